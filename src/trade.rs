//! Trade records produced by the matching engine.

use crate::money::Micros;
use crate::orders::{OrderId, Side, UserId};
use serde::{Deserialize, Serialize};

/// Monotonic trade identifier, unique per shard.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct TradeId(pub u64);

/// A single execution between a resting maker and an incoming taker.
///
/// Trades are append-only: once emitted they are never mutated, and their
/// ids increase strictly in emission order within a shard. The execution
/// price is always the maker's resting price (passive-price rule).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    /// Unique, strictly increasing trade identifier.
    pub id: TradeId,
    /// Symbol the trade printed on.
    pub symbol: String,
    /// The resting order that provided liquidity.
    pub maker_order_id: OrderId,
    /// The incoming order that consumed liquidity.
    pub taker_order_id: OrderId,
    /// Owner of the maker order.
    pub maker_user: UserId,
    /// Owner of the taker order.
    pub taker_user: UserId,
    /// Side of the taker order.
    pub taker_side: Side,
    /// Execution price in micro-units (the maker's price).
    pub price: Micros,
    /// Executed quantity in lots.
    pub quantity: i64,
    /// Fee charged to the maker in micro-units; negative is a rebate.
    pub maker_fee: Micros,
    /// Fee charged to the taker in micro-units.
    pub taker_fee: Micros,
    /// Command sequence under which this trade was produced.
    pub seq: u64,
    /// Wall-clock timestamp in milliseconds, stamped by the sequencer.
    pub timestamp_ms: u64,
}

impl Trade {
    /// Notional value of the trade (price × quantity).
    #[must_use]
    pub fn notional(&self) -> Option<Micros> {
        self.price.checked_mul_qty(self.quantity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notional() {
        let trade = Trade {
            id: TradeId(1),
            symbol: "BTC-PERP".to_string(),
            maker_order_id: OrderId(10),
            taker_order_id: OrderId(11),
            maker_user: UserId(1),
            taker_user: UserId(2),
            taker_side: Side::Sell,
            price: Micros::new(3_500_000_000),
            quantity: 100,
            maker_fee: Micros::new(-70_000_000),
            taker_fee: Micros::new(175_000_000),
            seq: 5,
            timestamp_ms: 1_700_000_000_000,
        };
        assert_eq!(trade.notional(), Some(Micros::new(350_000_000_000)));
    }
}
