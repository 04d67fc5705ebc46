//! Pre-trade risk checks.
//!
//! The gate runs once per order command, at sequencer entry, against a
//! consistent snapshot of the single-writer state: no concurrent mutation
//! can intervene between the checks and the matching that follows. Input
//! validation that needs only the book (tick/lot alignment, size bounds,
//! post-only, reduce-only, halt) lives in `OrderBook::submit`; the gate
//! covers the checks that need cross-component state — account existence,
//! open-order caps, and the initial-margin requirement.

use crate::book::OrderBook;
use crate::catalog::SymbolSpec;
use crate::error::RejectReason;
use crate::ledger::Ledger;
use crate::money::Micros;
use crate::orders::{Order, OrderFlags, OrderKind, Side, UserId};
use crate::position::PositionManager;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Per-user account summary combining ledger balances with position
/// marks. This is the `snapshot(user)` surface of the ledger interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AccountSummary {
    /// Free cash, micro-units.
    pub cash: Micros,
    /// Cash reserved as position margin, micro-units.
    pub reserved_margin: Micros,
    /// Cash + reserved margin + unrealized PnL at current marks.
    pub equity: Micros,
    /// Equity minus the initial-margin requirement across positions.
    pub free_margin: Micros,
}

/// Compute the account summary for `user`.
///
/// `mark_of` supplies the marking price per symbol (reference price when
/// available, last trade otherwise); symbols without a mark contribute
/// zero unrealized PnL.
#[must_use]
pub fn account_summary(
    user: UserId,
    ledger: &Ledger,
    positions: &PositionManager,
    mark_of: impl Fn(&str) -> Option<Micros>,
    margin_bps_of: impl Fn(&str) -> Option<u32>,
) -> AccountSummary {
    let balances = ledger.snapshot(user);
    let unrealized = positions.total_unrealized(user, &mark_of);
    let required = positions.total_required_margin(user, &margin_bps_of);
    let equity = balances
        .cash
        .checked_add(balances.reserved_margin)
        .and_then(|e| e.checked_add(unrealized))
        .unwrap_or(Micros::MAX);
    let free_margin = equity.checked_sub(required).unwrap_or(Micros::ZERO);
    AccountSummary {
        cash: balances.cash,
        reserved_margin: balances.reserved_margin,
        equity,
        free_margin,
    }
}

/// The pre-trade gate configuration and entry point.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RiskGate {
    /// Maximum open orders (resting + parked) per user per symbol.
    pub max_open_orders: u32,
}

impl Default for RiskGate {
    fn default() -> Self {
        Self {
            max_open_orders: 200,
        }
    }
}

impl RiskGate {
    /// Run the cross-component checks for an incoming order.
    ///
    /// # Errors
    ///
    /// The first failed check's [`RejectReason`]; the order must not touch
    /// the book when this returns `Err`.
    pub fn check(
        &self,
        order: &Order,
        spec: &SymbolSpec,
        book: &OrderBook,
        ledger: &Ledger,
        positions: &PositionManager,
        mark_of: impl Fn(&str) -> Option<Micros>,
        margin_bps_of: impl Fn(&str) -> Option<u32>,
    ) -> Result<(), RejectReason> {
        if !ledger.has_account(order.user_id) {
            return Err(RejectReason::UnknownUser {
                user_id: order.user_id,
            });
        }

        if book.open_order_count(order.user_id) >= self.max_open_orders {
            return Err(RejectReason::OpenOrderLimit {
                limit: self.max_open_orders,
            });
        }

        // Orders that can only shrink the position carry no fresh margin
        // requirement.
        if order.flags.contains(OrderFlags::REDUCE_ONLY) {
            return Ok(());
        }

        let Some(effective_price) = effective_price(order, book, &mark_of) else {
            // Unpriceable market order into an empty, unmarked book; it
            // will cancel with NoLiquidity downstream without margin use.
            return Ok(());
        };
        let required = effective_price
            .checked_mul_qty(order.quantity)
            .and_then(|notional| notional.checked_bps(spec.initial_margin_bps as i32))
            .unwrap_or(Micros::MAX);

        let summary = account_summary(order.user_id, ledger, positions, mark_of, margin_bps_of);
        if required > summary.free_margin {
            return Err(RejectReason::InsufficientMargin {
                required,
                available: summary.free_margin,
            });
        }
        trace!(
            "margin check passed for {}: required {required}, free {}",
            order.user_id, summary.free_margin
        );
        Ok(())
    }
}

/// The price an order is margined at: the limit price for limit orders,
/// the best opposite for market orders, the trigger for parked stops.
fn effective_price(
    order: &Order,
    book: &OrderBook,
    mark_of: impl Fn(&str) -> Option<Micros>,
) -> Option<Micros> {
    if order.kind.is_stop() {
        return order.trigger.or(order.price);
    }
    match order.kind {
        OrderKind::Limit => order.price,
        OrderKind::Market => {
            let (best_bid, best_ask) = book.bbo();
            let opposite = match order.side {
                Side::Buy => best_ask,
                Side::Sell => best_bid,
            };
            opposite.or_else(|| mark_of(book.symbol()))
        }
        _ => order.price,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::StpPolicy;
    use crate::catalog::CircuitBand;
    use crate::orders::{OrderId, OrderStatus, TimeInForce};

    const PX: i64 = 3_500_000_000;

    fn spec() -> SymbolSpec {
        SymbolSpec {
            symbol: "BTC-PERP".to_string(),
            tick_size: Micros::new(10_000),
            lot_size: 1,
            min_order: 1,
            max_order: 1_000_000,
            maker_fee_bps: -2,
            taker_fee_bps: 5,
            initial_margin_bps: 1_000,
            maintenance_margin_bps: 500,
            max_leverage: 10,
            circuit_bands: [
                CircuitBand {
                    deviation_bps: 300,
                    halt_ms: 60_000,
                },
                CircuitBand {
                    deviation_bps: 500,
                    halt_ms: 300_000,
                },
                CircuitBand {
                    deviation_bps: 1_000,
                    halt_ms: 3_600_000,
                },
            ],
            stp_policy: StpPolicy::CancelTaker,
            is_hedgeable: true,
            reference_source_id: "cb-usd".to_string(),
        }
    }

    fn limit_order(user: u64, qty: i64, price: i64) -> Order {
        Order {
            id: OrderId(1),
            client_id: String::new(),
            user_id: UserId(user),
            symbol: "BTC-PERP".to_string(),
            side: Side::Buy,
            kind: OrderKind::Limit,
            price: Some(Micros::new(price)),
            trigger: None,
            quantity: qty,
            filled: 0,
            remaining: qty,
            status: OrderStatus::New,
            enqueue_seq: 1,
            time_in_force: TimeInForce::Gtc,
            flags: OrderFlags::empty(),
        }
    }

    fn setup(cash: i64) -> (OrderBook, Ledger, PositionManager) {
        let book = OrderBook::new(spec());
        let mut ledger = Ledger::new();
        ledger.open_account(UserId(1));
        ledger.deposit(UserId(1), Micros::new(cash)).unwrap();
        (book, ledger, PositionManager::new())
    }

    #[test]
    fn test_unknown_user_rejected() {
        let (book, ledger, positions) = setup(0);
        let gate = RiskGate::default();
        let order = limit_order(99, 10, PX);
        let err = gate
            .check(&order, &spec(), &book, &ledger, &positions, |_| None, |_| None)
            .unwrap_err();
        assert!(matches!(err, RejectReason::UnknownUser { .. }));
    }

    #[test]
    fn test_margin_boundary() {
        // 10 lots at 3500 = 35_000 notional; 10% margin = 3500 units.
        let required = 3_500_000_000i64 * 10 / 10;
        let (book, ledger, positions) = setup(required);
        let gate = RiskGate::default();

        let order = limit_order(1, 10, PX);
        assert!(
            gate.check(&order, &spec(), &book, &ledger, &positions, |_| None, |_| None)
                .is_ok()
        );

        // One lot more than the cash can margin.
        let (book2, ledger2, positions2) = setup(required - 1);
        let err = gate
            .check(&order, &spec(), &book2, &ledger2, &positions2, |_| None, |_| None)
            .unwrap_err();
        assert!(matches!(err, RejectReason::InsufficientMargin { .. }));
    }

    #[test]
    fn test_reduce_only_skips_margin() {
        let (book, ledger, positions) = setup(0);
        let gate = RiskGate::default();
        let mut order = limit_order(1, 10, PX);
        order.flags = OrderFlags::REDUCE_ONLY;
        assert!(
            gate.check(&order, &spec(), &book, &ledger, &positions, |_| None, |_| None)
                .is_ok()
        );
    }

    #[test]
    fn test_open_order_cap() {
        let (mut book, ledger, positions) = setup(i64::MAX / 4);
        let gate = RiskGate {
            max_open_orders: 2,
        };
        for id in 1..=2 {
            let mut o = limit_order(1, 1, PX - id * 10_000);
            o.id = OrderId(id as u64);
            o.enqueue_seq = id as u64;
            book.submit(o, 0).unwrap();
        }
        let order = limit_order(1, 1, PX);
        let err = gate
            .check(&order, &spec(), &book, &ledger, &positions, |_| None, |_| None)
            .unwrap_err();
        assert!(matches!(err, RejectReason::OpenOrderLimit { limit: 2 }));
    }
}
