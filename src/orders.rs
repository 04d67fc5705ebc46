//! Order model: identifiers, sides, kinds, time-in-force, flags, lifecycle.

use crate::money::Micros;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Monotonic order identifier, assigned by the sequencer at admission.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct OrderId(pub u64);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// User identifier. `UserId::HOUSE` is reserved for exchange-side accounts
/// (fee revenue, funding clearing, insurance).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl UserId {
    /// The reserved exchange-side account owner.
    pub const HOUSE: UserId = UserId(0);
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "u{}", self.0)
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    /// Bid side.
    Buy,
    /// Ask side.
    Sell,
}

impl Side {
    /// The opposite side.
    #[must_use]
    #[inline]
    pub fn opposite(self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// Signed direction: +1 for buys, -1 for sells.
    #[must_use]
    #[inline]
    pub fn sign(self) -> i64 {
        match self {
            Side::Buy => 1,
            Side::Sell => -1,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// The structural kind of an order.
///
/// Execution-style variations (IOC, FOK, post-only, reduce-only) are carried
/// by [`TimeInForce`] and [`OrderFlags`] rather than multiplying kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderKind {
    /// No price; consumes liquidity until filled or the book empties.
    Market,
    /// Matches up to its limit price; the residual may rest.
    Limit,
    /// Parked until the last trade price crosses the trigger, then
    /// converts to a market order.
    Stop,
    /// Parked until triggered, then converts to a limit order.
    StopLimit,
}

impl OrderKind {
    /// Whether this kind parks on the stop ladder before activation.
    #[must_use]
    #[inline]
    pub fn is_stop(self) -> bool {
        matches!(self, OrderKind::Stop | OrderKind::StopLimit)
    }
}

/// Time-in-force policy for the non-parked phase of an order's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TimeInForce {
    /// Good till canceled: the residual rests on the book.
    #[default]
    Gtc,
    /// Immediate or cancel: the residual is canceled.
    Ioc,
    /// Fill or kill: rejected unless fillable in full without resting.
    Fok,
}

impl fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeInForce::Gtc => write!(f, "GTC"),
            TimeInForce::Ioc => write!(f, "IOC"),
            TimeInForce::Fok => write!(f, "FOK"),
        }
    }
}

bitflags! {
    /// Execution flags carried by an order.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct OrderFlags: u8 {
        /// Reject rather than take liquidity.
        const POST_ONLY = 1 << 0;
        /// Reject if the order would increase the absolute position size.
        const REDUCE_ONLY = 1 << 1;
    }
}

/// Order lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    /// Admitted by the sequencer, not yet matched or rested.
    New,
    /// Resting on the book, unfilled.
    Open,
    /// Resting on the book with a partial fill.
    Partial,
    /// Fully filled. Terminal.
    Filled,
    /// Canceled before completion. Terminal.
    Canceled,
    /// Rejected before admission. Terminal.
    Rejected,
    /// A stop order whose trigger fired; transient while it converts.
    Triggered,
}

impl OrderStatus {
    /// Whether the order can no longer change state.
    #[must_use]
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected
        )
    }
}

/// Why an order left the book (or never rested) without filling in full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CancelReason {
    /// The owner asked for the cancel.
    UserRequested,
    /// An immediate-or-cancel residual was discarded.
    ImmediateOrCancel,
    /// A market order ran out of liquidity.
    NoLiquidity,
    /// Self-trade prevention canceled this order.
    SelfTrade,
    /// The order was replaced by a modify.
    Replaced,
    /// The position it belonged to was force-liquidated.
    Liquidation,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::UserRequested => write!(f, "user requested"),
            CancelReason::ImmediateOrCancel => write!(f, "immediate-or-cancel residual"),
            CancelReason::NoLiquidity => write!(f, "no liquidity"),
            CancelReason::SelfTrade => write!(f, "self-trade prevention"),
            CancelReason::Replaced => write!(f, "replaced by modify"),
            CancelReason::Liquidation => write!(f, "forced liquidation"),
        }
    }
}

/// A client order as tracked by the book and the journal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Monotonic identifier assigned at admission.
    pub id: OrderId,
    /// Opaque client-supplied identifier, echoed in every event for this
    /// order. The engine never interprets or deduplicates it.
    pub client_id: String,
    /// Owner of the order.
    pub user_id: UserId,
    /// Symbol this order trades.
    pub symbol: String,
    /// Buy or sell.
    pub side: Side,
    /// Structural kind.
    pub kind: OrderKind,
    /// Limit price in micro-units; `None` for market orders.
    pub price: Option<Micros>,
    /// Trigger price for stop kinds; `None` otherwise.
    pub trigger: Option<Micros>,
    /// Original quantity in lots.
    pub quantity: i64,
    /// Quantity filled so far.
    pub filled: i64,
    /// Quantity still outstanding. `filled + remaining == quantity` always.
    pub remaining: i64,
    /// Lifecycle status.
    pub status: OrderStatus,
    /// Book arrival order; ties at a price level resolve by this.
    pub enqueue_seq: u64,
    /// Time-in-force policy.
    pub time_in_force: TimeInForce,
    /// Execution flags.
    pub flags: OrderFlags,
}

impl Order {
    /// Apply a fill of `qty` lots, maintaining the quantity invariant and
    /// the status transitions.
    ///
    /// Caller guarantees `0 < qty <= self.remaining`.
    pub(crate) fn apply_fill(&mut self, qty: i64) {
        debug_assert!(qty > 0 && qty <= self.remaining);
        self.filled += qty;
        self.remaining -= qty;
        self.status = if self.remaining == 0 {
            OrderStatus::Filled
        } else {
            OrderStatus::Partial
        };
    }

    /// Whether the order can still trade or rest.
    #[must_use]
    #[inline]
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Notional value of the remaining quantity at `price`.
    #[must_use]
    pub fn remaining_notional(&self, price: Micros) -> Option<Micros> {
        price.checked_mul_qty(self.remaining)
    }
}
