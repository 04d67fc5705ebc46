//! Engine error taxonomy: rejection reasons and fatal invariant violations.

use crate::money::Micros;
use crate::orders::{OrderId, Side, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine-readable reason a command was rejected.
///
/// Rejections are events, not state changes: a rejected command leaves the
/// books, positions and ledger exactly as they were. Every variant carries a
/// stable human-readable message through its `Display` impl.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum RejectReason {
    /// The symbol is halted by the circuit breaker or an operator.
    Halted {
        /// The halted symbol.
        symbol: String,
    },

    /// Free margin does not cover the initial margin requirement.
    InsufficientMargin {
        /// Margin required for the order, micro-units.
        required: Micros,
        /// Free margin available, micro-units.
        available: Micros,
    },

    /// The price is not a multiple of the symbol's tick size.
    TickAlignment {
        /// The misaligned price.
        price: Micros,
        /// The symbol's tick size.
        tick_size: Micros,
    },

    /// The quantity is not a multiple of the symbol's lot size.
    LotAlignment {
        /// The misaligned quantity.
        quantity: i64,
        /// The symbol's lot size.
        lot_size: i64,
    },

    /// The quantity is outside the symbol's `[min_order, max_order]` range.
    SizeBounds {
        /// The rejected quantity.
        quantity: i64,
        /// Smallest accepted quantity.
        min: i64,
        /// Largest accepted quantity.
        max: i64,
    },

    /// The order would have traded against the same user's resting order.
    SelfTrade {
        /// The taker order that was canceled.
        taker_order_id: OrderId,
        /// The user on both sides.
        user_id: UserId,
    },

    /// A post-only order would have crossed the opposite side.
    PostOnlyWouldCross {
        /// The offending limit price.
        price: Micros,
        /// The best opposite price it would have hit.
        opposite_price: Micros,
        /// The side of the rejected order.
        side: Side,
    },

    /// A reduce-only order would have grown the absolute position.
    ReduceOnlyWouldIncrease {
        /// Net position at sequencer entry, lots.
        net_size: i64,
        /// The rejected order quantity, lots.
        quantity: i64,
    },

    /// A fill-or-kill order could not be filled in full.
    FokInfeasible {
        /// Quantity requested, lots.
        requested: i64,
        /// Quantity available within the limit, lots.
        available: i64,
    },

    /// The symbol is not in the product catalog.
    UnknownSymbol {
        /// The unrecognized symbol.
        symbol: String,
    },

    /// The user has no ledger account.
    UnknownUser {
        /// The unrecognized user.
        user_id: UserId,
    },

    /// Cancel/modify target does not exist.
    OrderNotFound {
        /// The missing order id.
        order_id: OrderId,
    },

    /// Cancel/modify target is already filled, canceled or rejected.
    AlreadyTerminal {
        /// The terminal order id.
        order_id: OrderId,
    },

    /// The user's open-order count for the symbol is at its cap.
    OpenOrderLimit {
        /// The configured cap.
        limit: u32,
    },

    /// The command queue is full; the producer must retry or fail.
    QueueFull,

    /// The command's deadline passed before the sequencer dequeued it.
    Timeout,

    /// A market order found no liquidity (cancel reason for the residual).
    NoLiquidity {
        /// Unfilled remainder, lots.
        remaining: i64,
    },

    /// A caller-supplied amount is outside what the ledger can represent.
    AmountOverflow {
        /// The rejected amount, micro-units.
        amount: Micros,
    },

    /// The order kind requires a price (limit kinds) or a trigger (stop
    /// kinds) that the request did not supply.
    MissingPrice {
        /// Human-readable name of the missing field.
        field: String,
    },

    /// A funding tick arrived before any reference or trade price exists
    /// to mark positions at.
    NoReferencePrice {
        /// The unmarked symbol.
        symbol: String,
    },

    /// A withdrawal would leave the account under its margin requirement.
    WithdrawalBlocked {
        /// Amount requested, micro-units.
        requested: Micros,
        /// Amount withdrawable without crossing margin, micro-units.
        withdrawable: Micros,
    },
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Halted { symbol } => write!(f, "symbol {symbol} is halted"),
            RejectReason::InsufficientMargin {
                required,
                available,
            } => write!(
                f,
                "insufficient margin: required {required}, available {available}"
            ),
            RejectReason::TickAlignment { price, tick_size } => write!(
                f,
                "price {price} is not a multiple of tick size {tick_size}"
            ),
            RejectReason::LotAlignment { quantity, lot_size } => write!(
                f,
                "quantity {quantity} is not a multiple of lot size {lot_size}"
            ),
            RejectReason::SizeBounds { quantity, min, max } => write!(
                f,
                "quantity {quantity} outside allowed range [{min}, {max}]"
            ),
            RejectReason::SelfTrade {
                taker_order_id,
                user_id,
            } => write!(
                f,
                "self-trade prevented: taker {taker_order_id} of user {user_id}"
            ),
            RejectReason::PostOnlyWouldCross {
                price,
                opposite_price,
                side,
            } => write!(
                f,
                "post-only {side} at {price} would cross opposite at {opposite_price}"
            ),
            RejectReason::ReduceOnlyWouldIncrease { net_size, quantity } => write!(
                f,
                "reduce-only order of {quantity} would increase position {net_size}"
            ),
            RejectReason::FokInfeasible {
                requested,
                available,
            } => write!(
                f,
                "fill-or-kill infeasible: requested {requested}, available {available}"
            ),
            RejectReason::UnknownSymbol { symbol } => write!(f, "unknown symbol: {symbol}"),
            RejectReason::UnknownUser { user_id } => write!(f, "unknown user: {user_id}"),
            RejectReason::OrderNotFound { order_id } => write!(f, "order not found: {order_id}"),
            RejectReason::AlreadyTerminal { order_id } => {
                write!(f, "order {order_id} is already terminal")
            }
            RejectReason::OpenOrderLimit { limit } => {
                write!(f, "open-order limit of {limit} reached")
            }
            RejectReason::QueueFull => write!(f, "command queue is full"),
            RejectReason::Timeout => write!(f, "command deadline expired before sequencing"),
            RejectReason::NoLiquidity { remaining } => {
                write!(f, "no liquidity for remaining {remaining}")
            }
            RejectReason::AmountOverflow { amount } => {
                write!(f, "amount {amount} is not representable")
            }
            RejectReason::MissingPrice { field } => {
                write!(f, "order is missing its {field}")
            }
            RejectReason::NoReferencePrice { symbol } => {
                write!(f, "no reference price for {symbol}")
            }
            RejectReason::WithdrawalBlocked {
                requested,
                withdrawable,
            } => write!(
                f,
                "withdrawal of {requested} blocked: only {withdrawable} withdrawable"
            ),
        }
    }
}

impl std::error::Error for RejectReason {}

/// A fatal invariant violation.
///
/// These are never rejected-and-forgotten: the shard publishes a
/// `FatalError` event, stops accepting commands, and waits for operator
/// intervention. The sequencer never retries on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum FatalReason {
    /// A ledger batch or the cumulative totals failed to balance.
    LedgerImbalance {
        /// Total debits observed, micro-units.
        debits: Micros,
        /// Total credits observed, micro-units.
        credits: Micros,
    },

    /// The order index and the price levels disagree.
    BookInconsistency {
        /// The affected symbol.
        symbol: String,
        /// What the integrity check found.
        detail: String,
    },

    /// Checked money arithmetic overflowed.
    MoneyOverflow {
        /// The operation that overflowed.
        context: String,
    },

    /// The journal could not persist an event under the selected
    /// durability mode.
    JournalWriteFailed {
        /// The underlying journal error message.
        message: String,
    },

    /// Replay produced state that violates a post-replay invariant.
    ReplayMismatch {
        /// What the post-replay validation found.
        detail: String,
    },
}

impl fmt::Display for FatalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalReason::LedgerImbalance { debits, credits } => {
                write!(f, "ledger imbalance: debits {debits} != credits {credits}")
            }
            FatalReason::BookInconsistency { symbol, detail } => {
                write!(f, "book inconsistency on {symbol}: {detail}")
            }
            FatalReason::MoneyOverflow { context } => {
                write!(f, "money arithmetic overflow in {context}")
            }
            FatalReason::JournalWriteFailed { message } => {
                write!(f, "journal write failed: {message}")
            }
            FatalReason::ReplayMismatch { detail } => {
                write!(f, "replay mismatch: {detail}")
            }
        }
    }
}

impl std::error::Error for FatalReason {}
