//! The sequenced event taxonomy.
//!
//! Every accepted command produces a contiguous run of events tagged with
//! a single `command_seq` and sub-sequenced `event_seq`. The same records
//! feed the write-ahead journal and the fan-out subscribers, in the same
//! order, so replaying the journal reproduces exactly what subscribers
//! saw.

use crate::book::BookDelta;
use crate::breaker::{BreakerState, HaltReason};
use crate::error::{FatalReason, RejectReason};
use crate::ledger::LedgerEntry;
use crate::money::Micros;
use crate::orders::{CancelReason, Order, OrderId, OrderStatus, UserId};
use crate::position::Position;
use crate::trade::Trade;
use serde::{Deserialize, Serialize};

/// Numeric event kind, carried in the journal record header.
///
/// Values are part of the on-disk format and must never be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum EventKind {
    /// An order passed admission.
    OrderAccepted = 1,
    /// A command was rejected; no state changed.
    OrderRejected = 2,
    /// A trade printed.
    TradeExecuted = 3,
    /// An order's status/remaining changed.
    OrderUpdated = 4,
    /// An order left the book before completion.
    OrderCanceled = 5,
    /// A visible price level changed.
    BookDelta = 6,
    /// A position changed.
    PositionUpdated = 7,
    /// Ledger entries were appended.
    LedgerPosted = 8,
    /// A funding charge was applied to one user.
    FundingApplied = 9,
    /// A reference price was adopted.
    ReferenceApplied = 10,
    /// A circuit breaker (or operator) halted the symbol.
    CircuitHalted = 11,
    /// The symbol resumed normal matching.
    CircuitResumed = 12,
    /// A position breached its liquidation price.
    LiquidationRequired = 13,
    /// A forced liquidation completed.
    LiquidationExecuted = 14,
    /// The shard hit a fatal invariant violation and stopped.
    FatalError = 15,
}

impl EventKind {
    /// Decode a wire kind value.
    #[must_use]
    pub fn from_u16(value: u16) -> Option<EventKind> {
        match value {
            1 => Some(EventKind::OrderAccepted),
            2 => Some(EventKind::OrderRejected),
            3 => Some(EventKind::TradeExecuted),
            4 => Some(EventKind::OrderUpdated),
            5 => Some(EventKind::OrderCanceled),
            6 => Some(EventKind::BookDelta),
            7 => Some(EventKind::PositionUpdated),
            8 => Some(EventKind::LedgerPosted),
            9 => Some(EventKind::FundingApplied),
            10 => Some(EventKind::ReferenceApplied),
            11 => Some(EventKind::CircuitHalted),
            12 => Some(EventKind::CircuitResumed),
            13 => Some(EventKind::LiquidationRequired),
            14 => Some(EventKind::LiquidationExecuted),
            15 => Some(EventKind::FatalError),
            _ => None,
        }
    }
}

/// A sequenced engine event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineEvent {
    /// An order passed admission and was assigned its id.
    OrderAccepted {
        /// The admitted order, as it entered matching.
        order: Order,
    },

    /// A command was rejected. No state changed.
    OrderRejected {
        /// The order id, when one had been assigned.
        order_id: Option<OrderId>,
        /// The client's opaque id, echoed verbatim; empty for non-order
        /// commands.
        client_id: String,
        /// The user that issued the command.
        user_id: UserId,
        /// The symbol involved, when there was one.
        symbol: String,
        /// Why the command was rejected.
        reason: RejectReason,
    },

    /// A trade printed.
    TradeExecuted {
        /// The trade record.
        trade: Trade,
    },

    /// An order's status or remaining quantity changed.
    OrderUpdated {
        /// The order.
        order_id: OrderId,
        /// The client's opaque id, echoed.
        client_id: String,
        /// New status.
        status: OrderStatus,
        /// Remaining quantity in lots.
        remaining: i64,
    },

    /// An order left the book (or never rested) before completion.
    OrderCanceled {
        /// The order.
        order_id: OrderId,
        /// The client's opaque id, echoed.
        client_id: String,
        /// Why it was canceled.
        reason: CancelReason,
        /// Remaining quantity at cancellation.
        remaining: i64,
    },

    /// A visible price level changed.
    BookDelta {
        /// The symbol whose book changed.
        symbol: String,
        /// The level change.
        delta: BookDelta,
    },

    /// A position changed. Carries the full record so replay can restore
    /// it without re-deriving.
    PositionUpdated {
        /// The updated position.
        position: Position,
    },

    /// Ledger entries were appended atomically.
    LedgerPosted {
        /// The balanced batch.
        entries: Vec<LedgerEntry>,
    },

    /// One user's funding charge for a funding tick.
    FundingApplied {
        /// The symbol funded.
        symbol: String,
        /// The charged (positive) or paid (negative) user.
        user: UserId,
        /// The funding rate, micro-units per unit notional.
        rate_micros: i64,
        /// The signed charge, micro-units.
        charge: Micros,
    },

    /// A reference price was adopted for a symbol.
    ReferenceApplied {
        /// The symbol.
        symbol: String,
        /// The adopted reference price.
        price: Micros,
        /// Which feed produced it.
        source_id: String,
        /// Feed timestamp, milliseconds.
        timestamp_ms: u64,
    },

    /// The symbol halted.
    CircuitHalted {
        /// The halted symbol.
        symbol: String,
        /// Why.
        reason: HaltReason,
        /// When matching may resume, milliseconds since epoch.
        until_ms: u64,
        /// Full breaker state after the halt, for replay.
        state: BreakerState,
    },

    /// The symbol resumed.
    CircuitResumed {
        /// The resumed symbol.
        symbol: String,
        /// Full breaker state after resumption, for replay.
        state: BreakerState,
    },

    /// A position breached its liquidation price; a `ForceLiquidate`
    /// command will be sequenced next cycle.
    LiquidationRequired {
        /// The symbol.
        symbol: String,
        /// The position owner.
        user: UserId,
        /// The reference price that breached.
        reference: Micros,
    },

    /// A forced liquidation completed.
    LiquidationExecuted {
        /// The symbol.
        symbol: String,
        /// The liquidated user.
        user: UserId,
        /// Quantity closed, lots.
        quantity: i64,
        /// Amount drawn from the insurance fund to cover the shortfall.
        insurance_draw: Micros,
    },

    /// The shard hit a fatal invariant violation and stopped accepting
    /// commands.
    FatalError {
        /// What went wrong.
        reason: FatalReason,
    },
}

impl EngineEvent {
    /// The wire kind of this event.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            EngineEvent::OrderAccepted { .. } => EventKind::OrderAccepted,
            EngineEvent::OrderRejected { .. } => EventKind::OrderRejected,
            EngineEvent::TradeExecuted { .. } => EventKind::TradeExecuted,
            EngineEvent::OrderUpdated { .. } => EventKind::OrderUpdated,
            EngineEvent::OrderCanceled { .. } => EventKind::OrderCanceled,
            EngineEvent::BookDelta { .. } => EventKind::BookDelta,
            EngineEvent::PositionUpdated { .. } => EventKind::PositionUpdated,
            EngineEvent::LedgerPosted { .. } => EventKind::LedgerPosted,
            EngineEvent::FundingApplied { .. } => EventKind::FundingApplied,
            EngineEvent::ReferenceApplied { .. } => EventKind::ReferenceApplied,
            EngineEvent::CircuitHalted { .. } => EventKind::CircuitHalted,
            EngineEvent::CircuitResumed { .. } => EventKind::CircuitResumed,
            EngineEvent::LiquidationRequired { .. } => EventKind::LiquidationRequired,
            EngineEvent::LiquidationExecuted { .. } => EventKind::LiquidationExecuted,
            EngineEvent::FatalError { .. } => EventKind::FatalError,
        }
    }
}

/// One event with its position in the total order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    /// The command this event belongs to.
    pub command_seq: u64,
    /// Position within the command's event run, starting at 0.
    pub event_seq: u32,
    /// The event payload.
    pub event: EngineEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_values_roundtrip() {
        for kind in [
            EventKind::OrderAccepted,
            EventKind::OrderRejected,
            EventKind::TradeExecuted,
            EventKind::OrderUpdated,
            EventKind::OrderCanceled,
            EventKind::BookDelta,
            EventKind::PositionUpdated,
            EventKind::LedgerPosted,
            EventKind::FundingApplied,
            EventKind::ReferenceApplied,
            EventKind::CircuitHalted,
            EventKind::CircuitResumed,
            EventKind::LiquidationRequired,
            EventKind::LiquidationExecuted,
            EventKind::FatalError,
        ] {
            assert_eq!(EventKind::from_u16(kind as u16), Some(kind));
        }
        assert_eq!(EventKind::from_u16(0), None);
        assert_eq!(EventKind::from_u16(999), None);
    }

    #[test]
    fn test_event_serde_roundtrip() {
        let event = EngineEvent::FundingApplied {
            symbol: "BTC-PERP".to_string(),
            user: UserId(4),
            rate_micros: 100,
            charge: Micros::new(35_000_000),
        };
        assert_eq!(event.kind(), EventKind::FundingApplied);
        let json = serde_json::to_vec(&event).unwrap();
        let back: EngineEvent = serde_json::from_slice(&json).unwrap();
        assert_eq!(event, back);
    }
}
