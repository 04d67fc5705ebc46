//! The sequencer's command vocabulary and queue envelope.

use crate::events::EventRecord;
use crate::money::Micros;
use crate::orders::{OrderFlags, OrderId, OrderKind, Side, TimeInForce, UserId};
use crossbeam::channel::Sender;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// A request to place an order, before the sequencer assigns identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Opaque client identifier, echoed in every event for this order.
    pub client_id: String,
    /// The submitting user.
    pub user_id: UserId,
    /// Symbol to trade.
    pub symbol: String,
    /// Buy or sell.
    pub side: Side,
    /// Structural kind.
    pub kind: OrderKind,
    /// Limit price; required for `Limit` and `StopLimit`.
    pub price: Option<Micros>,
    /// Trigger price; required for `Stop` and `StopLimit`.
    pub trigger: Option<Micros>,
    /// Quantity in lots.
    pub quantity: i64,
    /// Time-in-force policy.
    pub time_in_force: TimeInForce,
    /// Execution flags.
    pub flags: OrderFlags,
}

/// A command submitted for total-ordered execution.
///
/// Each command is dispatched by the sequencer in arrival order and
/// produces a contiguous run of events under one `command_seq`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Submit a new order.
    PlaceOrder {
        /// The order request.
        request: OrderRequest,
    },

    /// Cancel an order by id.
    CancelOrder {
        /// The requesting user; must own the order.
        user_id: UserId,
        /// Symbol the order was placed on.
        symbol: String,
        /// The order to cancel.
        order_id: OrderId,
    },

    /// Replace an order's price and/or quantity, as atomic cancel+new.
    /// When the replacement is rejected the original stays canceled.
    ModifyOrder {
        /// The requesting user; must own the order.
        user_id: UserId,
        /// Symbol the order was placed on.
        symbol: String,
        /// The order to replace.
        order_id: OrderId,
        /// New limit price, if changing.
        new_price: Option<Micros>,
        /// New total quantity, if changing.
        new_quantity: Option<i64>,
    },

    /// Adopt an external reference price for margining, liquidation and
    /// circuit breaking. The core never fetches prices itself.
    ApplyReferencePrice {
        /// The symbol.
        symbol: String,
        /// The reference price in micro-units.
        price: Micros,
        /// Which feed produced it.
        source_id: String,
        /// Feed timestamp, milliseconds.
        timestamp_ms: u64,
    },

    /// Apply a funding cycle to every open position in the symbol.
    ApplyFundingTick {
        /// The symbol.
        symbol: String,
        /// Funding rate, micro-units per unit of notional (1_000_000 =
        /// 100%). Positive rates charge longs and pay shorts.
        rate_micros: i64,
        /// Schedule timestamp, milliseconds.
        timestamp_ms: u64,
    },

    /// Close a user's position with a forced market order.
    ForceLiquidate {
        /// The position owner.
        user_id: UserId,
        /// The symbol.
        symbol: String,
        /// Operator- or engine-supplied reason, carried into the events.
        reason: String,
    },

    /// Operator halt for a symbol.
    HaltSymbol {
        /// The symbol to halt.
        symbol: String,
        /// Why.
        reason: String,
    },

    /// Lift an operator halt.
    ResumeSymbol {
        /// The symbol to resume.
        symbol: String,
    },

    /// Credit cash into a user account.
    Deposit {
        /// The account owner.
        user_id: UserId,
        /// Amount in micro-units.
        amount: Micros,
    },

    /// Debit cash from a user account; rejected when it would cross the
    /// margin requirement.
    Withdraw {
        /// The account owner.
        user_id: UserId,
        /// Amount in micro-units.
        amount: Micros,
    },
}

impl Command {
    /// The symbol a command targets, when it targets one.
    #[must_use]
    pub fn symbol(&self) -> Option<&str> {
        match self {
            Command::PlaceOrder { request } => Some(&request.symbol),
            Command::CancelOrder { symbol, .. }
            | Command::ModifyOrder { symbol, .. }
            | Command::ApplyReferencePrice { symbol, .. }
            | Command::ApplyFundingTick { symbol, .. }
            | Command::ForceLiquidate { symbol, .. }
            | Command::HaltSymbol { symbol, .. }
            | Command::ResumeSymbol { symbol } => Some(symbol),
            Command::Deposit { .. } | Command::Withdraw { .. } => None,
        }
    }
}

/// The result of sequencing one command: its position in the total order
/// and the events it produced.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    /// The command's sequence number.
    pub command_seq: u64,
    /// The contiguous event run, `event_seq` 0..n.
    pub events: Vec<EventRecord>,
}

/// Queue envelope: the command plus per-command metadata that never
/// reaches the journal.
pub struct CommandEnvelope {
    /// The command to execute.
    pub command: Command,
    /// Drop-dead time: a command dequeued after this instant is rejected
    /// with `Timeout` without touching state.
    pub deadline: Option<Instant>,
    /// Reply channel for callers that wait for their events.
    pub reply: Option<Sender<CommandOutcome>>,
}

impl CommandEnvelope {
    /// Envelope with no deadline and no reply channel.
    #[must_use]
    pub fn fire_and_forget(command: Command) -> Self {
        Self {
            command,
            deadline: None,
            reply: None,
        }
    }
}
