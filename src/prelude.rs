//! Prelude re-exporting the types most callers need.
//!
//! ```rust
//! use exchange_core::prelude::*;
//! ```

pub use crate::book::{BookDelta, BookSnapshot, LevelView, OrderBook, StpPolicy};
pub use crate::breaker::{CircuitBreaker, HaltReason};
pub use crate::catalog::{CircuitBand, ProductCatalog, SymbolSpec};
pub use crate::engine::{Command, CommandOutcome, Engine, EngineConfig, EngineHandle, OrderRequest};
pub use crate::error::{FatalReason, RejectReason};
pub use crate::events::{EngineEvent, EventKind, EventRecord, OverflowPolicy, Subscription};
pub use crate::journal::{DurabilityMode, FileJournal, Journal};
pub use crate::ledger::{AccountKind, Ledger, LedgerEntry};
pub use crate::money::Micros;
pub use crate::orders::{
    CancelReason, Order, OrderFlags, OrderId, OrderKind, OrderStatus, Side, TimeInForce, UserId,
};
pub use crate::position::{Position, PositionManager};
pub use crate::risk::{AccountSummary, RiskGate};
pub use crate::trade::{Trade, TradeId};
pub use crate::utils::current_time_millis;
