//! # Deterministic Derivatives Exchange Core
//!
//! The correctness-critical path of a centralized derivatives exchange:
//! a deterministic, single-writer matching engine with strict price-time
//! priority, the position/margin/liquidation subsystem that consumes its
//! trade stream, and the sequenced event bus and write-ahead journal that
//! fan results out to subscribers and make the whole thing replayable.
//!
//! ## Architecture
//!
//! One sequencer thread per shard owns every mutable structure — books,
//! positions, ledger, circuit breakers. External threads enqueue
//! [`Command`]s on a bounded queue and subscribe to the event bus;
//! nothing else crosses the boundary. For each accepted command the
//! pipeline runs in a fixed order:
//!
//! ```text
//! client cmd ──► CommandQueue ──► Sequencer ──► Book[symbol] ──► trades
//!                                    │                            │
//!                                    ├──► RiskGate (pre-trade)    ▼
//!                                    ▼                       PositionManager ──► Ledger
//!                               CircuitBreaker                    │
//!                                                                 ▼
//!                                                            EventBus ──► subscribers
//! ```
//!
//! Every event is journaled before it is published; replaying the journal
//! from an empty engine reproduces books, positions and balances exactly
//! (see [`Engine::recover`] and [`Engine::state_digest`]).
//!
//! ## Guarantees
//!
//! - **Price-time priority**: fills always hit the best opposite price,
//!   FIFO within a level; execution prints at the resting order's price.
//! - **Atomic trade effects**: every trade updates both parties'
//!   positions, balances and fees in one command, with balanced
//!   double-entry postings.
//! - **Interlocked safety machinery**: margin checks, circuit breakers
//!   and forced liquidations all run inside the same single-writer
//!   pipeline, so no position can open, fill or persist in violation of
//!   its invariants.
//! - **Replayable**: a length-prefixed, CRC32-checksummed write-ahead
//!   journal with configurable durability boundaries rebuilds the entire
//!   shard after a crash.
//!
//! ## Money
//!
//! All monetary values are signed 64-bit integer micro-units (10⁻⁶ of
//! the quoted currency), wrapped in [`Micros`]. Arithmetic is checked and
//! overflow is a fatal error; no float ever touches the engine, the wire
//! or the journal.

pub mod book;
pub mod breaker;
pub mod catalog;
pub mod engine;
pub mod error;
pub mod events;
pub mod journal;
pub mod ledger;
pub mod money;
pub mod orders;
pub mod position;
pub mod risk;
pub mod trade;

mod replay;

pub mod prelude;
mod utils;

pub use book::{BookDelta, BookSnapshot, Fill, LevelView, MatchOutcome, OrderBook, StpPolicy};
pub use breaker::{BreakerState, CircuitBreaker, Halt, HaltReason};
pub use catalog::{CatalogError, CircuitBand, ProductCatalog, SymbolSpec};
pub use engine::{Command, CommandOutcome, Engine, EngineConfig, EngineHandle, OrderRequest};
pub use error::{FatalReason, RejectReason};
pub use events::{EngineEvent, EventBus, EventKind, EventRecord, OverflowPolicy, Subscription};
pub use journal::{DurabilityMode, FileJournal, Journal, JournalEntry, JournalError};
pub use ledger::{AccountKind, BalanceSnapshot, Ledger, LedgerEntry};
pub use money::Micros;
pub use orders::{
    CancelReason, Order, OrderFlags, OrderId, OrderKind, OrderStatus, Side, TimeInForce, UserId,
};
pub use position::{Position, PositionManager};
pub use risk::{AccountSummary, RiskGate};
pub use trade::{Trade, TradeId};
pub use utils::current_time_millis;
