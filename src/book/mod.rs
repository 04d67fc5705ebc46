//! Per-symbol price-time-priority order book.
//!
//! The book is single-writer: it is owned by the sequencer and mutated only
//! on the sequencer thread. Matching follows strict price priority, then
//! arrival (`enqueue_seq`) priority within a level; execution always prints
//! at the resting order's price.

mod book;
mod level;
mod matching;
mod stops;
pub mod stp;

pub use book::{BookDelta, BookSnapshot, LevelView, OrderBook};
pub use level::PriceLevel;
pub use matching::{Fill, MatchOutcome};
pub use stp::StpPolicy;
