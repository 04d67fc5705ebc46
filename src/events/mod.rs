//! Sequenced events and their fan-out to subscribers.

mod bus;
mod event;

pub use bus::{EventBus, OverflowPolicy, Subscription};
pub use event::{EngineEvent, EventKind, EventRecord};
