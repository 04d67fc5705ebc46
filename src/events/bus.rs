//! Fan-out of sequenced events to subscribers.
//!
//! Each subscriber owns a bounded lock-free queue. The publishing side —
//! the sequencer — never blocks: when a queue is full the configured
//! [`OverflowPolicy`] either displaces the oldest record or disconnects
//! the subscriber. A slow consumer can therefore lose data or its
//! subscription, but it can never stall the matching path.

use super::event::EventRecord;
use crossbeam::queue::ArrayQueue;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// What to do when a subscriber's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OverflowPolicy {
    /// Displace the oldest queued record; the subscriber sees a gap and
    /// can re-request replay from the journal.
    #[default]
    DropOldest,
    /// Disconnect the subscriber; it must resubscribe.
    DisconnectSubscriber,
}

struct SubscriberSlot {
    queue: Arc<ArrayQueue<EventRecord>>,
    connected: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

/// The fan-out hub. Publishing is wait-free with respect to subscribers.
pub struct EventBus {
    subscribers: DashMap<Uuid, SubscriberSlot>,
    capacity: usize,
    policy: OverflowPolicy,
}

impl EventBus {
    /// Create a bus whose subscribers each get a queue of `capacity`
    /// records, governed by `policy` on overflow.
    #[must_use]
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            subscribers: DashMap::new(),
            capacity: capacity.max(1),
            policy,
        }
    }

    /// Register a new subscriber.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        let id = Uuid::new_v4();
        let queue = Arc::new(ArrayQueue::new(self.capacity));
        let connected = Arc::new(AtomicBool::new(true));
        let dropped = Arc::new(AtomicU64::new(0));
        self.subscribers.insert(
            id,
            SubscriberSlot {
                queue: Arc::clone(&queue),
                connected: Arc::clone(&connected),
                dropped: Arc::clone(&dropped),
            },
        );
        debug!("subscriber {id} registered");
        Subscription {
            id,
            queue,
            connected,
            dropped,
        }
    }

    /// Remove a subscriber.
    pub fn unsubscribe(&self, id: Uuid) {
        if let Some((_, slot)) = self.subscribers.remove(&id) {
            slot.connected.store(false, Ordering::Release);
        }
    }

    /// Number of connected subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Publish one record to every subscriber. Never blocks.
    pub fn publish(&self, record: &EventRecord) {
        let mut to_disconnect = Vec::new();
        for entry in self.subscribers.iter() {
            let slot = entry.value();
            match self.policy {
                OverflowPolicy::DropOldest => {
                    if slot.queue.force_push(record.clone()).is_some() {
                        slot.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                OverflowPolicy::DisconnectSubscriber => {
                    if slot.queue.push(record.clone()).is_err() {
                        slot.connected.store(false, Ordering::Release);
                        to_disconnect.push(*entry.key());
                    }
                }
            }
        }
        for id in to_disconnect {
            warn!("subscriber {id} overflowed and was disconnected");
            self.subscribers.remove(&id);
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers.len())
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .finish()
    }
}

/// A consumer's end of the bus.
pub struct Subscription {
    id: Uuid,
    queue: Arc<ArrayQueue<EventRecord>>,
    connected: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    /// This subscription's identity.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Pop the next record if one is queued.
    #[must_use]
    pub fn try_next(&self) -> Option<EventRecord> {
        self.queue.pop()
    }

    /// Pop the next record, polling up to `timeout`.
    ///
    /// Subscriber threads run at their own pace; a short sleep between
    /// polls keeps this independent of the sequencer.
    #[must_use]
    pub fn next_timeout(&self, timeout: Duration) -> Option<EventRecord> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(record) = self.queue.pop() {
                return Some(record);
            }
            if !self.is_connected() || Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Drain everything currently queued.
    #[must_use]
    pub fn drain(&self) -> Vec<EventRecord> {
        let mut records = Vec::new();
        while let Some(record) = self.queue.pop() {
            records.push(record);
        }
        records
    }

    /// Whether the bus still considers this subscriber connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Number of records displaced under [`OverflowPolicy::DropOldest`].
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event::EngineEvent;
    use crate::money::Micros;
    use crate::orders::UserId;

    fn record(seq: u64) -> EventRecord {
        EventRecord {
            command_seq: seq,
            event_seq: 0,
            event: EngineEvent::FundingApplied {
                symbol: "BTC-PERP".to_string(),
                user: UserId(1),
                rate_micros: 1,
                charge: Micros::new(1),
            },
        }
    }

    #[test]
    fn test_publish_reaches_all_subscribers() {
        let bus = EventBus::new(8, OverflowPolicy::DropOldest);
        let a = bus.subscribe();
        let b = bus.subscribe();
        bus.publish(&record(1));

        assert_eq!(a.try_next().unwrap().command_seq, 1);
        assert_eq!(b.try_next().unwrap().command_seq, 1);
        assert!(a.try_next().is_none());
    }

    #[test]
    fn test_drop_oldest_displaces_head() {
        let bus = EventBus::new(2, OverflowPolicy::DropOldest);
        let sub = bus.subscribe();
        for seq in 1..=4 {
            bus.publish(&record(seq));
        }
        // Oldest two were displaced.
        assert_eq!(sub.dropped_count(), 2);
        assert_eq!(sub.try_next().unwrap().command_seq, 3);
        assert_eq!(sub.try_next().unwrap().command_seq, 4);
        assert!(sub.is_connected());
    }

    #[test]
    fn test_disconnect_policy_removes_subscriber() {
        let bus = EventBus::new(1, OverflowPolicy::DisconnectSubscriber);
        let sub = bus.subscribe();
        bus.publish(&record(1));
        bus.publish(&record(2));

        assert!(!sub.is_connected());
        assert_eq!(bus.subscriber_count(), 0);
        // The record queued before the overflow is still readable.
        assert_eq!(sub.try_next().unwrap().command_seq, 1);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new(4, OverflowPolicy::DropOldest);
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        bus.unsubscribe(sub.id());
        assert_eq!(bus.subscriber_count(), 0);
        assert!(!sub.is_connected());
    }

    #[test]
    fn test_next_timeout_returns_queued() {
        let bus = EventBus::new(4, OverflowPolicy::DropOldest);
        let sub = bus.subscribe();
        bus.publish(&record(7));
        let got = sub.next_timeout(Duration::from_millis(50)).unwrap();
        assert_eq!(got.command_seq, 7);
        assert!(sub.next_timeout(Duration::from_millis(5)).is_none());
    }
}
