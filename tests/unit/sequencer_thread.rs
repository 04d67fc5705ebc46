//! The threaded front end: handles, replies, deadlines, subscriptions.

use super::common::*;
use exchange_core::prelude::*;
use std::time::{Duration, Instant};

#[test]
fn spawned_engine_sequences_submitted_commands() {
    let (engine, _clock) = engine_with_users();
    let (handle, thread) = engine.spawn();

    let rx = handle.submit_wait(limit(1, Side::Buy, 10, PX)).unwrap();
    let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(outcome
        .events
        .iter()
        .any(|r| matches!(r.event, EngineEvent::OrderAccepted { .. })));

    let rx = handle.submit_wait(limit(2, Side::Sell, 10, PX)).unwrap();
    let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(
        outcome
            .events
            .iter()
            .filter(|r| matches!(r.event, EngineEvent::TradeExecuted { .. }))
            .count(),
        1
    );

    drop(handle);
    let engine = thread.join().unwrap();
    assert_eq!(engine.positions().net_size(SYMBOL, UserId(1)), 10);
}

#[test]
fn expired_deadline_rejects_with_timeout() {
    let (engine, _clock) = engine_with_users();
    let (handle, thread) = engine.spawn();

    let past = Instant::now() - Duration::from_millis(10);
    let rx = handle
        .submit_with_deadline(limit(1, Side::Buy, 10, PX), past)
        .unwrap();
    let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(outcome.events.iter().any(|r| matches!(
        r.event,
        EngineEvent::OrderRejected {
            reason: RejectReason::Timeout,
            ..
        }
    )));

    drop(handle);
    let engine = thread.join().unwrap();
    // The expired command touched nothing.
    assert_eq!(engine.book(SYMBOL).unwrap().bbo(), (None, None));
}

#[test]
fn subscribers_see_events_in_order() {
    let (engine, _clock) = engine_with_users();
    let sub = engine.subscribe();
    // Deposits already happened before subscribing; only new commands
    // reach this subscriber.
    let (handle, thread) = engine.spawn();

    handle.submit(limit(1, Side::Buy, 10, PX)).unwrap();
    handle.submit(limit(2, Side::Sell, 10, PX)).unwrap();
    drop(handle);
    let _engine = thread.join().unwrap();

    let records = sub.drain();
    assert!(!records.is_empty());
    // (command_seq, event_seq) is strictly increasing lexicographically,
    // and events for one command are contiguous.
    let mut prev = None;
    for record in &records {
        let key = (record.command_seq, record.event_seq);
        if let Some(prev) = prev {
            assert!(key > prev, "events out of order: {key:?} after {prev:?}");
        }
        prev = Some(key);
    }
    assert!(records
        .iter()
        .any(|r| matches!(r.event, EngineEvent::TradeExecuted { .. })));
}

/// A journal whose writes start failing on command, for driving the
/// fatal-error path.
struct FlakyJournal {
    fail_after: std::sync::atomic::AtomicU64,
}

impl Journal for FlakyJournal {
    fn append(&self, record: &EventRecord) -> Result<(), exchange_core::JournalError> {
        let limit = self.fail_after.load(std::sync::atomic::Ordering::SeqCst);
        if record.command_seq >= limit {
            return Err(exchange_core::JournalError::Io {
                message: "disk on fire".to_string(),
                path: None,
            });
        }
        Ok(())
    }

    fn sync(&self) -> Result<(), exchange_core::JournalError> {
        Ok(())
    }

    fn read_from(
        &self,
        _from: u64,
    ) -> Result<exchange_core::journal::JournalReadIter, exchange_core::JournalError> {
        Ok(Box::new(std::iter::empty()))
    }

    fn last_command_seq(&self) -> Option<u64> {
        None
    }

    fn verify_integrity(&self) -> Result<(), exchange_core::JournalError> {
        Ok(())
    }
}

#[test]
fn journal_failure_is_fatal_and_shard_stops() {
    let journal = FlakyJournal {
        fail_after: std::sync::atomic::AtomicU64::new(4),
    };
    let (mut engine, _clock) = engine_with_config(EngineConfig::default(), Some(Box::new(journal)));

    // Command seq 3 still journals fine (0..=2 were the deposits).
    let outcome = engine.apply(limit(1, Side::Buy, 10, PX));
    assert!(rejection(&outcome).is_none());
    assert!(!engine.is_fatal());

    // Command seq 4 hits the failing disk: FatalError is appended to the
    // event run and the shard stops.
    let outcome = engine.apply(limit(2, Side::Sell, 10, PX));
    assert!(outcome.events.iter().any(|r| matches!(
        r.event,
        EngineEvent::FatalError {
            reason: FatalReason::JournalWriteFailed { .. }
        }
    )));
    assert!(engine.is_fatal());

    // Everything afterwards is rejected without state changes.
    let outcome = engine.apply(limit(3, Side::Buy, 1, PX));
    assert!(matches!(
        rejection(&outcome),
        Some(RejectReason::Halted { .. })
    ));
}
