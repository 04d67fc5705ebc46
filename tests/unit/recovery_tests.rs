//! Crash-recovery: replaying the journal reproduces identical state.

use super::common::*;
use exchange_core::prelude::*;

fn run_workload(engine: &mut Engine) {
    engine.apply(reference(PX, 1_000));
    // A deterministic mix: rests, crossings, cancels, a stop, funding.
    let mut placed = Vec::new();
    for i in 0..40i64 {
        let user = 1 + (i % 3) as u64;
        let side = if i % 2 == 0 { Side::Buy } else { Side::Sell };
        let offset = (i % 7 - 3) * TICK;
        let price = if side == Side::Buy {
            PX - 2 * TICK + offset
        } else {
            PX + 2 * TICK + offset
        };
        let outcome = engine.apply(limit(user, side, 5 + i % 10, price));
        if let Some(id) = outcome.events.iter().find_map(|r| match &r.event {
            EngineEvent::OrderAccepted { order } => Some(order.id),
            _ => None,
        }) {
            placed.push(id);
        }
    }
    // Cross the spread a few times.
    engine.apply(limit(1, Side::Sell, 30, PX - 2 * TICK));
    engine.apply(limit(2, Side::Buy, 25, PX + 2 * TICK));
    engine.apply(market(3, Side::Buy, 10));
    // Cancel every third placed order.
    for id in placed.iter().step_by(3) {
        for user in 1..=3u64 {
            engine.apply(Command::CancelOrder {
                user_id: UserId(user),
                symbol: SYMBOL.to_string(),
                order_id: *id,
            });
        }
    }
    // A parked stop that survives to the snapshot.
    engine.apply(Command::PlaceOrder {
        request: OrderRequest {
            client_id: "wl-stop".to_string(),
            user_id: UserId(1),
            symbol: SYMBOL.to_string(),
            side: Side::Sell,
            kind: OrderKind::StopLimit,
            price: Some(Micros::new(PX - 40 * TICK)),
            trigger: Some(Micros::new(PX - 30 * TICK)),
            quantity: 5,
            time_in_force: TimeInForce::Gtc,
            flags: OrderFlags::empty(),
        },
    });
    engine.apply(Command::ApplyFundingTick {
        symbol: SYMBOL.to_string(),
        rate_micros: 50,
        timestamp_ms: 5_000,
    });
}

#[test]
fn replay_reproduces_identical_state() {
    let dir = tempfile::tempdir().unwrap();

    let (digest, next_seq) = {
        let journal = FileJournal::open(dir.path()).unwrap();
        let (mut engine, _clock) =
            engine_with_config(EngineConfig::default(), Some(Box::new(journal)));
        run_workload(&mut engine);
        assert!(!engine.is_fatal());
        (engine.state_digest(), engine.next_command_seq())
        // Engine dropped here: crash-kill. PerCommand durability means
        // everything acknowledged is on disk.
    };

    let journal = FileJournal::open(dir.path()).unwrap();
    let recovered = Engine::recover(catalog(), EngineConfig::default(), Box::new(journal)).unwrap();

    assert_eq!(recovered.state_digest(), digest);
    assert_eq!(recovered.next_command_seq(), next_seq);
    assert!(!recovered.is_fatal());
    recovered.book(SYMBOL).unwrap().validate().unwrap();
    let (debits, credits) = recovered.ledger().cumulative_totals();
    assert_eq!(debits, credits);
}

#[test]
fn recovered_engine_continues_sequencing() {
    let dir = tempfile::tempdir().unwrap();
    {
        let journal = FileJournal::open(dir.path()).unwrap();
        let (mut engine, _clock) =
            engine_with_config(EngineConfig::default(), Some(Box::new(journal)));
        engine.apply(limit(1, Side::Buy, 10, PX));
    }

    let journal = FileJournal::open(dir.path()).unwrap();
    let mut recovered =
        Engine::recover(catalog(), EngineConfig::default(), Box::new(journal)).unwrap();

    // The recovered book still has the resting bid; a sell crosses it.
    let outcome = recovered.apply(limit(2, Side::Sell, 10, PX));
    assert_eq!(trades(&outcome).len(), 1);
    assert_eq!(trades(&outcome)[0].quantity, 10);
}

#[test]
fn corrupt_tail_is_ignored_on_recovery() {
    let dir = tempfile::tempdir().unwrap();
    {
        let journal = FileJournal::open(dir.path()).unwrap();
        let (mut engine, _clock) =
            engine_with_config(EngineConfig::default(), Some(Box::new(journal)));
        engine.apply(limit(1, Side::Buy, 10, PX));
        engine.apply(limit(2, Side::Sell, 4, PX));
    }

    // Flip one byte near the end of the written region.
    let seg = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .find(|e| e.file_name().to_string_lossy().ends_with(".wal"))
        .unwrap()
        .path();
    let mut bytes = std::fs::read(&seg).unwrap();
    let written_end = bytes
        .iter()
        .rposition(|&b| b != 0)
        .unwrap_or(bytes.len() - 1);
    bytes[written_end - 4] ^= 0xFF;
    std::fs::write(&seg, &bytes).unwrap();

    let journal = FileJournal::open(dir.path()).unwrap();
    let recovered = Engine::recover(catalog(), EngineConfig::default(), Box::new(journal)).unwrap();
    // The prefix replayed cleanly; the engine is live, not fatal.
    assert!(!recovered.is_fatal());
    recovered.book(SYMBOL).unwrap().validate().unwrap();
}

#[test]
fn per_batch_durability_syncs_on_schedule() {
    let dir = tempfile::tempdir().unwrap();
    let journal = FileJournal::open(dir.path()).unwrap();
    let mut config = EngineConfig::default();
    config.durability = DurabilityMode::PerBatch(4);
    let (mut engine, _clock) = engine_with_config(config, Some(Box::new(journal)));

    for i in 0..10 {
        engine.apply(limit(1, Side::Buy, 1, PX - i * TICK));
    }
    assert!(!engine.is_fatal());

    // Everything appended is readable back (read_from flushes).
    let journal = FileJournal::open(dir.path()).unwrap();
    let count = journal.read_from(0).unwrap().filter(Result::is_ok).count();
    assert!(count > 10);
}
