//! Shared fixtures for the integration tests.

use exchange_core::prelude::*;
use std::sync::{Arc, Once};
use std::sync::atomic::{AtomicU64, Ordering};

static INIT_TRACING: Once = Once::new();

/// Install a test subscriber once so `RUST_LOG=exchange_core=trace`
/// surfaces engine internals during debugging runs.
fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Tick chosen fine enough for the circuit-breaker scenario prices.
pub const TICK: i64 = 1_000;
pub const PX: i64 = 3_500_000_000;
pub const SYMBOL: &str = "BTC-PERP";

pub fn symbol_spec() -> SymbolSpec {
    SymbolSpec {
        symbol: SYMBOL.to_string(),
        tick_size: Micros::new(TICK),
        lot_size: 1,
        min_order: 1,
        max_order: 1_000_000,
        maker_fee_bps: -2,
        taker_fee_bps: 5,
        initial_margin_bps: 1_000,
        maintenance_margin_bps: 200,
        max_leverage: 10,
        circuit_bands: [
            CircuitBand {
                deviation_bps: 300,
                halt_ms: 60_000,
            },
            CircuitBand {
                deviation_bps: 500,
                halt_ms: 300_000,
            },
            CircuitBand {
                deviation_bps: 1_000,
                halt_ms: 3_600_000,
            },
        ],
        stp_policy: StpPolicy::CancelTaker,
        is_hedgeable: true,
        reference_source_id: "cb-usd".to_string(),
    }
}

pub fn catalog() -> ProductCatalog {
    ProductCatalog::new([symbol_spec()]).expect("valid catalog")
}

/// A controllable wall clock shared with the engine.
#[derive(Clone)]
pub struct TestClock(Arc<AtomicU64>);

impl TestClock {
    pub fn new(start_ms: u64) -> Self {
        Self(Arc::new(AtomicU64::new(start_ms)))
    }

    pub fn advance(&self, ms: u64) {
        self.0.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.0.store(ms, Ordering::SeqCst);
    }

    pub fn now(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Engine with three funded users and a controlled clock, no journal.
pub fn engine_with_users() -> (Engine, TestClock) {
    engine_with_config(EngineConfig::default(), None)
}

pub fn engine_with_config(
    config: EngineConfig,
    journal: Option<Box<dyn Journal>>,
) -> (Engine, TestClock) {
    init_tracing();
    let clock = TestClock::new(1_000);
    let mut engine = Engine::new(catalog(), config, journal).expect("engine");
    let handle = clock.clone();
    engine.set_clock(move || handle.now());
    for user in 1..=3u64 {
        engine.open_account(UserId(user));
        let outcome = engine.apply(Command::Deposit {
            user_id: UserId(user),
            amount: Micros::new(1_000_000_000_000),
        });
        assert!(
            matches!(
                outcome.events[0].event,
                EngineEvent::LedgerPosted { .. }
            ),
            "deposit should post: {:?}",
            outcome.events
        );
    }
    (engine, clock)
}

pub fn limit(user: u64, side: Side, qty: i64, price: i64) -> Command {
    Command::PlaceOrder {
        request: OrderRequest {
            client_id: format!("c-{user}-{price}-{qty}"),
            user_id: UserId(user),
            symbol: SYMBOL.to_string(),
            side,
            kind: OrderKind::Limit,
            price: Some(Micros::new(price)),
            trigger: None,
            quantity: qty,
            time_in_force: TimeInForce::Gtc,
            flags: OrderFlags::empty(),
        },
    }
}

pub fn market(user: u64, side: Side, qty: i64) -> Command {
    Command::PlaceOrder {
        request: OrderRequest {
            client_id: format!("m-{user}-{qty}"),
            user_id: UserId(user),
            symbol: SYMBOL.to_string(),
            side,
            kind: OrderKind::Market,
            price: None,
            trigger: None,
            quantity: qty,
            time_in_force: TimeInForce::Gtc,
            flags: OrderFlags::empty(),
        },
    }
}

pub fn reference(price: i64, ts: u64) -> Command {
    Command::ApplyReferencePrice {
        symbol: SYMBOL.to_string(),
        price: Micros::new(price),
        source_id: "cb-usd".to_string(),
        timestamp_ms: ts,
    }
}

/// Collect the trades out of a command outcome.
pub fn trades(outcome: &CommandOutcome) -> Vec<Trade> {
    outcome
        .events
        .iter()
        .filter_map(|record| match &record.event {
            EngineEvent::TradeExecuted { trade } => Some(trade.clone()),
            _ => None,
        })
        .collect()
}

/// The first rejection reason in an outcome, if any.
pub fn rejection(outcome: &CommandOutcome) -> Option<RejectReason> {
    outcome.events.iter().find_map(|record| match &record.event {
        EngineEvent::OrderRejected { reason, .. } => Some(reason.clone()),
        _ => None,
    })
}

/// Whether any event in the outcome matches the predicate.
pub fn has_event(outcome: &CommandOutcome, pred: impl Fn(&EngineEvent) -> bool) -> bool {
    outcome.events.iter().any(|record| pred(&record.event))
}
