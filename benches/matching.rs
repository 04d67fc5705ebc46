//! Matching throughput: rest-heavy and sweep-heavy submissions against a
//! seeded book.

use criterion::{Criterion, criterion_group, criterion_main};
use exchange_core::prelude::*;
use std::hint::black_box;

const PX: i64 = 3_500_000_000;
const TICK: i64 = 10_000;

fn spec() -> SymbolSpec {
    SymbolSpec {
        symbol: "BTC-PERP".to_string(),
        tick_size: Micros::new(TICK),
        lot_size: 1,
        min_order: 1,
        max_order: 1_000_000,
        maker_fee_bps: -2,
        taker_fee_bps: 5,
        initial_margin_bps: 1_000,
        maintenance_margin_bps: 500,
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
        reference_source_id: "bench".to_string(),
    }
}

fn order(id: u64, user: u64, side: Side, qty: i64, price: Option<i64>) -> Order {
    Order {
        id: OrderId(id),
        client_id: String::new(),
        user_id: UserId(user),
        symbol: "BTC-PERP".to_string(),
        side,
        kind: if price.is_some() {
            OrderKind::Limit
        } else {
            OrderKind::Market
        },
        price: price.map(Micros::new),
        trigger: None,
        quantity: qty,
        filled: 0,
        remaining: qty,
        status: OrderStatus::New,
        enqueue_seq: id,
        time_in_force: TimeInForce::Gtc,
        flags: OrderFlags::empty(),
    }
}

fn seeded_book(levels: i64, orders_per_level: i64) -> (OrderBook, u64) {
    let mut book = OrderBook::new(spec());
    let mut id = 1u64;
    for level in 0..levels {
        for _ in 0..orders_per_level {
            let bid = order(id, 1 + id % 7, Side::Buy, 10, Some(PX - level * TICK));
            book.submit(bid, 0).expect("seed bid");
            id += 1;
            let ask = order(id, 1 + id % 7, Side::Sell, 10, Some(PX + TICK + level * TICK));
            book.submit(ask, 0).expect("seed ask");
            id += 1;
        }
    }
    (book, id)
}

fn bench_resting_adds(c: &mut Criterion) {
    c.bench_function("rest_non_crossing_limit", |b| {
        let (mut book, mut next_id) = seeded_book(50, 4);
        b.iter(|| {
            let price = PX - (next_id % 50) as i64 * TICK;
            let incoming = order(next_id, 1 + next_id % 7, Side::Buy, 10, Some(price));
            next_id += 1;
            black_box(book.submit(incoming, 0).expect("rest"));
        });
    });
}

fn bench_aggressive_sweep(c: &mut Criterion) {
    c.bench_function("sweep_three_levels", |b| {
        b.iter_batched(
            || seeded_book(20, 4),
            |(mut book, next_id)| {
                let incoming = order(next_id, 97, Side::Buy, 120, Some(PX + 4 * TICK));
                black_box(book.submit(incoming, 0).expect("sweep"));
            },
            criterion::BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_resting_adds, bench_aggressive_sweep);
criterion_main!(benches);
