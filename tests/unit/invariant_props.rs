//! Property tests: conservation, book integrity and ledger balance over
//! random command streams.

use super::common::*;
use exchange_core::prelude::*;
use proptest::prelude::*;
use std::collections::HashMap;

#[derive(Debug, Clone)]
enum Op {
    Limit {
        user: u64,
        buy: bool,
        qty: i64,
        tick_offset: i64,
    },
    Market {
        user: u64,
        buy: bool,
        qty: i64,
    },
    CancelNth(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (1u64..=3, any::<bool>(), 1i64..50, -20i64..=20).prop_map(
            |(user, buy, qty, tick_offset)| Op::Limit {
                user,
                buy,
                qty,
                tick_offset,
            }
        ),
        1 => (1u64..=3, any::<bool>(), 1i64..30).prop_map(|(user, buy, qty)| Op::Market {
            user,
            buy,
            qty
        }),
        1 => (0usize..64).prop_map(Op::CancelNth),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn invariants_hold_over_random_command_streams(ops in prop::collection::vec(op_strategy(), 1..80)) {
        let (mut engine, _clock) = engine_with_users();

        let mut accepted: Vec<OrderId> = Vec::new();
        let mut accepted_qty: i64 = 0;
        let mut traded_qty: i64 = 0;
        let mut canceled_remaining: i64 = 0;
        let mut order_owner: HashMap<OrderId, u64> = HashMap::new();

        for op in &ops {
            let command = match op {
                Op::Limit { user, buy, qty, tick_offset } => limit(
                    *user,
                    if *buy { Side::Buy } else { Side::Sell },
                    *qty,
                    PX + tick_offset * TICK,
                ),
                Op::Market { user, buy, qty } => market(
                    *user,
                    if *buy { Side::Buy } else { Side::Sell },
                    *qty,
                ),
                Op::CancelNth(n) => {
                    let Some(id) = accepted.get(n % accepted.len().max(1)) else {
                        continue;
                    };
                    Command::CancelOrder {
                        user_id: UserId(order_owner.get(id).copied().unwrap_or(1)),
                        symbol: SYMBOL.to_string(),
                        order_id: *id,
                    }
                }
            };

            let outcome = engine.apply(command);
            for record in &outcome.events {
                match &record.event {
                    EngineEvent::OrderAccepted { order } => {
                        accepted.push(order.id);
                        accepted_qty += order.quantity;
                        order_owner.insert(order.id, order.user_id.0);
                    }
                    EngineEvent::TradeExecuted { trade } => {
                        traded_qty += trade.quantity;
                        prop_assert!(trade.maker_user != trade.taker_user);
                    }
                    EngineEvent::OrderCanceled { remaining, .. } => {
                        canceled_remaining += remaining;
                    }
                    _ => {}
                }
            }

            // Universal invariants after every command.
            let book = engine.book(SYMBOL).unwrap();
            prop_assert!(book.validate().is_ok(), "{:?}", book.validate());
            if let (Some(bid), Some(ask)) = book.bbo() {
                prop_assert!(bid < ask);
            }
            let (debits, credits) = engine.ledger().cumulative_totals();
            prop_assert_eq!(debits, credits);
            prop_assert!(!engine.is_fatal());
        }

        // Conservation: every accepted lot is traded away (twice per
        // trade: maker + taker), canceled, or still resting.
        let book = engine.book(SYMBOL).unwrap();
        let (bids, asks) = book.depth(usize::MAX);
        let resting: i64 = bids.iter().chain(asks.iter()).map(|l| l.quantity).sum();
        prop_assert_eq!(accepted_qty, 2 * traded_qty + canceled_remaining + resting);

        // Per-user cash stays non-negative (margin gate held the line).
        for user in 1..=3u64 {
            prop_assert!(engine.ledger().cash_is_sound(UserId(user)));
        }
    }
}
