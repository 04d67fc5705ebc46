//! End-to-end scenarios through the full sequencer pipeline.

use super::common::*;
use exchange_core::prelude::*;

#[test]
fn crossing_limit_matches_fifo_across_two_makers() {
    let (mut engine, _clock) = engine_with_users();
    engine.apply(limit(1, Side::Buy, 100, PX));
    engine.apply(limit(2, Side::Buy, 50, PX));

    let outcome = engine.apply(limit(3, Side::Sell, 120, PX));
    let fills = trades(&outcome);
    assert_eq!(fills.len(), 2);
    assert_eq!(fills[0].quantity, 100);
    assert_eq!(fills[0].price, Micros::new(PX));
    assert_eq!(fills[0].maker_user, UserId(1));
    assert_eq!(fills[1].quantity, 20);
    assert_eq!(fills[1].maker_user, UserId(2));
    // Trade ids are unique and increasing.
    assert!(fills[0].id < fills[1].id);

    // The second bid keeps 30 resting.
    let book = engine.book(SYMBOL).unwrap();
    let (bids, _asks) = book.depth(1);
    assert_eq!(bids[0].quantity, 30);
    assert_eq!(bids[0].price, Micros::new(PX));
    book.validate().unwrap();
}

#[test]
fn post_only_rejects_when_crossing() {
    let (mut engine, _clock) = engine_with_users();
    engine.apply(limit(1, Side::Sell, 10, PX + 10 * TICK));

    let outcome = engine.apply(Command::PlaceOrder {
        request: OrderRequest {
            client_id: "po-1".to_string(),
            user_id: UserId(2),
            symbol: SYMBOL.to_string(),
            side: Side::Buy,
            kind: OrderKind::Limit,
            price: Some(Micros::new(PX + 10 * TICK)),
            trigger: None,
            quantity: 10,
            time_in_force: TimeInForce::Gtc,
            flags: OrderFlags::POST_ONLY,
        },
    });
    assert!(matches!(
        rejection(&outcome),
        Some(RejectReason::PostOnlyWouldCross { .. })
    ));
    // Exactly one event: the rejection. Book unchanged.
    assert_eq!(outcome.events.len(), 1);
    let (_, asks) = engine.book(SYMBOL).unwrap().depth(1);
    assert_eq!(asks[0].quantity, 10);
}

#[test]
fn self_trade_prevention_cancels_taker() {
    let (mut engine, _clock) = engine_with_users();
    engine.apply(limit(1, Side::Sell, 50, PX + 20 * TICK));

    let outcome = engine.apply(market(1, Side::Buy, 30));
    assert!(trades(&outcome).is_empty());
    assert!(has_event(&outcome, |e| matches!(
        e,
        EngineEvent::OrderCanceled {
            reason: CancelReason::SelfTrade,
            ..
        }
    )));
    // The resting sell is untouched.
    let (_, asks) = engine.book(SYMBOL).unwrap().depth(1);
    assert_eq!(asks[0].quantity, 50);
}

#[test]
fn liquidation_cascade_from_reference_breach() {
    let (mut engine, _clock) = engine_with_users();
    engine.apply(reference(PX, 1_000));

    // User 1 goes long 100 @ 3500 against user 2.
    engine.apply(limit(2, Side::Sell, 100, PX));
    let outcome = engine.apply(limit(1, Side::Buy, 100, PX));
    assert_eq!(trades(&outcome).len(), 1);
    assert_eq!(engine.positions().net_size(SYMBOL, UserId(1)), 100);

    // Liquidity for the forced close.
    engine.apply(limit(3, Side::Buy, 150, 3_430_000_000));

    // 2% maintenance margin puts the liquidation price at 3430; a
    // reference print at 3420 breaches it.
    let outcome = engine.apply(reference(3_420_000_000, 2_000));
    assert!(has_event(&outcome, |e| matches!(
        e,
        EngineEvent::LiquidationRequired {
            user: UserId(1),
            ..
        }
    )));

    // The ForceLiquidate command was sequenced right after: position
    // closed against the book, realized loss posted.
    assert_eq!(engine.positions().net_size(SYMBOL, UserId(1)), 0);
    let position = engine.positions().get(SYMBOL, UserId(1)).unwrap();
    // (3430 − 3500) · 100 = −7000 units.
    assert_eq!(position.realized_pnl, Micros::new(-7_000_000_000));
    // Ledger stayed balanced throughout.
    let (debits, credits) = engine.ledger().cumulative_totals();
    assert_eq!(debits, credits);
    assert!(!engine.is_fatal());
}

#[test]
fn liquidation_shortfall_draws_insurance() {
    let mut config = EngineConfig::default();
    config.insurance_fund = Micros::new(100_000_000_000);
    let clock = TestClock::new(1_000);
    let mut engine = Engine::new(catalog(), config, None).unwrap();
    let handle = clock.clone();
    engine.set_clock(move || handle.now());

    // User 1 gets just enough cash to open the position.
    for (user, cash) in [(1u64, 36_000_000_000i64), (2, 1_000_000_000_000), (3, 1_000_000_000_000)] {
        engine.open_account(UserId(user));
        engine.apply(Command::Deposit {
            user_id: UserId(user),
            amount: Micros::new(cash),
        });
    }
    engine.apply(reference(PX, 1_000));
    engine.apply(limit(2, Side::Sell, 100, PX));
    engine.apply(limit(1, Side::Buy, 100, PX));
    assert_eq!(engine.positions().net_size(SYMBOL, UserId(1)), 100);

    // The market gaps far through the liquidation price; the only bid
    // sits way below bankruptcy.
    engine.apply(limit(3, Side::Buy, 150, 3_000_000_000));
    let outcome = engine.apply(reference(3_400_000_000, 2_000));
    assert!(has_event(&outcome, |e| matches!(
        e,
        EngineEvent::LiquidationRequired { .. }
    )));

    // Closed at 3000: realized −50_000 units, far beyond the margin.
    assert_eq!(engine.positions().net_size(SYMBOL, UserId(1)), 0);
    // Insurance absorbed the shortfall; the user's cash is whole.
    assert!(engine.ledger().cash_is_sound(UserId(1)));
    assert!(engine.ledger().insurance_balance() < Micros::new(100_000_000_000));
    let (debits, credits) = engine.ledger().cumulative_totals();
    assert_eq!(debits, credits);
}

#[test]
fn circuit_breaker_halts_then_resumes() {
    let (mut engine, clock) = engine_with_users();
    engine.apply(reference(PX, 1_000));

    // A print 3.00003% above the reference breaches band 1.
    let breach_price = 3_605_001_000;
    engine.apply(limit(1, Side::Sell, 10, breach_price));
    let outcome = engine.apply(limit(2, Side::Buy, 10, breach_price));
    assert_eq!(trades(&outcome).len(), 1);
    assert!(has_event(&outcome, |e| matches!(
        e,
        EngineEvent::CircuitHalted {
            reason: HaltReason::Band(0),
            ..
        }
    )));

    // Submits now reject with Halted; cancels still work.
    let outcome = engine.apply(limit(3, Side::Buy, 5, PX));
    assert!(matches!(
        rejection(&outcome),
        Some(RejectReason::Halted { .. })
    ));

    let resting = engine.apply(limit(3, Side::Buy, 5, PX));
    assert!(matches!(
        rejection(&resting),
        Some(RejectReason::Halted { .. })
    ));

    // Past expiry, an acceptable reference resumes matching.
    clock.advance(61_000);
    let outcome = engine.apply(reference(3_600_000_000, clock.now()));
    assert!(has_event(&outcome, |e| matches!(
        e,
        EngineEvent::CircuitResumed { .. }
    )));

    let outcome = engine.apply(limit(3, Side::Buy, 5, 3_600_000_000));
    assert!(rejection(&outcome).is_none());
}

#[test]
fn cancel_of_terminal_order_reports_already_terminal() {
    let (mut engine, _clock) = engine_with_users();
    let placed = engine.apply(limit(1, Side::Buy, 10, PX));
    let order_id = placed
        .events
        .iter()
        .find_map(|r| match &r.event {
            EngineEvent::OrderAccepted { order } => Some(order.id),
            _ => None,
        })
        .unwrap();

    // First cancel succeeds.
    let outcome = engine.apply(Command::CancelOrder {
        user_id: UserId(1),
        symbol: SYMBOL.to_string(),
        order_id,
    });
    assert!(has_event(&outcome, |e| matches!(
        e,
        EngineEvent::OrderCanceled {
            reason: CancelReason::UserRequested,
            ..
        }
    )));

    // Second cancel is a no-op rejection, nothing else perturbed.
    let outcome = engine.apply(Command::CancelOrder {
        user_id: UserId(1),
        symbol: SYMBOL.to_string(),
        order_id,
    });
    assert!(matches!(
        rejection(&outcome),
        Some(RejectReason::AlreadyTerminal { .. })
    ));
    assert_eq!(outcome.events.len(), 1);

    // Unknown ids are NotFound instead.
    let outcome = engine.apply(Command::CancelOrder {
        user_id: UserId(1),
        symbol: SYMBOL.to_string(),
        order_id: OrderId(9_999),
    });
    assert!(matches!(
        rejection(&outcome),
        Some(RejectReason::OrderNotFound { .. })
    ));
}

#[test]
fn modify_is_cancel_plus_new_and_new_rejection_keeps_cancel() {
    let (mut engine, _clock) = engine_with_users();
    let placed = engine.apply(limit(1, Side::Buy, 10, PX));
    let order_id = placed
        .events
        .iter()
        .find_map(|r| match &r.event {
            EngineEvent::OrderAccepted { order } => Some(order.id),
            _ => None,
        })
        .unwrap();

    // Price improvement: cancel + new at the better price.
    let outcome = engine.apply(Command::ModifyOrder {
        user_id: UserId(1),
        symbol: SYMBOL.to_string(),
        order_id,
        new_price: Some(Micros::new(PX + TICK)),
        new_quantity: None,
    });
    assert!(has_event(&outcome, |e| matches!(
        e,
        EngineEvent::OrderCanceled {
            reason: CancelReason::Replaced,
            ..
        }
    )));
    let new_id = outcome
        .events
        .iter()
        .find_map(|r| match &r.event {
            EngineEvent::OrderAccepted { order } => Some(order.id),
            _ => None,
        })
        .unwrap();
    assert_ne!(new_id, order_id);
    let book = engine.book(SYMBOL).unwrap();
    assert_eq!(book.bbo().0, Some(Micros::new(PX + TICK)));

    // A replacement that fails validation leaves the original canceled.
    let outcome = engine.apply(Command::ModifyOrder {
        user_id: UserId(1),
        symbol: SYMBOL.to_string(),
        order_id: new_id,
        new_price: Some(Micros::new(PX + TICK + 1)), // off-tick
        new_quantity: None,
    });
    assert!(has_event(&outcome, |e| matches!(
        e,
        EngineEvent::OrderCanceled {
            reason: CancelReason::Replaced,
            ..
        }
    )));
    assert!(matches!(
        rejection(&outcome),
        Some(RejectReason::TickAlignment { .. })
    ));
    assert_eq!(engine.book(SYMBOL).unwrap().bbo().0, None);
}

#[test]
fn stop_order_triggers_and_executes() {
    let (mut engine, _clock) = engine_with_users();

    // A resting bid to absorb the triggered stop sell.
    engine.apply(limit(3, Side::Buy, 50, PX - 30 * TICK));

    // Park a sell stop below the market.
    let outcome = engine.apply(Command::PlaceOrder {
        request: OrderRequest {
            client_id: "stop-1".to_string(),
            user_id: UserId(1),
            symbol: SYMBOL.to_string(),
            side: Side::Sell,
            kind: OrderKind::Stop,
            price: None,
            trigger: Some(Micros::new(PX - 10 * TICK)),
            quantity: 20,
            time_in_force: TimeInForce::Gtc,
            flags: OrderFlags::empty(),
        },
    });
    assert!(rejection(&outcome).is_none());
    assert_eq!(engine.book(SYMBOL).unwrap().parked_stop_count(), 1);

    // A trade at the trigger price fires the stop, which sweeps the bid.
    engine.apply(limit(2, Side::Sell, 5, PX - 10 * TICK));
    let outcome = engine.apply(limit(3, Side::Buy, 5, PX - 10 * TICK));
    assert!(has_event(&outcome, |e| matches!(
        e,
        EngineEvent::OrderUpdated {
            status: OrderStatus::Triggered,
            ..
        }
    )));
    // The stop's market order traded against the resting bid.
    let stop_trades: Vec<Trade> = trades(&outcome)
        .into_iter()
        .filter(|t| t.taker_user == UserId(1))
        .collect();
    assert_eq!(stop_trades.iter().map(|t| t.quantity).sum::<i64>(), 20);
    assert_eq!(engine.book(SYMBOL).unwrap().parked_stop_count(), 0);
}

#[test]
fn funding_tick_charges_longs_pays_shorts() {
    let (mut engine, _clock) = engine_with_users();
    engine.apply(reference(PX, 1_000));
    engine.apply(limit(2, Side::Sell, 100, PX));
    engine.apply(limit(1, Side::Buy, 100, PX));

    let cash_long_before = engine.ledger().balance(UserId(1), AccountKind::Cash);
    let cash_short_before = engine.ledger().balance(UserId(2), AccountKind::Cash);

    // 0.01% of 100 × 3500 = 35 units.
    let outcome = engine.apply(Command::ApplyFundingTick {
        symbol: SYMBOL.to_string(),
        rate_micros: 100,
        timestamp_ms: 2_000,
    });
    assert!(has_event(&outcome, |e| matches!(
        e,
        EngineEvent::FundingApplied {
            user: UserId(1),
            charge,
            ..
        } if *charge == Micros::new(35_000_000)
    )));

    let cash_long_after = engine.ledger().balance(UserId(1), AccountKind::Cash);
    let cash_short_after = engine.ledger().balance(UserId(2), AccountKind::Cash);
    assert_eq!(
        cash_long_before.checked_sub(cash_long_after),
        Some(Micros::new(35_000_000))
    );
    assert_eq!(
        cash_short_after.checked_sub(cash_short_before),
        Some(Micros::new(35_000_000))
    );
    let position = engine.positions().get(SYMBOL, UserId(1)).unwrap();
    assert_eq!(position.cumulative_funding, Micros::new(35_000_000));
}

#[test]
fn fok_boundary_through_engine() {
    let (mut engine, _clock) = engine_with_users();
    engine.apply(limit(1, Side::Sell, 70, PX));
    engine.apply(limit(2, Side::Sell, 50, PX + TICK));

    let fok = |qty: i64| Command::PlaceOrder {
        request: OrderRequest {
            client_id: format!("fok-{qty}"),
            user_id: UserId(3),
            symbol: SYMBOL.to_string(),
            side: Side::Buy,
            kind: OrderKind::Limit,
            price: Some(Micros::new(PX + TICK)),
            trigger: None,
            quantity: qty,
            time_in_force: TimeInForce::Fok,
            flags: OrderFlags::empty(),
        },
    };

    let outcome = engine.apply(fok(121));
    assert!(matches!(
        rejection(&outcome),
        Some(RejectReason::FokInfeasible {
            requested: 121,
            available: 120
        })
    ));
    assert!(trades(&outcome).is_empty());

    let outcome = engine.apply(fok(120));
    assert_eq!(trades(&outcome).iter().map(|t| t.quantity).sum::<i64>(), 120);
}

#[test]
fn withdraw_rejected_when_crossing_margin() {
    let (mut engine, _clock) = engine_with_users();
    engine.apply(reference(PX, 1_000));
    engine.apply(limit(2, Side::Sell, 100, PX));
    engine.apply(limit(1, Side::Buy, 100, PX));

    let summary = engine.account(UserId(1));
    assert!(summary.reserved_margin.is_positive());

    // Withdrawing everything the user ever had must fail now.
    let outcome = engine.apply(Command::Withdraw {
        user_id: UserId(1),
        amount: Micros::new(1_000_000_000_000),
        });
    assert!(matches!(
        rejection(&outcome),
        Some(RejectReason::WithdrawalBlocked { .. })
    ));

    // A small withdrawal inside free margin clears.
    let outcome = engine.apply(Command::Withdraw {
        user_id: UserId(1),
        amount: Micros::new(1_000_000),
    });
    assert!(rejection(&outcome).is_none());
}

#[test]
fn insufficient_margin_rejected() {
    let (mut engine, _clock) = engine_with_users();
    engine.open_account(UserId(9));
    engine.apply(Command::Deposit {
        user_id: UserId(9),
        amount: Micros::new(1_000_000),
    });
    // 10% of 100 × 3500 is far beyond one unit of cash.
    let outcome = engine.apply(limit(9, Side::Buy, 100, PX));
    assert!(matches!(
        rejection(&outcome),
        Some(RejectReason::InsufficientMargin { .. })
    ));
}

#[test]
fn unknown_user_and_symbol_rejected() {
    let (mut engine, _clock) = engine_with_users();
    let outcome = engine.apply(limit(42, Side::Buy, 1, PX));
    assert!(matches!(
        rejection(&outcome),
        Some(RejectReason::UnknownUser { .. })
    ));

    let mut cmd = limit(1, Side::Buy, 1, PX);
    if let Command::PlaceOrder { request } = &mut cmd {
        request.symbol = "DOGE-PERP".to_string();
    }
    let outcome = engine.apply(cmd);
    assert!(matches!(
        rejection(&outcome),
        Some(RejectReason::UnknownSymbol { .. })
    ));
}

#[test]
fn manual_halt_and_resume() {
    let (mut engine, _clock) = engine_with_users();
    let outcome = engine.apply(Command::HaltSymbol {
        symbol: SYMBOL.to_string(),
        reason: "ops drill".to_string(),
    });
    assert!(has_event(&outcome, |e| matches!(
        e,
        EngineEvent::CircuitHalted {
            reason: HaltReason::Manual,
            ..
        }
    )));
    let outcome = engine.apply(limit(1, Side::Buy, 1, PX));
    assert!(matches!(
        rejection(&outcome),
        Some(RejectReason::Halted { .. })
    ));

    engine.apply(Command::ResumeSymbol {
        symbol: SYMBOL.to_string(),
    });
    let outcome = engine.apply(limit(1, Side::Buy, 1, PX));
    assert!(rejection(&outcome).is_none());
}

#[test]
fn event_sequencing_is_contiguous_per_command() {
    let (mut engine, _clock) = engine_with_users();
    engine.apply(limit(1, Side::Buy, 100, PX));
    let outcome = engine.apply(limit(2, Side::Sell, 40, PX));

    assert!(outcome.events.len() > 1);
    for (idx, record) in outcome.events.iter().enumerate() {
        assert_eq!(record.command_seq, outcome.command_seq);
        assert_eq!(record.event_seq, idx as u32);
    }
}

#[test]
fn extreme_price_hits_overflow_guard_not_panic() {
    let (mut engine, _clock) = engine_with_users();
    // The largest tick-aligned price representable. The margin
    // requirement on it overflows, which must surface as a rejection,
    // never as wrapped arithmetic.
    let price = (i64::MAX / TICK) * TICK;
    let outcome = engine.apply(limit(1, Side::Buy, 1, price));
    assert!(matches!(
        rejection(&outcome),
        Some(RejectReason::InsufficientMargin { .. })
    ));
    assert!(!engine.is_fatal());

    // One tick off alignment rejects on the tick check instead.
    let outcome = engine.apply(limit(1, Side::Buy, 1, price - 1));
    assert!(matches!(
        rejection(&outcome),
        Some(RejectReason::TickAlignment { .. })
    ));
}

#[test]
fn determinism_same_commands_same_digest() {
    let run = || {
        let (mut engine, _clock) = engine_with_users();
        engine.apply(reference(PX, 1_000));
        engine.apply(limit(1, Side::Buy, 100, PX));
        engine.apply(limit(2, Side::Buy, 50, PX));
        engine.apply(limit(3, Side::Sell, 120, PX));
        engine.apply(market(2, Side::Sell, 10));
        engine.apply(Command::ApplyFundingTick {
            symbol: SYMBOL.to_string(),
            rate_micros: 100,
            timestamp_ms: 2_000,
        });
        engine.state_digest()
    };
    assert_eq!(run(), run());
}
