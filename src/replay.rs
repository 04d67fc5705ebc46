//! Crash recovery: rebuild engine state by streaming the journal.
//!
//! Recovery replays *events*, not commands: every state-bearing event
//! (`OrderAccepted`, `TradeExecuted`, `OrderUpdated`, `OrderCanceled`,
//! `PositionUpdated`, `LedgerPosted`, `CircuitHalted`/`Resumed`,
//! `ReferenceApplied`) is applied directly, so nothing is re-derived from
//! feed sources and no matching is re-run. A corrupt journal tail is
//! truncated at the first bad record; post-replay invariant validation
//! halts any symbol whose book fails its integrity check.

use crate::engine::{Engine, EngineConfig};
use crate::catalog::ProductCatalog;
use crate::error::FatalReason;
use crate::events::EngineEvent;
use crate::journal::Journal;
use crate::orders::{Order, OrderId, OrderStatus};
use std::collections::HashMap;
use tracing::{info, warn};

impl Engine {
    /// Rebuild an engine from its journal.
    ///
    /// `catalog` and `config` must match the crashed instance's; the
    /// journal supplies everything else. The next `command_seq` continues
    /// from `last + 1`.
    ///
    /// # Errors
    ///
    /// Returns [`FatalReason`] when the replayed ledger entries fail to
    /// balance (corrupted history, not a truncated tail).
    pub fn recover(
        catalog: ProductCatalog,
        config: EngineConfig,
        journal: Box<dyn Journal>,
    ) -> Result<Engine, FatalReason> {
        let mut engine = Engine::new(catalog, config, None)?;
        let mut live: HashMap<OrderId, Order> = HashMap::new();
        let mut last_command_seq = None;
        let mut replayed = 0usize;

        let entries = match journal.read_from(0) {
            Ok(entries) => entries,
            Err(e) => {
                return Err(FatalReason::ReplayMismatch {
                    detail: format!("journal unreadable: {e}"),
                });
            }
        };
        for entry in entries {
            match entry {
                Ok(entry) => {
                    last_command_seq = Some(entry.record.command_seq);
                    engine.replay_event(entry.record.event, &mut live)?;
                    replayed += 1;
                }
                Err(e) => {
                    // Corrupt tail: everything before it is intact, the
                    // rest never became durable.
                    warn!("journal tail truncated during recovery: {e}");
                    break;
                }
            }
        }

        engine.next_command_seq = last_command_seq.map_or(0, |seq| seq + 1);
        engine.validate_after_replay();
        engine.journal = Some(journal);
        info!(
            "recovery complete: {replayed} events, next command seq {}",
            engine.next_command_seq
        );
        Ok(engine)
    }

    /// Apply one journaled event to the rebuilding state.
    fn replay_event(
        &mut self,
        event: EngineEvent,
        live: &mut HashMap<OrderId, Order>,
    ) -> Result<(), FatalReason> {
        match event {
            EngineEvent::OrderAccepted { order } => {
                self.next_order_id = self.next_order_id.max(order.id.0 + 1);
                self.next_enqueue_seq = self.next_enqueue_seq.max(order.enqueue_seq + 1);
                self.note_status(order.id, order.status);
                self.order_meta.insert(
                    order.id,
                    crate::engine::OrderMeta {
                        user: order.user_id,
                        client_id: order.client_id.clone(),
                    },
                );
                live.insert(order.id, order);
            }

            EngineEvent::OrderRejected { order_id, .. } => {
                // Admission rejections carry a freshly minted id; rejected
                // cancels/modifies echo an existing order's id and must not
                // overwrite its status history.
                if let Some(order_id) = order_id {
                    // Rejected admissions consumed an id; keep the counter
                    // ahead of every id ever handed out.
                    self.next_order_id = self.next_order_id.max(order_id.0 + 1);
                    if !self.order_statuses.contains_key(&order_id) {
                        self.note_status(order_id, OrderStatus::Rejected);
                    }
                }
            }

            EngineEvent::TradeExecuted { trade } => {
                self.next_trade_id = self.next_trade_id.max(trade.id.0 + 1);
                if let Some(book) = self.books.get_mut(&trade.symbol) {
                    book.replay_trade(trade.maker_order_id, trade.quantity, trade.price);
                }
                if let Some(taker) = live.get_mut(&trade.taker_order_id)
                    && taker.remaining >= trade.quantity
                {
                    taker.apply_fill(trade.quantity);
                }
                if let Some(maker) = live.get_mut(&trade.maker_order_id)
                    && maker.remaining >= trade.quantity
                {
                    maker.apply_fill(trade.quantity);
                }
            }

            EngineEvent::OrderUpdated {
                order_id,
                status,
                remaining,
                ..
            } => {
                self.note_status(order_id, status);
                match status {
                    OrderStatus::Open | OrderStatus::Partial => {
                        // The taker's residual rested (or a stop parked):
                        // materialize it in the book if the fills have not
                        // already put it there.
                        if let Some(template) = live.get(&order_id).cloned() {
                            let symbol = template.symbol.clone();
                            if let Some(book) = self.books.get_mut(&symbol)
                                && !book.contains(order_id)
                                && remaining > 0
                            {
                                let mut order = template;
                                order.status = status;
                                order.remaining = remaining;
                                order.filled = order.quantity - remaining;
                                if order.kind.is_stop() {
                                    book.replay_park(order);
                                } else {
                                    book.replay_rest(order);
                                }
                            }
                        }
                    }
                    OrderStatus::Triggered => {
                        // Unpark and convert; later events rest or fill
                        // the activated order.
                        if let Some(template) = live.get(&order_id).cloned() {
                            if let Some(book) = self.books.get_mut(&template.symbol) {
                                let _ = book.cancel(order_id);
                            }
                            live.insert(
                                order_id,
                                crate::book::OrderBook::activate_stop(template),
                            );
                        }
                    }
                    _ => {}
                }
            }

            EngineEvent::OrderCanceled { order_id, .. } => {
                self.note_status(order_id, OrderStatus::Canceled);
                if let Some(order) = live.get(&order_id)
                    && let Some(book) = self.books.get_mut(&order.symbol)
                {
                    let _ = book.cancel(order_id);
                }
            }

            // Deltas are derived state; the book mutations above imply them.
            EngineEvent::BookDelta { .. } => {}

            EngineEvent::PositionUpdated { position } => {
                self.positions.restore(position);
            }

            EngineEvent::LedgerPosted { entries } => {
                self.ledger.apply_entries(&entries)?;
            }

            // Funding balance and position effects arrive via
            // `LedgerPosted` and `PositionUpdated`.
            EngineEvent::FundingApplied { .. } => {}

            EngineEvent::ReferenceApplied { symbol, price, .. } => {
                if let Some(breaker) = self.breakers.get_mut(&symbol) {
                    // Adoption only: halts and resumptions are restored
                    // from their own journaled state.
                    let _ = breaker.apply_reference(price, 0);
                }
            }

            EngineEvent::CircuitHalted { symbol, state, .. } => {
                if let Some(breaker) = self.breakers.get_mut(&symbol) {
                    breaker.restore(state);
                }
                if let Some(book) = self.books.get_mut(&symbol) {
                    book.set_halted(true);
                }
            }

            EngineEvent::CircuitResumed { symbol, state } => {
                if let Some(breaker) = self.breakers.get_mut(&symbol) {
                    breaker.restore(state);
                }
                if let Some(book) = self.books.get_mut(&symbol) {
                    book.set_halted(state.is_halted());
                }
            }

            // The ForceLiquidate command's own events carry the state.
            EngineEvent::LiquidationRequired { .. } | EngineEvent::LiquidationExecuted { .. } => {}

            EngineEvent::FatalError { reason } => {
                warn!("journal records a fatal stop: {reason}");
                self.fatal = true;
            }
        }
        Ok(())
    }

    /// Post-replay invariant validation: any book that fails its
    /// integrity check is halted and flagged rather than trusted.
    fn validate_after_replay(&mut self) {
        let symbols: Vec<String> = self.books.keys().cloned().collect();
        for symbol in symbols {
            let detail = self
                .books
                .get(&symbol)
                .and_then(|book| book.validate().err());
            if let Some(detail) = detail {
                warn!("post-replay validation failed for {symbol}: {detail}");
                if let Some(breaker) = self.breakers.get_mut(&symbol) {
                    breaker.halt_manual();
                }
                if let Some(book) = self.books.get_mut(&symbol) {
                    book.set_halted(true);
                }
            }
        }
        let (debits, credits) = self.ledger.cumulative_totals();
        if debits != credits {
            warn!("post-replay ledger imbalance: {debits} != {credits}");
            self.fatal = true;
        }
    }
}
