//! The sequencer: single-writer command execution.
//!
//! One sequencer thread owns every book, position, ledger and breaker in
//! its shard. External threads interact only by enqueueing commands on a
//! bounded channel and by subscribing to the event bus; nothing else
//! crosses the thread boundary. For each order command the pipeline is
//! fixed — risk gate, book, position manager, ledger, event bus — and a
//! failure at any stage short-circuits to a rejection event with no
//! partial state visible.
//!
//! Internal follow-ups (liquidations required by a reference move) are
//! queued during the triggering command and sequenced as their own
//! commands, before the next external command is taken.

use super::command::{Command, CommandEnvelope, CommandOutcome, OrderRequest};
use crate::book::{MatchOutcome, OrderBook};
use crate::breaker::{CircuitBreaker, HaltReason};
use crate::catalog::{ProductCatalog, SymbolSpec};
use crate::error::{FatalReason, RejectReason};
use crate::events::{EngineEvent, EventBus, EventRecord, OverflowPolicy, Subscription};
use crate::journal::{DurabilityMode, Journal};
use crate::ledger::{AccountKind, Ledger};
use crate::money::Micros;
use crate::orders::{
    CancelReason, Order, OrderFlags, OrderId, OrderStatus, Side, UserId,
};
use crate::position::PositionManager;
use crate::risk::{AccountSummary, RiskGate, account_summary};
use crate::trade::{Trade, TradeId};
use crate::utils::current_time_millis;
use crossbeam::channel::{Receiver, Sender, TrySendError, bounded, unbounded};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// Engine construction parameters. Injected explicitly; there are no
/// process-wide singletons.
#[derive(Debug)]
pub struct EngineConfig {
    /// Command queue depth; producers see `QueueFull` beyond it.
    pub queue_capacity: usize,
    /// Per-subscriber event queue depth.
    pub subscriber_capacity: usize,
    /// What happens to a subscriber that falls behind.
    pub overflow_policy: OverflowPolicy,
    /// When journal writes are flushed to stable storage.
    pub durability: DurabilityMode,
    /// Pre-trade risk configuration.
    pub risk: RiskGate,
    /// Initial insurance fund balance.
    pub insurance_fund: Micros,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 4_096,
            subscriber_capacity: 8_192,
            overflow_policy: OverflowPolicy::default(),
            durability: DurabilityMode::default(),
            risk: RiskGate::default(),
            insurance_fund: Micros::ZERO,
        }
    }
}

/// Per-order bookkeeping kept by the engine for cancel/modify semantics
/// and event echo fields.
#[derive(Debug, Clone)]
pub(crate) struct OrderMeta {
    pub(crate) user: UserId,
    pub(crate) client_id: String,
}

/// The sequencer state for one shard.
///
/// `apply` executes one command synchronously; [`Engine::spawn`] moves the
/// engine onto its sequencer thread and hands back an [`EngineHandle`].
pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) catalog: ProductCatalog,
    pub(crate) books: BTreeMap<String, OrderBook>,
    pub(crate) breakers: BTreeMap<String, CircuitBreaker>,
    pub(crate) positions: PositionManager,
    pub(crate) ledger: Ledger,
    pub(crate) bus: EventBus,
    pub(crate) journal: Option<Box<dyn Journal>>,
    pub(crate) next_command_seq: u64,
    pub(crate) next_order_id: u64,
    pub(crate) next_trade_id: u64,
    pub(crate) next_enqueue_seq: u64,
    /// Status history for every order ever admitted, for
    /// `AlreadyTerminal` vs `NotFound` answers.
    pub(crate) order_statuses: HashMap<OrderId, OrderStatus>,
    pub(crate) order_meta: HashMap<OrderId, OrderMeta>,
    /// Liquidations queued for next-cycle sequencing.
    pub(crate) pending_liquidations: VecDeque<(UserId, String, String)>,
    pub(crate) commands_since_sync: u32,
    pub(crate) last_sync_ms: u64,
    pub(crate) fatal: bool,
    pub(crate) clock: Box<dyn Fn() -> u64 + Send>,
}

impl Engine {
    /// Build an engine over `catalog` with the given configuration and
    /// optional journal.
    ///
    /// # Errors
    ///
    /// Returns [`FatalReason`] when seeding the insurance fund overflows
    /// the ledger (configuration error).
    pub fn new(
        catalog: ProductCatalog,
        config: EngineConfig,
        journal: Option<Box<dyn Journal>>,
    ) -> Result<Self, FatalReason> {
        let mut books = BTreeMap::new();
        let mut breakers = BTreeMap::new();
        for symbol in catalog.symbols() {
            if let Some(spec) = catalog.get(symbol) {
                books.insert(symbol.to_string(), OrderBook::new(spec.clone()));
                breakers.insert(symbol.to_string(), CircuitBreaker::new(spec.circuit_bands));
            }
        }
        let bus = EventBus::new(config.subscriber_capacity, config.overflow_policy);
        let mut ledger = Ledger::new();
        if config.insurance_fund.is_positive() {
            ledger.fund_insurance(config.insurance_fund)?;
        }
        info!(
            "engine constructed: {} symbols, durability {:?}",
            books.len(),
            config.durability
        );
        Ok(Self {
            config,
            catalog,
            books,
            breakers,
            positions: PositionManager::new(),
            ledger,
            bus,
            journal,
            next_command_seq: 0,
            next_order_id: 1,
            next_trade_id: 1,
            next_enqueue_seq: 1,
            order_statuses: HashMap::new(),
            order_meta: HashMap::new(),
            pending_liquidations: VecDeque::new(),
            commands_since_sync: 0,
            last_sync_ms: 0,
            fatal: false,
            clock: Box::new(current_time_millis),
        })
    }

    /// Replace the wall clock. Commands are stamped through this; tests
    /// inject a controlled clock.
    pub fn set_clock(&mut self, clock: impl Fn() -> u64 + Send + 'static) {
        self.clock = Box::new(clock);
    }

    /// Register an event subscriber.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        self.bus.subscribe()
    }

    /// Provision a ledger account. Deposits reject unknown users.
    pub fn open_account(&mut self, user: UserId) {
        self.ledger.open_account(user);
    }

    /// The book for `symbol`, for read-model and test inspection.
    #[must_use]
    pub fn book(&self, symbol: &str) -> Option<&OrderBook> {
        self.books.get(symbol)
    }

    /// The position manager, read-only.
    #[must_use]
    pub fn positions(&self) -> &PositionManager {
        &self.positions
    }

    /// The ledger, read-only.
    #[must_use]
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// The sequence number the next command will receive.
    #[must_use]
    pub fn next_command_seq(&self) -> u64 {
        self.next_command_seq
    }

    /// Whether the shard has stopped on a fatal invariant violation.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.fatal
    }

    /// Account summary for `user` at current marks.
    #[must_use]
    pub fn account(&self, user: UserId) -> AccountSummary {
        account_summary(
            user,
            &self.ledger,
            &self.positions,
            |s| self.mark_price(s),
            |s| self.catalog.get(s).map(|spec| spec.initial_margin_bps),
        )
    }

    /// SHA-256 digest over the canonical book, ledger and position
    /// snapshots. Two engines with identical state produce identical
    /// digests; crash-recovery tests compare these.
    #[must_use]
    pub fn state_digest(&self) -> String {
        let mut hasher = Sha256::new();
        for book in self.books.values() {
            hasher.update(serde_json::to_vec(&book.snapshot()).unwrap_or_default());
        }
        for (key, balance) in self.ledger.balances() {
            hasher.update(serde_json::to_vec(&(key, balance)).unwrap_or_default());
        }
        for position in self.positions.iter() {
            hasher.update(serde_json::to_vec(position).unwrap_or_default());
        }
        format!("{:x}", hasher.finalize())
    }

    /// Execute one command and any liquidations it queued, returning the
    /// command's own outcome.
    pub fn apply(&mut self, command: Command) -> CommandOutcome {
        let outcome = self.apply_one(command);
        while let Some((user, symbol, reason)) = self.pending_liquidations.pop_front() {
            if self.fatal {
                break;
            }
            let _ = self.apply_one(Command::ForceLiquidate {
                user_id: user,
                symbol,
                reason,
            });
        }
        outcome
    }

    /// Reject a command without touching state (deadline expiry, shard
    /// stopped).
    fn apply_rejected(&mut self, command: &Command, reason: RejectReason) -> CommandOutcome {
        let event = self.rejection_event(command, reason);
        let seq = self.next_command_seq;
        self.next_command_seq += 1;
        self.finish_command(seq, vec![event])
    }

    fn apply_one(&mut self, command: Command) -> CommandOutcome {
        if self.fatal {
            let symbol = command.symbol().unwrap_or("*").to_string();
            return self.apply_rejected(&command, RejectReason::Halted { symbol });
        }
        let seq = self.next_command_seq;
        self.next_command_seq += 1;
        let now_ms = (self.clock)();
        debug!("sequencing command {seq}: {command:?}");
        let events = self.dispatch(command, seq, now_ms);
        self.finish_command(seq, events)
    }

    /// Journal and publish one command's event run.
    fn finish_command(&mut self, seq: u64, events: Vec<EngineEvent>) -> CommandOutcome {
        let records: Vec<EventRecord> = events
            .into_iter()
            .enumerate()
            .map(|(idx, event)| EventRecord {
                command_seq: seq,
                event_seq: idx as u32,
                event,
            })
            .collect();

        if let Some(journal) = self.journal.as_ref() {
            let mut journal_failure = None;
            for record in &records {
                if let Err(e) = journal.append(record) {
                    journal_failure = Some(e.to_string());
                    break;
                }
            }
            if journal_failure.is_none()
                && let Err(e) = self.maybe_sync(seq)
            {
                journal_failure = Some(e);
            }
            if let Some(message) = journal_failure {
                error!("journal write failed, shard stopping: {message}");
                self.fatal = true;
                let fatal_record = EventRecord {
                    command_seq: seq,
                    event_seq: records.len() as u32,
                    event: EngineEvent::FatalError {
                        reason: FatalReason::JournalWriteFailed { message },
                    },
                };
                for record in &records {
                    self.bus.publish(record);
                }
                self.bus.publish(&fatal_record);
                let mut all = records;
                all.push(fatal_record);
                return CommandOutcome {
                    command_seq: seq,
                    events: all,
                };
            }
        }

        for record in &records {
            self.bus.publish(record);
        }
        CommandOutcome {
            command_seq: seq,
            events: records,
        }
    }

    /// Sync the journal at the boundary selected by the durability mode.
    fn maybe_sync(&mut self, _seq: u64) -> Result<(), String> {
        let Some(journal) = self.journal.as_ref() else {
            return Ok(());
        };
        self.commands_since_sync += 1;
        let due = match self.config.durability {
            DurabilityMode::PerCommand => true,
            DurabilityMode::PerBatch(n) => self.commands_since_sync >= n.max(1),
            DurabilityMode::IntervalMs(ms) => {
                let now = (self.clock)();
                now.saturating_sub(self.last_sync_ms) >= ms
            }
        };
        if due {
            journal.sync().map_err(|e| e.to_string())?;
            self.commands_since_sync = 0;
            self.last_sync_ms = (self.clock)();
        }
        Ok(())
    }

    fn dispatch(&mut self, command: Command, seq: u64, now_ms: u64) -> Vec<EngineEvent> {
        match command {
            Command::PlaceOrder { request } => self.handle_place(request, seq, now_ms),
            Command::CancelOrder {
                user_id,
                symbol,
                order_id,
            } => self.handle_cancel(user_id, &symbol, order_id),
            Command::ModifyOrder {
                user_id,
                symbol,
                order_id,
                new_price,
                new_quantity,
            } => self.handle_modify(user_id, &symbol, order_id, new_price, new_quantity, seq, now_ms),
            Command::ApplyReferencePrice {
                symbol,
                price,
                source_id,
                timestamp_ms,
            } => self.handle_reference(&symbol, price, &source_id, timestamp_ms, seq, now_ms),
            Command::ApplyFundingTick {
                symbol,
                rate_micros,
                ..
            } => self.handle_funding(&symbol, rate_micros),
            Command::ForceLiquidate {
                user_id, symbol, ..
            } => self.handle_liquidation(user_id, &symbol, seq, now_ms),
            Command::HaltSymbol { symbol, .. } => self.handle_halt(&symbol),
            Command::ResumeSymbol { symbol } => self.handle_resume(&symbol),
            Command::Deposit { user_id, amount } => self.handle_deposit(user_id, amount),
            Command::Withdraw { user_id, amount } => self.handle_withdraw(user_id, amount),
        }
    }

    // ── Order commands ─────────────────────────────────────────────────

    fn handle_place(&mut self, request: OrderRequest, seq: u64, now_ms: u64) -> Vec<EngineEvent> {
        let Some(spec) = self.catalog.get(&request.symbol).cloned() else {
            return vec![EngineEvent::OrderRejected {
                order_id: None,
                client_id: request.client_id,
                user_id: request.user_id,
                symbol: request.symbol.clone(),
                reason: RejectReason::UnknownSymbol {
                    symbol: request.symbol,
                },
            }];
        };

        let order_id = OrderId(self.next_order_id);
        self.next_order_id += 1;
        let enqueue_seq = self.next_enqueue_seq;
        self.next_enqueue_seq += 1;
        let order = Order {
            id: order_id,
            client_id: request.client_id,
            user_id: request.user_id,
            symbol: request.symbol,
            side: request.side,
            kind: request.kind,
            price: request.price,
            trigger: request.trigger,
            quantity: request.quantity,
            filled: 0,
            remaining: request.quantity,
            status: OrderStatus::New,
            enqueue_seq,
            time_in_force: request.time_in_force,
            flags: request.flags,
        };

        if let Err(reason) = self.gate_order(&order, &spec) {
            return vec![self.reject_order(order, reason)];
        }
        self.submit_to_book(order, &spec, seq, now_ms)
    }

    /// Input validation, then the cross-component risk gate, in the order
    /// the rejection taxonomy promises: input errors outrank margin.
    fn gate_order(&self, order: &Order, spec: &SymbolSpec) -> Result<(), RejectReason> {
        let Some(book) = self.books.get(&spec.symbol) else {
            return Err(RejectReason::UnknownSymbol {
                symbol: spec.symbol.clone(),
            });
        };
        book.validate_order(
            order,
            self.positions.net_size(&spec.symbol, order.user_id),
        )?;
        self.config.risk.check(
            order,
            spec,
            book,
            &self.ledger,
            &self.positions,
            |s| self.mark_price(s),
            |s| self.catalog.get(s).map(|sp| sp.initial_margin_bps),
        )
    }

    /// Submit a gated order to its book and process everything that
    /// follows: fills, breaker, stop cascade.
    fn submit_to_book(
        &mut self,
        order: Order,
        spec: &SymbolSpec,
        seq: u64,
        now_ms: u64,
    ) -> Vec<EngineEvent> {
        let symbol = spec.symbol.clone();
        let position_net = self.positions.net_size(&symbol, order.user_id);
        let breaker = self.breakers.get(&symbol);

        let Some(book) = self.books.get_mut(&symbol) else {
            let reason = RejectReason::UnknownSymbol { symbol };
            return vec![self.reject_order(order, reason)];
        };
        match book.submit_guarded(order.clone(), position_net, breaker) {
            Err(reason) => vec![self.reject_order(order, reason)],
            Ok(outcome) => {
                self.order_meta.insert(
                    order.id,
                    OrderMeta {
                        user: order.user_id,
                        client_id: order.client_id.clone(),
                    },
                );
                let mut events = vec![EngineEvent::OrderAccepted {
                    order: order.clone(),
                }];
                self.process_outcome(&symbol, spec, outcome, seq, now_ms, &mut events);
                if !self.fatal {
                    self.run_stop_cascade(&symbol, spec, seq, now_ms, &mut events);
                }
                events
            }
        }
    }

    /// Turn a book outcome into events and downstream effects, in a fixed
    /// deterministic order: trades (with position and ledger effects),
    /// self-trade maker cancels, the taker's own terminal/rest event, the
    /// book deltas, then any circuit-breaker halt.
    fn process_outcome(
        &mut self,
        symbol: &str,
        spec: &SymbolSpec,
        outcome: MatchOutcome,
        seq: u64,
        now_ms: u64,
        events: &mut Vec<EngineEvent>,
    ) {
        let taker = &outcome.taker;
        for fill in &outcome.fills {
            if let Err(fatal) = self.apply_fill_effects(symbol, spec, taker, fill, seq, now_ms, events) {
                self.enter_fatal(fatal, events);
                return;
            }
        }

        for maker in &outcome.canceled_makers {
            self.note_status(maker.id, OrderStatus::Canceled);
            events.push(EngineEvent::OrderCanceled {
                order_id: maker.id,
                client_id: maker.client_id.clone(),
                reason: CancelReason::SelfTrade,
                remaining: maker.remaining,
            });
        }

        self.note_status(taker.id, taker.status);
        if outcome.parked || outcome.rested || taker.status == OrderStatus::Filled {
            events.push(EngineEvent::OrderUpdated {
                order_id: taker.id,
                client_id: taker.client_id.clone(),
                status: taker.status,
                remaining: taker.remaining,
            });
        } else if let Some(reason) = outcome.taker_cancel {
            events.push(EngineEvent::OrderCanceled {
                order_id: taker.id,
                client_id: taker.client_id.clone(),
                reason,
                remaining: taker.remaining,
            });
        }

        for delta in &outcome.deltas {
            events.push(EngineEvent::BookDelta {
                symbol: symbol.to_string(),
                delta: *delta,
            });
        }

        if let Some(breach_price) = outcome.breached {
            self.apply_trade_halt(symbol, breach_price, now_ms, events);
        } else if let Some(last_fill) = outcome.fills.last() {
            // The guard only fires mid-match; a final fill can still be
            // the breaching print.
            self.apply_trade_halt(symbol, last_fill.price, now_ms, events);
        }
    }

    /// Per-fill effects: mint the trade, update both positions, post both
    /// ledger legs.
    #[allow(clippy::too_many_arguments)]
    fn apply_fill_effects(
        &mut self,
        symbol: &str,
        spec: &SymbolSpec,
        taker: &Order,
        fill: &crate::book::Fill,
        seq: u64,
        now_ms: u64,
        events: &mut Vec<EngineEvent>,
    ) -> Result<(), FatalReason> {
        let notional = fill
            .price
            .checked_mul_qty(fill.quantity)
            .ok_or_else(|| FatalReason::MoneyOverflow {
                context: format!("trade notional at {}", fill.price),
            })?;
        let maker_fee = notional
            .checked_bps(spec.maker_fee_bps)
            .ok_or_else(|| FatalReason::MoneyOverflow {
                context: "maker fee".to_string(),
            })?;
        let taker_fee = notional
            .checked_bps(spec.taker_fee_bps)
            .ok_or_else(|| FatalReason::MoneyOverflow {
                context: "taker fee".to_string(),
            })?;

        let trade_id = TradeId(self.next_trade_id);
        self.next_trade_id += 1;
        let trade = Trade {
            id: trade_id,
            symbol: symbol.to_string(),
            maker_order_id: fill.maker.id,
            taker_order_id: taker.id,
            maker_user: fill.maker.user_id,
            taker_user: taker.user_id,
            taker_side: taker.side,
            price: fill.price,
            quantity: fill.quantity,
            maker_fee,
            taker_fee,
            seq,
            timestamp_ms: now_ms,
        };
        events.push(EngineEvent::TradeExecuted {
            trade: trade.clone(),
        });

        self.note_status(fill.maker.id, fill.maker.status);
        events.push(EngineEvent::OrderUpdated {
            order_id: fill.maker.id,
            client_id: fill.maker.client_id.clone(),
            status: fill.maker.status,
            remaining: fill.maker.remaining,
        });

        let maker_effect = self.positions.apply_fill(
            fill.maker.user_id,
            spec,
            fill.maker.side,
            fill.quantity,
            fill.price,
        )?;
        let taker_effect =
            self.positions
                .apply_fill(taker.user_id, spec, taker.side, fill.quantity, fill.price)?;
        events.push(EngineEvent::PositionUpdated {
            position: maker_effect.position.clone(),
        });
        events.push(EngineEvent::PositionUpdated {
            position: taker_effect.position.clone(),
        });

        let mut entries = self.ledger.post_trade_leg(
            fill.maker.user_id,
            trade_id,
            maker_fee,
            maker_effect.realized,
            maker_effect.margin_delta,
        )?;
        entries.extend(self.ledger.post_trade_leg(
            taker.user_id,
            trade_id,
            taker_fee,
            taker_effect.realized,
            taker_effect.margin_delta,
        )?);
        events.push(EngineEvent::LedgerPosted { entries });
        Ok(())
    }

    /// Consult the breaker about a printed price and emit the halt when
    /// one fires.
    fn apply_trade_halt(
        &mut self,
        symbol: &str,
        price: Micros,
        now_ms: u64,
        events: &mut Vec<EngineEvent>,
    ) {
        let Some(breaker) = self.breakers.get_mut(symbol) else {
            return;
        };
        if let Some(halt) = breaker.on_trade(price, now_ms) {
            let state = breaker.state();
            if let Some(book) = self.books.get_mut(symbol) {
                book.set_halted(true);
            }
            warn!("{symbol} halted: {}", halt.reason);
            events.push(EngineEvent::CircuitHalted {
                symbol: symbol.to_string(),
                reason: halt.reason,
                until_ms: halt.until_ms,
                state,
            });
        }
    }

    /// Fire and execute parked stops while the book is live and trades
    /// keep crossing triggers.
    fn run_stop_cascade(
        &mut self,
        symbol: &str,
        spec: &SymbolSpec,
        seq: u64,
        now_ms: u64,
        events: &mut Vec<EngineEvent>,
    ) {
        loop {
            let Some(book) = self.books.get_mut(symbol) else {
                return;
            };
            if book.is_halted() {
                return;
            }
            let Some(last) = book.last_trade_price() else {
                return;
            };
            let Some(stop) = book.take_next_triggered(last) else {
                return;
            };
            events.push(EngineEvent::OrderUpdated {
                order_id: stop.id,
                client_id: stop.client_id.clone(),
                status: OrderStatus::Triggered,
                remaining: stop.remaining,
            });
            let activated = OrderBook::activate_stop(stop);

            // Margin is re-checked at activation: the market may have
            // moved a long way since the stop parked.
            if let Err(reason) = self.gate_order(&activated, spec) {
                let event = self.reject_order(activated, reason);
                events.push(event);
                continue;
            }

            let position_net = self.positions.net_size(symbol, activated.user_id);
            let breaker = self.breakers.get(symbol);
            let Some(book) = self.books.get_mut(symbol) else {
                return;
            };
            match book.submit_guarded(activated.clone(), position_net, breaker) {
                Err(reason) => {
                    let event = self.reject_order(activated, reason);
                    events.push(event);
                }
                Ok(outcome) => {
                    self.process_outcome(symbol, spec, outcome, seq, now_ms, events);
                    if self.fatal {
                        return;
                    }
                }
            }
        }
    }

    fn handle_cancel(&mut self, user: UserId, symbol: &str, order_id: OrderId) -> Vec<EngineEvent> {
        let Some(book) = self.books.get_mut(symbol) else {
            return vec![EngineEvent::OrderRejected {
                order_id: Some(order_id),
                client_id: String::new(),
                user_id: user,
                symbol: symbol.to_string(),
                reason: RejectReason::UnknownSymbol {
                    symbol: symbol.to_string(),
                },
            }];
        };

        let owner_matches = book
            .order(order_id)
            .or_else(|| book.parked_stop(order_id))
            .map(|o| o.user_id == user);
        match owner_matches {
            Some(true) => {
                let Some((order, delta)) = book.cancel(order_id) else {
                    return vec![self.cancel_rejection(user, symbol, order_id)];
                };
                self.note_status(order_id, OrderStatus::Canceled);
                let mut events = vec![EngineEvent::OrderCanceled {
                    order_id,
                    client_id: order.client_id.clone(),
                    reason: CancelReason::UserRequested,
                    remaining: order.remaining,
                }];
                if let Some(delta) = delta {
                    events.push(EngineEvent::BookDelta {
                        symbol: symbol.to_string(),
                        delta,
                    });
                }
                events
            }
            // Another user's order is indistinguishable from a missing one.
            Some(false) => vec![EngineEvent::OrderRejected {
                order_id: Some(order_id),
                client_id: String::new(),
                user_id: user,
                symbol: symbol.to_string(),
                reason: RejectReason::OrderNotFound { order_id },
            }],
            None => vec![self.cancel_rejection(user, symbol, order_id)],
        }
    }

    /// Distinguish `AlreadyTerminal` from `NotFound` using the status
    /// history.
    fn cancel_rejection(&self, user: UserId, symbol: &str, order_id: OrderId) -> EngineEvent {
        let reason = match self.order_statuses.get(&order_id) {
            Some(status) if status.is_terminal() => RejectReason::AlreadyTerminal { order_id },
            _ => RejectReason::OrderNotFound { order_id },
        };
        let client_id = self
            .order_meta
            .get(&order_id)
            .map(|m| m.client_id.clone())
            .unwrap_or_default();
        EngineEvent::OrderRejected {
            order_id: Some(order_id),
            client_id,
            user_id: user,
            symbol: symbol.to_string(),
            reason,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_modify(
        &mut self,
        user: UserId,
        symbol: &str,
        order_id: OrderId,
        new_price: Option<Micros>,
        new_quantity: Option<i64>,
        seq: u64,
        now_ms: u64,
    ) -> Vec<EngineEvent> {
        let Some(spec) = self.catalog.get(symbol).cloned() else {
            return vec![EngineEvent::OrderRejected {
                order_id: Some(order_id),
                client_id: String::new(),
                user_id: user,
                symbol: symbol.to_string(),
                reason: RejectReason::UnknownSymbol {
                    symbol: symbol.to_string(),
                },
            }];
        };
        let Some(book) = self.books.get_mut(symbol) else {
            return vec![self.cancel_rejection(user, symbol, order_id)];
        };

        let existing = book
            .order(order_id)
            .or_else(|| book.parked_stop(order_id))
            .filter(|o| o.user_id == user)
            .cloned();
        let Some(old) = existing else {
            return vec![self.cancel_rejection(user, symbol, order_id)];
        };

        // Cancel+new, atomically within this command.
        let mut events = Vec::new();
        if let Some((canceled, delta)) = book.cancel(order_id) {
            self.note_status(order_id, OrderStatus::Canceled);
            events.push(EngineEvent::OrderCanceled {
                order_id,
                client_id: canceled.client_id.clone(),
                reason: CancelReason::Replaced,
                remaining: canceled.remaining,
            });
            if let Some(delta) = delta {
                events.push(EngineEvent::BookDelta {
                    symbol: symbol.to_string(),
                    delta,
                });
            }
        }

        // The replacement carries the unfilled portion only; a new
        // quantity at or below the already-filled amount leaves nothing
        // to work and rejects (the cancel above stands — documented).
        let target_quantity = new_quantity.unwrap_or(old.quantity);
        let replacement_quantity = target_quantity - old.filled;
        if replacement_quantity <= 0 {
            events.push(EngineEvent::OrderRejected {
                order_id: Some(order_id),
                client_id: old.client_id.clone(),
                user_id: user,
                symbol: symbol.to_string(),
                reason: RejectReason::SizeBounds {
                    quantity: replacement_quantity,
                    min: spec.min_order,
                    max: spec.max_order,
                },
            });
            return events;
        }

        let replacement_id = OrderId(self.next_order_id);
        self.next_order_id += 1;
        let enqueue_seq = self.next_enqueue_seq;
        self.next_enqueue_seq += 1;
        let replacement = Order {
            id: replacement_id,
            client_id: old.client_id.clone(),
            user_id: user,
            symbol: symbol.to_string(),
            side: old.side,
            kind: old.kind,
            price: new_price.or(old.price),
            trigger: old.trigger,
            quantity: replacement_quantity,
            filled: 0,
            remaining: replacement_quantity,
            status: OrderStatus::New,
            enqueue_seq,
            time_in_force: old.time_in_force,
            flags: old.flags,
        };

        if let Err(reason) = self.gate_order(&replacement, &spec) {
            events.push(self.reject_order(replacement, reason));
            return events;
        }
        events.extend(self.submit_to_book(replacement, &spec, seq, now_ms));
        events
    }

    // ── Market-state commands ──────────────────────────────────────────

    fn handle_reference(
        &mut self,
        symbol: &str,
        price: Micros,
        source_id: &str,
        timestamp_ms: u64,
        seq: u64,
        now_ms: u64,
    ) -> Vec<EngineEvent> {
        let Some(spec) = self.catalog.get(symbol).cloned() else {
            return vec![EngineEvent::OrderRejected {
                order_id: None,
                client_id: String::new(),
                user_id: UserId::HOUSE,
                symbol: symbol.to_string(),
                reason: RejectReason::UnknownSymbol {
                    symbol: symbol.to_string(),
                },
            }];
        };
        let Some(breaker) = self.breakers.get_mut(symbol) else {
            return Vec::new();
        };

        let mut events = Vec::new();
        if let Some(halt) = breaker.apply_reference(price, now_ms) {
            // The dislocated reference extended the halt instead of being
            // adopted.
            let state = breaker.state();
            if let Some(book) = self.books.get_mut(symbol) {
                book.set_halted(true);
            }
            events.push(EngineEvent::CircuitHalted {
                symbol: symbol.to_string(),
                reason: halt.reason,
                until_ms: halt.until_ms,
                state,
            });
            return events;
        }

        events.push(EngineEvent::ReferenceApplied {
            symbol: symbol.to_string(),
            price,
            source_id: source_id.to_string(),
            timestamp_ms,
        });

        if breaker.try_resume(now_ms) {
            let state = breaker.state();
            if let Some(book) = self.books.get_mut(symbol) {
                book.set_halted(false);
            }
            info!("{symbol} resumed");
            events.push(EngineEvent::CircuitResumed {
                symbol: symbol.to_string(),
                state,
            });
        }

        // A reference move can trigger parked stops.
        self.run_reference_stops(symbol, &spec, price, seq, now_ms, &mut events);

        // And it can put positions past their liquidation price. During a
        // halt the closing order could not execute anyway; the first
        // post-resume reference re-runs this scan.
        if self.books.get(symbol).is_some_and(OrderBook::is_halted) {
            return events;
        }
        for user in
            self.positions
                .breached_positions(symbol, price, spec.maintenance_margin_bps)
        {
            events.push(EngineEvent::LiquidationRequired {
                symbol: symbol.to_string(),
                user,
                reference: price,
            });
            self.pending_liquidations.push_back((
                user,
                symbol.to_string(),
                "maintenance margin breach".to_string(),
            ));
        }
        events
    }

    /// Trigger parked stops off a reference move, then let the trade-price
    /// cascade continue naturally.
    fn run_reference_stops(
        &mut self,
        symbol: &str,
        spec: &SymbolSpec,
        reference: Micros,
        seq: u64,
        now_ms: u64,
        events: &mut Vec<EngineEvent>,
    ) {
        loop {
            let Some(book) = self.books.get_mut(symbol) else {
                return;
            };
            if book.is_halted() {
                return;
            }
            let Some(stop) = book.take_next_triggered(reference) else {
                break;
            };
            events.push(EngineEvent::OrderUpdated {
                order_id: stop.id,
                client_id: stop.client_id.clone(),
                status: OrderStatus::Triggered,
                remaining: stop.remaining,
            });
            let activated = OrderBook::activate_stop(stop);
            if let Err(reason) = self.gate_order(&activated, spec) {
                let event = self.reject_order(activated, reason);
                events.push(event);
                continue;
            }
            let position_net = self.positions.net_size(symbol, activated.user_id);
            let breaker = self.breakers.get(symbol);
            let Some(book) = self.books.get_mut(symbol) else {
                return;
            };
            match book.submit_guarded(activated.clone(), position_net, breaker) {
                Err(reason) => {
                    let event = self.reject_order(activated, reason);
                    events.push(event);
                }
                Ok(outcome) => {
                    self.process_outcome(symbol, spec, outcome, seq, now_ms, events);
                    if self.fatal {
                        return;
                    }
                }
            }
        }
        if !self.fatal {
            self.run_stop_cascade(symbol, spec, seq, now_ms, events);
        }
    }

    fn handle_funding(&mut self, symbol: &str, rate_micros: i64) -> Vec<EngineEvent> {
        if !self.catalog.contains(symbol) {
            return vec![EngineEvent::OrderRejected {
                order_id: None,
                client_id: String::new(),
                user_id: UserId::HOUSE,
                symbol: symbol.to_string(),
                reason: RejectReason::UnknownSymbol {
                    symbol: symbol.to_string(),
                },
            }];
        }
        let Some(mark) = self.mark_price(symbol) else {
            return vec![EngineEvent::OrderRejected {
                order_id: None,
                client_id: String::new(),
                user_id: UserId::HOUSE,
                symbol: symbol.to_string(),
                reason: RejectReason::NoReferencePrice {
                    symbol: symbol.to_string(),
                },
            }];
        };

        let charges = match self.positions.funding_charges(symbol, rate_micros, mark) {
            Ok(charges) => charges,
            Err(fatal) => {
                let mut events = Vec::new();
                self.enter_fatal(fatal, &mut events);
                return events;
            }
        };

        let mut events = Vec::new();
        let flat: Vec<(UserId, Micros)> = charges.iter().map(|(u, c, _)| (*u, *c)).collect();
        match self.ledger.post_funding(&flat) {
            Ok(entries) => {
                for (user, charge, position) in charges {
                    events.push(EngineEvent::FundingApplied {
                        symbol: symbol.to_string(),
                        user,
                        rate_micros,
                        charge,
                    });
                    events.push(EngineEvent::PositionUpdated { position });
                }
                events.push(EngineEvent::LedgerPosted { entries });
            }
            Err(fatal) => self.enter_fatal(fatal, &mut events),
        }
        events
    }

    fn handle_liquidation(
        &mut self,
        user: UserId,
        symbol: &str,
        seq: u64,
        now_ms: u64,
    ) -> Vec<EngineEvent> {
        let Some(spec) = self.catalog.get(symbol).cloned() else {
            return vec![EngineEvent::OrderRejected {
                order_id: None,
                client_id: String::new(),
                user_id: user,
                symbol: symbol.to_string(),
                reason: RejectReason::UnknownSymbol {
                    symbol: symbol.to_string(),
                },
            }];
        };
        let net = self.positions.net_size(symbol, user);
        if net == 0 {
            // Nothing left to close: the position recovered or an earlier
            // liquidation finished the job.
            return vec![EngineEvent::LiquidationExecuted {
                symbol: symbol.to_string(),
                user,
                quantity: 0,
                insurance_draw: Micros::ZERO,
            }];
        }

        warn!("force-liquidating {user} on {symbol}, net {net}");
        let mut events = Vec::new();

        // The user's resting orders go first so they cannot interfere
        // with the closing market order.
        if let Some(book) = self.books.get_mut(symbol) {
            for (order, delta) in book.cancel_all_for_user(user) {
                self.note_status(order.id, OrderStatus::Canceled);
                events.push(EngineEvent::OrderCanceled {
                    order_id: order.id,
                    client_id: order.client_id.clone(),
                    reason: CancelReason::Liquidation,
                    remaining: order.remaining,
                });
                if let Some(delta) = delta {
                    events.push(EngineEvent::BookDelta {
                        symbol: symbol.to_string(),
                        delta,
                    });
                }
            }
        }

        let order_id = OrderId(self.next_order_id);
        self.next_order_id += 1;
        let enqueue_seq = self.next_enqueue_seq;
        self.next_enqueue_seq += 1;
        let closing = Order {
            id: order_id,
            client_id: format!("liq-{}-{seq}", user.0),
            user_id: user,
            symbol: symbol.to_string(),
            side: if net > 0 { Side::Sell } else { Side::Buy },
            kind: crate::orders::OrderKind::Market,
            price: None,
            trigger: None,
            quantity: net.abs(),
            filled: 0,
            remaining: net.abs(),
            status: OrderStatus::New,
            enqueue_seq,
            time_in_force: crate::orders::TimeInForce::Gtc,
            flags: OrderFlags::REDUCE_ONLY,
        };
        self.order_meta.insert(
            order_id,
            OrderMeta {
                user,
                client_id: closing.client_id.clone(),
            },
        );

        // The closing order bypasses the risk gate: margin checks cannot
        // be allowed to block de-risking.
        let position_net = net;
        let closed_qty;
        {
            let Some(book) = self.books.get_mut(symbol) else {
                return events;
            };
            match book.submit(closing.clone(), position_net) {
                Err(reason) => {
                    events.push(self.reject_order(closing, reason));
                    return events;
                }
                Ok(outcome) => {
                    closed_qty = closing.quantity - outcome.taker.remaining;
                    events.push(EngineEvent::OrderAccepted {
                        order: closing.clone(),
                    });
                    self.process_outcome(symbol, &spec, outcome, seq, now_ms, &mut events);
                    if self.fatal {
                        return events;
                    }
                }
            }
        }

        // Any shortfall against the bankruptcy price shows up as negative
        // cash; the insurance fund absorbs it.
        let cash = self.ledger.balance(user, AccountKind::Cash);
        let mut insurance_draw = Micros::ZERO;
        if cash.is_negative() {
            insurance_draw = -cash;
            match self.ledger.post_insurance_draw(user, insurance_draw) {
                Ok(entries) => events.push(EngineEvent::LedgerPosted { entries }),
                Err(fatal) => {
                    self.enter_fatal(fatal, &mut events);
                    return events;
                }
            }
        }

        events.push(EngineEvent::LiquidationExecuted {
            symbol: symbol.to_string(),
            user,
            quantity: closed_qty,
            insurance_draw,
        });
        events
    }

    fn handle_halt(&mut self, symbol: &str) -> Vec<EngineEvent> {
        let Some(breaker) = self.breakers.get_mut(symbol) else {
            return vec![EngineEvent::OrderRejected {
                order_id: None,
                client_id: String::new(),
                user_id: UserId::HOUSE,
                symbol: symbol.to_string(),
                reason: RejectReason::UnknownSymbol {
                    symbol: symbol.to_string(),
                },
            }];
        };
        breaker.halt_manual();
        let state = breaker.state();
        if let Some(book) = self.books.get_mut(symbol) {
            book.set_halted(true);
        }
        warn!("{symbol} halted by operator");
        vec![EngineEvent::CircuitHalted {
            symbol: symbol.to_string(),
            reason: HaltReason::Manual,
            until_ms: u64::MAX,
            state,
        }]
    }

    fn handle_resume(&mut self, symbol: &str) -> Vec<EngineEvent> {
        let Some(breaker) = self.breakers.get_mut(symbol) else {
            return vec![EngineEvent::OrderRejected {
                order_id: None,
                client_id: String::new(),
                user_id: UserId::HOUSE,
                symbol: symbol.to_string(),
                reason: RejectReason::UnknownSymbol {
                    symbol: symbol.to_string(),
                },
            }];
        };
        let fully_resumed = breaker.resume_manual();
        let state = breaker.state();
        if fully_resumed && let Some(book) = self.books.get_mut(symbol) {
            book.set_halted(false);
        }
        info!("{symbol} operator halt lifted (fully resumed: {fully_resumed})");
        vec![EngineEvent::CircuitResumed {
            symbol: symbol.to_string(),
            state,
        }]
    }

    fn handle_deposit(&mut self, user: UserId, amount: Micros) -> Vec<EngineEvent> {
        match self.ledger.deposit(user, amount) {
            Ok(entries) => vec![EngineEvent::LedgerPosted { entries }],
            Err(reason) => vec![EngineEvent::OrderRejected {
                order_id: None,
                client_id: String::new(),
                user_id: user,
                symbol: String::new(),
                reason,
            }],
        }
    }

    fn handle_withdraw(&mut self, user: UserId, amount: Micros) -> Vec<EngineEvent> {
        let summary = self.account(user);
        let withdrawable = summary.free_margin.min(summary.cash).max(Micros::ZERO);
        match self.ledger.withdraw(user, amount, withdrawable) {
            Ok(entries) => vec![EngineEvent::LedgerPosted { entries }],
            Err(reason) => vec![EngineEvent::OrderRejected {
                order_id: None,
                client_id: String::new(),
                user_id: user,
                symbol: String::new(),
                reason,
            }],
        }
    }

    // ── Shared helpers ─────────────────────────────────────────────────

    /// The price positions are marked at: the breaker reference when one
    /// exists, the last trade otherwise.
    fn mark_price(&self, symbol: &str) -> Option<Micros> {
        self.breakers
            .get(symbol)
            .and_then(CircuitBreaker::reference)
            .or_else(|| self.books.get(symbol).and_then(OrderBook::last_trade_price))
    }

    pub(crate) fn note_status(&mut self, order_id: OrderId, status: OrderStatus) {
        self.order_statuses.insert(order_id, status);
    }

    fn reject_order(&mut self, order: Order, reason: RejectReason) -> EngineEvent {
        self.note_status(order.id, OrderStatus::Rejected);
        self.order_meta.insert(
            order.id,
            OrderMeta {
                user: order.user_id,
                client_id: order.client_id.clone(),
            },
        );
        EngineEvent::OrderRejected {
            order_id: Some(order.id),
            client_id: order.client_id,
            user_id: order.user_id,
            symbol: order.symbol,
            reason,
        }
    }

    fn rejection_event(&self, command: &Command, reason: RejectReason) -> EngineEvent {
        let (client_id, user_id) = match command {
            Command::PlaceOrder { request } => (request.client_id.clone(), request.user_id),
            Command::CancelOrder { user_id, .. }
            | Command::ModifyOrder { user_id, .. }
            | Command::ForceLiquidate { user_id, .. }
            | Command::Deposit { user_id, .. }
            | Command::Withdraw { user_id, .. } => (String::new(), *user_id),
            _ => (String::new(), UserId::HOUSE),
        };
        EngineEvent::OrderRejected {
            order_id: None,
            client_id,
            user_id,
            symbol: command.symbol().unwrap_or_default().to_string(),
            reason,
        }
    }

    /// Stop the shard on a fatal invariant violation.
    fn enter_fatal(&mut self, reason: FatalReason, events: &mut Vec<EngineEvent>) {
        error!("fatal invariant violation, shard stopping: {reason}");
        self.fatal = true;
        events.push(EngineEvent::FatalError { reason });
    }

    // ── Threaded front end ─────────────────────────────────────────────

    /// Move the engine onto its sequencer thread. The returned handle
    /// enqueues commands; the thread exits (returning the engine) when
    /// every handle is dropped.
    #[must_use]
    pub fn spawn(self) -> (EngineHandle, JoinHandle<Engine>) {
        let (sender, receiver): (Sender<CommandEnvelope>, Receiver<CommandEnvelope>) =
            bounded(self.config.queue_capacity);
        let handle = EngineHandle { sender };
        let thread = std::thread::Builder::new()
            .name("sequencer".to_string())
            .spawn(move || run_loop(self, receiver))
            .unwrap_or_else(|e| panic!("failed to spawn sequencer thread: {e}"));
        (handle, thread)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("symbols", &self.books.len())
            .field("next_command_seq", &self.next_command_seq)
            .field("fatal", &self.fatal)
            .finish()
    }
}

fn run_loop(mut engine: Engine, receiver: Receiver<CommandEnvelope>) -> Engine {
    info!("sequencer thread running");
    while let Ok(envelope) = receiver.recv() {
        let expired = envelope
            .deadline
            .is_some_and(|deadline| std::time::Instant::now() > deadline);
        let outcome = if expired {
            engine.apply_rejected(&envelope.command, RejectReason::Timeout)
        } else {
            engine.apply(envelope.command)
        };
        if let Some(reply) = envelope.reply {
            // The caller may have given up; that is their business.
            let _ = reply.send(outcome);
        }
    }
    info!("sequencer thread draining complete, exiting");
    engine
}

/// Producer-side handle to a spawned engine.
#[derive(Clone)]
pub struct EngineHandle {
    sender: Sender<CommandEnvelope>,
}

impl EngineHandle {
    /// Enqueue a command without waiting for its events.
    ///
    /// # Errors
    ///
    /// [`RejectReason::QueueFull`] when the queue has no room — retry is
    /// the caller's responsibility, with a fresh `client_id` if the
    /// original outcome is unknown.
    pub fn submit(&self, command: Command) -> Result<(), RejectReason> {
        self.submit_envelope(CommandEnvelope::fire_and_forget(command))
            .map(|_| ())
    }

    /// Enqueue a command and receive its sequenced outcome.
    ///
    /// # Errors
    ///
    /// [`RejectReason::QueueFull`] when the queue has no room.
    pub fn submit_wait(&self, command: Command) -> Result<Receiver<CommandOutcome>, RejectReason> {
        let (tx, rx) = unbounded();
        self.submit_envelope(CommandEnvelope {
            command,
            deadline: None,
            reply: Some(tx),
        })?;
        Ok(rx)
    }

    /// Enqueue a command with a drop-dead deadline.
    ///
    /// # Errors
    ///
    /// [`RejectReason::QueueFull`] when the queue has no room.
    pub fn submit_with_deadline(
        &self,
        command: Command,
        deadline: std::time::Instant,
    ) -> Result<Receiver<CommandOutcome>, RejectReason> {
        let (tx, rx) = unbounded();
        self.submit_envelope(CommandEnvelope {
            command,
            deadline: Some(deadline),
            reply: Some(tx),
        })?;
        Ok(rx)
    }

    fn submit_envelope(&self, envelope: CommandEnvelope) -> Result<(), RejectReason> {
        match self.sender.try_send(envelope) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                Err(RejectReason::QueueFull)
            }
        }
    }
}
