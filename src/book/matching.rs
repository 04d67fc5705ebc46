//! The matching loop: submission validation, price-time-priority fills,
//! self-trade handling, and time-in-force residual processing.

use super::book::{BookDelta, OrderBook};
use crate::breaker::CircuitBreaker;
use crate::error::RejectReason;
use crate::money::Micros;
use crate::orders::{
    CancelReason, Order, OrderFlags, OrderKind, OrderStatus, Side, TimeInForce, UserId,
};
use tracing::trace;

/// One execution against a resting maker, in chronological match order.
///
/// Fees, trade ids and sequencing are assigned by the engine; the book
/// reports the raw fill with the maker's post-fill state.
#[derive(Debug, Clone)]
pub struct Fill {
    /// The maker order as it stands after this fill.
    pub maker: Order,
    /// Execution price (the maker's resting price).
    pub price: Micros,
    /// Executed quantity in lots.
    pub quantity: i64,
}

/// Everything a single `submit` did to the book.
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    /// The incoming order after matching and residual handling.
    pub taker: Order,
    /// Fills in chronological order.
    pub fills: Vec<Fill>,
    /// Resting orders canceled by self-trade prevention.
    pub canceled_makers: Vec<Order>,
    /// Why the taker's residual was canceled, when it was.
    pub taker_cancel: Option<CancelReason>,
    /// Visible book changes, in the order they happened.
    pub deltas: Vec<BookDelta>,
    /// Whether the residual rested on the book.
    pub rested: bool,
    /// Whether the order parked on the stop ladder.
    pub parked: bool,
    /// Price of the fill that breached a circuit band, when the guard
    /// stopped the match mid-way. The breaching trade itself stands.
    pub breached: Option<Micros>,
}

impl MatchOutcome {
    fn new(taker: Order) -> Self {
        Self {
            taker,
            fills: Vec::new(),
            canceled_makers: Vec::new(),
            taker_cancel: None,
            deltas: Vec::new(),
            rested: false,
            parked: false,
            breached: None,
        }
    }
}

impl OrderBook {
    /// Submit an order: validate, match, and handle the residual per its
    /// time-in-force.
    ///
    /// `position_net` is the caller's position snapshot for the symbol,
    /// taken at sequencer entry, used only for the REDUCE_ONLY check.
    ///
    /// # Errors
    ///
    /// Returns a [`RejectReason`] without mutating the book for every
    /// validation failure; partial state changes are never observable.
    pub fn submit(
        &mut self,
        order: Order,
        position_net: i64,
    ) -> Result<MatchOutcome, RejectReason> {
        self.submit_guarded(order, position_net, None)
    }

    /// [`OrderBook::submit`] with a circuit-breaker guard: after each fill
    /// prints, a breached band stops further matching within the same
    /// order. The breaching fill itself stands; the engine converts the
    /// breach into a halt.
    ///
    /// # Errors
    ///
    /// Same as [`OrderBook::submit`].
    pub fn submit_guarded(
        &mut self,
        mut order: Order,
        position_net: i64,
        breaker: Option<&CircuitBreaker>,
    ) -> Result<MatchOutcome, RejectReason> {
        self.validate_order(&order, position_net)?;

        if order.kind.is_stop() {
            order.status = OrderStatus::Open;
            self.park_stop(order.clone());
            let mut outcome = MatchOutcome::new(order);
            outcome.parked = true;
            return Ok(outcome);
        }

        let limit = match order.kind {
            OrderKind::Market => None,
            _ => order.price,
        };

        if order.time_in_force == TimeInForce::Fok {
            let available = self.peek_available(order.side, limit, order.user_id);
            if available < order.remaining {
                return Err(RejectReason::FokInfeasible {
                    requested: order.remaining,
                    available,
                });
            }
        }

        let mut outcome = self.run_match(order, limit, breaker);

        // Residual handling per time-in-force.
        if outcome.taker.remaining > 0 && outcome.taker_cancel.is_none() {
            match (outcome.taker.kind, outcome.taker.time_in_force) {
                (OrderKind::Market, _) => {
                    outcome.taker_cancel = Some(CancelReason::NoLiquidity);
                }
                (_, TimeInForce::Ioc) => {
                    outcome.taker_cancel = Some(CancelReason::ImmediateOrCancel);
                }
                (_, TimeInForce::Fok) => {
                    // Feasibility was proven above; a leftover here means the
                    // book changed mid-command, which cannot happen under the
                    // single-writer model.
                    debug_assert!(false, "FOK residual after feasibility check");
                    outcome.taker_cancel = Some(CancelReason::NoLiquidity);
                }
                (_, TimeInForce::Gtc) => {
                    if outcome.taker.filled == 0 {
                        outcome.taker.status = OrderStatus::Open;
                    }
                    let delta = self.rest(outcome.taker.clone());
                    outcome.deltas.push(delta);
                    outcome.rested = true;
                }
            }
        }
        if outcome.taker_cancel.is_some() && outcome.taker.remaining > 0 {
            outcome.taker.status = OrderStatus::Canceled;
        }

        Ok(outcome)
    }

    /// The core loop: march the best opposite levels while they cross,
    /// filling FIFO heads and applying the self-trade policy.
    fn run_match(
        &mut self,
        mut taker: Order,
        limit: Option<Micros>,
        breaker: Option<&CircuitBreaker>,
    ) -> MatchOutcome {
        let mut fills = Vec::new();
        let mut canceled_makers: Vec<Order> = Vec::new();
        let mut deltas = Vec::new();
        let mut taker_cancel = None;
        let mut breached = None;
        let stp = self.spec.stp_policy;

        while taker.remaining > 0 {
            let best = match taker.side {
                Side::Buy => self.asks.keys().next().copied(),
                Side::Sell => self.bids.keys().next_back().copied(),
            };
            let Some(best_price) = best else { break };

            if let Some(limit) = limit {
                let crosses = match taker.side {
                    Side::Buy => best_price <= limit,
                    Side::Sell => best_price >= limit,
                };
                if !crosses {
                    break;
                }
            }

            let maker_side = taker.side.opposite();
            let levels = match maker_side {
                Side::Buy => &mut self.bids,
                Side::Sell => &mut self.asks,
            };
            let Some(level) = levels.get_mut(&best_price) else {
                break;
            };

            let head_is_self = level
                .front()
                .is_some_and(|head| head.user_id == taker.user_id);
            if head_is_self {
                let mut removed_maker = None;
                if stp.cancels_maker()
                    && let Some(maker) = level.pop_front()
                {
                    if level.is_empty() {
                        levels.remove(&best_price);
                    }
                    removed_maker = Some(maker);
                }
                if let Some(mut maker) = removed_maker {
                    maker.status = OrderStatus::Canceled;
                    self.index.remove(&maker.id);
                    self.dec_open(maker.user_id);
                    deltas.push(BookDelta {
                        side: maker_side,
                        price: best_price,
                        qty_delta: -maker.remaining,
                    });
                    trace!(
                        "self-trade: canceled resting {} of {} on {}",
                        maker.id,
                        maker.user_id,
                        self.symbol()
                    );
                    canceled_makers.push(maker);
                }
                if stp.cancels_taker() {
                    taker_cancel = Some(CancelReason::SelfTrade);
                    break;
                }
                continue;
            }

            let head_remaining = level.front().map_or(0, |o| o.remaining);
            let qty = taker.remaining.min(head_remaining);
            let Some(maker_after) = level.fill_front(qty) else {
                break;
            };
            if level.is_empty() {
                levels.remove(&best_price);
            }

            taker.apply_fill(qty);
            self.last_trade_price = Some(best_price);
            deltas.push(BookDelta {
                side: maker_side,
                price: best_price,
                qty_delta: -qty,
            });
            if maker_after.remaining == 0 {
                self.index.remove(&maker_after.id);
                self.dec_open(maker_after.user_id);
            }
            trace!(
                "fill {} x {} maker {} taker {} on {}",
                best_price,
                qty,
                maker_after.id,
                taker.id,
                self.symbol()
            );
            fills.push(Fill {
                maker: maker_after,
                price: best_price,
                quantity: qty,
            });

            if breaker.is_some_and(|b| b.would_halt(best_price)) {
                breached = Some(best_price);
                break;
            }
        }

        MatchOutcome {
            taker,
            fills,
            canceled_makers,
            taker_cancel,
            deltas,
            rested: false,
            parked: false,
            breached,
        }
    }

    /// Submission validation, evaluated once against the single-writer
    /// state. No mutation happens here. The sequencer runs this before
    /// the margin gate so input errors outrank policy errors; `submit`
    /// re-runs it, which is cheap and keeps the book safe standalone.
    pub fn validate_order(&self, order: &Order, position_net: i64) -> Result<(), RejectReason> {
        if order.symbol != self.spec.symbol {
            return Err(RejectReason::UnknownSymbol {
                symbol: order.symbol.clone(),
            });
        }
        if self.halted {
            return Err(RejectReason::Halted {
                symbol: self.spec.symbol.clone(),
            });
        }
        let needs_price = matches!(order.kind, OrderKind::Limit | OrderKind::StopLimit);
        if needs_price && order.price.is_none() {
            return Err(RejectReason::MissingPrice {
                field: "limit price".to_string(),
            });
        }
        if order.kind.is_stop() && order.trigger.is_none() {
            return Err(RejectReason::MissingPrice {
                field: "trigger price".to_string(),
            });
        }
        for price in order.price.iter().chain(order.trigger.iter()) {
            if !price.is_tick_aligned(self.spec.tick_size) {
                return Err(RejectReason::TickAlignment {
                    price: *price,
                    tick_size: self.spec.tick_size,
                });
            }
        }
        if order.quantity % self.spec.lot_size != 0 {
            return Err(RejectReason::LotAlignment {
                quantity: order.quantity,
                lot_size: self.spec.lot_size,
            });
        }
        if order.quantity < self.spec.min_order || order.quantity > self.spec.max_order {
            return Err(RejectReason::SizeBounds {
                quantity: order.quantity,
                min: self.spec.min_order,
                max: self.spec.max_order,
            });
        }
        if order.flags.contains(OrderFlags::REDUCE_ONLY) {
            let increases = position_net == 0
                || position_net.signum() == order.side.sign()
                || order.quantity > position_net.abs();
            if increases {
                return Err(RejectReason::ReduceOnlyWouldIncrease {
                    net_size: position_net,
                    quantity: order.quantity,
                });
            }
        }
        if order.flags.contains(OrderFlags::POST_ONLY)
            && let Some(price) = order.price
        {
            let (best_bid, best_ask) = self.bbo();
            let crossing = match order.side {
                Side::Buy => best_ask.filter(|ask| price >= *ask),
                Side::Sell => best_bid.filter(|bid| price <= *bid),
            };
            if let Some(opposite) = crossing {
                return Err(RejectReason::PostOnlyWouldCross {
                    price,
                    opposite_price: opposite,
                    side: order.side,
                });
            }
        }
        Ok(())
    }

    /// Liquidity available to `taker_user` on the opposite side within
    /// `limit`, excluding the user's own resting quantity (which can never
    /// fill against them under any self-trade policy).
    #[must_use]
    pub fn peek_available(
        &self,
        taker_side: Side,
        limit: Option<Micros>,
        taker_user: UserId,
    ) -> i64 {
        let mut available = 0i64;
        let iter: Box<dyn Iterator<Item = &super::level::PriceLevel>> = match taker_side {
            Side::Buy => Box::new(self.asks.values()),
            Side::Sell => Box::new(self.bids.values().rev()),
        };
        for level in iter {
            if let Some(limit) = limit {
                let crosses = match taker_side {
                    Side::Buy => level.price() <= limit,
                    Side::Sell => level.price() >= limit,
                };
                if !crosses {
                    break;
                }
            }
            let own: i64 = level
                .iter()
                .filter(|o| o.user_id == taker_user)
                .map(|o| o.remaining)
                .sum();
            available = available.saturating_add(level.total_quantity() - own);
        }
        available
    }
}
