//! Per-symbol order book: price-ordered levels, the order index, and the
//! non-matching operations (cancel, depth, BBO, snapshot, integrity).

use super::level::PriceLevel;
use crate::catalog::SymbolSpec;
use crate::money::Micros;
use crate::orders::{Order, OrderId, OrderStatus, Side, UserId};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

/// One `(side, price, signed quantity)` change to the visible book, emitted
/// for every rest, fill and cancel so subscribers can maintain a mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookDelta {
    /// The side whose level changed.
    pub side: Side,
    /// The price level that changed.
    pub price: Micros,
    /// Signed quantity delta: positive on rest, negative on fill/cancel.
    pub qty_delta: i64,
}

/// Aggregate view of one price level, as published in snapshots and depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelView {
    /// The level's price.
    pub price: Micros,
    /// Aggregate resting quantity.
    pub quantity: i64,
    /// Number of resting orders.
    pub order_count: usize,
}

/// A point-in-time aggregate snapshot of the book, suitable for read models
/// and recovery verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookSnapshot {
    /// The symbol this snapshot belongs to.
    pub symbol: String,
    /// Bid levels, best (highest) first.
    pub bids: Vec<LevelView>,
    /// Ask levels, best (lowest) first.
    pub asks: Vec<LevelView>,
    /// Last traded price, if any trade has printed.
    pub last_trade_price: Option<Micros>,
}

impl BookSnapshot {
    /// SHA-256 digest of the canonical JSON form, for crash-equivalence
    /// checks.
    #[must_use]
    pub fn digest(&self) -> String {
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        format!("{:x}", hasher.finalize())
    }
}

/// A per-symbol price-time-priority book.
///
/// The book is owned exclusively by the sequencer; nothing here is shared
/// or locked. External readers see immutable snapshots published through
/// the event bus.
pub struct OrderBook {
    pub(super) spec: SymbolSpec,
    /// Bid levels keyed by price; iterated in reverse for best-first.
    pub(super) bids: BTreeMap<Micros, PriceLevel>,
    /// Ask levels keyed by price; iterated forward for best-first.
    pub(super) asks: BTreeMap<Micros, PriceLevel>,
    /// Resting order lookup: id → (side, price).
    pub(super) index: HashMap<OrderId, (Side, Micros)>,
    /// Parked buy stops keyed by trigger (fire when last >= trigger).
    pub(super) buy_stops: BTreeMap<Micros, Vec<Order>>,
    /// Parked sell stops keyed by trigger (fire when last <= trigger).
    pub(super) sell_stops: BTreeMap<Micros, Vec<Order>>,
    /// Parked stop lookup: id → (side, trigger).
    pub(super) stop_index: HashMap<OrderId, (Side, Micros)>,
    /// Open orders (resting + parked) per user, for the risk cap.
    pub(super) open_counts: HashMap<UserId, u32>,
    /// Price of the last trade printed on this book.
    pub(super) last_trade_price: Option<Micros>,
    /// Set by the engine while the symbol is halted. Submits are rejected;
    /// cancels still work.
    pub(super) halted: bool,
}

impl OrderBook {
    /// Create an empty book for the given symbol spec.
    #[must_use]
    pub fn new(spec: SymbolSpec) -> Self {
        Self {
            spec,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            index: HashMap::new(),
            buy_stops: BTreeMap::new(),
            sell_stops: BTreeMap::new(),
            stop_index: HashMap::new(),
            open_counts: HashMap::new(),
            last_trade_price: None,
            halted: false,
        }
    }

    /// The symbol this book trades.
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.spec.symbol
    }

    /// The spec this book was built from.
    #[must_use]
    pub fn spec(&self) -> &SymbolSpec {
        &self.spec
    }

    /// Whether the symbol is currently halted.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Engine hook: flip the halt flag.
    pub(crate) fn set_halted(&mut self, halted: bool) {
        self.halted = halted;
    }

    /// Price of the last trade printed on this book, if any.
    #[must_use]
    pub fn last_trade_price(&self) -> Option<Micros> {
        self.last_trade_price
    }

    /// Number of open orders (resting + parked stops) for `user`.
    #[must_use]
    pub fn open_order_count(&self, user: UserId) -> u32 {
        self.open_counts.get(&user).copied().unwrap_or(0)
    }

    /// Best bid and best ask, either of which may be absent.
    #[must_use]
    pub fn bbo(&self) -> (Option<Micros>, Option<Micros>) {
        let best_bid = self.bids.keys().next_back().copied();
        let best_ask = self.asks.keys().next().copied();
        (best_bid, best_ask)
    }

    /// Aggregate depth down to `n` levels per side, best-first.
    #[must_use]
    pub fn depth(&self, n: usize) -> (Vec<LevelView>, Vec<LevelView>) {
        let bids = self
            .bids
            .values()
            .rev()
            .take(n)
            .map(Self::level_view)
            .collect();
        let asks = self.asks.values().take(n).map(Self::level_view).collect();
        (bids, asks)
    }

    fn level_view(level: &PriceLevel) -> LevelView {
        LevelView {
            price: level.price(),
            quantity: level.total_quantity(),
            order_count: level.order_count(),
        }
    }

    /// Cancel a resting or parked order.
    ///
    /// Returns the canceled order with status set to `Canceled`, or `None`
    /// when the book does not hold it (the engine distinguishes `NotFound`
    /// from `AlreadyTerminal` using its own status history).
    pub fn cancel(&mut self, order_id: OrderId) -> Option<(Order, Option<BookDelta>)> {
        if let Some((side, price)) = self.index.remove(&order_id) {
            let levels = match side {
                Side::Buy => &mut self.bids,
                Side::Sell => &mut self.asks,
            };
            let level = levels.get_mut(&price)?;
            let mut order = level.remove(order_id)?;
            let delta = BookDelta {
                side,
                price,
                qty_delta: -order.remaining,
            };
            if level.is_empty() {
                levels.remove(&price);
            }
            self.dec_open(order.user_id);
            order.status = OrderStatus::Canceled;
            trace!("canceled resting order {} on {}", order_id, self.symbol());
            return Some((order, Some(delta)));
        }

        if let Some((side, trigger)) = self.stop_index.remove(&order_id) {
            let ladder = match side {
                Side::Buy => &mut self.buy_stops,
                Side::Sell => &mut self.sell_stops,
            };
            let parked = ladder.get_mut(&trigger)?;
            let idx = parked.iter().position(|o| o.id == order_id)?;
            let mut order = parked.remove(idx);
            if parked.is_empty() {
                ladder.remove(&trigger);
            }
            self.dec_open(order.user_id);
            order.status = OrderStatus::Canceled;
            trace!("canceled parked stop {} on {}", order_id, self.symbol());
            return Some((order, None));
        }

        None
    }

    /// Cancel every open order belonging to `user`. Used by the
    /// liquidation path and operator tooling.
    pub fn cancel_all_for_user(&mut self, user: UserId) -> Vec<(Order, Option<BookDelta>)> {
        let resting: Vec<OrderId> = self
            .index
            .iter()
            .filter_map(|(id, _)| {
                let owned = self.order(*id).is_some_and(|o| o.user_id == user);
                owned.then_some(*id)
            })
            .collect();
        let parked: Vec<OrderId> = self
            .stop_index
            .keys()
            .filter(|id| self.parked_stop(**id).is_some_and(|o| o.user_id == user))
            .copied()
            .collect();

        let mut canceled = Vec::with_capacity(resting.len() + parked.len());
        for id in resting.into_iter().chain(parked) {
            if let Some(out) = self.cancel(id) {
                canceled.push(out);
            }
        }
        canceled
    }

    /// Look up a resting order by id.
    #[must_use]
    pub fn order(&self, order_id: OrderId) -> Option<&Order> {
        let (side, price) = self.index.get(&order_id)?;
        let levels = match side {
            Side::Buy => &self.bids,
            Side::Sell => &self.asks,
        };
        levels.get(price)?.iter().find(|o| o.id == order_id)
    }

    /// Look up a parked stop order by id.
    #[must_use]
    pub fn parked_stop(&self, order_id: OrderId) -> Option<&Order> {
        let (side, trigger) = self.stop_index.get(&order_id)?;
        let ladder = match side {
            Side::Buy => &self.buy_stops,
            Side::Sell => &self.sell_stops,
        };
        ladder.get(trigger)?.iter().find(|o| o.id == order_id)
    }

    /// Whether the book holds `order_id`, resting or parked.
    #[must_use]
    pub fn contains(&self, order_id: OrderId) -> bool {
        self.index.contains_key(&order_id) || self.stop_index.contains_key(&order_id)
    }

    /// Aggregate snapshot of the whole book.
    #[must_use]
    pub fn snapshot(&self) -> BookSnapshot {
        BookSnapshot {
            symbol: self.spec.symbol.clone(),
            bids: self.bids.values().rev().map(Self::level_view).collect(),
            asks: self.asks.values().map(Self::level_view).collect(),
            last_trade_price: self.last_trade_price,
        }
    }

    /// Internal integrity check: the index and the levels must agree, and
    /// aggregate level quantities must equal the sum of order remainders.
    ///
    /// Returns a description of the first inconsistency found.
    pub fn validate(&self) -> Result<(), String> {
        for (id, (side, price)) in &self.index {
            let levels = match side {
                Side::Buy => &self.bids,
                Side::Sell => &self.asks,
            };
            let Some(level) = levels.get(price) else {
                return Err(format!("index points {id} at missing level {price}"));
            };
            if !level.iter().any(|o| o.id == *id) {
                return Err(format!("index points {id} at level {price} without it"));
            }
        }
        for (levels, side) in [(&self.bids, Side::Buy), (&self.asks, Side::Sell)] {
            for level in levels.values() {
                let sum: i64 = level.iter().map(|o| o.remaining).sum();
                if sum != level.total_quantity() {
                    return Err(format!(
                        "{side} level {} aggregate {} != order sum {sum}",
                        level.price(),
                        level.total_quantity()
                    ));
                }
                for order in level.iter() {
                    if !self.index.contains_key(&order.id) {
                        return Err(format!("order {} resting but unindexed", order.id));
                    }
                    if order.filled + order.remaining != order.quantity {
                        return Err(format!("order {} quantity invariant broken", order.id));
                    }
                }
            }
        }
        if let (Some(bid), Some(ask)) = self.bbo()
            && bid >= ask
        {
            return Err(format!("crossed book: bid {bid} >= ask {ask}"));
        }
        Ok(())
    }

    pub(super) fn inc_open(&mut self, user: UserId) {
        *self.open_counts.entry(user).or_insert(0) += 1;
    }

    pub(super) fn dec_open(&mut self, user: UserId) {
        if let Some(count) = self.open_counts.get_mut(&user) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.open_counts.remove(&user);
            }
        }
    }

    /// Journal-replay hook: rest an order exactly as a live rest would.
    pub(crate) fn replay_rest(&mut self, order: Order) {
        let _ = self.rest(order);
    }

    /// Journal-replay hook: park a stop exactly as a live park would.
    pub(crate) fn replay_park(&mut self, order: Order) {
        self.park_stop(order);
    }

    /// Journal-replay hook: apply a journaled fill to the resting maker
    /// and refresh the last trade price.
    pub(crate) fn replay_trade(
        &mut self,
        maker_order_id: OrderId,
        quantity: i64,
        price: Micros,
    ) -> Option<Order> {
        let (side, level_price) = *self.index.get(&maker_order_id)?;
        let levels = match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        };
        let level = levels.get_mut(&level_price)?;
        let maker_after = level.fill_order(maker_order_id, quantity)?;
        if level.is_empty() {
            levels.remove(&level_price);
        }
        self.last_trade_price = Some(price);
        if maker_after.remaining == 0 {
            self.index.remove(&maker_order_id);
            self.dec_open(maker_after.user_id);
        }
        Some(maker_after)
    }

    /// Rest a limit order at its price, updating the index and counters.
    ///
    /// Caller guarantees the order has a price, positive remainder, and a
    /// non-crossing placement.
    pub(super) fn rest(&mut self, order: Order) -> BookDelta {
        let price = order.price.unwrap_or_default();
        let side = order.side;
        let delta = BookDelta {
            side,
            price,
            qty_delta: order.remaining,
        };
        self.index.insert(order.id, (side, price));
        self.inc_open(order.user_id);
        let levels = match side {
            Side::Buy => &mut self.bids,
            Side::Sell => &mut self.asks,
        };
        levels
            .entry(price)
            .or_insert_with(|| PriceLevel::new(price))
            .push_back(order);
        delta
    }
}
