//! Parked stop orders and trigger activation.
//!
//! Stop and stop-limit orders park on a per-side trigger ladder instead of
//! resting in the visible book. A buy stop fires when the observed price
//! rises to or through its trigger; a sell stop fires when the price falls
//! to or through it. The engine feeds both last-trade prices and reference
//! prices into [`OrderBook::take_triggered`], and converts each fired order
//! to a market or limit order before resubmitting it under the same
//! command.

use super::book::OrderBook;
use crate::money::Micros;
use crate::orders::{Order, OrderKind, OrderStatus, Side};
use tracing::trace;

impl OrderBook {
    /// Park a validated stop order on the trigger ladder.
    ///
    /// Caller guarantees `order.trigger` is present and tick-aligned.
    pub(super) fn park_stop(&mut self, order: Order) {
        let trigger = order.trigger.unwrap_or_default();
        self.stop_index.insert(order.id, (order.side, trigger));
        self.inc_open(order.user_id);
        let ladder = match order.side {
            Side::Buy => &mut self.buy_stops,
            Side::Sell => &mut self.sell_stops,
        };
        trace!(
            "parked {} stop {} trigger {} on {}",
            order.side,
            order.id,
            trigger,
            self.spec.symbol
        );
        ladder.entry(trigger).or_default().push(order);
    }

    /// Pop the single highest-priority parked stop crossed by `price`:
    /// buy stops lowest-trigger-first, then sell stops
    /// highest-trigger-first. The engine activates stops one at a time so
    /// a halt mid-cascade leaves the rest parked.
    pub fn take_next_triggered(&mut self, price: Micros) -> Option<Order> {
        let buy_trigger = self
            .buy_stops
            .range(..=price)
            .map(|(trigger, _)| *trigger)
            .next();
        if let Some(trigger) = buy_trigger {
            return self.pop_parked(Side::Buy, trigger, price);
        }
        let sell_trigger = self
            .sell_stops
            .range(price..)
            .map(|(trigger, _)| *trigger)
            .next_back();
        if let Some(trigger) = sell_trigger {
            return self.pop_parked(Side::Sell, trigger, price);
        }
        None
    }

    fn pop_parked(&mut self, side: Side, trigger: Micros, price: Micros) -> Option<Order> {
        let ladder = match side {
            Side::Buy => &mut self.buy_stops,
            Side::Sell => &mut self.sell_stops,
        };
        let parked = ladder.get_mut(&trigger)?;
        let mut order = if parked.is_empty() {
            None
        } else {
            Some(parked.remove(0))
        }?;
        if parked.is_empty() {
            ladder.remove(&trigger);
        }
        self.stop_index.remove(&order.id);
        self.dec_open(order.user_id);
        order.status = OrderStatus::Triggered;
        trace!(
            "triggered stop {} at {} on {}",
            order.id, price, self.spec.symbol
        );
        Some(order)
    }

    /// Pop every parked stop whose trigger is crossed by `price`, marked
    /// `Triggered`, in the same order [`OrderBook::take_next_triggered`]
    /// would produce them.
    ///
    /// The caller converts each returned order (`Stop` → market,
    /// `StopLimit` → limit) and resubmits it.
    pub fn take_triggered(&mut self, price: Micros) -> Vec<Order> {
        let mut fired = Vec::new();
        while let Some(order) = self.take_next_triggered(price) {
            fired.push(order);
        }
        fired
    }

    /// Convert a fired stop into the order it activates as.
    ///
    /// `Stop` becomes a market order (price cleared); `StopLimit` becomes a
    /// limit order at its stored price. Status resets to `New` for
    /// resubmission.
    #[must_use]
    pub fn activate_stop(mut order: Order) -> Order {
        match order.kind {
            OrderKind::Stop => {
                order.kind = OrderKind::Market;
                order.price = None;
            }
            OrderKind::StopLimit => {
                order.kind = OrderKind::Limit;
            }
            _ => {}
        }
        order.trigger = None;
        order.status = OrderStatus::New;
        order
    }

    /// Number of parked stops on both ladders.
    #[must_use]
    pub fn parked_stop_count(&self) -> usize {
        self.stop_index.len()
    }
}
