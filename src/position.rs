//! Positions, average-entry accounting, PnL, funding and liquidation
//! triggers.
//!
//! The position manager consumes the trade stream and is the only writer
//! of position state. Balance effects (fees, realized PnL, margin
//! reservations) are delegated to the [`crate::ledger::Ledger`]; the
//! pipeline is strictly acyclic and the ledger never calls back.

use crate::catalog::SymbolSpec;
use crate::error::FatalReason;
use crate::money::Micros;
use crate::orders::{Side, UserId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::trace;

/// One user's position in one symbol.
///
/// Created lazily on first fill and never destroyed; a flat position keeps
/// its realized PnL and funding history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Position owner.
    pub user: UserId,
    /// Symbol.
    pub symbol: String,
    /// Signed net size in lots; positive long, negative short, zero flat.
    pub net_size: i64,
    /// Volume-weighted average entry price. Zero when flat.
    pub avg_entry_price: Micros,
    /// Cumulative realized PnL over the position's life.
    pub realized_pnl: Micros,
    /// Cumulative funding paid (positive) or received (negative).
    pub cumulative_funding: Micros,
}

impl Position {
    fn flat(user: UserId, symbol: &str) -> Self {
        Self {
            user,
            symbol: symbol.to_string(),
            net_size: 0,
            avg_entry_price: Micros::ZERO,
            realized_pnl: Micros::ZERO,
            cumulative_funding: Micros::ZERO,
        }
    }

    /// Unrealized PnL against `mark`: `(mark − avg_entry) · net_size`.
    #[must_use]
    pub fn unrealized(&self, mark: Micros) -> Option<Micros> {
        mark.checked_sub(self.avg_entry_price)?
            .checked_mul_qty(self.net_size)
    }

    /// Initial-margin requirement at the configured rate.
    #[must_use]
    pub fn required_margin(&self, initial_margin_bps: u32) -> Option<Micros> {
        self.avg_entry_price
            .checked_mul_qty(self.net_size.abs())?
            .checked_bps(initial_margin_bps as i32)
    }

    /// The reference price at which maintenance margin is exhausted.
    ///
    /// Longs liquidate when the reference falls to
    /// `avg · (1 − maintenance)`, shorts when it rises to
    /// `avg · (1 + maintenance)`. `None` when flat or on overflow.
    #[must_use]
    pub fn liquidation_price(&self, maintenance_margin_bps: u32) -> Option<Micros> {
        if self.net_size == 0 {
            return None;
        }
        let buffer = self
            .avg_entry_price
            .checked_bps(maintenance_margin_bps as i32)?;
        if self.net_size > 0 {
            self.avg_entry_price.checked_sub(buffer)
        } else {
            self.avg_entry_price.checked_add(buffer)
        }
    }

    /// Whether `reference` breaches the liquidation price.
    #[must_use]
    pub fn breaches_liquidation(&self, reference: Micros, maintenance_margin_bps: u32) -> bool {
        match self.liquidation_price(maintenance_margin_bps) {
            Some(liq) if self.net_size > 0 => reference <= liq,
            Some(liq) if self.net_size < 0 => reference >= liq,
            _ => false,
        }
    }
}

/// Balance effects of applying one fill to one party's position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillEffect {
    /// The updated position.
    pub position: Position,
    /// Realized PnL from this fill (zero unless the fill reduced or
    /// flipped the position).
    pub realized: Micros,
    /// Change in the initial-margin reservation: positive reserves,
    /// negative releases.
    pub margin_delta: Micros,
}

/// All positions for one shard, keyed `(symbol, user)` so per-symbol scans
/// iterate deterministically.
#[derive(Debug, Default)]
pub struct PositionManager {
    positions: BTreeMap<(String, UserId), Position>,
}

impl PositionManager {
    /// An empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The position of `user` in `symbol`, if one was ever opened.
    #[must_use]
    pub fn get(&self, symbol: &str, user: UserId) -> Option<&Position> {
        self.positions.get(&(symbol.to_string(), user))
    }

    /// Net size of `user` in `symbol`; zero when no position exists.
    #[must_use]
    pub fn net_size(&self, symbol: &str, user: UserId) -> i64 {
        self.get(symbol, user).map_or(0, |p| p.net_size)
    }

    /// Apply one party's side of a fill.
    ///
    /// `side` is the direction **this party** traded. Average-entry and
    /// realized-PnL rules:
    ///
    /// 1. Same sign (or flat before): the average entry price absorbs the
    ///    fill volume-weighted.
    /// 2. Opposite sign, `|Δ| ≤ |old|`: realizes `(price − avg) · closed ·
    ///    sign(old)`; the average is unchanged.
    /// 3. Opposite sign, `|Δ| > |old|`: closes the old side at realized
    ///    PnL, opens the residual on the new side at `price`.
    ///
    /// # Errors
    ///
    /// [`FatalReason::MoneyOverflow`] when the arithmetic leaves `i64`.
    pub fn apply_fill(
        &mut self,
        user: UserId,
        spec: &SymbolSpec,
        side: Side,
        quantity: i64,
        price: Micros,
    ) -> Result<FillEffect, FatalReason> {
        let key = (spec.symbol.clone(), user);
        let position = self
            .positions
            .entry(key)
            .or_insert_with(|| Position::flat(user, &spec.symbol));

        let margin_before = position
            .required_margin(spec.initial_margin_bps)
            .ok_or_else(|| overflow("required margin (before)"))?;

        let delta = side.sign() * quantity;
        let old = position.net_size;
        let new = old + delta;
        let mut realized = Micros::ZERO;

        if old == 0 || old.signum() == delta.signum() {
            // Case 1: extend (or open) the position.
            let abs_old = i128::from(old.abs());
            let abs_delta = i128::from(delta.abs());
            let abs_new = abs_old + abs_delta;
            let weighted = i128::from(position.avg_entry_price.raw()) * abs_old
                + i128::from(price.raw()) * abs_delta;
            let avg = i64::try_from(weighted / abs_new)
                .map_err(|_| overflow("volume-weighted average entry"))?;
            position.avg_entry_price = Micros::new(avg);
            position.net_size = new;
        } else {
            let closed = delta.abs().min(old.abs());
            realized = price
                .checked_sub(position.avg_entry_price)
                .and_then(|edge| edge.checked_mul_qty(closed))
                .map(|pnl| {
                    if old > 0 { pnl } else { -pnl }
                })
                .ok_or_else(|| overflow("realized PnL"))?;
            position.net_size = new;
            if new == 0 {
                position.avg_entry_price = Micros::ZERO;
            } else if new.signum() != old.signum() {
                // Case 3: flipped through flat; the residual opens at the
                // fill price.
                position.avg_entry_price = price;
            }
            position.realized_pnl = position
                .realized_pnl
                .checked_add(realized)
                .ok_or_else(|| overflow("cumulative realized PnL"))?;
        }

        let margin_after = position
            .required_margin(spec.initial_margin_bps)
            .ok_or_else(|| overflow("required margin (after)"))?;
        let margin_delta = margin_after
            .checked_sub(margin_before)
            .ok_or_else(|| overflow("margin delta"))?;

        trace!(
            "fill applied: {} {} {} x {} @ {} -> net {}",
            user, side, spec.symbol, quantity, price, position.net_size
        );
        Ok(FillEffect {
            position: position.clone(),
            realized,
            margin_delta,
        })
    }

    /// Compute funding charges for every open position in `symbol` at
    /// `mark`: `charge = net_notional · rate`, so longs pay and shorts
    /// receive when `rate_micros` is positive. Updates each position's
    /// cumulative funding. Deterministic user order.
    ///
    /// # Errors
    ///
    /// [`FatalReason::MoneyOverflow`] when a charge leaves `i64`.
    pub fn funding_charges(
        &mut self,
        symbol: &str,
        rate_micros: i64,
        mark: Micros,
    ) -> Result<Vec<(UserId, Micros, Position)>, FatalReason> {
        let mut charges = Vec::new();
        let range = (symbol.to_string(), UserId(u64::MIN))..=(symbol.to_string(), UserId(u64::MAX));
        for ((_, user), position) in self.positions.range_mut(range) {
            if position.net_size == 0 {
                continue;
            }
            let notional = mark
                .checked_mul_qty(position.net_size)
                .ok_or_else(|| overflow("funding notional"))?;
            let charge = notional
                .checked_rate(rate_micros)
                .ok_or_else(|| overflow("funding charge"))?;
            if charge.is_zero() {
                continue;
            }
            position.cumulative_funding = position
                .cumulative_funding
                .checked_add(charge)
                .ok_or_else(|| overflow("cumulative funding"))?;
            charges.push((*user, charge, position.clone()));
        }
        Ok(charges)
    }

    /// Users whose positions in `symbol` breach their liquidation price at
    /// `reference`, in deterministic order.
    #[must_use]
    pub fn breached_positions(
        &self,
        symbol: &str,
        reference: Micros,
        maintenance_margin_bps: u32,
    ) -> Vec<UserId> {
        let range = (symbol.to_string(), UserId(u64::MIN))..=(symbol.to_string(), UserId(u64::MAX));
        self.positions
            .range(range)
            .filter(|(_, p)| p.breaches_liquidation(reference, maintenance_margin_bps))
            .map(|((_, user), _)| *user)
            .collect()
    }

    /// Total unrealized PnL for `user` across symbols, marking each symbol
    /// at the supplied price; positions without a mark use their entry
    /// price (zero unrealized).
    #[must_use]
    pub fn total_unrealized(
        &self,
        user: UserId,
        mark_of: impl Fn(&str) -> Option<Micros>,
    ) -> Micros {
        self.positions
            .iter()
            .filter(|((_, u), _)| *u == user)
            .map(|((symbol, _), p)| {
                mark_of(symbol)
                    .and_then(|mark| p.unrealized(mark))
                    .unwrap_or(Micros::ZERO)
            })
            .sum()
    }

    /// Total initial-margin requirement for `user` across symbols.
    #[must_use]
    pub fn total_required_margin(
        &self,
        user: UserId,
        margin_bps_of: impl Fn(&str) -> Option<u32>,
    ) -> Micros {
        self.positions
            .iter()
            .filter(|((_, u), _)| *u == user)
            .map(|((symbol, _), p)| {
                margin_bps_of(symbol)
                    .and_then(|bps| p.required_margin(bps))
                    .unwrap_or(Micros::ZERO)
            })
            .sum()
    }

    /// Overwrite a position from a journaled `PositionUpdated` event
    /// during replay.
    pub fn restore(&mut self, position: Position) {
        self.positions
            .insert((position.symbol.clone(), position.user), position);
    }

    /// All positions, deterministic order.
    pub fn iter(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }
}

#[cold]
fn overflow(context: &str) -> FatalReason {
    FatalReason::MoneyOverflow {
        context: context.to_string(),
    }
}
