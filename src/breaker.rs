//! Per-symbol circuit breaker: three deviation bands against a reference
//! price, each with its own halt duration.
//!
//! A trade printing outside band *k* halts the symbol for that band's
//! duration; a breach of a stricter band during a halt extends it. During a
//! halt every submit is rejected with `Halted` while cancels continue to
//! work. Resumption requires both halt expiry and an acceptable fresh
//! reference price, so a symbol never reopens into a still-dislocated
//! market.
//!
//! Halt decisions are deterministic: they use the breaching trade's price
//! and the reference that was in force at command start, both of which are
//! journaled.

use crate::catalog::{BAND_COUNT, CircuitBand};
use crate::money::Micros;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Why a symbol is halted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HaltReason {
    /// A trade breached circuit band `band` (0-based).
    Band(u8),
    /// An operator issued `HaltSymbol`.
    Manual,
    /// Post-replay invariant validation failed for this symbol.
    ReplayMismatch,
}

impl std::fmt::Display for HaltReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HaltReason::Band(band) => write!(f, "circuit band {}", band + 1),
            HaltReason::Manual => write!(f, "operator halt"),
            HaltReason::ReplayMismatch => write!(f, "replay mismatch"),
        }
    }
}

/// A halt decision produced by the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Halt {
    /// Why the halt fired.
    pub reason: HaltReason,
    /// When normal matching may resume, milliseconds since epoch.
    pub until_ms: u64,
    /// Whether this extended an existing halt rather than opening one.
    pub extended: bool,
}

/// Serializable breaker state, journaled on halt/resume for replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BreakerState {
    /// The reference price in force, if one has been applied.
    pub reference: Option<Micros>,
    /// The band currently halting the symbol, if any.
    pub halted_band: Option<u8>,
    /// Whether an operator halt is in force.
    pub manual_halt: bool,
    /// Halt expiry, milliseconds since epoch. Meaningless when not halted.
    pub halt_until_ms: u64,
}

impl BreakerState {
    /// Whether any halt (band or manual) is in force.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.halted_band.is_some() || self.manual_halt
    }
}

/// The per-symbol breaker: bands plus live state.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    bands: [CircuitBand; BAND_COUNT],
    state: BreakerState,
}

impl CircuitBreaker {
    /// Create a breaker with the symbol's configured bands and no
    /// reference yet.
    #[must_use]
    pub fn new(bands: [CircuitBand; BAND_COUNT]) -> Self {
        Self {
            bands,
            state: BreakerState::default(),
        }
    }

    /// Current state, for snapshots and journaling.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Restore journaled state during replay.
    pub fn restore(&mut self, state: BreakerState) {
        self.state = state;
    }

    /// Whether the symbol is halted right now.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.state.is_halted()
    }

    /// The reference price in force.
    #[must_use]
    pub fn reference(&self) -> Option<Micros> {
        self.state.reference
    }

    /// The widest band strictly exceeded by `price`, if any.
    ///
    /// The comparison cross-multiplies instead of computing truncated
    /// basis points, so a deviation of 3.00003% does breach a 3% band.
    fn breached_band(&self, price: Micros) -> Option<u8> {
        let reference = self.state.reference?;
        if reference.raw() <= 0 {
            return None;
        }
        let diff = i128::from((price.raw() - reference.raw()).abs());
        let mut breached = None;
        for (idx, band) in self.bands.iter().enumerate() {
            // deviation > band ⇔ diff · 10_000 > band_bps · reference
            if diff * 10_000 > i128::from(band.deviation_bps) * i128::from(reference.raw()) {
                breached = Some(idx as u8);
            }
        }
        breached
    }

    /// Whether a trade printing at `price` would breach a band right now.
    /// Pure; the matching loop uses this to stop filling past a breach.
    #[must_use]
    pub fn would_halt(&self, price: Micros) -> bool {
        match self.breached_band(price) {
            Some(band) => self.state.halted_band.is_none() || Some(band) > self.state.halted_band,
            None => false,
        }
    }

    /// Judge a freshly printed trade price. Returns the halt to apply, or
    /// `None` when the price is inside all bands (or no reference exists).
    pub fn on_trade(&mut self, price: Micros, now_ms: u64) -> Option<Halt> {
        let band = self.breached_band(price)?;
        self.apply_band_halt(band, now_ms)
    }

    /// Apply a new reference price.
    ///
    /// While halted, a reference that itself breaches a stricter band
    /// extends the halt instead of updating; otherwise the reference is
    /// refreshed. Returns a halt extension when one fired.
    pub fn apply_reference(&mut self, price: Micros, now_ms: u64) -> Option<Halt> {
        if self.state.is_halted()
            && let Some(band) = self.breached_band(price)
            && Some(band) > self.state.halted_band
        {
            return self.apply_band_halt(band, now_ms);
        }
        self.state.reference = Some(price);
        None
    }

    /// Attempt resumption: the halt must have expired and the current
    /// reference must be in force. Manual halts never auto-resume.
    ///
    /// Returns `true` when the band halt cleared.
    pub fn try_resume(&mut self, now_ms: u64) -> bool {
        if self.state.manual_halt || self.state.halted_band.is_none() {
            return false;
        }
        if now_ms >= self.state.halt_until_ms && self.state.reference.is_some() {
            self.state.halted_band = None;
            self.state.halt_until_ms = 0;
            return true;
        }
        false
    }

    /// Operator halt. Stays in force until [`Self::resume_manual`].
    pub fn halt_manual(&mut self) {
        self.state.manual_halt = true;
    }

    /// Clear an operator halt. Returns `true` when the symbol is now
    /// fully unhalted (no band halt remains either).
    pub fn resume_manual(&mut self) -> bool {
        self.state.manual_halt = false;
        !self.state.is_halted()
    }

    fn apply_band_halt(&mut self, band: u8, now_ms: u64) -> Option<Halt> {
        let already = self.state.halted_band;
        // A halt only fires or extends when the band is stricter than the
        // one in force.
        if already.is_some() && Some(band) <= already {
            return None;
        }
        let duration = self.bands.get(band as usize)?.halt_ms;
        let until = now_ms.saturating_add(duration);
        let extended = already.is_some();
        self.state.halted_band = Some(band);
        self.state.halt_until_ms = self.state.halt_until_ms.max(until);
        warn!(
            "circuit band {} breached, halt until {} (extended: {extended})",
            band + 1,
            self.state.halt_until_ms
        );
        Some(Halt {
            reason: HaltReason::Band(band),
            until_ms: self.state.halt_until_ms,
            extended,
        })
    }
}
