//! Self-trade prevention policy.
//!
//! Self-trade prevention stops orders from the same user from matching
//! against each other, which would otherwise print wash trades. The policy
//! is configured per symbol in the product catalog and applied by the
//! matching loop whenever the head of the best opposite queue belongs to
//! the incoming order's user.
//!
//! # Policies
//!
//! - [`StpPolicy::CancelTaker`] — cancel the incoming (taker) remainder.
//!   Fills against other users that preceded the conflict are kept.
//! - [`StpPolicy::CancelMaker`] — cancel the conflicting resting order and
//!   keep matching.
//! - [`StpPolicy::CancelBoth`] — cancel the resting order and the incoming
//!   remainder.
//!
//! No policy ever produces a trade between two orders with the same
//! `user_id`.

use serde::{Deserialize, Serialize};

/// Per-symbol self-trade prevention policy.
///
/// The exchange-wide default is [`StpPolicy::CancelTaker`]: the resting
/// order keeps its queue position and the aggressor pays for the conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum StpPolicy {
    /// Cancel the incoming (taker) remainder when a self-trade would occur.
    #[default]
    CancelTaker = 0,

    /// Cancel the conflicting resting (maker) order and continue matching
    /// the taker against the rest of the level.
    CancelMaker = 1,

    /// Cancel both the conflicting resting order and the incoming
    /// remainder. Matching stops immediately.
    CancelBoth = 2,
}

impl StpPolicy {
    /// Whether this policy cancels the incoming order on conflict.
    #[must_use]
    #[inline]
    pub fn cancels_taker(self) -> bool {
        matches!(self, StpPolicy::CancelTaker | StpPolicy::CancelBoth)
    }

    /// Whether this policy cancels the resting order on conflict.
    #[must_use]
    #[inline]
    pub fn cancels_maker(self) -> bool {
        matches!(self, StpPolicy::CancelMaker | StpPolicy::CancelBoth)
    }
}

impl std::fmt::Display for StpPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StpPolicy::CancelTaker => write!(f, "CancelTaker"),
            StpPolicy::CancelMaker => write!(f, "CancelMaker"),
            StpPolicy::CancelBoth => write!(f, "CancelBoth"),
        }
    }
}
