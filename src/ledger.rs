//! Double-entry, append-only ledger.
//!
//! Every state-changing operation is expressed as a batch of two-sided
//! transfers, so each batch balances by construction; the cumulative
//! debit/credit totals are still re-checked after every batch and a
//! mismatch is a fatal invariant violation. House accounts (fee revenue,
//! funding clearing, realized-PnL clearing, insurance) belong to the
//! reserved [`UserId::HOUSE`] and are the only accounts allowed to go
//! negative — the insurance balance in particular is tracked and reported
//! when drawn below zero.

use crate::error::{FatalReason, RejectReason};
use crate::money::Micros;
use crate::orders::UserId;
use crate::trade::TradeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{trace, warn};

/// The kind of account a ledger entry posts to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum AccountKind {
    /// Free cash.
    Cash,
    /// Cash reserved against open positions.
    Margin,
    /// Exchange fee revenue (house).
    Fee,
    /// Funding clearing account (house).
    Funding,
    /// Realized-PnL clearing account (house).
    RealizedPnl,
    /// Insurance fund (house); may go negative.
    Insurance,
}

/// One side of a posting. `debit` and `credit` are mutually exclusive;
/// balances increase with credits and decrease with debits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Monotonic entry sequence, unique within the ledger.
    pub seq: u64,
    /// Account owner.
    pub user: UserId,
    /// Account kind.
    pub account: AccountKind,
    /// Amount debited (removed), micro-units.
    pub debit: Micros,
    /// Amount credited (added), micro-units.
    pub credit: Micros,
    /// The trade that caused this entry, when one did.
    pub ref_trade_id: Option<TradeId>,
}

/// Per-user balance view returned by [`Ledger::snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct BalanceSnapshot {
    /// Free cash, micro-units.
    pub cash: Micros,
    /// Cash reserved as position margin, micro-units.
    pub reserved_margin: Micros,
}

/// A transfer: `amount` moves from one account to another. The building
/// block of every balanced batch.
#[derive(Debug, Clone, Copy)]
pub struct Transfer {
    /// Source account.
    pub from: (UserId, AccountKind),
    /// Destination account.
    pub to: (UserId, AccountKind),
    /// Amount to move; must be non-negative.
    pub amount: Micros,
    /// Trade reference carried onto both entries.
    pub ref_trade_id: Option<TradeId>,
}

/// The double-entry ledger for one shard.
pub struct Ledger {
    /// Account balances. `BTreeMap` keeps iteration deterministic.
    balances: BTreeMap<(UserId, AccountKind), Micros>,
    /// Users with provisioned accounts.
    users: BTreeMap<UserId, ()>,
    /// Next entry sequence number.
    next_seq: u64,
    /// Cumulative debits across all entries ever posted.
    total_debits: i128,
    /// Cumulative credits across all entries ever posted.
    total_credits: i128,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger {
    /// An empty ledger with only the house user provisioned.
    #[must_use]
    pub fn new() -> Self {
        let mut ledger = Self {
            balances: BTreeMap::new(),
            users: BTreeMap::new(),
            next_seq: 0,
            total_debits: 0,
            total_credits: 0,
        };
        ledger.users.insert(UserId::HOUSE, ());
        ledger
    }

    /// Provision an account for `user`. Idempotent.
    pub fn open_account(&mut self, user: UserId) {
        self.users.insert(user, ());
    }

    /// Whether `user` has an account.
    #[must_use]
    pub fn has_account(&self, user: UserId) -> bool {
        self.users.contains_key(&user)
    }

    /// Current balance of one account.
    #[must_use]
    pub fn balance(&self, user: UserId, account: AccountKind) -> Micros {
        self.balances
            .get(&(user, account))
            .copied()
            .unwrap_or(Micros::ZERO)
    }

    /// Insurance fund balance; negative once drawn past its funding.
    #[must_use]
    pub fn insurance_balance(&self) -> Micros {
        self.balance(UserId::HOUSE, AccountKind::Insurance)
    }

    /// Cash and reserved margin for `user`.
    #[must_use]
    pub fn snapshot(&self, user: UserId) -> BalanceSnapshot {
        BalanceSnapshot {
            cash: self.balance(user, AccountKind::Cash),
            reserved_margin: self.balance(user, AccountKind::Margin),
        }
    }

    /// Sequence number the next entry will get.
    #[must_use]
    pub fn next_entry_seq(&self) -> u64 {
        self.next_seq
    }

    /// Credit a deposit into `user`'s cash, settled against house cash.
    ///
    /// # Errors
    ///
    /// `UnknownUser` when no account exists; fatal on overflow.
    pub fn deposit(
        &mut self,
        user: UserId,
        amount: Micros,
    ) -> Result<Vec<LedgerEntry>, RejectReason> {
        if !self.has_account(user) {
            return Err(RejectReason::UnknownUser { user_id: user });
        }
        if amount.is_negative() {
            return Err(RejectReason::AmountOverflow { amount });
        }
        // apply_entries is atomic, so an overflow here rejects cleanly
        // without touching any balance.
        self.post_transfers(&[Transfer {
            from: (UserId::HOUSE, AccountKind::Cash),
            to: (user, AccountKind::Cash),
            amount,
            ref_trade_id: None,
        }])
        .map_err(|fatal| {
            warn!("deposit rejected: {fatal}");
            RejectReason::AmountOverflow { amount }
        })
    }

    /// Withdraw from `user`'s cash.
    ///
    /// `withdrawable` is the engine-computed ceiling (free margin after
    /// open positions); the ledger additionally never lets cash go
    /// negative.
    ///
    /// # Errors
    ///
    /// `WithdrawalBlocked` when the amount exceeds the ceiling.
    pub fn withdraw(
        &mut self,
        user: UserId,
        amount: Micros,
        withdrawable: Micros,
    ) -> Result<Vec<LedgerEntry>, RejectReason> {
        if !self.has_account(user) {
            return Err(RejectReason::UnknownUser { user_id: user });
        }
        let cash = self.balance(user, AccountKind::Cash);
        let ceiling = withdrawable.min(cash);
        if amount > ceiling || amount.is_negative() {
            return Err(RejectReason::WithdrawalBlocked {
                requested: amount,
                withdrawable: ceiling.max(Micros::ZERO),
            });
        }
        self.post_transfers(&[Transfer {
            from: (user, AccountKind::Cash),
            to: (UserId::HOUSE, AccountKind::Cash),
            amount,
            ref_trade_id: None,
        }])
        .map_err(|fatal| {
            warn!("withdrawal rejected: {fatal}");
            RejectReason::AmountOverflow { amount }
        })
    }

    /// Post one party's share of a trade: fee, realized PnL, and the
    /// margin reservation delta (positive reserves, negative releases).
    ///
    /// # Errors
    ///
    /// Fatal on imbalance or overflow.
    pub fn post_trade_leg(
        &mut self,
        user: UserId,
        trade_id: TradeId,
        fee: Micros,
        realized_pnl: Micros,
        margin_delta: Micros,
    ) -> Result<Vec<LedgerEntry>, FatalReason> {
        let mut transfers = Vec::with_capacity(3);
        if !fee.is_zero() {
            let (from, to, amount) = if fee.is_positive() {
                ((user, AccountKind::Cash), (UserId::HOUSE, AccountKind::Fee), fee)
            } else {
                // Maker rebate: fee revenue pays the user.
                ((UserId::HOUSE, AccountKind::Fee), (user, AccountKind::Cash), -fee)
            };
            transfers.push(Transfer {
                from,
                to,
                amount,
                ref_trade_id: Some(trade_id),
            });
        }
        if !realized_pnl.is_zero() {
            let (from, to, amount) = if realized_pnl.is_positive() {
                (
                    (UserId::HOUSE, AccountKind::RealizedPnl),
                    (user, AccountKind::Cash),
                    realized_pnl,
                )
            } else {
                (
                    (user, AccountKind::Cash),
                    (UserId::HOUSE, AccountKind::RealizedPnl),
                    -realized_pnl,
                )
            };
            transfers.push(Transfer {
                from,
                to,
                amount,
                ref_trade_id: Some(trade_id),
            });
        }
        if !margin_delta.is_zero() {
            let (from, to, amount) = if margin_delta.is_positive() {
                ((user, AccountKind::Cash), (user, AccountKind::Margin), margin_delta)
            } else {
                ((user, AccountKind::Margin), (user, AccountKind::Cash), -margin_delta)
            };
            transfers.push(Transfer {
                from,
                to,
                amount,
                ref_trade_id: Some(trade_id),
            });
        }
        self.post_transfers(&transfers)
    }

    /// Post a funding cycle: positive charges debit the user into the
    /// funding clearing account, negative charges pay the user out of it.
    ///
    /// # Errors
    ///
    /// Fatal on imbalance or overflow.
    pub fn post_funding(
        &mut self,
        charges: &[(UserId, Micros)],
    ) -> Result<Vec<LedgerEntry>, FatalReason> {
        let transfers: Vec<Transfer> = charges
            .iter()
            .filter(|(_, amount)| !amount.is_zero())
            .map(|&(user, amount)| {
                if amount.is_positive() {
                    Transfer {
                        from: (user, AccountKind::Cash),
                        to: (UserId::HOUSE, AccountKind::Funding),
                        amount,
                        ref_trade_id: None,
                    }
                } else {
                    Transfer {
                        from: (UserId::HOUSE, AccountKind::Funding),
                        to: (user, AccountKind::Cash),
                        amount: -amount,
                        ref_trade_id: None,
                    }
                }
            })
            .collect();
        self.post_transfers(&transfers)
    }

    /// Cover a liquidation shortfall from the insurance fund: the drawn
    /// amount restores the user's cash to zero. The insurance balance may
    /// go negative; that condition is logged and reported.
    ///
    /// # Errors
    ///
    /// Fatal on imbalance or overflow.
    pub fn post_insurance_draw(
        &mut self,
        user: UserId,
        shortfall: Micros,
    ) -> Result<Vec<LedgerEntry>, FatalReason> {
        let entries = self.post_transfers(&[Transfer {
            from: (UserId::HOUSE, AccountKind::Insurance),
            to: (user, AccountKind::Cash),
            amount: shortfall,
            ref_trade_id: None,
        }])?;
        let remaining = self.insurance_balance();
        if remaining.is_negative() {
            warn!("insurance fund drawn below zero: {remaining}");
        }
        Ok(entries)
    }

    /// Seed the insurance fund. Used at engine construction.
    ///
    /// # Errors
    ///
    /// Fatal on overflow.
    pub fn fund_insurance(&mut self, amount: Micros) -> Result<Vec<LedgerEntry>, FatalReason> {
        self.post_transfers(&[Transfer {
            from: (UserId::HOUSE, AccountKind::Cash),
            to: (UserId::HOUSE, AccountKind::Insurance),
            amount,
            ref_trade_id: None,
        }])
    }

    /// Execute a batch of transfers atomically, appending balanced entry
    /// pairs and re-checking the cumulative totals.
    ///
    /// # Errors
    ///
    /// [`FatalReason::LedgerImbalance`] if the totals diverge (cannot
    /// happen through this path, checked anyway) and
    /// [`FatalReason::MoneyOverflow`] if a balance leaves `i64`.
    pub fn post_transfers(
        &mut self,
        transfers: &[Transfer],
    ) -> Result<Vec<LedgerEntry>, FatalReason> {
        let mut entries = Vec::with_capacity(transfers.len() * 2);
        for transfer in transfers {
            debug_assert!(!transfer.amount.is_negative());
            let seq = self.next_seq;
            self.next_seq += 2;
            entries.push(LedgerEntry {
                seq,
                user: transfer.from.0,
                account: transfer.from.1,
                debit: transfer.amount,
                credit: Micros::ZERO,
                ref_trade_id: transfer.ref_trade_id,
            });
            entries.push(LedgerEntry {
                seq: seq + 1,
                user: transfer.to.0,
                account: transfer.to.1,
                debit: Micros::ZERO,
                credit: transfer.amount,
                ref_trade_id: transfer.ref_trade_id,
            });
        }
        self.apply_entries(&entries)?;
        Ok(entries)
    }

    /// Apply entries to the balances and cumulative totals. Also the
    /// replay path: recovery feeds journaled entries straight through
    /// here.
    ///
    /// The batch is atomic: every balance change is staged and validated
    /// before any of them commits, so an overflow or imbalance leaves the
    /// ledger untouched.
    ///
    /// # Errors
    ///
    /// Fatal on overflow or imbalance.
    pub fn apply_entries(&mut self, entries: &[LedgerEntry]) -> Result<(), FatalReason> {
        let mut staged: BTreeMap<(UserId, AccountKind), Micros> = BTreeMap::new();
        let mut batch_debits: i128 = 0;
        let mut batch_credits: i128 = 0;
        for entry in entries {
            let delta = entry
                .credit
                .checked_sub(entry.debit)
                .ok_or_else(|| FatalReason::MoneyOverflow {
                    context: format!("ledger entry {}", entry.seq),
                })?;
            let key = (entry.user, entry.account);
            let current = staged
                .get(&key)
                .copied()
                .unwrap_or_else(|| self.balance(key.0, key.1));
            let next = current
                .checked_add(delta)
                .ok_or_else(|| FatalReason::MoneyOverflow {
                    context: format!("balance {:?}", key),
                })?;
            staged.insert(key, next);
            batch_debits += i128::from(entry.debit.raw());
            batch_credits += i128::from(entry.credit.raw());
        }
        if batch_debits != batch_credits {
            return Err(FatalReason::LedgerImbalance {
                debits: Micros::new(i64::try_from(batch_debits).unwrap_or(i64::MAX)),
                credits: Micros::new(i64::try_from(batch_credits).unwrap_or(i64::MAX)),
            });
        }

        for (key, next) in staged {
            self.balances.insert(key, next);
        }
        for entry in entries {
            self.next_seq = self.next_seq.max(entry.seq + 1);
            self.users.entry(entry.user).or_insert(());
        }
        self.total_debits += batch_debits;
        self.total_credits += batch_credits;
        trace!("posted {} ledger entries", entries.len());
        Ok(())
    }

    /// Check the non-negative-cash rule for `user`. House accounts are
    /// exempt (they settle against the outside world).
    #[must_use]
    pub fn cash_is_sound(&self, user: UserId) -> bool {
        user == UserId::HOUSE || !self.balance(user, AccountKind::Cash).is_negative()
    }

    /// Cumulative (debits, credits) over the ledger's life.
    #[must_use]
    pub fn cumulative_totals(&self) -> (i128, i128) {
        (self.total_debits, self.total_credits)
    }

    /// All balances, for snapshots. Deterministic iteration order.
    pub fn balances(&self) -> impl Iterator<Item = (&(UserId, AccountKind), &Micros)> {
        self.balances.iter()
    }
}
