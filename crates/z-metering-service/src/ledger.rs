//! Credit ledger.
//!
//! Balances only ever change through the store's conditional updates; this
//! layer validates input, names the idempotency keys, and turns store
//! outcomes into result enums. Insufficient credits and rejected settlements
//! are outcomes, not errors.

use std::sync::Arc;

use tracing::{debug, info, warn};

use z_metering_core::{
    ensure_positive, CreditAccount, CreditBalance, CreditTransaction, LedgerEntry, MeteringError,
    TaskId, TransactionType, UserId,
};
use z_metering_store::{LedgerStore, Settlement};

use crate::error::Result;
use crate::tiers::TierResolver;

/// Result of [`CreditLedger::reserve_credits`].
#[derive(Debug, Clone, PartialEq)]
pub enum ReserveOutcome {
    /// Credits are on hold for the task.
    Reserved {
        /// Available balance after the hold.
        balance_after: i64,
        /// The `reservation` transaction.
        transaction: CreditTransaction,
    },
    /// Not enough available credits; nothing was written.
    Insufficient {
        /// Available balance at the time of the attempt.
        available: i64,
        /// Requested amount.
        required: i64,
    },
}

impl ReserveOutcome {
    /// Whether the hold was placed.
    #[must_use]
    pub const fn is_reserved(&self) -> bool {
        matches!(self, Self::Reserved { .. })
    }

    /// User-facing failure message, if the reservation failed.
    #[must_use]
    pub fn error_message(&self) -> Option<String> {
        match self {
            Self::Reserved { .. } => None,
            Self::Insufficient {
                available,
                required,
            } => Some(format!(
                "Insufficient credits. Available: {available}, Required: {required}"
            )),
        }
    }
}

/// Why a confirm or release changed nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleRejection {
    /// No reservation was recorded for the task.
    NoReservation,
    /// The task was already confirmed or released.
    AlreadySettled,
    /// The account holds less in reserve than the amount.
    InsufficientHold,
}

impl std::fmt::Display for SettleRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::NoReservation => "no reservation for task",
            Self::AlreadySettled => "task already settled",
            Self::InsufficientHold => "reserved balance below amount",
        })
    }
}

/// Result of [`CreditLedger::confirm_charge`] and
/// [`CreditLedger::release_credits`].
#[derive(Debug, Clone, PartialEq)]
pub enum SettleOutcome {
    /// The hold was settled.
    Settled {
        /// Total balance after a confirm; available balance after a release.
        balance_after: i64,
        /// The `usage` or `release` transaction.
        transaction: CreditTransaction,
    },
    /// Nothing was written.
    Rejected(SettleRejection),
}

impl SettleOutcome {
    /// Whether the hold was settled.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        matches!(self, Self::Settled { .. })
    }
}

impl From<Settlement> for SettleOutcome {
    fn from(settlement: Settlement) -> Self {
        match settlement {
            Settlement::Applied { transaction, .. } => Self::Settled {
                balance_after: transaction.balance_after,
                transaction,
            },
            Settlement::NoReservation => Self::Rejected(SettleRejection::NoReservation),
            Settlement::AlreadySettled => Self::Rejected(SettleRejection::AlreadySettled),
            Settlement::InsufficientHold => Self::Rejected(SettleRejection::InsufficientHold),
        }
    }
}

/// Parameters for [`CreditLedger::add_credits`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddCredits {
    /// Credits to add.
    pub amount: i64,
    /// `purchase`, `bonus` or `refund`.
    pub transaction_type: TransactionType,
    /// Human-readable description.
    pub description: Option<String>,
    /// What the grant refers to (`payment`, `admin`, ...).
    pub reference_type: Option<String>,
    /// Identifier of the referenced entity.
    pub reference_id: Option<String>,
    /// Caller-chosen key; a replay with the same key is rejected.
    pub idempotency_key: Option<String>,
}

impl AddCredits {
    /// A grant with no description or references.
    #[must_use]
    pub const fn new(amount: i64, transaction_type: TransactionType) -> Self {
        Self {
            amount,
            transaction_type,
            description: None,
            reference_type: None,
            reference_id: None,
            idempotency_key: None,
        }
    }
}

/// Durable per-user credit bookkeeping.
#[derive(Clone)]
pub struct CreditLedger {
    store: Arc<dyn LedgerStore>,
    tiers: TierResolver,
}

impl std::fmt::Debug for CreditLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreditLedger").finish_non_exhaustive()
    }
}

impl CreditLedger {
    /// Create a ledger. `tiers` is invalidated after purchases.
    #[must_use]
    pub fn new(store: Arc<dyn LedgerStore>, tiers: TierResolver) -> Self {
        Self { store, tiers }
    }

    /// The user's balance; zeros if no account exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    pub async fn get_balance(&self, user_id: &UserId) -> Result<CreditBalance> {
        Ok(self
            .store
            .get_account(user_id)
            .await?
            .map(|account| account.snapshot())
            .unwrap_or_default())
    }

    /// The full account row, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    pub async fn get_account(&self, user_id: &UserId) -> Result<Option<CreditAccount>> {
        Ok(self.store.get_account(user_id).await?)
    }

    /// The user's transactions, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable.
    pub async fn list_transactions(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>> {
        Ok(self.store.list_transactions(user_id, limit, offset).await?)
    }

    /// Hold `amount` credits for `task_id` if the user has them available.
    ///
    /// # Errors
    ///
    /// - `MeteringError::InvalidAmount` unless `amount > 0`.
    /// - `StoreError::DuplicateTransaction` if the task was already reserved.
    pub async fn reserve_credits(
        &self,
        user_id: &UserId,
        amount: i64,
        task_id: &TaskId,
        description: Option<String>,
    ) -> Result<ReserveOutcome> {
        ensure_positive(amount)?;
        let entry = LedgerEntry::for_task(
            TransactionType::Reservation,
            amount,
            task_id,
            description.unwrap_or_else(|| format!("Reserved for task {task_id}")),
        );

        if let Some((account, transaction)) = self.store.reserve(user_id, entry).await? {
            debug!(
                user_id = %user_id,
                task_id = %task_id,
                amount,
                available = account.available_balance(),
                "Credits reserved"
            );
            return Ok(ReserveOutcome::Reserved {
                balance_after: account.available_balance(),
                transaction,
            });
        }

        // Read only to report the shortfall; the decision above was atomic.
        let available = self.get_balance(user_id).await?.available_balance;
        info!(
            user_id = %user_id,
            task_id = %task_id,
            required = amount,
            available,
            "Insufficient credits for reservation"
        );
        Ok(ReserveOutcome::Insufficient {
            available,
            required: amount,
        })
    }

    /// Turn the task's hold into a permanent charge.
    ///
    /// # Errors
    ///
    /// - `MeteringError::InvalidAmount` unless `amount > 0`.
    pub async fn confirm_charge(
        &self,
        user_id: &UserId,
        amount: i64,
        task_id: &TaskId,
        description: Option<String>,
    ) -> Result<SettleOutcome> {
        ensure_positive(amount)?;
        let entry = LedgerEntry::for_task(
            TransactionType::Usage,
            amount,
            task_id,
            description.unwrap_or_else(|| format!("Used for task {task_id}")),
        );
        let outcome = SettleOutcome::from(self.store.settle(user_id, task_id, entry).await?);
        log_settlement("confirm", user_id, task_id, amount, &outcome);
        Ok(outcome)
    }

    /// Return the task's hold without charging.
    ///
    /// # Errors
    ///
    /// - `MeteringError::InvalidAmount` unless `amount > 0`.
    pub async fn release_credits(
        &self,
        user_id: &UserId,
        amount: i64,
        task_id: &TaskId,
        reason: impl Into<String>,
    ) -> Result<SettleOutcome> {
        ensure_positive(amount)?;
        let entry =
            LedgerEntry::for_task(TransactionType::Release, amount, task_id, reason.into());
        let outcome = SettleOutcome::from(self.store.settle(user_id, task_id, entry).await?);
        log_settlement("release", user_id, task_id, amount, &outcome);
        Ok(outcome)
    }

    /// Grant credits, creating the account if needed. Returns the new total
    /// balance.
    ///
    /// # Errors
    ///
    /// - `MeteringError::InvalidAmount` unless `amount > 0` and the type is a
    ///   grant.
    /// - `StoreError::DuplicateTransaction` if the idempotency key was used.
    pub async fn add_credits(&self, user_id: &UserId, grant: AddCredits) -> Result<i64> {
        ensure_positive(grant.amount)?;
        if !grant.transaction_type.is_grant() {
            return Err(MeteringError::InvalidAmount(format!(
                "{} is not a credit grant",
                grant.transaction_type
            ))
            .into());
        }

        let is_purchase = grant.transaction_type == TransactionType::Purchase;
        let entry = LedgerEntry {
            transaction_type: grant.transaction_type,
            amount: grant.amount,
            description: grant.description,
            reference_type: grant.reference_type,
            reference_id: grant.reference_id,
            idempotency_key: grant.idempotency_key,
        };
        let (account, _) = self.store.grant(user_id, entry).await?;
        info!(
            user_id = %user_id,
            amount = grant.amount,
            kind = %grant.transaction_type,
            balance = account.balance,
            "Credits added"
        );

        if is_purchase {
            self.tiers.invalidate_user_tier(user_id).await?;
        }
        Ok(account.balance)
    }
}

fn log_settlement(
    action: &'static str,
    user_id: &UserId,
    task_id: &TaskId,
    amount: i64,
    outcome: &SettleOutcome,
) {
    match outcome {
        SettleOutcome::Settled { balance_after, .. } => debug!(
            action,
            user_id = %user_id,
            task_id = %task_id,
            amount,
            balance_after,
            "Reservation settled"
        ),
        SettleOutcome::Rejected(reason) => warn!(
            action,
            user_id = %user_id,
            task_id = %task_id,
            amount,
            reason = %reason,
            "Settlement rejected"
        ),
    }
}
