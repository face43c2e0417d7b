//! Credit account and transaction types for z-metering.
//!
//! An account holds a `balance` and a `reserved_balance`. Reservations hold
//! credits against in-flight tasks without spending them; a confirmed charge
//! removes them from `balance`, a release hands them back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{TaskId, TransactionId, UserId};

/// A user's credit account.
///
/// Created lazily on the first grant and never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditAccount {
    /// The account owner.
    pub user_id: UserId,

    /// Total credits available to the user, including reserved credits.
    pub balance: i64,

    /// Credits currently held against in-flight tasks.
    pub reserved_balance: i64,

    /// Lifetime credits purchased.
    pub lifetime_purchased: i64,

    /// Lifetime credits spent on confirmed charges.
    pub lifetime_used: i64,

    /// Lifetime credits refunded.
    pub lifetime_refunded: i64,

    /// When the account was created.
    pub created_at: DateTime<Utc>,

    /// When the account was last updated.
    pub updated_at: DateTime<Utc>,
}

impl CreditAccount {
    /// Create an empty account.
    #[must_use]
    pub fn new(user_id: UserId) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            balance: 0,
            reserved_balance: 0,
            lifetime_purchased: 0,
            lifetime_used: 0,
            lifetime_refunded: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Credits that can still be reserved.
    #[must_use]
    pub const fn available_balance(&self) -> i64 {
        self.balance - self.reserved_balance
    }

    /// Balance snapshot for this account.
    #[must_use]
    pub const fn snapshot(&self) -> CreditBalance {
        CreditBalance {
            balance: self.balance,
            available_balance: self.available_balance(),
            reserved_balance: self.reserved_balance,
        }
    }
}

/// A point-in-time view of an account's balance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditBalance {
    /// Total balance.
    pub balance: i64,
    /// `balance - reserved_balance`.
    pub available_balance: i64,
    /// Credits on hold.
    pub reserved_balance: i64,
}

/// An immutable ledger record.
///
/// Every balance mutation writes exactly one transaction in the same unit of
/// work; the transaction log is the reconciliation source of truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditTransaction {
    /// Unique transaction ID (ULID for time-ordering).
    pub id: TransactionId,

    /// The user whose account was affected.
    pub user_id: UserId,

    /// Type of transaction.
    pub transaction_type: TransactionType,

    /// Signed amount. Negative for holds and charges, positive otherwise.
    pub amount: i64,

    /// Available balance after reservations and releases, total balance
    /// after everything else.
    pub balance_after: i64,

    /// Human-readable description.
    pub description: Option<String>,

    /// What the transaction refers to (`task`, `payment`, `admin`, ...).
    pub reference_type: Option<String>,

    /// Identifier of the referenced entity.
    pub reference_id: Option<String>,

    /// Deterministic key; unique across the ledger when present.
    pub idempotency_key: Option<String>,

    /// When the transaction was written.
    pub created_at: DateTime<Utc>,
}

/// Type of credit transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    /// Credits placed on hold for a task.
    Reservation,

    /// A hold converted into a permanent charge.
    Usage,

    /// A hold returned without charge.
    Release,

    /// Credits bought by the user.
    Purchase,

    /// Promotional credits.
    Bonus,

    /// Credits refunded to the user.
    Refund,
}

impl TransactionType {
    /// The value stored in the `type` column.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Reservation => "reservation",
            Self::Usage => "usage",
            Self::Release => "release",
            Self::Purchase => "purchase",
            Self::Bonus => "bonus",
            Self::Refund => "refund",
        }
    }

    /// Parse a stored `type` column value.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "reservation" => Some(Self::Reservation),
            "usage" => Some(Self::Usage),
            "release" => Some(Self::Release),
            "purchase" => Some(Self::Purchase),
            "bonus" => Some(Self::Bonus),
            "refund" => Some(Self::Refund),
            _ => None,
        }
    }

    /// Whether this type grants new credits to the account.
    #[must_use]
    pub const fn is_grant(&self) -> bool {
        matches!(self, Self::Purchase | Self::Bonus | Self::Refund)
    }

    /// Sign an amount the way it is recorded in the ledger.
    #[must_use]
    pub const fn signed_amount(&self, amount: i64) -> i64 {
        match self {
            Self::Reservation | Self::Usage => -amount,
            Self::Release | Self::Purchase | Self::Bonus | Self::Refund => amount,
        }
    }

    /// The `balance_after` recorded for this type given the updated account.
    #[must_use]
    pub const fn balance_after(&self, account: &CreditAccount) -> i64 {
        match self {
            Self::Reservation | Self::Release => account.available_balance(),
            Self::Usage | Self::Purchase | Self::Bonus | Self::Refund => account.balance,
        }
    }

    /// Deterministic idempotency key for task-scoped transactions.
    ///
    /// Returns `None` for grants, whose keys are chosen by the caller.
    #[must_use]
    pub fn task_key(&self, task_id: &TaskId) -> Option<String> {
        let prefix = match self {
            Self::Reservation => "reserve",
            Self::Usage => "usage",
            Self::Release => "release",
            Self::Purchase | Self::Bonus | Self::Refund => return None,
        };
        Some(format!("{prefix}-{task_id}"))
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transaction to be written alongside a balance mutation.
///
/// `amount` is the unsigned magnitude; the store signs it and fills in
/// `balance_after` from the row it just updated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    /// Type of transaction.
    pub transaction_type: TransactionType,
    /// Unsigned amount.
    pub amount: i64,
    /// Human-readable description.
    pub description: Option<String>,
    /// Reference type.
    pub reference_type: Option<String>,
    /// Reference ID.
    pub reference_id: Option<String>,
    /// Idempotency key.
    pub idempotency_key: Option<String>,
}

impl LedgerEntry {
    /// Entry for a task-scoped transaction (`reservation`, `usage`, `release`).
    #[must_use]
    pub fn for_task(
        transaction_type: TransactionType,
        amount: i64,
        task_id: &TaskId,
        description: String,
    ) -> Self {
        Self {
            transaction_type,
            amount,
            description: Some(description),
            reference_type: Some("task".to_string()),
            reference_id: Some(task_id.to_string()),
            idempotency_key: transaction_type.task_key(task_id),
        }
    }

    /// Materialize the transaction record once the account row is updated.
    #[must_use]
    pub fn into_transaction(self, account: &CreditAccount) -> CreditTransaction {
        CreditTransaction {
            id: TransactionId::generate(),
            user_id: account.user_id,
            transaction_type: self.transaction_type,
            amount: self.transaction_type.signed_amount(self.amount),
            balance_after: self.transaction_type.balance_after(account),
            description: self.description,
            reference_type: self.reference_type,
            reference_id: self.reference_id,
            idempotency_key: self.idempotency_key,
            created_at: Utc::now(),
        }
    }
}
