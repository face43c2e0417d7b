//! Relational storage layer for z-metering.
//!
//! This crate owns every mutation of credit balances. Each mutation is one
//! conditional update plus one append-only transaction row, committed as a
//! single unit of work; no code path reads a balance and writes it back.
//!
//! # Backends
//!
//! - [`PgStore`]: PostgreSQL via `sqlx`. Conditions are `WHERE` guards that the
//!   database evaluates atomically with the update.
//! - [`MemoryStore`]: in-process twin with identical semantics, used by tests
//!   and local tooling.
//!
//! # Tables
//!
//! - `credits`: one row per user
//! - `credit_transactions`: the ledger, unique on `idempotency_key`
//! - `providers` / `admin_providers`: provider settings (`config->'rateLimit'`)
//! - `rate_limit_settings`: tier table and base limits

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod memory;
pub mod postgres;

use async_trait::async_trait;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use postgres::PgStore;

use z_metering_core::{
    CreditAccount, CreditTransaction, LedgerEntry, ProviderRateLimitConfig, ProviderScope,
    RateLimitConfig, TaskId, UserId,
};

/// Outcome of settling (confirming or releasing) a reservation.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    /// The hold was settled.
    Applied {
        /// The account after the update.
        account: CreditAccount,
        /// The transaction written with it.
        transaction: CreditTransaction,
    },
    /// No reservation was ever recorded for the task.
    NoReservation,
    /// The task's reservation was already confirmed or released.
    AlreadySettled,
    /// The account does not hold enough reserved credits for the amount.
    InsufficientHold,
}

/// Credit ledger persistence.
///
/// Every mutating method is race-safe on its own: the balance condition is
/// evaluated by the backend atomically with the write.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Get an account by user ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_account(&self, user_id: &UserId) -> Result<Option<CreditAccount>>;

    /// Increase `reserved_balance` by `entry.amount` only if
    /// `balance - reserved_balance >= entry.amount`, and record the entry.
    ///
    /// Returns `None` when the condition fails or the account does not exist;
    /// nothing is written in that case.
    ///
    /// # Errors
    ///
    /// - `StoreError::DuplicateTransaction` if the entry's key already exists.
    async fn reserve(
        &self,
        user_id: &UserId,
        entry: LedgerEntry,
    ) -> Result<Option<(CreditAccount, CreditTransaction)>>;

    /// Confirm (`usage` entry) or release (`release` entry) the reservation of
    /// `task_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn settle(
        &self,
        user_id: &UserId,
        task_id: &TaskId,
        entry: LedgerEntry,
    ) -> Result<Settlement>;

    /// Add credits, creating the account if absent, and record the entry.
    ///
    /// # Errors
    ///
    /// - `StoreError::DuplicateTransaction` if the entry's key already exists.
    async fn grant(
        &self,
        user_id: &UserId,
        entry: LedgerEntry,
    ) -> Result<(CreditAccount, CreditTransaction)>;

    /// List transactions for a user, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_transactions(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>>;
}

/// Persisted provider and tier settings.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// The `rateLimit` section of a provider's configuration, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the stored JSON is malformed.
    async fn provider_rate_limit(
        &self,
        scope: ProviderScope,
        provider: &str,
    ) -> Result<Option<ProviderRateLimitConfig>>;

    /// The persisted tier table, if one has been saved.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or the stored JSON is malformed.
    async fn rate_limit_config(&self) -> Result<Option<RateLimitConfig>>;

    /// Insert or replace the tier table.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn save_rate_limit_config(&self, config: &RateLimitConfig) -> Result<()>;
}
