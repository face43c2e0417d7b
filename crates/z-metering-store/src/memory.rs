//! In-memory storage.
//!
//! One mutex guards every table, so each method is a single critical section
//! with the same conditions `PgStore` evaluates in SQL.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use z_metering_core::{
    CreditAccount, CreditTransaction, LedgerEntry, ProviderRateLimitConfig, ProviderScope,
    RateLimitConfig, TaskId, TransactionType, UserId,
};

use crate::error::{Result, StoreError};
use crate::{LedgerStore, Settlement, SettingsStore};

#[derive(Default)]
struct Tables {
    accounts: HashMap<UserId, CreditAccount>,
    transactions: Vec<CreditTransaction>,
    keys: HashSet<String>,
    providers: HashMap<(ProviderScope, String), ProviderRateLimitConfig>,
    rate_limit_config: Option<RateLimitConfig>,
}

impl Tables {
    fn check_key(&self, entry: &LedgerEntry) -> Result<()> {
        match &entry.idempotency_key {
            Some(key) if self.keys.contains(key) => Err(StoreError::DuplicateTransaction {
                idempotency_key: key.clone(),
            }),
            _ => Ok(()),
        }
    }

    fn append(&mut self, transaction: CreditTransaction) {
        if let Some(key) = &transaction.idempotency_key {
            self.keys.insert(key.clone());
        }
        self.transactions.push(transaction);
    }
}

/// Process-local store with the same atomicity as [`crate::PgStore`].
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Database("memory store lock poisoned".into()))
    }

    /// Set a provider's `rateLimit` configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the store lock is poisoned.
    pub fn set_provider_config(
        &self,
        scope: ProviderScope,
        provider: impl Into<String>,
        config: ProviderRateLimitConfig,
    ) -> Result<()> {
        self.tables()?
            .providers
            .insert((scope, provider.into()), config);
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn get_account(&self, user_id: &UserId) -> Result<Option<CreditAccount>> {
        Ok(self.tables()?.accounts.get(user_id).cloned())
    }

    async fn reserve(
        &self,
        user_id: &UserId,
        entry: LedgerEntry,
    ) -> Result<Option<(CreditAccount, CreditTransaction)>> {
        let mut tables = self.tables()?;
        tables.check_key(&entry)?;

        let Some(account) = tables.accounts.get_mut(user_id) else {
            return Ok(None);
        };
        if account.available_balance() < entry.amount {
            return Ok(None);
        }
        account.reserved_balance += entry.amount;
        account.updated_at = Utc::now();

        let account = account.clone();
        let transaction = entry.into_transaction(&account);
        tables.append(transaction.clone());
        Ok(Some((account, transaction)))
    }

    async fn settle(
        &self,
        user_id: &UserId,
        task_id: &TaskId,
        entry: LedgerEntry,
    ) -> Result<Settlement> {
        let mut tables = self.tables()?;

        let has = |ty: TransactionType| {
            ty.task_key(task_id)
                .is_some_and(|key| tables.keys.contains(&key))
        };
        if !has(TransactionType::Reservation) {
            return Ok(Settlement::NoReservation);
        }
        if has(TransactionType::Usage) || has(TransactionType::Release) {
            return Ok(Settlement::AlreadySettled);
        }

        let Some(account) = tables.accounts.get_mut(user_id) else {
            return Ok(Settlement::NoReservation);
        };
        match entry.transaction_type {
            TransactionType::Usage => {
                if account.reserved_balance < entry.amount || account.balance < entry.amount {
                    return Ok(Settlement::InsufficientHold);
                }
                account.balance -= entry.amount;
                account.reserved_balance -= entry.amount;
                account.lifetime_used += entry.amount;
            }
            TransactionType::Release => {
                if account.reserved_balance < entry.amount {
                    return Ok(Settlement::InsufficientHold);
                }
                account.reserved_balance -= entry.amount;
            }
            other => {
                return Err(StoreError::Database(format!(
                    "cannot settle a reservation with a {other} entry"
                )))
            }
        }
        account.updated_at = Utc::now();

        let account = account.clone();
        let transaction = entry.into_transaction(&account);
        tables.append(transaction.clone());
        Ok(Settlement::Applied {
            account,
            transaction,
        })
    }

    async fn grant(
        &self,
        user_id: &UserId,
        entry: LedgerEntry,
    ) -> Result<(CreditAccount, CreditTransaction)> {
        let mut tables = self.tables()?;
        tables.check_key(&entry)?;

        let account = tables
            .accounts
            .entry(*user_id)
            .or_insert_with(|| CreditAccount::new(*user_id));
        account.balance += entry.amount;
        match entry.transaction_type {
            TransactionType::Purchase => account.lifetime_purchased += entry.amount,
            TransactionType::Refund => account.lifetime_refunded += entry.amount,
            _ => {}
        }
        account.updated_at = Utc::now();

        let account = account.clone();
        let transaction = entry.into_transaction(&account);
        tables.append(transaction.clone());
        Ok((account, transaction))
    }

    async fn list_transactions(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>> {
        let tables = self.tables()?;
        Ok(tables
            .transactions
            .iter()
            .rev()
            .filter(|tx| tx.user_id == *user_id)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn provider_rate_limit(
        &self,
        scope: ProviderScope,
        provider: &str,
    ) -> Result<Option<ProviderRateLimitConfig>> {
        Ok(self
            .tables()?
            .providers
            .get(&(scope, provider.to_string()))
            .cloned())
    }

    async fn rate_limit_config(&self) -> Result<Option<RateLimitConfig>> {
        Ok(self.tables()?.rate_limit_config.clone())
    }

    async fn save_rate_limit_config(&self, config: &RateLimitConfig) -> Result<()> {
        self.tables()?.rate_limit_config = Some(config.clone());
        Ok(())
    }
}
