//! PostgreSQL storage implementation.
//!
//! Balance conditions live in `WHERE` clauses so the row lock taken by the
//! `UPDATE` is also the check. A zero-row update means the condition failed
//! and the unit of work is rolled back untouched.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{FromRow, Postgres, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use z_metering_core::{
    CreditAccount, CreditTransaction, LedgerEntry, ProviderRateLimitConfig, ProviderScope,
    RateLimitConfig, TaskId, TransactionId, TransactionType, UserId,
};

use crate::error::{Result, StoreError};
use crate::{LedgerStore, Settlement, SettingsStore};

const ACCOUNT_COLUMNS: &str = "user_id, balance, reserved_balance, lifetime_purchased, \
     lifetime_used, lifetime_refunded, created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "id, user_id, type, amount, balance_after, description, \
     reference_type, reference_id, idempotency_key, created_at";

#[derive(FromRow)]
struct AccountRow {
    user_id: Uuid,
    balance: i64,
    reserved_balance: i64,
    lifetime_purchased: i64,
    lifetime_used: i64,
    lifetime_refunded: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<AccountRow> for CreditAccount {
    fn from(row: AccountRow) -> Self {
        Self {
            user_id: UserId::from_uuid(row.user_id),
            balance: row.balance,
            reserved_balance: row.reserved_balance,
            lifetime_purchased: row.lifetime_purchased,
            lifetime_used: row.lifetime_used,
            lifetime_refunded: row.lifetime_refunded,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(FromRow)]
struct TransactionRow {
    id: Uuid,
    user_id: Uuid,
    #[sqlx(rename = "type")]
    transaction_type: String,
    amount: i64,
    balance_after: i64,
    description: Option<String>,
    reference_type: Option<String>,
    reference_id: Option<String>,
    idempotency_key: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for CreditTransaction {
    type Error = StoreError;

    fn try_from(row: TransactionRow) -> Result<Self> {
        let transaction_type = TransactionType::parse(&row.transaction_type).ok_or_else(|| {
            StoreError::Serialization(format!("unknown transaction type: {}", row.transaction_type))
        })?;
        Ok(Self {
            id: TransactionId::from_uuid(row.id),
            user_id: UserId::from_uuid(row.user_id),
            transaction_type,
            amount: row.amount,
            balance_after: row.balance_after,
            description: row.description,
            reference_type: row.reference_type,
            reference_id: row.reference_id,
            idempotency_key: row.idempotency_key,
            created_at: row.created_at,
        })
    }
}

/// PostgreSQL-backed storage implementation.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl std::fmt::Debug for PgStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgStore").field("pool_size", &self.pool.size()).finish()
    }
}

impl PgStore {
    /// Wrap an existing pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a new pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be reached.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        info!(max_connections, "PostgreSQL pool connected");
        Ok(Self { pool })
    }

    /// Apply the bundled migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if a migration fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }

    /// Run `SELECT 1` against the pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the database is unreachable.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Append a transaction inside `tx`.
    ///
    /// A unique violation on the idempotency key is reported as
    /// `StoreError::DuplicateTransaction`; the caller drops `tx`, rolling back.
    async fn insert_transaction(
        tx: &mut Transaction<'_, Postgres>,
        transaction: &CreditTransaction,
    ) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO credit_transactions \
             (id, user_id, type, amount, balance_after, description, reference_type, \
              reference_id, idempotency_key, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(transaction.id.to_uuid())
        .bind(transaction.user_id.as_uuid())
        .bind(transaction.transaction_type.as_str())
        .bind(transaction.amount)
        .bind(transaction.balance_after)
        .bind(&transaction.description)
        .bind(&transaction.reference_type)
        .bind(&transaction.reference_id)
        .bind(&transaction.idempotency_key)
        .bind(transaction.created_at)
        .execute(&mut **tx)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::DuplicateTransaction {
                    idempotency_key: transaction.idempotency_key.clone().unwrap_or_default(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn get_account(&self, user_id: &UserId) -> Result<Option<CreditAccount>> {
        let row = sqlx::query_as::<_, AccountRow>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM credits WHERE user_id = $1"
        ))
        .bind(user_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(CreditAccount::from))
    }

    async fn reserve(
        &self,
        user_id: &UserId,
        entry: LedgerEntry,
    ) -> Result<Option<(CreditAccount, CreditTransaction)>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, AccountRow>(&format!(
            "UPDATE credits \
             SET reserved_balance = reserved_balance + $2, updated_at = now() \
             WHERE user_id = $1 AND balance - reserved_balance >= $2 \
             RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(user_id.as_uuid())
        .bind(entry.amount)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            debug!(user_id = %user_id, amount = entry.amount, "Reservation condition failed");
            return Ok(None);
        };

        let account = CreditAccount::from(row);
        let transaction = entry.into_transaction(&account);
        Self::insert_transaction(&mut tx, &transaction).await?;
        tx.commit().await?;

        Ok(Some((account, transaction)))
    }

    async fn settle(
        &self,
        user_id: &UserId,
        task_id: &TaskId,
        entry: LedgerEntry,
    ) -> Result<Settlement> {
        let keys: Vec<String> = [
            TransactionType::Reservation,
            TransactionType::Usage,
            TransactionType::Release,
        ]
        .iter()
        .filter_map(|ty| ty.task_key(task_id))
        .collect();

        let mut tx = self.pool.begin().await?;

        // Row lock serializes settlements of the same account, so the key
        // lookup below sees any settlement that committed before us.
        let locked: Option<Uuid> =
            sqlx::query_scalar("SELECT user_id FROM credits WHERE user_id = $1 FOR UPDATE")
                .bind(user_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await?;
        if locked.is_none() {
            return Ok(Settlement::NoReservation);
        }

        let existing: Vec<String> = sqlx::query_scalar(
            "SELECT type FROM credit_transactions WHERE idempotency_key = ANY($1)",
        )
        .bind(&keys)
        .fetch_all(&mut *tx)
        .await?;

        if !existing.iter().any(|ty| ty == TransactionType::Reservation.as_str()) {
            return Ok(Settlement::NoReservation);
        }
        if existing.len() > 1 {
            return Ok(Settlement::AlreadySettled);
        }

        let update = match entry.transaction_type {
            TransactionType::Usage => format!(
                "UPDATE credits \
                 SET balance = balance - $2, reserved_balance = reserved_balance - $2, \
                     lifetime_used = lifetime_used + $2, updated_at = now() \
                 WHERE user_id = $1 AND reserved_balance >= $2 AND balance >= $2 \
                 RETURNING {ACCOUNT_COLUMNS}"
            ),
            TransactionType::Release => format!(
                "UPDATE credits \
                 SET reserved_balance = reserved_balance - $2, updated_at = now() \
                 WHERE user_id = $1 AND reserved_balance >= $2 \
                 RETURNING {ACCOUNT_COLUMNS}"
            ),
            other => {
                return Err(StoreError::Database(format!(
                    "cannot settle a reservation with a {other} entry"
                )))
            }
        };

        let row = sqlx::query_as::<_, AccountRow>(&update)
            .bind(user_id.as_uuid())
            .bind(entry.amount)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(row) = row else {
            return Ok(Settlement::InsufficientHold);
        };

        let account = CreditAccount::from(row);
        let transaction = entry.into_transaction(&account);
        match Self::insert_transaction(&mut tx, &transaction).await {
            Ok(()) => {}
            // A concurrent settlement committed first.
            Err(StoreError::DuplicateTransaction { .. }) => return Ok(Settlement::AlreadySettled),
            Err(e) => return Err(e),
        }
        tx.commit().await?;

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
        let purchased = if entry.transaction_type == TransactionType::Purchase {
            entry.amount
        } else {
            0
        };
        let refunded = if entry.transaction_type == TransactionType::Refund {
            entry.amount
        } else {
            0
        };

        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, AccountRow>(&format!(
            "INSERT INTO credits \
             (user_id, balance, reserved_balance, lifetime_purchased, lifetime_used, lifetime_refunded) \
             VALUES ($1, $2, 0, $3, 0, $4) \
             ON CONFLICT (user_id) DO UPDATE SET \
                 balance = credits.balance + EXCLUDED.balance, \
                 lifetime_purchased = credits.lifetime_purchased + EXCLUDED.lifetime_purchased, \
                 lifetime_refunded = credits.lifetime_refunded + EXCLUDED.lifetime_refunded, \
                 updated_at = now() \
             RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(user_id.as_uuid())
        .bind(entry.amount)
        .bind(purchased)
        .bind(refunded)
        .fetch_one(&mut *tx)
        .await?;

        let account = CreditAccount::from(row);
        let transaction = entry.into_transaction(&account);
        Self::insert_transaction(&mut tx, &transaction).await?;
        tx.commit().await?;

        Ok((account, transaction))
    }

    async fn list_transactions(
        &self,
        user_id: &UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<CreditTransaction>> {
        let rows = sqlx::query_as::<_, TransactionRow>(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM credit_transactions \
             WHERE user_id = $1 ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3"
        ))
        .bind(user_id.as_uuid())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(i64::try_from(offset).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(CreditTransaction::try_from).collect()
    }
}

#[async_trait]
impl SettingsStore for PgStore {
    async fn provider_rate_limit(
        &self,
        scope: ProviderScope,
        provider: &str,
    ) -> Result<Option<ProviderRateLimitConfig>> {
        let sql = match scope {
            ProviderScope::Web => "SELECT config -> 'rateLimit' FROM providers WHERE name = $1",
            ProviderScope::Admin => {
                "SELECT config -> 'rateLimit' FROM admin_providers WHERE name = $1"
            }
        };

        let value: Option<Option<serde_json::Value>> = sqlx::query_scalar(sql)
            .bind(provider)
            .fetch_optional(&self.pool)
            .await?;

        match value.flatten() {
            Some(serde_json::Value::Null) | None => Ok(None),
            Some(json) => Ok(Some(serde_json::from_value(json)?)),
        }
    }

    async fn rate_limit_config(&self) -> Result<Option<RateLimitConfig>> {
        let row: Option<(serde_json::Value, serde_json::Value)> = sqlx::query_as(
            "SELECT tiers, limits FROM rate_limit_settings ORDER BY updated_at DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some((tiers, limits)) = row else {
            return Ok(None);
        };
        Ok(Some(RateLimitConfig {
            tiers: serde_json::from_value(tiers)?,
            limits: serde_json::from_value(limits)?,
        }))
    }

    async fn save_rate_limit_config(&self, config: &RateLimitConfig) -> Result<()> {
        let tiers = serde_json::to_value(&config.tiers)?;
        let limits = serde_json::to_value(&config.limits)?;

        let mut tx = self.pool.begin().await?;
        // Serialize concurrent saves so the table stays single-row.
        sqlx::query("LOCK TABLE rate_limit_settings IN SHARE ROW EXCLUSIVE MODE")
            .execute(&mut *tx)
            .await?;

        let updated = sqlx::query(
            "UPDATE rate_limit_settings SET tiers = $1, limits = $2, updated_at = now()",
        )
        .bind(&tiers)
        .bind(&limits)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            sqlx::query("INSERT INTO rate_limit_settings (tiers, limits) VALUES ($1, $2)")
                .bind(&tiers)
                .bind(&limits)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        info!(tiers = config.tiers.len(), "Rate limit settings saved");
        Ok(())
    }
}
