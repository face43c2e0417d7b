//! Application state.

use std::sync::Arc;

use z_metering_cache::{CacheBackend, RedisCache};
use z_metering_store::{LedgerStore, PgStore, SettingsStore};

use crate::config::MeteringConfig;
use crate::error::Result;
use crate::ledger::CreditLedger;
use crate::lifecycle::TaskRunner;
use crate::limiter::ProviderRateLimiter;
use crate::metrics::MeteringMetrics;
use crate::progress::ProgressPipeline;
use crate::tiers::TierResolver;

/// The metering components, wired to one cache connection and one store.
#[derive(Clone)]
pub struct Metering {
    /// Credit ledger.
    pub ledger: CreditLedger,

    /// Provider admission control.
    pub limiter: ProviderRateLimiter,

    /// Task progress publishing and replay.
    pub progress: ProgressPipeline,

    /// Rate-limit tier lookup.
    pub tiers: TierResolver,

    /// Task attempt runner.
    pub runner: TaskRunner,

    /// Task and provider metrics.
    pub metrics: MeteringMetrics,

    /// The shared cache connection.
    pub cache: Arc<dyn CacheBackend>,

    /// Service configuration.
    pub config: MeteringConfig,

    redis: Option<RedisCache>,
    postgres: Option<PgStore>,
}

impl std::fmt::Debug for Metering {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metering")
            .field("cache", &self.cache.provider_name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Metering {
    /// Open the database pool and the cache connection, then build the
    /// components around them.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, either backend
    /// cannot be reached, or migrations fail.
    pub async fn connect(config: MeteringConfig) -> Result<Self> {
        config.validate()?;
        tracing::info!(
            max_connections = config.database_max_connections,
            "Connecting to PostgreSQL"
        );
        let postgres = PgStore::connect(&config.database_url, config.database_max_connections).await?;
        if config.run_migrations {
            tracing::info!("Running database migrations");
            postgres.migrate().await?;
        }

        let redis = RedisCache::connect(&config.cache).await?;

        let store = Arc::new(postgres.clone());
        let mut metering =
            Self::from_parts(Arc::new(redis.clone()), store.clone(), store, config)?;
        metering.redis = Some(redis);
        metering.postgres = Some(postgres);
        Ok(metering)
    }

    /// Build the components over explicit backends, with a fresh metrics
    /// registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the metrics cannot be registered.
    pub fn from_parts(
        cache: Arc<dyn CacheBackend>,
        ledger_store: Arc<dyn LedgerStore>,
        settings_store: Arc<dyn SettingsStore>,
        config: MeteringConfig,
    ) -> Result<Self> {
        let metrics = MeteringMetrics::new()?;
        let tiers = TierResolver::new(cache.clone(), ledger_store.clone(), settings_store.clone());
        let ledger = CreditLedger::new(ledger_store, tiers.clone());
        let limiter =
            ProviderRateLimiter::new(cache.clone(), settings_store).with_metrics(metrics.clone());
        let progress = ProgressPipeline::new(cache.clone());
        let runner = TaskRunner::new(
            ledger.clone(),
            limiter.clone(),
            progress.clone(),
            metrics.clone(),
            config.provider_call_timeout,
        );

        Ok(Self {
            ledger,
            limiter,
            progress,
            tiers,
            runner,
            metrics,
            cache,
            config,
            redis: None,
            postgres: None,
        })
    }

    /// Check both backends.
    ///
    /// # Errors
    ///
    /// Returns the first backend failure.
    pub async fn health_check(&self) -> Result<()> {
        self.cache.health_check().await?;
        if let Some(postgres) = &self.postgres {
            postgres.health_check().await?;
        }
        Ok(())
    }

    /// Close the cache connection and the database pool.
    pub async fn close(&self) {
        if let Some(redis) = &self.redis {
            redis.close();
        }
        if let Some(postgres) = &self.postgres {
            postgres.close().await;
        }
        tracing::info!("Metering backends closed");
    }
}
