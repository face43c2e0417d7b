//! Rate-limit tier resolution.
//!
//! Thin cache-aside over the persisted tier table and each user's lifetime
//! purchases. Both are cached for five minutes; a purchase invalidates the
//! user's entry so new limits apply at once.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use z_metering_cache::{keys, CacheBackend};
use z_metering_core::{LimitKind, RateLimitConfig, RateLimitLimitEntry, UserId};
use z_metering_store::{LedgerStore, SettingsStore};

use crate::error::Result;

/// Cache lifetimes for the resolver.
#[derive(Debug, Clone, Copy)]
pub struct TierSettings {
    /// TTL of the cached tier table.
    pub config_ttl: Duration,
    /// TTL of each cached user tier.
    pub user_tier_ttl: Duration,
}

impl Default for TierSettings {
    fn default() -> Self {
        Self {
            config_ttl: Duration::from_secs(300),
            user_tier_ttl: Duration::from_secs(300),
        }
    }
}

/// Resolves users to rate-limit tiers.
#[derive(Clone)]
pub struct TierResolver {
    cache: Arc<dyn CacheBackend>,
    ledger: Arc<dyn LedgerStore>,
    settings: Arc<dyn SettingsStore>,
    ttl: TierSettings,
}

impl std::fmt::Debug for TierResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TierResolver")
            .field("cache", &self.cache.provider_name())
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl TierResolver {
    /// Create a resolver with default TTLs.
    #[must_use]
    pub fn new(
        cache: Arc<dyn CacheBackend>,
        ledger: Arc<dyn LedgerStore>,
        settings: Arc<dyn SettingsStore>,
    ) -> Self {
        Self::with_settings(cache, ledger, settings, TierSettings::default())
    }

    /// Create a resolver with explicit TTLs.
    #[must_use]
    pub fn with_settings(
        cache: Arc<dyn CacheBackend>,
        ledger: Arc<dyn LedgerStore>,
        settings: Arc<dyn SettingsStore>,
        ttl: TierSettings,
    ) -> Self {
        Self {
            cache,
            ledger,
            settings,
            ttl,
        }
    }

    /// The tier table: cache, then the store, then the built-in default.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache or store is unreachable.
    pub async fn get_rate_limit_config(&self) -> Result<RateLimitConfig> {
        if let Some(cached) = self.cache.get(keys::RATE_LIMIT_CONFIG).await? {
            match serde_json::from_str(&cached) {
                Ok(config) => return Ok(config),
                Err(e) => warn!(error = %e, "Discarding malformed cached rate limit config"),
            }
        }

        let config = match self.settings.rate_limit_config().await? {
            Some(config) => config,
            None => {
                debug!("No persisted rate limit config; using defaults");
                RateLimitConfig::default()
            }
        };

        self.cache
            .set_ex(
                keys::RATE_LIMIT_CONFIG,
                &serde_json::to_string(&config)?,
                self.ttl.config_ttl,
            )
            .await?;
        Ok(config)
    }

    /// Persist a new tier table and drop the cached copy.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache or store is unreachable.
    pub async fn update_rate_limit_config(
        &self,
        config: RateLimitConfig,
    ) -> Result<RateLimitConfig> {
        self.settings.save_rate_limit_config(&config).await?;
        self.cache.delete(keys::RATE_LIMIT_CONFIG).await?;
        info!(tiers = config.tiers.len(), "Rate limit config updated");
        Ok(config)
    }

    /// The user's tier name.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache or store is unreachable.
    pub async fn get_user_tier(&self, user_id: &UserId) -> Result<String> {
        let key = keys::user_tier(user_id);
        if let Some(tier) = self.cache.get(&key).await? {
            return Ok(tier);
        }

        let lifetime_purchased = self
            .ledger
            .get_account(user_id)
            .await?
            .map_or(0, |account| account.lifetime_purchased);
        let config = self.get_rate_limit_config().await?;
        let tier = config.resolve_tier(lifetime_purchased).to_string();

        self.cache.set_ex(&key, &tier, self.ttl.user_tier_ttl).await?;
        debug!(user_id = %user_id, tier = %tier, "Resolved user tier");
        Ok(tier)
    }

    /// Drop the user's cached tier.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache is unreachable.
    pub async fn invalidate_user_tier(&self, user_id: &UserId) -> Result<()> {
        self.cache.delete(&keys::user_tier(user_id)).await?;
        Ok(())
    }

    /// The base limit for `kind` scaled by the user's tier.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache or store is unreachable.
    pub async fn effective_limit(
        &self,
        user_id: &UserId,
        kind: LimitKind,
    ) -> Result<RateLimitLimitEntry> {
        let tier = self.get_user_tier(user_id).await?;
        let config = self.get_rate_limit_config().await?;
        Ok(config.scaled_limit(kind, &tier))
    }
}
