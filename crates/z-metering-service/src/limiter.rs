//! Provider rate limiter.
//!
//! Three gates per `(scope, provider)`, checked in order:
//!
//! 1. concurrency: a bounded semaphore set, admitted by an atomic script that
//!    first reaps entries left behind by crashed workers
//! 2. per-minute: a 60 s window counter
//! 3. per-day: a counter keyed by the UTC date, expiring when the day ends
//!
//! A denial, or a cache error partway through, undoes exactly the increments
//! this call made. `try_acquire` never blocks; a denial carries a retry hint.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use z_metering_cache::{keys, CacheBackend};
use z_metering_core::{AcquireOutcome, DenyReason, JobId, ProviderRateLimitConfig, ProviderScope};
use z_metering_store::SettingsStore;

use crate::error::Result;
use crate::metrics::MeteringMetrics;

/// Upper bound of [`calculate_backoff`].
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Tunables of the limiter.
#[derive(Debug, Clone, Copy)]
pub struct LimiterSettings {
    /// TTL of cached provider configs.
    pub config_ttl: Duration,
    /// Age after which a semaphore entry is presumed abandoned.
    pub stale_after: Duration,
    /// Per-minute window length.
    pub minute_window: Duration,
    /// Retry hint for a full semaphore.
    pub concurrency_retry: Duration,
    /// Retry hint for an exhausted day.
    pub day_retry: Duration,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            config_ttl: Duration::from_secs(300),
            stale_after: Duration::from_secs(600),
            minute_window: Duration::from_secs(60),
            concurrency_retry: Duration::from_secs(2),
            day_retry: Duration::from_secs(60),
        }
    }
}

/// Exponential backoff for provider 429 retries: `base * 2^attempt`, capped
/// at [`MAX_BACKOFF`].
#[must_use]
pub fn calculate_backoff(attempt: u32, base: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    base.checked_mul(factor)
        .map_or(MAX_BACKOFF, |delay| delay.min(MAX_BACKOFF))
}

/// Cross-process admission control for upstream providers.
#[derive(Clone)]
pub struct ProviderRateLimiter {
    cache: Arc<dyn CacheBackend>,
    settings: Arc<dyn SettingsStore>,
    tuning: LimiterSettings,
    metrics: Option<MeteringMetrics>,
}

impl std::fmt::Debug for ProviderRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRateLimiter")
            .field("cache", &self.cache.provider_name())
            .field("tuning", &self.tuning)
            .finish_non_exhaustive()
    }
}

impl ProviderRateLimiter {
    /// Create a limiter with default tunables.
    #[must_use]
    pub fn new(cache: Arc<dyn CacheBackend>, settings: Arc<dyn SettingsStore>) -> Self {
        Self::with_settings(cache, settings, LimiterSettings::default())
    }

    /// Create a limiter with explicit tunables.
    #[must_use]
    pub fn with_settings(
        cache: Arc<dyn CacheBackend>,
        settings: Arc<dyn SettingsStore>,
        tuning: LimiterSettings,
    ) -> Self {
        Self {
            cache,
            settings,
            tuning,
            metrics: None,
        }
    }

    /// Count denials in `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: MeteringMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The provider's rate-limit config; `None` means unrestricted.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache or store is unreachable, or the stored
    /// config is malformed.
    pub async fn get_provider_rate_limit_config(
        &self,
        scope: ProviderScope,
        provider: &str,
    ) -> Result<Option<ProviderRateLimitConfig>> {
        let key = keys::provider_config(scope, provider);
        if let Some(cached) = self.cache.get(&key).await? {
            match serde_json::from_str(&cached) {
                Ok(config) => return Ok(Some(config)),
                Err(e) => warn!(
                    scope = %scope,
                    provider,
                    error = %e,
                    "Discarding malformed cached provider config"
                ),
            }
        }

        let config = self.settings.provider_rate_limit(scope, provider).await?;
        if let Some(config) = &config {
            self.cache
                .set_ex(&key, &serde_json::to_string(config)?, self.tuning.config_ttl)
                .await?;
        }
        Ok(config)
    }

    /// Drop the cached config so the next lookup reads the store.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache is unreachable.
    pub async fn invalidate_config(&self, scope: ProviderScope, provider: &str) -> Result<()> {
        self.cache.delete(&keys::provider_config(scope, provider)).await?;
        Ok(())
    }

    /// Try to admit `job_id` through every configured gate.
    ///
    /// # Errors
    ///
    /// Returns an error only if the cache is unreachable; denials are
    /// `Ok(AcquireOutcome::Denied { .. })`. On an error the increments this
    /// call already made are undone as far as the cache allows.
    pub async fn try_acquire(
        &self,
        scope: ProviderScope,
        provider: &str,
        job_id: &JobId,
        config: &ProviderRateLimitConfig,
    ) -> Result<AcquireOutcome> {
        let mut held = Increments::default();
        let result = self
            .pass_gates(scope, provider, job_id, config, &mut held)
            .await;

        match &result {
            Ok(AcquireOutcome::Allowed) => {
                debug!(scope = %scope, provider, job_id = %job_id, "Provider slot acquired");
            }
            Ok(AcquireOutcome::Denied {
                reason,
                retry_after,
            }) => {
                self.undo(scope, provider, job_id, held).await;
                if let Some(metrics) = &self.metrics {
                    metrics.rate_limit_hit(provider);
                }
                debug!(
                    scope = %scope,
                    provider,
                    reason = %reason,
                    retry_after_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX),
                    "Provider admission denied"
                );
            }
            Err(e) => {
                warn!(scope = %scope, provider, job_id = %job_id, error = %e, "Provider admission failed");
                self.undo(scope, provider, job_id, held).await;
            }
        }
        result
    }

    /// Run the gates in order, recording each increment in `held` as soon as
    /// it lands.
    async fn pass_gates(
        &self,
        scope: ProviderScope,
        provider: &str,
        job_id: &JobId,
        config: &ProviderRateLimitConfig,
        held: &mut Increments,
    ) -> Result<AcquireOutcome> {
        if let Some(max) = config.max_concurrency {
            let admitted = self
                .cache
                .semaphore_acquire(
                    &keys::semaphore(scope, provider),
                    job_id.as_str(),
                    max,
                    Utc::now().timestamp_millis(),
                    self.tuning.stale_after,
                )
                .await?;
            if !admitted {
                return Ok(denied(DenyReason::Concurrency, self.tuning.concurrency_retry));
            }
            held.slot = true;
        }

        if let Some(max) = config.max_per_minute {
            let rpm_key = keys::rpm(scope, provider);
            let count = self
                .cache
                .incr_with_ttl(&rpm_key, self.tuning.minute_window)
                .await?;
            held.rpm = Some(rpm_key.clone());
            if count > i64::from(max) {
                let retry_after = self
                    .cache
                    .pttl(&rpm_key)
                    .await?
                    .unwrap_or(self.tuning.minute_window)
                    .max(Duration::from_secs(1));
                return Ok(denied(DenyReason::Rpm, retry_after));
            }
        }

        if let Some(max) = config.max_per_day {
            let now = Utc::now();
            let rpd_key = keys::rpd(scope, provider, now.date_naive());
            let count = self
                .cache
                .incr_with_ttl(&rpd_key, rest_of_day(now))
                .await?;
            held.rpd = Some(rpd_key);
            if count > i64::from(max) {
                return Ok(denied(DenyReason::Rpd, self.tuning.day_retry));
            }
        }

        Ok(AcquireOutcome::Allowed)
    }

    /// Take back exactly the increments in `held`. Failures are logged; the
    /// window expiry and the stale reaper bound what is left behind.
    async fn undo(&self, scope: ProviderScope, provider: &str, job_id: &JobId, held: Increments) {
        for key in [held.rpd, held.rpm].into_iter().flatten() {
            if let Err(e) = self.cache.decr(&key).await {
                warn!(key = %key, error = %e, "Failed to roll back window counter");
            }
        }
        if held.slot {
            if let Err(e) = self
                .cache
                .semaphore_release(&keys::semaphore(scope, provider), job_id.as_str())
                .await
            {
                warn!(
                    scope = %scope,
                    provider,
                    job_id = %job_id,
                    error = %e,
                    "Failed to roll back concurrency slot"
                );
            }
        }
    }

    /// Remove `job_id` from the concurrency set. Safe to call repeatedly and
    /// for jobs that never held a slot.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache is unreachable.
    pub async fn release_slot(
        &self,
        scope: ProviderScope,
        provider: &str,
        job_id: &JobId,
    ) -> Result<()> {
        let released = self
            .cache
            .semaphore_release(&keys::semaphore(scope, provider), job_id.as_str())
            .await?;
        if released {
            debug!(scope = %scope, provider, job_id = %job_id, "Provider slot released");
        }
        Ok(())
    }

    /// Record an upstream rate-limit rejection: the per-minute counter is
    /// raised to its ceiling for a fresh window, so the next callers back off
    /// without a round trip to the provider.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache is unreachable.
    pub async fn mark_provider_busy(
        &self,
        scope: ProviderScope,
        provider: &str,
        config: Option<&ProviderRateLimitConfig>,
    ) -> Result<()> {
        let ceiling = config.and_then(|c| c.max_per_minute).unwrap_or(1);
        self.cache
            .saturate_with_ttl(
                &keys::rpm(scope, provider),
                i64::from(ceiling),
                self.tuning.minute_window,
            )
            .await?;
        info!(scope = %scope, provider, ceiling, "Provider marked busy");
        Ok(())
    }

    /// Number of slots currently held.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache is unreachable.
    pub async fn in_flight(&self, scope: ProviderScope, provider: &str) -> Result<u64> {
        Ok(self
            .cache
            .semaphore_count(&keys::semaphore(scope, provider))
            .await?)
    }
}

/// Time left until the next UTC midnight, at least one second.
fn rest_of_day(now: DateTime<Utc>) -> Duration {
    let midnight = now
        .date_naive()
        .succ_opt()
        .and_then(|day| day.and_hms_opt(0, 0, 0))
        .map(|at| at.and_utc());
    midnight
        .and_then(|at| (at - now).to_std().ok())
        .unwrap_or(Duration::from_secs(86_400))
        .max(Duration::from_secs(1))
}

const fn denied(reason: DenyReason, retry_after: Duration) -> AcquireOutcome {
    AcquireOutcome::Denied {
        reason,
        retry_after,
    }
}

/// What one `try_acquire` call has incremented so far.
#[derive(Debug, Default)]
struct Increments {
    slot: bool,
    rpm: Option<String>,
    rpd: Option<String>,
}
