//! Task lifecycle.
//!
//! A task is admitted by the API layer, which reserves its cost. A worker
//! then runs one attempt with [`TaskRunner::run`]: provider admission, the
//! provider call under a timeout, slot release, and settlement of the
//! reservation. A denied or rate-limited attempt is deferred with the
//! reservation still in place. An attempt cut short by a cache or store
//! failure releases the reservation and publishes `failed` before the error
//! is returned.

use std::future::Future;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use z_metering_core::{
    AcquireOutcome, JobId, ProviderRateLimitConfig, ProviderScope, TaskId, UserId,
};

use crate::error::{Result, ServiceError};
use crate::ledger::{CreditLedger, ReserveOutcome, SettleOutcome};
use crate::limiter::{calculate_backoff, ProviderRateLimiter};
use crate::metrics::{MeteringMetrics, NO_PROVIDER};
use crate::progress::{ProgressPipeline, ProgressTracker};

/// Base delay before retrying after a provider 429.
pub const RATE_LIMITED_RETRY: Duration = Duration::from_secs(2);

/// Upper bound of the random jitter added to deferrals.
pub const MAX_JITTER: Duration = Duration::from_secs(2);

/// Message published when an attempt is aborted by an infrastructure error.
pub const ABORTED_MESSAGE: &str = "Task processing failed";

/// One attempt's worth of task metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskJob {
    /// The task.
    pub task_id: TaskId,
    /// Owner of the reservation.
    pub user_id: UserId,
    /// Credits reserved at admission; zero for free tasks.
    pub cost: i64,
    /// Which provider table the provider belongs to.
    pub scope: ProviderScope,
    /// Provider name, if the task calls one.
    pub provider: Option<String>,
    /// Queue job identifier; the semaphore member.
    pub job_id: JobId,
    /// Provider 429 reschedules so far.
    pub retry_count: u32,
    /// When the job was enqueued, if known.
    pub queued_at: Option<DateTime<Utc>>,
}

impl TaskJob {
    /// A first attempt for `task_id` with `job_id` as its queue identity.
    #[must_use]
    pub const fn new(task_id: TaskId, user_id: UserId, cost: i64, job_id: JobId) -> Self {
        Self {
            task_id,
            user_id,
            cost,
            scope: ProviderScope::Web,
            provider: None,
            job_id,
            retry_count: 0,
            queued_at: None,
        }
    }

    /// Route the attempt through `provider` in `scope`.
    #[must_use]
    pub fn with_provider(mut self, scope: ProviderScope, provider: impl Into<String>) -> Self {
        self.scope = scope;
        self.provider = Some(provider.into());
        self
    }

    /// Record when the job entered the queue.
    #[must_use]
    pub fn with_queued_at(mut self, queued_at: DateTime<Utc>) -> Self {
        self.queued_at = Some(queued_at);
        self
    }

    fn provider_label(&self) -> &str {
        self.provider.as_deref().unwrap_or(NO_PROVIDER)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureKind {
    Execution,
    RateLimited,
    Timeout,
}

/// A failed provider call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ProviderFailure {
    message: String,
    kind: FailureKind,
}

impl ProviderFailure {
    /// A failure, recognised as a rate limit if the message says so.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = if message.contains("429") || message.contains("RESOURCE_EXHAUSTED") {
            FailureKind::RateLimited
        } else {
            FailureKind::Execution
        };
        Self { message, kind }
    }

    /// A failure carrying the provider's HTTP status.
    #[must_use]
    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        let mut failure = Self::new(message);
        if status == 429 {
            failure.kind = FailureKind::RateLimited;
        }
        failure
    }

    /// The provider rejected the call for exceeding its rate limit.
    #[must_use]
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: FailureKind::RateLimited,
        }
    }

    fn timed_out(after: Duration) -> Self {
        Self {
            message: format!("Provider call timed out after {}s", after.as_secs()),
            kind: FailureKind::Timeout,
        }
    }

    /// Whether this is an upstream 429.
    #[must_use]
    pub const fn is_rate_limited(&self) -> bool {
        matches!(self.kind, FailureKind::RateLimited)
    }

    /// Metric label for the failure.
    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self.kind {
            FailureKind::Execution => "execution_failed",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::Timeout => "timeout",
        }
    }

    /// The failure message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

/// How an attempt ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// The work succeeded and the charge was confirmed.
    Completed {
        /// Output of the provider call.
        output: Option<Value>,
    },
    /// The work failed and the reservation was released.
    Failed {
        /// Failure message.
        error: String,
    },
    /// The attempt should be retried later; nothing was settled.
    Deferred {
        /// Suggested delay.
        retry_after: Duration,
        /// Retry count to carry into the next attempt.
        retry_count: u32,
    },
}

/// Runs task attempts against the ledger, limiter and progress pipeline.
#[derive(Debug, Clone)]
pub struct TaskRunner {
    ledger: CreditLedger,
    limiter: ProviderRateLimiter,
    progress: ProgressPipeline,
    metrics: MeteringMetrics,
    call_timeout: Duration,
}

impl TaskRunner {
    /// Create a runner; provider calls longer than `call_timeout` fail.
    #[must_use]
    pub const fn new(
        ledger: CreditLedger,
        limiter: ProviderRateLimiter,
        progress: ProgressPipeline,
        metrics: MeteringMetrics,
        call_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            limiter,
            progress,
            metrics,
            call_timeout,
        }
    }

    /// Reserve a task's cost before it is queued. Free tasks reserve nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is unreachable or the task was already
    /// reserved.
    pub async fn admit(
        &self,
        user_id: &UserId,
        cost: i64,
        task_id: &TaskId,
    ) -> Result<Option<ReserveOutcome>> {
        if cost <= 0 {
            return Ok(None);
        }
        self.ledger
            .reserve_credits(user_id, cost, task_id, None)
            .await
            .map(Some)
    }

    /// Run one attempt of `job`. `work` receives a tracker for the task and
    /// returns the provider output.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache or store is unreachable, after releasing
    /// the reservation and publishing `failed` where still possible. Provider
    /// failures are reported as [`TaskOutcome::Failed`].
    pub async fn run<F, Fut>(&self, job: &TaskJob, work: F) -> Result<TaskOutcome>
    where
        F: FnOnce(ProgressTracker) -> Fut + Send,
        Fut: Future<Output = std::result::Result<Option<Value>, ProviderFailure>> + Send,
    {
        let started = Instant::now();
        if let Some(queued_at) = job.queued_at {
            let waited = (Utc::now() - queued_at).to_std().unwrap_or_default();
            self.metrics.queue_waited(job.scope.as_str(), waited);
        }

        let outcome = match self.attempt(job, work).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.abandon(job, &e).await;
                self.metrics
                    .task_finished(job.provider_label(), "failed", started.elapsed());
                return Err(e);
            }
        };

        let status = match outcome {
            TaskOutcome::Completed { .. } => "completed",
            TaskOutcome::Failed { .. } => "failed",
            TaskOutcome::Deferred { .. } => return Ok(outcome),
        };
        self.metrics
            .task_finished(job.provider_label(), status, started.elapsed());
        Ok(outcome)
    }

    async fn attempt<F, Fut>(&self, job: &TaskJob, work: F) -> Result<TaskOutcome>
    where
        F: FnOnce(ProgressTracker) -> Fut + Send,
        Fut: Future<Output = std::result::Result<Option<Value>, ProviderFailure>> + Send,
    {
        let limits = match job.provider.as_deref() {
            Some(provider) => Some((
                provider,
                self.limiter
                    .get_provider_rate_limit_config(job.scope, provider)
                    .await?,
            )),
            None => None,
        };

        let mut slot = None;
        if let Some((provider, Some(config))) = &limits {
            let outcome = self
                .limiter
                .try_acquire(job.scope, provider, &job.job_id, config)
                .await?;
            if let AcquireOutcome::Denied {
                reason,
                retry_after,
            } = outcome
            {
                info!(
                    task_id = %job.task_id,
                    provider,
                    reason = %reason,
                    "Provider busy, deferring task"
                );
                return Ok(TaskOutcome::Deferred {
                    retry_after: retry_after + jitter(),
                    retry_count: job.retry_count,
                });
            }
            slot = Some(*provider);
        }

        let tracker = self.progress.tracker(job.task_id);
        let call_started = Instant::now();
        let result = tokio::time::timeout(self.call_timeout, work(tracker))
            .await
            .unwrap_or_else(|_| Err(ProviderFailure::timed_out(self.call_timeout)));
        if let Some((provider, _)) = &limits {
            self.metrics.provider_called(provider, call_started.elapsed());
        }

        if let Some(provider) = slot {
            if let Err(e) = self
                .limiter
                .release_slot(job.scope, provider, &job.job_id)
                .await
            {
                warn!(
                    task_id = %job.task_id,
                    provider,
                    error = %e,
                    "Failed to release provider slot"
                );
            }
        }

        match result {
            Ok(output) => self.succeed(job, output).await,
            Err(failure) => {
                if let Some((provider, config)) = &limits {
                    if let Some(deferred) = self
                        .reschedule(job, provider, config.as_ref(), &failure)
                        .await?
                    {
                        return Ok(deferred);
                    }
                    self.metrics.provider_error(provider, failure.error_type());
                }
                self.fail(job, failure).await
            }
        }
    }

    /// Decide whether a provider 429 defers the task. An unconfigured
    /// provider retries with the default policy.
    async fn reschedule(
        &self,
        job: &TaskJob,
        provider: &str,
        configured: Option<&ProviderRateLimitConfig>,
        failure: &ProviderFailure,
    ) -> Result<Option<TaskOutcome>> {
        if !failure.is_rate_limited() {
            return Ok(None);
        }
        self.metrics.rate_limit_hit(provider);

        let config = configured.cloned().unwrap_or_default();
        if !config.retries_on_429() {
            return Ok(None);
        }
        if job.retry_count >= config.max_retries() {
            warn!(
                task_id = %job.task_id,
                provider,
                retries = job.retry_count,
                "Provider 429 retries exhausted"
            );
            return Ok(None);
        }

        let retry_after = match job.scope {
            ProviderScope::Web => {
                self.limiter
                    .mark_provider_busy(job.scope, provider, configured)
                    .await?;
                RATE_LIMITED_RETRY + jitter()
            }
            ProviderScope::Admin => calculate_backoff(job.retry_count, config.base_backoff()),
        };
        info!(
            task_id = %job.task_id,
            provider,
            attempt = job.retry_count + 1,
            max_retries = config.max_retries(),
            "Provider 429, rescheduling"
        );
        Ok(Some(TaskOutcome::Deferred {
            retry_after,
            retry_count: job.retry_count + 1,
        }))
    }

    async fn succeed(&self, job: &TaskJob, output: Option<Value>) -> Result<TaskOutcome> {
        if job.cost > 0 {
            let outcome = self
                .ledger
                .confirm_charge(&job.user_id, job.cost, &job.task_id, None)
                .await?;
            if let SettleOutcome::Rejected(reason) = outcome {
                warn!(task_id = %job.task_id, reason = %reason, "Charge not confirmed");
            }
        }
        self.progress.completed(&job.task_id, output.clone()).await?;
        debug!(task_id = %job.task_id, "Task completed");
        Ok(TaskOutcome::Completed { output })
    }

    async fn fail(&self, job: &TaskJob, failure: ProviderFailure) -> Result<TaskOutcome> {
        warn!(task_id = %job.task_id, error = %failure, "Task failed");
        if job.cost > 0 {
            let outcome = self
                .ledger
                .release_credits(&job.user_id, job.cost, &job.task_id, "Task failed")
                .await?;
            if let SettleOutcome::Rejected(reason) = outcome {
                warn!(task_id = %job.task_id, reason = %reason, "Reservation not released");
            }
        }
        self.progress.failed(&job.task_id, failure.message()).await?;
        Ok(TaskOutcome::Failed {
            error: failure.message,
        })
    }

    /// Best-effort cleanup after an infrastructure error.
    async fn abandon(&self, job: &TaskJob, cause: &ServiceError) {
        error!(task_id = %job.task_id, error = %cause, "Task attempt aborted");
        if job.cost > 0 {
            match self
                .ledger
                .release_credits(&job.user_id, job.cost, &job.task_id, "Task aborted")
                .await
            {
                Ok(SettleOutcome::Rejected(reason)) => {
                    debug!(task_id = %job.task_id, reason = %reason, "Reservation already settled");
                }
                Ok(SettleOutcome::Settled { .. }) => {}
                Err(e) => {
                    warn!(task_id = %job.task_id, error = %e, "Failed to release reservation");
                }
            }
        }
        if let Err(e) = self.progress.failed(&job.task_id, ABORTED_MESSAGE).await {
            warn!(task_id = %job.task_id, error = %e, "Failed to publish task failure");
        }
    }
}

fn jitter() -> Duration {
    let max = u64::try_from(MAX_JITTER.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(rand::rng().random_range(0..max))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_detects_rate_limits() {
        assert!(ProviderFailure::new("HTTP 429 Too Many Requests").is_rate_limited());
        assert!(ProviderFailure::new("RESOURCE_EXHAUSTED: quota").is_rate_limited());
        assert!(ProviderFailure::with_status(429, "slow down").is_rate_limited());
        assert!(ProviderFailure::rate_limited("busy").is_rate_limited());
        assert!(!ProviderFailure::with_status(500, "boom").is_rate_limited());
    }

    #[test]
    fn timeouts_are_not_rate_limits() {
        let failure = ProviderFailure::timed_out(Duration::from_secs(429));
        assert!(!failure.is_rate_limited());
        assert_eq!(failure.error_type(), "timeout");
        assert_eq!(ProviderFailure::new("boom").error_type(), "execution_failed");
    }

    #[test]
    fn jitter_is_bounded() {
        for _ in 0..100 {
            assert!(jitter() < MAX_JITTER);
        }
    }
}
