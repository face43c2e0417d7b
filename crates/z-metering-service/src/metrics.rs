//! Prometheus metrics for task attempts and provider admission.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `task_duration_seconds` | Histogram | `provider`, `status` |
//! | `tasks_total` | Counter | `provider`, `status` |
//! | `task_queue_wait_seconds` | Histogram | `queue` |
//! | `provider_api_duration_seconds` | Histogram | `provider` |
//! | `provider_rate_limit_hits_total` | Counter | `provider` |
//! | `provider_errors_total` | Counter | `provider`, `error_type` |
//!
//! Each [`MeteringMetrics`] owns its registry, so several instances can live
//! in one process.

use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

use crate::error::{Result, ServiceError};

/// Label used for tasks that call no provider.
pub const NO_PROVIDER: &str = "none";

const TASK_DURATION_BUCKETS: &[f64] = &[0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0];
const QUEUE_WAIT_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];
const PROVIDER_CALL_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0];

/// Task and provider metrics, registered into one registry.
#[derive(Clone)]
pub struct MeteringMetrics {
    registry: Registry,
    task_duration: HistogramVec,
    tasks_total: IntCounterVec,
    queue_wait: HistogramVec,
    provider_call_duration: HistogramVec,
    rate_limit_hits: IntCounterVec,
    provider_errors: IntCounterVec,
}

impl std::fmt::Debug for MeteringMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeteringMetrics").finish_non_exhaustive()
    }
}

impl MeteringMetrics {
    /// Create the metrics in a fresh registry.
    ///
    /// # Errors
    ///
    /// Returns an error if a metric fails to register.
    pub fn new() -> Result<Self> {
        Self::with_registry(Registry::new())
    }

    /// Create the metrics in `registry`.
    ///
    /// # Errors
    ///
    /// Returns an error if a metric fails to register, e.g. because the
    /// registry already holds one with the same name.
    pub fn with_registry(registry: Registry) -> Result<Self> {
        let task_duration = HistogramVec::new(
            HistogramOpts::new("task_duration_seconds", "Task processing duration in seconds")
                .buckets(TASK_DURATION_BUCKETS.to_vec()),
            &["provider", "status"],
        )?;
        registry.register(Box::new(task_duration.clone()))?;

        let tasks_total = IntCounterVec::new(
            Opts::new("tasks_total", "Total number of tasks processed"),
            &["provider", "status"],
        )?;
        registry.register(Box::new(tasks_total.clone()))?;

        let queue_wait = HistogramVec::new(
            HistogramOpts::new(
                "task_queue_wait_seconds",
                "Time spent waiting in queue before processing",
            )
            .buckets(QUEUE_WAIT_BUCKETS.to_vec()),
            &["queue"],
        )?;
        registry.register(Box::new(queue_wait.clone()))?;

        let provider_call_duration = HistogramVec::new(
            HistogramOpts::new(
                "provider_api_duration_seconds",
                "External provider call duration in seconds",
            )
            .buckets(PROVIDER_CALL_BUCKETS.to_vec()),
            &["provider"],
        )?;
        registry.register(Box::new(provider_call_duration.clone()))?;

        let rate_limit_hits = IntCounterVec::new(
            Opts::new(
                "provider_rate_limit_hits_total",
                "Number of provider rate limit hits",
            ),
            &["provider"],
        )?;
        registry.register(Box::new(rate_limit_hits.clone()))?;

        let provider_errors = IntCounterVec::new(
            Opts::new("provider_errors_total", "Total provider errors"),
            &["provider", "error_type"],
        )?;
        registry.register(Box::new(provider_errors.clone()))?;

        Ok(Self {
            registry,
            task_duration,
            tasks_total,
            queue_wait,
            provider_call_duration,
            rate_limit_hits,
            provider_errors,
        })
    }

    /// The registry, for scraping.
    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every metric in the Prometheus text format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode_text(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| ServiceError::Metrics(e.to_string()))
    }

    /// Record a finished attempt. `status` is `completed` or `failed`.
    pub fn task_finished(&self, provider: &str, status: &str, elapsed: Duration) {
        self.task_duration
            .with_label_values(&[provider, status])
            .observe(elapsed.as_secs_f64());
        self.tasks_total.with_label_values(&[provider, status]).inc();
    }

    /// Record how long a job sat in `queue` before its attempt started.
    pub fn queue_waited(&self, queue: &str, waited: Duration) {
        self.queue_wait
            .with_label_values(&[queue])
            .observe(waited.as_secs_f64());
    }

    /// Record one provider call.
    pub fn provider_called(&self, provider: &str, elapsed: Duration) {
        self.provider_call_duration
            .with_label_values(&[provider])
            .observe(elapsed.as_secs_f64());
    }

    /// Record an admission denial or an upstream 429.
    pub fn rate_limit_hit(&self, provider: &str) {
        self.rate_limit_hits.with_label_values(&[provider]).inc();
    }

    /// Record a failed provider call.
    pub fn provider_error(&self, provider: &str, error_type: &str) {
        self.provider_errors
            .with_label_values(&[provider, error_type])
            .inc();
    }

    /// Attempts counted for `provider` with `status`.
    #[must_use]
    pub fn task_count(&self, provider: &str, status: &str) -> u64 {
        self.tasks_total.with_label_values(&[provider, status]).get()
    }

    /// Rate-limit hits counted for `provider`.
    #[must_use]
    pub fn rate_limit_hit_count(&self, provider: &str) -> u64 {
        self.rate_limit_hits.with_label_values(&[provider]).get()
    }

    /// Provider errors counted for `provider` and `error_type`.
    #[must_use]
    pub fn provider_error_count(&self, provider: &str, error_type: &str) -> u64 {
        self.provider_errors
            .with_label_values(&[provider, error_type])
            .get()
    }

    /// Observations of `queue` wait time.
    #[must_use]
    pub fn queue_wait_count(&self, queue: &str) -> u64 {
        self.queue_wait.with_label_values(&[queue]).get_sample_count()
    }
}
