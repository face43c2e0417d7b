//! Provider rate-limit configuration and admission outcomes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of provider 429 retries before a task fails.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default base delay for provider 429 backoff.
pub const DEFAULT_BASE_BACKOFF_MS: u64 = 1000;

/// Which provider registry a call is made under.
///
/// Scopes never share counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderScope {
    /// End-user tools.
    Web,
    /// Admin studio tools.
    Admin,
}

impl ProviderScope {
    /// The scope segment used in cache keys.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Admin => "admin",
        }
    }
}

impl std::fmt::Display for ProviderScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rate-limit settings stored in a provider's `config.rateLimit`.
///
/// Every gate is optional; an absent field disables that gate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRateLimitConfig {
    /// Max simultaneous in-flight calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<u32>,

    /// Max calls per rolling 60 second window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_per_minute: Option<u32>,

    /// Max calls per UTC calendar day.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_per_day: Option<u32>,

    /// Reschedule instead of failing when the provider answers 429.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_on_429: Option<bool>,

    /// Max 429 reschedules before failing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    /// Base delay for exponential 429 backoff.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_backoff_ms: Option<u64>,
}

impl ProviderRateLimitConfig {
    /// Whether a provider 429 should reschedule the task.
    #[must_use]
    pub fn retries_on_429(&self) -> bool {
        self.retry_on_429.unwrap_or(true)
    }

    /// Max 429 reschedules.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(DEFAULT_MAX_RETRIES)
    }

    /// Base delay for 429 backoff.
    #[must_use]
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms.unwrap_or(DEFAULT_BASE_BACKOFF_MS))
    }
}

/// Which gate denied an admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DenyReason {
    /// The concurrency semaphore is full.
    Concurrency,
    /// The per-minute window is exhausted.
    Rpm,
    /// The per-day window is exhausted.
    Rpd,
}

impl DenyReason {
    /// Stable name for logs and events.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Concurrency => "concurrency",
            Self::Rpm => "rpm",
            Self::Rpd => "rpd",
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of an admission attempt. Never an error for an expected denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Every configured gate admitted the call.
    Allowed,
    /// A gate denied the call; nothing this call incremented remains counted.
    Denied {
        /// The denying gate.
        reason: DenyReason,
        /// Suggested wait before retrying.
        retry_after: Duration,
    },
}

impl AcquireOutcome {
    /// Whether the call was admitted.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}
