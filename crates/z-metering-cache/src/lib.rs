//! Shared key-value connection for z-metering.
//!
//! Every component that coordinates through the key-value store (the provider
//! rate limiter, the progress pipeline, the tier resolver) talks to it through
//! [`CacheBackend`]. The backend is constructed once at startup and passed to
//! each component; there is no process-global connection.
//!
//! # Backends
//!
//! - [`RedisCache`]: one auto-reconnecting `ConnectionManager` plus a dedicated
//!   pub/sub connection per subscription.
//! - [`MemoryCache`]: process-local twin used by tests.
//!
//! Every [`CacheBackend`] method is a single atomic operation on the store.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod keys;
pub mod providers;
pub mod scripts;

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;

pub use error::{CacheError, Result};
pub use providers::{MemoryCache, RedisCache};

/// Connection settings for [`RedisCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Connection URL (`redis://[user:pass@]host:port[/db]`).
    pub url: String,

    /// Attempts for the initial connect and for each reconnect.
    pub connect_retries: u32,

    /// First reconnect delay; doubles per attempt.
    pub backoff_base: Duration,

    /// Upper bound on any reconnect delay.
    pub backoff_max: Duration,

    /// Per-command response timeout.
    pub response_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".into(),
            connect_retries: 6,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_secs(5),
            response_timeout: Duration::from_secs(5),
        }
    }
}

impl CacheConfig {
    /// Delay before reconnect attempt `attempt` (0-based): `base * 2^attempt`,
    /// capped at `backoff_max`.
    #[must_use]
    pub fn connect_backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.backoff_base
            .checked_mul(factor)
            .map_or(self.backoff_max, |delay| delay.min(self.backoff_max))
    }
}

/// Connection lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// A connect attempt started.
    Connecting {
        /// 1-based attempt number.
        attempt: u32,
    },
    /// The connection is up.
    Connected,
    /// A connect attempt failed and another will follow.
    Reconnecting {
        /// The attempt that failed.
        attempt: u32,
        /// Wait before the next attempt.
        delay: Duration,
    },
    /// A command or connect attempt failed.
    Error {
        /// Error description.
        message: String,
    },
    /// The connection was closed by the application.
    Closed,
}

/// Observer of [`CacheEvent`]s, for metrics or alerting.
pub type CacheEventHook = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

/// Payloads received on one broadcast channel.
///
/// Dropping the subscription unsubscribes.
pub struct ChannelSubscription {
    channel: String,
    inner: Pin<Box<dyn Stream<Item = String> + Send>>,
}

impl ChannelSubscription {
    /// Wrap a payload stream.
    pub fn new(
        channel: impl Into<String>,
        inner: impl Stream<Item = String> + Send + 'static,
    ) -> Self {
        Self {
            channel: channel.into(),
            inner: Box::pin(inner),
        }
    }

    /// The subscribed channel.
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }
}

impl std::fmt::Debug for ChannelSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelSubscription")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl Stream for ChannelSubscription {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// Atomic key-value operations used by the metering components.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Get a string value.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set a string value with an expiry.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Delete a key. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Remaining time to live; `None` if the key is missing or never expires.
    async fn pttl(&self, key: &str) -> Result<Option<Duration>>;

    /// Increment a counter, giving it `ttl` if it had no expiry.
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64>;

    /// Decrement a counter.
    async fn decr(&self, key: &str) -> Result<i64>;

    /// Raise a counter to at least `ceiling` and reset its expiry to `ttl`.
    async fn saturate_with_ttl(&self, key: &str, ceiling: i64, ttl: Duration) -> Result<i64>;

    /// Reap members scored before `now_ms - stale_after`, then add `member`
    /// scored `now_ms` if fewer than `limit` remain.
    async fn semaphore_acquire(
        &self,
        key: &str,
        member: &str,
        limit: u32,
        now_ms: i64,
        stale_after: Duration,
    ) -> Result<bool>;

    /// Remove `member`. Returns whether it was present.
    async fn semaphore_release(&self, key: &str, member: &str) -> Result<bool>;

    /// Current number of members.
    async fn semaphore_count(&self, key: &str) -> Result<u64>;

    /// Append a payload to a log capped near `max_len` entries and reset the
    /// log's expiry to `ttl`. Returns the entry ID.
    async fn stream_append(
        &self,
        key: &str,
        payload: &str,
        max_len: usize,
        ttl: Duration,
    ) -> Result<String>;

    /// Every payload in the log, oldest first.
    async fn stream_read(&self, key: &str) -> Result<Vec<String>>;

    /// Broadcast a payload. Returns the number of receivers.
    async fn publish(&self, channel: &str, payload: &str) -> Result<u64>;

    /// Subscribe to a channel. The subscription is live when this returns.
    async fn subscribe(&self, channel: &str) -> Result<ChannelSubscription>;

    /// Round-trip check.
    async fn health_check(&self) -> Result<()>;

    /// Backend name for logs.
    fn provider_name(&self) -> &'static str;
}
