//! Error types for the cache layer.

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors that can occur talking to the key-value store.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The store could not be reached, or the connection was closed.
    #[error("cache connection error: {0}")]
    Connection(String),

    /// The store rejected or failed a command.
    #[error("cache backend error: {0}")]
    Backend(String),

    /// A cached value could not be encoded or decoded.
    #[error("cache serialization error: {0}")]
    Serialization(String),

    /// A command did not answer in time.
    #[error("cache operation timed out: {0}")]
    Timeout(String),
}

impl CacheError {
    /// Whether the error indicates a lost connection rather than a bad command.
    #[must_use]
    pub const fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_connection_dropped() || err.is_connection_refusal() || err.is_io_error() {
            Self::Connection(err.to_string())
        } else if err.kind() == redis::ErrorKind::TypeError {
            Self::Serialization(err.to_string())
        } else {
            Self::Backend(err.to_string())
        }
    }
}
