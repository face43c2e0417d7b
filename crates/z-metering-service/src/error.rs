//! Service error types.

use z_metering_cache::CacheError;
use z_metering_core::MeteringError;
use z_metering_store::StoreError;

/// Result type for service operations.
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Infrastructure and validation failures.
///
/// Expected business outcomes (insufficient credits, admission denial, a
/// rejected settlement) are returned in `Ok(..)`, never as a `ServiceError`.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// Invalid input or domain value.
    #[error(transparent)]
    Domain(#[from] MeteringError),

    /// Relational store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Key-value store failure.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Metric registration or export failed.
    #[error("metrics error: {0}")]
    Metrics(String),
}

impl ServiceError {
    /// Whether the failure is a lost connection or timeout that may clear on
    /// its own.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Cache(err) => err.is_connection(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        Self::Domain(MeteringError::Serialization(err))
    }
}

impl From<prometheus::Error> for ServiceError {
    fn from(err: prometheus::Error) -> Self {
        Self::Metrics(err.to_string())
    }
}
