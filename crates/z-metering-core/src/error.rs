//! Error types for z-metering.

use crate::ids::IdError;

/// Result type for z-metering domain operations.
pub type Result<T> = std::result::Result<T, MeteringError>;

/// Errors raised by domain validation.
#[derive(Debug, thiserror::Error)]
pub enum MeteringError {
    /// Invalid identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),

    /// Invalid amount.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Reject non-positive credit amounts.
///
/// # Errors
///
/// Returns `MeteringError::InvalidAmount` unless `amount > 0`.
pub fn ensure_positive(amount: i64) -> Result<i64> {
    if amount > 0 {
        Ok(amount)
    } else {
        Err(MeteringError::InvalidAmount(format!(
            "amount must be positive, got {amount}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_amounts_pass() {
        assert_eq!(ensure_positive(1).unwrap(), 1);
    }

    #[test]
    fn zero_and_negative_amounts_fail() {
        assert!(matches!(ensure_positive(0), Err(MeteringError::InvalidAmount(_))));
        assert!(matches!(ensure_positive(-10), Err(MeteringError::InvalidAmount(_))));
    }
}
