//! Core types for z-metering.
//!
//! This crate provides the domain types shared by the metering components:
//!
//! - **Identifiers**: `UserId`, `TaskId`, `TransactionId`, `JobId`
//! - **Credits**: `CreditAccount`, `CreditBalance`, `CreditTransaction`, `TransactionType`
//! - **Progress**: `ProgressEvent`, `ProgressEventType`
//! - **Provider limits**: `ProviderScope`, `ProviderRateLimitConfig`, `AcquireOutcome`
//! - **Tiers**: `RateLimitConfig`, `RateLimitTier`, `LimitKind`
//!
//! # Credit unit
//!
//! Credits are whole integers stored as `i64`. A task's cost is reserved up
//! front and either confirmed or released when the task settles.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod credits;
pub mod error;
pub mod ids;
pub mod limits;
pub mod progress;
pub mod tiers;

pub use credits::{CreditAccount, CreditBalance, CreditTransaction, LedgerEntry, TransactionType};
pub use error::{ensure_positive, MeteringError, Result};
pub use ids::{IdError, JobId, TaskId, TransactionId, UserId};
pub use limits::{
    AcquireOutcome, DenyReason, ProviderRateLimitConfig, ProviderScope, DEFAULT_BASE_BACKOFF_MS,
    DEFAULT_MAX_RETRIES,
};
pub use progress::{ProgressEvent, ProgressEventType};
pub use tiers::{
    LimitKind, RateLimitConfig, RateLimitLimitEntry, RateLimitLimits, RateLimitTier, DEFAULT_TIER,
};
