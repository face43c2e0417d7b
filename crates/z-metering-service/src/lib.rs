//! Z-Metering service components.
//!
//! This crate composes the metering core of a multi-tenant AI task runner:
//!
//! - [`CreditLedger`]: reserve, confirm, release and grant credits
//! - [`ProviderRateLimiter`]: cross-process concurrency, per-minute and
//!   per-day admission for upstream providers
//! - [`ProgressPipeline`]: per-task progress with replay for late subscribers
//! - [`TierResolver`]: purchase-based rate-limit tiers
//! - [`TaskRunner`]: one task attempt from provider admission to settlement
//! - [`MeteringMetrics`]: Prometheus series for task attempts and providers
//!
//! Every component takes its backends by constructor; [`Metering`] wires them
//! to one cache connection and one database pool for the life of the process.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod ledger;
pub mod lifecycle;
pub mod limiter;
pub mod metrics;
pub mod progress;
pub mod state;
pub mod tiers;

pub use config::MeteringConfig;
pub use error::{Result, ServiceError};
pub use ledger::{AddCredits, CreditLedger, ReserveOutcome, SettleOutcome, SettleRejection};
pub use lifecycle::{ProviderFailure, TaskJob, TaskOutcome, TaskRunner};
pub use limiter::{calculate_backoff, LimiterSettings, ProviderRateLimiter};
pub use metrics::MeteringMetrics;
pub use progress::{ProgressPipeline, ProgressSettings, ProgressSubscription, ProgressTracker};
pub use state::Metering;
pub use tiers::{TierResolver, TierSettings};
