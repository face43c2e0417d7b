//! Key schema.
//!
//! Every provider key is scoped by `(scope, provider)` so `web` and `admin`
//! callers, and different providers, never share a counter.
//!
//! | Key | Value |
//! |---|---|
//! | `prl:<scope>:<provider>:config` | provider `rateLimit` JSON |
//! | `prl:<scope>:<provider>:sem` | sorted set of job IDs scored by acquire time (ms) |
//! | `prl:<scope>:<provider>:rpm` | per-minute counter |
//! | `prl:<scope>:<provider>:rpd:<YYYY-MM-DD>` | per-day counter (UTC date) |
//! | `user:tier:<userId>` | tier name |
//! | `rate-limit:config` | tier table JSON |
//! | `stream:task:<taskId>` | progress log |
//! | `task:<taskId>` | progress channel |

use chrono::NaiveDate;

use z_metering_core::{ProviderScope, TaskId, UserId};

/// Cached tier table.
pub const RATE_LIMIT_CONFIG: &str = "rate-limit:config";

fn provider(scope: ProviderScope, provider: &str, suffix: &str) -> String {
    format!("prl:{scope}:{provider}:{suffix}")
}

/// Cached provider rate-limit config.
#[must_use]
pub fn provider_config(scope: ProviderScope, name: &str) -> String {
    provider(scope, name, "config")
}

/// Concurrency semaphore.
#[must_use]
pub fn semaphore(scope: ProviderScope, name: &str) -> String {
    provider(scope, name, "sem")
}

/// Per-minute window counter.
#[must_use]
pub fn rpm(scope: ProviderScope, name: &str) -> String {
    provider(scope, name, "rpm")
}

/// Per-day window counter for a UTC date.
#[must_use]
pub fn rpd(scope: ProviderScope, name: &str, date: NaiveDate) -> String {
    provider(scope, name, &format!("rpd:{}", date.format("%Y-%m-%d")))
}

/// Cached tier name of a user.
#[must_use]
pub fn user_tier(user_id: &UserId) -> String {
    format!("user:tier:{user_id}")
}

/// Persistent progress log of a task.
#[must_use]
pub fn progress_stream(task_id: &TaskId) -> String {
    format!("stream:task:{task_id}")
}

/// Broadcast channel of a task.
#[must_use]
pub fn progress_channel(task_id: &TaskId) -> String {
    format!("task:{task_id}")
}
