//! Service configuration.

use std::str::FromStr;
use std::time::Duration;

use z_metering_cache::CacheConfig;

use crate::error::{Result, ServiceError};

/// Configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct MeteringConfig {
    /// Key-value store connection settings.
    pub cache: CacheConfig,

    /// PostgreSQL URL (default: `postgres://localhost/z_metering`).
    pub database_url: String,

    /// Pool size (default: 10).
    pub database_max_connections: u32,

    /// Apply bundled migrations on startup (default: false).
    pub run_migrations: bool,

    /// Upper bound on a single provider call (default: 600 s).
    pub provider_call_timeout: Duration,
}

impl Default for MeteringConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            database_url: "postgres://localhost/z_metering".into(),
            database_max_connections: 10,
            run_migrations: false,
            provider_call_timeout: Duration::from_secs(600),
        }
    }
}

impl MeteringConfig {
    /// Load configuration from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, falling back to defaults for
    /// missing or unparsable values.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |name: &str| lookup(name).and_then(|v| v.trim().parse::<u64>().ok());
        let millis = |name: &str, default: Duration| {
            parsed(name).map_or(default, Duration::from_millis)
        };

        Self {
            cache: CacheConfig {
                url: lookup("REDIS_URL").unwrap_or(defaults.cache.url),
                connect_retries: parse_or(
                    &lookup,
                    "CACHE_CONNECT_RETRIES",
                    defaults.cache.connect_retries,
                ),
                backoff_base: millis("CACHE_BACKOFF_BASE_MS", defaults.cache.backoff_base),
                backoff_max: millis("CACHE_BACKOFF_MAX_MS", defaults.cache.backoff_max),
                response_timeout: millis(
                    "CACHE_RESPONSE_TIMEOUT_MS",
                    defaults.cache.response_timeout,
                ),
            },
            database_url: lookup("DATABASE_URL").unwrap_or(defaults.database_url),
            database_max_connections: parse_or(
                &lookup,
                "DATABASE_MAX_CONNECTIONS",
                defaults.database_max_connections,
            ),
            run_migrations: lookup("RUN_MIGRATIONS")
                .map_or(defaults.run_migrations, |v| {
                    matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
                }),
            provider_call_timeout: parsed("PROVIDER_CALL_TIMEOUT_SECS")
                .map_or(defaults.provider_call_timeout, Duration::from_secs),
        }
    }
}

impl MeteringConfig {
    /// Reject settings the components cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `ServiceError::Config` naming the offending setting.
    pub fn validate(&self) -> Result<()> {
        if self.database_max_connections == 0 {
            return Err(ServiceError::Config(
                "DATABASE_MAX_CONNECTIONS must be at least 1".into(),
            ));
        }
        if self.provider_call_timeout.is_zero() {
            return Err(ServiceError::Config(
                "PROVIDER_CALL_TIMEOUT_SECS must be at least 1".into(),
            ));
        }
        if self.cache.backoff_base > self.cache.backoff_max {
            return Err(ServiceError::Config(
                "CACHE_BACKOFF_BASE_MS exceeds CACHE_BACKOFF_MAX_MS".into(),
            ));
        }
        Ok(())
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T {
    lookup(name)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> MeteringConfig {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        MeteringConfig::from_lookup(|name| env.get(name).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let config = from_pairs(&[]);
        assert_eq!(config.cache.url, "redis://127.0.0.1:6379");
        assert_eq!(config.cache.connect_retries, 6);
        assert_eq!(config.database_max_connections, 10);
        assert!(!config.run_migrations);
        assert_eq!(config.provider_call_timeout, Duration::from_secs(600));
    }

    #[test]
    fn reads_overrides() {
        let config = from_pairs(&[
            ("REDIS_URL", "redis://cache:6380"),
            ("CACHE_BACKOFF_MAX_MS", "2500"),
            ("DATABASE_MAX_CONNECTIONS", "25"),
            ("RUN_MIGRATIONS", "true"),
            ("PROVIDER_CALL_TIMEOUT_SECS", "30"),
        ]);
        assert_eq!(config.cache.url, "redis://cache:6380");
        assert_eq!(config.cache.backoff_max, Duration::from_millis(2500));
        assert_eq!(config.database_max_connections, 25);
        assert!(config.run_migrations);
        assert_eq!(config.provider_call_timeout, Duration::from_secs(30));
    }

    #[test]
    fn validate_rejects_zero_pool() {
        let config = from_pairs(&[("DATABASE_MAX_CONNECTIONS", "0")]);
        assert!(matches!(config.validate(), Err(ServiceError::Config(_))));
        assert!(from_pairs(&[]).validate().is_ok());
    }

    #[test]
    fn ignores_unparsable_numbers() {
        let config = from_pairs(&[("CACHE_CONNECT_RETRIES", "lots")]);
        assert_eq!(config.cache.connect_retries, 6);
    }
}
