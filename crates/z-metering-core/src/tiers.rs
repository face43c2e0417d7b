//! User rate-limit tiers.
//!
//! A user's tier is picked from `lifetime_purchased`: the tier with the highest
//! `min_purchased` the user still meets wins. Tier multipliers scale the base
//! request limits.

use serde::{Deserialize, Serialize};

/// Tier assigned when no configured tier matches.
pub const DEFAULT_TIER: &str = "free";

/// One tier of the tier table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitTier {
    /// Tier name (`free`, `basic`, `premium`, ...).
    pub name: String,
    /// Minimum lifetime purchased credits to qualify.
    pub min_purchased: i64,
    /// Factor applied to every base limit.
    pub multiplier: f64,
}

/// A request limit over a fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitLimitEntry {
    /// Requests allowed per window.
    pub max: u32,
    /// Window length in seconds.
    pub window_seconds: u32,
}

impl RateLimitLimitEntry {
    const fn per_minute(max: u32) -> Self {
        Self {
            max,
            window_seconds: 60,
        }
    }
}

/// Base limits for each limited surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitLimits {
    /// Authenticated API calls.
    pub user_api: RateLimitLimitEntry,
    /// Task submissions.
    pub task_creation: RateLimitLimitEntry,
    /// Uploads.
    pub upload: RateLimitLimitEntry,
    /// Session lookups.
    pub auth_session: RateLimitLimitEntry,
    /// Sign-in and similar actions.
    pub auth_action: RateLimitLimitEntry,
    /// All API calls from one client.
    pub global_api: RateLimitLimitEntry,
}

/// Which base limit to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitKind {
    /// `userApi`.
    UserApi,
    /// `taskCreation`.
    TaskCreation,
    /// `upload`.
    Upload,
    /// `authSession`.
    AuthSession,
    /// `authAction`.
    AuthAction,
    /// `globalApi`.
    GlobalApi,
}

impl RateLimitLimits {
    /// The base entry for a limit kind.
    #[must_use]
    pub const fn get(&self, kind: LimitKind) -> RateLimitLimitEntry {
        match kind {
            LimitKind::UserApi => self.user_api,
            LimitKind::TaskCreation => self.task_creation,
            LimitKind::Upload => self.upload,
            LimitKind::AuthSession => self.auth_session,
            LimitKind::AuthAction => self.auth_action,
            LimitKind::GlobalApi => self.global_api,
        }
    }
}

/// The persisted tier table and base limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Tier table, in any order.
    pub tiers: Vec<RateLimitTier>,
    /// Base limits.
    pub limits: RateLimitLimits,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            tiers: vec![
                RateLimitTier {
                    name: "free".into(),
                    min_purchased: 0,
                    multiplier: 1.0,
                },
                RateLimitTier {
                    name: "basic".into(),
                    min_purchased: 1,
                    multiplier: 2.0,
                },
                RateLimitTier {
                    name: "premium".into(),
                    min_purchased: 1000,
                    multiplier: 3.0,
                },
            ],
            limits: RateLimitLimits {
                user_api: RateLimitLimitEntry::per_minute(200),
                task_creation: RateLimitLimitEntry::per_minute(10),
                upload: RateLimitLimitEntry::per_minute(20),
                auth_session: RateLimitLimitEntry::per_minute(60),
                auth_action: RateLimitLimitEntry::per_minute(10),
                global_api: RateLimitLimitEntry::per_minute(500),
            },
        }
    }
}

impl RateLimitConfig {
    /// Resolve the tier name for a lifetime purchase total.
    #[must_use]
    pub fn resolve_tier(&self, lifetime_purchased: i64) -> &str {
        self.tiers
            .iter()
            .filter(|tier| lifetime_purchased >= tier.min_purchased)
            .max_by_key(|tier| tier.min_purchased)
            .map_or(DEFAULT_TIER, |tier| tier.name.as_str())
    }

    /// Multiplier of a tier; `1.0` for unknown tiers.
    #[must_use]
    pub fn multiplier(&self, tier_name: &str) -> f64 {
        self.tiers
            .iter()
            .find(|tier| tier.name == tier_name)
            .map_or(1.0, |tier| tier.multiplier)
    }

    /// The base limit for `kind` scaled by the tier's multiplier.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_lossless
    )]
    pub fn scaled_limit(&self, kind: LimitKind, tier_name: &str) -> RateLimitLimitEntry {
        let base = self.limits.get(kind);
        let scaled = (f64::from(base.max) * self.multiplier(tier_name)).floor();
        RateLimitLimitEntry {
            max: scaled.clamp(0.0, f64::from(u32::MAX)) as u32,
            window_seconds: base.window_seconds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_highest_qualifying_tier() {
        let config = RateLimitConfig::default();
        assert_eq!(config.resolve_tier(0), "free");
        assert_eq!(config.resolve_tier(1), "basic");
        assert_eq!(config.resolve_tier(999), "basic");
        assert_eq!(config.resolve_tier(1000), "premium");
        assert_eq!(config.resolve_tier(50_000), "premium");
    }

    #[test]
    fn tier_order_does_not_matter() {
        let mut config = RateLimitConfig::default();
        config.tiers.reverse();
        assert_eq!(config.resolve_tier(5), "basic");
    }

    #[test]
    fn falls_back_to_default_tier() {
        let config = RateLimitConfig {
            tiers: vec![RateLimitTier {
                name: "vip".into(),
                min_purchased: 100,
                multiplier: 5.0,
            }],
            ..RateLimitConfig::default()
        };
        assert_eq!(config.resolve_tier(10), DEFAULT_TIER);
    }

    #[test]
    fn limits_scale_with_multiplier() {
        let config = RateLimitConfig::default();
        assert_eq!(config.scaled_limit(LimitKind::TaskCreation, "free").max, 10);
        assert_eq!(config.scaled_limit(LimitKind::TaskCreation, "premium").max, 30);
        assert_eq!(config.scaled_limit(LimitKind::UserApi, "unknown").max, 200);
    }

    #[test]
    fn wire_format_is_camel_case() {
        let json = serde_json::to_value(RateLimitConfig::default()).unwrap();
        assert_eq!(json["tiers"][1]["minPurchased"], 1);
        assert_eq!(json["limits"]["taskCreation"]["windowSeconds"], 60);
    }
}
