//! Provider rate limiter integration tests.

mod common;

use std::time::Duration;

use common::TestHarness;
use futures::future::join_all;

use z_metering_cache::{keys, CacheBackend};
use z_metering_core::{AcquireOutcome, DenyReason, JobId, ProviderRateLimitConfig, ProviderScope};

const WEB: ProviderScope = ProviderScope::Web;

fn job(name: &str) -> JobId {
    JobId::new(name).unwrap()
}

fn limits(concurrency: Option<u32>, rpm: Option<u32>, rpd: Option<u32>) -> ProviderRateLimitConfig {
    ProviderRateLimitConfig {
        max_concurrency: concurrency,
        max_per_minute: rpm,
        max_per_day: rpd,
        ..ProviderRateLimitConfig::default()
    }
}

async fn rpm_count(harness: &TestHarness, provider: &str) -> Option<String> {
    harness.cache.get(&keys::rpm(WEB, provider)).await.unwrap()
}

// ============================================================================
// Gates
// ============================================================================

#[tokio::test]
async fn concurrency_denial_leaves_counters_untouched() {
    let harness = TestHarness::new();
    let limiter = &harness.metering.limiter;
    let config = limits(Some(1), Some(1), None);

    let first = limiter
        .try_acquire(WEB, "openai", &job("a"), &config)
        .await
        .unwrap();
    assert!(first.is_allowed());

    let second = limiter
        .try_acquire(WEB, "openai", &job("b"), &config)
        .await
        .unwrap();
    assert_eq!(
        second,
        AcquireOutcome::Denied {
            reason: DenyReason::Concurrency,
            retry_after: Duration::from_secs(2),
        }
    );
    assert_eq!(rpm_count(&harness, "openai").await.as_deref(), Some("1"));
    assert_eq!(limiter.in_flight(WEB, "openai").await.unwrap(), 1);
}

#[tokio::test]
async fn rpm_denial_releases_the_slot() {
    let harness = TestHarness::new();
    let limiter = &harness.metering.limiter;
    let config = limits(Some(5), Some(1), None);

    assert!(limiter
        .try_acquire(WEB, "fal", &job("a"), &config)
        .await
        .unwrap()
        .is_allowed());

    let denied = limiter
        .try_acquire(WEB, "fal", &job("b"), &config)
        .await
        .unwrap();
    match denied {
        AcquireOutcome::Denied {
            reason,
            retry_after,
        } => {
            assert_eq!(reason, DenyReason::Rpm);
            assert!(retry_after >= Duration::from_secs(1));
            assert!(retry_after <= Duration::from_secs(60));
        }
        AcquireOutcome::Allowed => panic!("second call within the minute was admitted"),
    }

    assert_eq!(limiter.in_flight(WEB, "fal").await.unwrap(), 1);
    assert_eq!(rpm_count(&harness, "fal").await.as_deref(), Some("1"));
}

#[tokio::test]
async fn rpd_denial_rolls_back_earlier_gates() {
    let harness = TestHarness::new();
    let limiter = &harness.metering.limiter;
    let config = limits(Some(5), Some(10), Some(1));

    assert!(limiter
        .try_acquire(WEB, "replicate", &job("a"), &config)
        .await
        .unwrap()
        .is_allowed());

    let denied = limiter
        .try_acquire(WEB, "replicate", &job("b"), &config)
        .await
        .unwrap();
    assert_eq!(
        denied,
        AcquireOutcome::Denied {
            reason: DenyReason::Rpd,
            retry_after: Duration::from_secs(60),
        }
    );

    assert_eq!(limiter.in_flight(WEB, "replicate").await.unwrap(), 1);
    assert_eq!(rpm_count(&harness, "replicate").await.as_deref(), Some("1"));
}

#[tokio::test]
async fn concurrent_callers_pass_one_gate_each() {
    let harness = TestHarness::new();
    let limiter = &harness.metering.limiter;
    let config = limits(Some(5), Some(1), None);

    let jobs: Vec<JobId> = (0..5).map(|i| job(&format!("job-{i}"))).collect();
    let outcomes = join_all(
        jobs.iter()
            .map(|id| limiter.try_acquire(WEB, "openai", id, &config)),
    )
    .await;

    let mut allowed = 0;
    for outcome in outcomes {
        match outcome.unwrap() {
            AcquireOutcome::Allowed => allowed += 1,
            AcquireOutcome::Denied { reason, .. } => assert_eq!(reason, DenyReason::Rpm),
        }
    }
    assert_eq!(allowed, 1);
    assert_eq!(limiter.in_flight(WEB, "openai").await.unwrap(), 1);
    assert_eq!(rpm_count(&harness, "openai").await.as_deref(), Some("1"));
}

#[tokio::test]
async fn in_flight_matches_admissions() {
    let harness = TestHarness::new();
    let limiter = &harness.metering.limiter;
    let config = limits(Some(5), Some(100), None);

    let mut admitted = 0;
    for i in 0..8 {
        let outcome = limiter
            .try_acquire(WEB, "google", &job(&format!("job-{i}")), &config)
            .await
            .unwrap();
        if outcome.is_allowed() {
            admitted += 1;
        }
    }

    assert_eq!(admitted, 5);
    assert_eq!(limiter.in_flight(WEB, "google").await.unwrap(), 5);
    assert_eq!(rpm_count(&harness, "google").await.as_deref(), Some("5"));
}

#[tokio::test]
async fn scopes_do_not_share_counters() {
    let harness = TestHarness::new();
    let limiter = &harness.metering.limiter;
    let config = limits(Some(1), None, None);

    assert!(limiter
        .try_acquire(ProviderScope::Web, "openai", &job("a"), &config)
        .await
        .unwrap()
        .is_allowed());
    assert!(limiter
        .try_acquire(ProviderScope::Admin, "openai", &job("a"), &config)
        .await
        .unwrap()
        .is_allowed());
}

#[tokio::test]
async fn unrestricted_config_always_admits() {
    let harness = TestHarness::new();
    let limiter = &harness.metering.limiter;
    let config = ProviderRateLimitConfig::default();

    for i in 0..20 {
        assert!(limiter
            .try_acquire(WEB, "local", &job(&format!("job-{i}")), &config)
            .await
            .unwrap()
            .is_allowed());
    }
    assert_eq!(limiter.in_flight(WEB, "local").await.unwrap(), 0);
    assert_eq!(rpm_count(&harness, "local").await, None);
}

#[tokio::test(start_paused = true)]
async fn minute_window_expires() {
    let harness = TestHarness::new();
    let limiter = &harness.metering.limiter;
    let config = limits(None, Some(1), None);

    assert!(limiter
        .try_acquire(WEB, "openai", &job("a"), &config)
        .await
        .unwrap()
        .is_allowed());
    assert!(!limiter
        .try_acquire(WEB, "openai", &job("b"), &config)
        .await
        .unwrap()
        .is_allowed());

    tokio::time::advance(Duration::from_secs(61)).await;

    assert!(limiter
        .try_acquire(WEB, "openai", &job("b"), &config)
        .await
        .unwrap()
        .is_allowed());
}

// ============================================================================
// Release / busy
// ============================================================================

#[tokio::test]
async fn release_frees_the_slot_once() {
    let harness = TestHarness::new();
    let limiter = &harness.metering.limiter;
    let config = limits(Some(1), None, None);

    limiter
        .try_acquire(WEB, "openai", &job("a"), &config)
        .await
        .unwrap();
    limiter.release_slot(WEB, "openai", &job("a")).await.unwrap();
    limiter.release_slot(WEB, "openai", &job("a")).await.unwrap();
    limiter
        .release_slot(WEB, "openai", &job("never-held"))
        .await
        .unwrap();

    assert_eq!(limiter.in_flight(WEB, "openai").await.unwrap(), 0);
    assert!(limiter
        .try_acquire(WEB, "openai", &job("b"), &config)
        .await
        .unwrap()
        .is_allowed());
}

#[tokio::test]
async fn busy_provider_denies_until_window_passes() {
    let harness = TestHarness::new();
    let limiter = &harness.metering.limiter;
    let config = limits(None, Some(3), None);

    limiter
        .mark_provider_busy(WEB, "openai", Some(&config))
        .await
        .unwrap();
    assert_eq!(rpm_count(&harness, "openai").await.as_deref(), Some("3"));

    let outcome = limiter
        .try_acquire(WEB, "openai", &job("a"), &config)
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        AcquireOutcome::Denied {
            reason: DenyReason::Rpm,
            ..
        }
    ));
    assert_eq!(rpm_count(&harness, "openai").await.as_deref(), Some("3"));
}

#[tokio::test]
async fn busy_without_config_sets_single_request_window() {
    let harness = TestHarness::new();
    let limiter = &harness.metering.limiter;

    limiter.mark_provider_busy(WEB, "fal", None).await.unwrap();
    assert_eq!(rpm_count(&harness, "fal").await.as_deref(), Some("1"));

    let ttl = harness
        .cache
        .pttl(&keys::rpm(WEB, "fal"))
        .await
        .unwrap()
        .unwrap();
    assert!(ttl <= Duration::from_secs(60));
}

// ============================================================================
// Cache failures
// ============================================================================

#[tokio::test]
async fn cache_error_after_slot_releases_it() {
    let harness = TestHarness::new();
    let limiter = &harness.metering.limiter;
    let config = limits(Some(1), Some(10), None);

    harness.faults.fail("incr_with_ttl", ":rpm");
    let err = limiter
        .try_acquire(WEB, "fal", &job("a"), &config)
        .await
        .unwrap_err();
    assert!(err.is_transient());
    assert_eq!(limiter.in_flight(WEB, "fal").await.unwrap(), 0);

    harness.faults.heal();
    let next = limiter
        .try_acquire(WEB, "fal", &job("b"), &config)
        .await
        .unwrap();
    assert!(next.is_allowed());
}

#[tokio::test]
async fn cache_error_at_day_gate_rolls_back_minute_and_slot() {
    let harness = TestHarness::new();
    let limiter = &harness.metering.limiter;
    let config = limits(Some(2), Some(10), Some(100));

    harness.faults.fail("incr_with_ttl", ":rpd:");
    assert!(limiter
        .try_acquire(WEB, "openai", &job("a"), &config)
        .await
        .is_err());

    assert_eq!(rpm_count(&harness, "openai").await.as_deref(), Some("0"));
    assert_eq!(limiter.in_flight(WEB, "openai").await.unwrap(), 0);
}

#[tokio::test]
async fn denials_are_counted() {
    let harness = TestHarness::new();
    let limiter = &harness.metering.limiter;
    let config = limits(Some(1), None, None);

    limiter
        .try_acquire(WEB, "openai", &job("a"), &config)
        .await
        .unwrap();
    limiter
        .try_acquire(WEB, "openai", &job("b"), &config)
        .await
        .unwrap();

    assert_eq!(harness.metering.metrics.rate_limit_hit_count("openai"), 1);
}

// ============================================================================
// Config lookup
// ============================================================================

#[tokio::test]
async fn config_lookup_is_cached_until_invalidated() {
    let harness = TestHarness::new();
    let limiter = &harness.metering.limiter;

    assert_eq!(
        limiter
            .get_provider_rate_limit_config(WEB, "openai")
            .await
            .unwrap(),
        None
    );

    let first = limits(Some(2), None, None);
    harness.configure_provider("openai", first.clone());
    assert_eq!(
        limiter
            .get_provider_rate_limit_config(WEB, "openai")
            .await
            .unwrap(),
        Some(first.clone())
    );

    harness.configure_provider("openai", limits(Some(8), None, None));
    assert_eq!(
        limiter
            .get_provider_rate_limit_config(WEB, "openai")
            .await
            .unwrap(),
        Some(first)
    );

    limiter.invalidate_config(WEB, "openai").await.unwrap();
    assert_eq!(
        limiter
            .get_provider_rate_limit_config(WEB, "openai")
            .await
            .unwrap()
            .and_then(|config| config.max_concurrency),
        Some(8)
    );
}

#[tokio::test]
async fn admin_scope_reads_its_own_table() {
    let harness = TestHarness::new();
    harness.configure_provider("openai", limits(Some(2), None, None));

    let admin = harness
        .metering
        .limiter
        .get_provider_rate_limit_config(ProviderScope::Admin, "openai")
        .await
        .unwrap();
    assert_eq!(admin, None);
}
