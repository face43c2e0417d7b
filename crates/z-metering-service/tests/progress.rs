//! Progress pipeline integration tests.

mod common;

use std::time::Duration;

use common::TestHarness;
use futures::StreamExt;
use serde_json::json;

use z_metering_cache::{keys, CacheBackend};
use z_metering_core::{ProgressEventType, TaskId};
use z_metering_service::{ProgressPipeline, ProgressSettings};

fn types(events: &[z_metering_core::ProgressEvent]) -> Vec<ProgressEventType> {
    events.iter().map(|event| event.event_type).collect()
}

// ============================================================================
// Replay
// ============================================================================

#[tokio::test]
async fn late_subscriber_sees_history_in_order() {
    let harness = TestHarness::new();
    let progress = &harness.metering.progress;
    let task = TaskId::generate();

    progress
        .step_started(&task, "render", Some("Render".into()))
        .await
        .unwrap();
    progress
        .progress(&task, 40, Some("halfway".into()), Some("render".into()))
        .await
        .unwrap();
    progress
        .step_completed(&task, "render", Some(json!({"frames": 12})))
        .await
        .unwrap();

    let mut subscription = progress.subscribe(&task).await.unwrap();
    let mut seen = Vec::new();
    for _ in 0..3 {
        seen.push(subscription.next().await.unwrap());
    }
    assert_eq!(
        types(&seen),
        vec![
            ProgressEventType::StepStarted,
            ProgressEventType::Progress,
            ProgressEventType::StepCompleted,
        ]
    );
    assert!(seen.iter().all(|event| event.task_id == Some(task)));
    assert_eq!(seen[1].progress, Some(40));

    progress.completed(&task, None).await.unwrap();
    let last = subscription.next().await.unwrap();
    assert_eq!(last.event_type, ProgressEventType::Completed);
    assert!(subscription.next().await.is_none());
}

#[tokio::test]
async fn terminal_history_ends_without_waiting() {
    let harness = TestHarness::new();
    let progress = &harness.metering.progress;
    let task = TaskId::generate();

    progress.step_started(&task, "s1", None).await.unwrap();
    progress.failed(&task, "provider exploded").await.unwrap();

    let events: Vec<_> = progress
        .subscribe(&task)
        .await
        .unwrap()
        .into_stream()
        .collect()
        .await;
    assert_eq!(
        types(&events),
        vec![ProgressEventType::StepStarted, ProgressEventType::Failed]
    );
    assert_eq!(events[1].error.as_deref(), Some("provider exploded"));
}

#[tokio::test]
async fn nothing_follows_a_terminal_event() {
    let harness = TestHarness::new();
    let progress = &harness.metering.progress;
    let task = TaskId::generate();

    let mut subscription = progress.subscribe(&task).await.unwrap();
    progress.completed(&task, Some(json!("done"))).await.unwrap();
    progress.progress(&task, 99, None, None).await.unwrap();

    let event = subscription.next().await.unwrap();
    assert_eq!(event.event_type, ProgressEventType::Completed);
    assert_eq!(event.output, Some(json!("done")));
    assert!(subscription.next().await.is_none());
}

#[tokio::test]
async fn live_duplicates_of_replayed_entries_are_skipped() {
    let harness = TestHarness::new();
    let progress = &harness.metering.progress;
    let task = TaskId::generate();

    progress.step_started(&task, "s1", None).await.unwrap();
    let mut subscription = progress.subscribe(&task).await.unwrap();

    // An event published between the channel subscription and the log read
    // arrives on both paths.
    let logged = harness
        .cache
        .stream_read(&keys::progress_stream(&task))
        .await
        .unwrap();
    harness
        .cache
        .publish(&keys::progress_channel(&task), &logged[0])
        .await
        .unwrap();
    progress.completed(&task, None).await.unwrap();

    let first = subscription.next().await.unwrap();
    let second = subscription.next().await.unwrap();
    assert_eq!(first.event_type, ProgressEventType::StepStarted);
    assert_eq!(second.event_type, ProgressEventType::Completed);
    assert!(subscription.next().await.is_none());
}

#[tokio::test]
async fn malformed_log_entries_are_dropped() {
    let harness = TestHarness::new();
    let progress = &harness.metering.progress;
    let task = TaskId::generate();

    harness
        .cache
        .stream_append(
            &keys::progress_stream(&task),
            "not json",
            1000,
            Duration::from_secs(300),
        )
        .await
        .unwrap();
    progress.completed(&task, None).await.unwrap();

    let events: Vec<_> = progress
        .subscribe(&task)
        .await
        .unwrap()
        .into_stream()
        .collect()
        .await;
    assert_eq!(types(&events), vec![ProgressEventType::Completed]);
}

#[tokio::test]
async fn closed_subscription_yields_nothing() {
    let harness = TestHarness::new();
    let progress = &harness.metering.progress;
    let task = TaskId::generate();

    progress.step_started(&task, "s1", None).await.unwrap();
    let mut subscription = progress.subscribe(&task).await.unwrap();
    subscription.close();
    assert!(subscription.next().await.is_none());
}

// ============================================================================
// Retention
// ============================================================================

#[tokio::test]
async fn log_keeps_newest_entries() {
    let harness = TestHarness::new();
    let progress = ProgressPipeline::with_settings(
        harness.cache.clone(),
        ProgressSettings {
            max_len: 3,
            ttl: Duration::from_secs(300),
        },
    );
    let task = TaskId::generate();

    for pct in [10, 20, 30, 40, 50] {
        progress.progress(&task, pct, None, None).await.unwrap();
    }

    let logged = harness
        .cache
        .stream_read(&keys::progress_stream(&task))
        .await
        .unwrap();
    assert!(logged.len() <= 3);

    progress.completed(&task, None).await.unwrap();
    let events: Vec<_> = progress
        .subscribe(&task)
        .await
        .unwrap()
        .into_stream()
        .collect()
        .await;
    assert_eq!(events.last().map(|e| e.event_type), Some(ProgressEventType::Completed));
    assert_eq!(events[events.len() - 2].progress, Some(50));
}

#[tokio::test(start_paused = true)]
async fn log_expires_after_inactivity() {
    let harness = TestHarness::new();
    let progress = &harness.metering.progress;
    let task = TaskId::generate();

    progress.completed(&task, None).await.unwrap();
    tokio::time::advance(Duration::from_secs(301)).await;

    let logged = harness
        .cache
        .stream_read(&keys::progress_stream(&task))
        .await
        .unwrap();
    assert!(logged.is_empty());
}

// ============================================================================
// Tracker
// ============================================================================

#[tokio::test]
async fn tracker_attributes_progress_to_current_step() {
    let harness = TestHarness::new();
    let task = TaskId::generate();
    let mut tracker = harness.metering.progress.tracker(task);

    tracker.complete_step(None).await.unwrap();
    tracker
        .start_step("upscale", Some("Upscale".into()))
        .await
        .unwrap();
    assert_eq!(tracker.current_step(), Some("upscale"));
    tracker
        .update_progress(75, Some("almost".into()))
        .await
        .unwrap();
    tracker
        .complete_step(Some(json!({"width": 2048})))
        .await
        .unwrap();
    tracker.complete(None).await.unwrap();

    let events: Vec<_> = harness
        .metering
        .progress
        .subscribe(&task)
        .await
        .unwrap()
        .into_stream()
        .collect()
        .await;
    assert_eq!(
        types(&events),
        vec![
            ProgressEventType::StepStarted,
            ProgressEventType::Progress,
            ProgressEventType::StepCompleted,
            ProgressEventType::Completed,
        ]
    );
    assert_eq!(events[0].step_name.as_deref(), Some("Upscale"));
    assert_eq!(events[1].step_id.as_deref(), Some("upscale"));
    assert_eq!(events[1].message.as_deref(), Some("almost"));
    assert_eq!(events[2].output, Some(json!({"width": 2048})));
}
