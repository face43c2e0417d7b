//! Task progress pipeline.
//!
//! Each event is appended to the task's capped log and then broadcast on the
//! task's channel. A subscriber listens on the channel first and then reads
//! the log, so everything published in the log's lifetime reaches it even if
//! it connects late. The short overlap may deliver an event twice; live
//! payloads identical to a replayed entry are skipped.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{Stream, StreamExt};
use tracing::{debug, warn};

use z_metering_cache::{keys, CacheBackend, ChannelSubscription};
use z_metering_core::{ProgressEvent, TaskId};

use crate::error::Result;

/// Log retention settings.
#[derive(Debug, Clone, Copy)]
pub struct ProgressSettings {
    /// Approximate maximum entries kept per task.
    pub max_len: usize,
    /// Log expiry, refreshed on every append.
    pub ttl: Duration,
}

impl Default for ProgressSettings {
    fn default() -> Self {
        Self {
            max_len: 1000,
            ttl: Duration::from_secs(300),
        }
    }
}

/// Publishes and replays task progress.
#[derive(Clone)]
pub struct ProgressPipeline {
    cache: Arc<dyn CacheBackend>,
    settings: ProgressSettings,
}

impl std::fmt::Debug for ProgressPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressPipeline")
            .field("cache", &self.cache.provider_name())
            .field("settings", &self.settings)
            .finish()
    }
}

impl ProgressPipeline {
    /// Create a pipeline with default retention.
    #[must_use]
    pub fn new(cache: Arc<dyn CacheBackend>) -> Self {
        Self::with_settings(cache, ProgressSettings::default())
    }

    /// Create a pipeline with explicit retention.
    #[must_use]
    pub fn with_settings(cache: Arc<dyn CacheBackend>, settings: ProgressSettings) -> Self {
        Self { cache, settings }
    }

    /// Stamp `event` with the task and the current time, append it to the
    /// task's log, then broadcast it.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache is unreachable.
    pub async fn publish(&self, task_id: &TaskId, mut event: ProgressEvent) -> Result<ProgressEvent> {
        event.task_id = Some(*task_id);
        event.timestamp = Utc::now();
        let payload = serde_json::to_string(&event)?;

        self.cache
            .stream_append(
                &keys::progress_stream(task_id),
                &payload,
                self.settings.max_len,
                self.settings.ttl,
            )
            .await?;
        let receivers = self
            .cache
            .publish(&keys::progress_channel(task_id), &payload)
            .await?;

        debug!(
            task_id = %task_id,
            event = ?event.event_type,
            receivers,
            "Progress published"
        );
        Ok(event)
    }

    /// Publish `step_started`.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache is unreachable.
    pub async fn step_started(
        &self,
        task_id: &TaskId,
        step_id: impl Into<String>,
        step_name: Option<String>,
    ) -> Result<ProgressEvent> {
        self.publish(task_id, ProgressEvent::step_started(step_id, step_name))
            .await
    }

    /// Publish `progress`, clamped to `0..=100`.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache is unreachable.
    pub async fn progress(
        &self,
        task_id: &TaskId,
        progress: i64,
        message: Option<String>,
        step_id: Option<String>,
    ) -> Result<ProgressEvent> {
        self.publish(task_id, ProgressEvent::progress(progress, message, step_id))
            .await
    }

    /// Publish `step_completed`.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache is unreachable.
    pub async fn step_completed(
        &self,
        task_id: &TaskId,
        step_id: impl Into<String>,
        output: Option<serde_json::Value>,
    ) -> Result<ProgressEvent> {
        self.publish(task_id, ProgressEvent::step_completed(step_id, output))
            .await
    }

    /// Publish the terminal `completed` event.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache is unreachable.
    pub async fn completed(
        &self,
        task_id: &TaskId,
        output: Option<serde_json::Value>,
    ) -> Result<ProgressEvent> {
        self.publish(task_id, ProgressEvent::completed(output)).await
    }

    /// Publish the terminal `failed` event.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache is unreachable.
    pub async fn failed(&self, task_id: &TaskId, error: impl Into<String>) -> Result<ProgressEvent> {
        self.publish(task_id, ProgressEvent::failed(error)).await
    }

    /// Subscribe to a task's events, replaying its log first.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache is unreachable.
    pub async fn subscribe(&self, task_id: &TaskId) -> Result<ProgressSubscription> {
        let live = self
            .cache
            .subscribe(&keys::progress_channel(task_id))
            .await?;
        let replayed = self
            .cache
            .stream_read(&keys::progress_stream(task_id))
            .await?;

        let mut subscription = ProgressSubscription {
            task_id: *task_id,
            buffered: VecDeque::new(),
            replayed: HashSet::new(),
            live: Some(live),
            finished: false,
        };

        for payload in replayed {
            let Some(event) = subscription.decode(&payload) else {
                continue;
            };
            subscription.replayed.insert(payload);
            let terminal = event.is_terminal();
            subscription.buffered.push_back(event);
            if terminal {
                // Nothing follows a terminal event.
                subscription.live = None;
                break;
            }
        }

        debug!(
            task_id = %task_id,
            replayed = subscription.buffered.len(),
            "Progress subscription opened"
        );
        Ok(subscription)
    }

    /// A tracker bound to one task.
    #[must_use]
    pub fn tracker(&self, task_id: TaskId) -> ProgressTracker {
        ProgressTracker::new(self.clone(), task_id)
    }
}

/// An ordered sequence of one task's events, ending after the first terminal
/// event.
///
/// Dropping or closing the subscription unsubscribes from the channel; the
/// log is left for other readers.
pub struct ProgressSubscription {
    task_id: TaskId,
    buffered: VecDeque<ProgressEvent>,
    replayed: HashSet<String>,
    live: Option<ChannelSubscription>,
    finished: bool,
}

impl std::fmt::Debug for ProgressSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressSubscription")
            .field("task_id", &self.task_id)
            .field("buffered", &self.buffered.len())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl ProgressSubscription {
    /// The task being followed.
    #[must_use]
    pub const fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// The next event, or `None` once a terminal event has been delivered or
    /// the subscription was closed.
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        if self.finished {
            return None;
        }

        if let Some(event) = self.buffered.pop_front() {
            return Some(self.deliver(event));
        }

        loop {
            let Some(payload) = self.live.as_mut()?.next().await else {
                debug!(task_id = %self.task_id, "Progress channel ended");
                self.close();
                return None;
            };
            if self.replayed.remove(&payload) {
                continue;
            }
            if let Some(event) = self.decode(&payload) {
                return Some(self.deliver(event));
            }
        }
    }

    /// Stop receiving. Later calls to [`next`](Self::next) return `None`.
    pub fn close(&mut self) {
        self.finished = true;
        self.live = None;
        self.buffered.clear();
        self.replayed.clear();
    }

    /// Adapt into a `futures::Stream`.
    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> + Send {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription
                .next()
                .await
                .map(|event| (event, subscription))
        })
    }

    fn deliver(&mut self, event: ProgressEvent) -> ProgressEvent {
        if event.is_terminal() {
            self.close();
        }
        event
    }

    fn decode(&self, payload: &str) -> Option<ProgressEvent> {
        match serde_json::from_str(payload) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(task_id = %self.task_id, error = %e, "Dropping malformed progress event");
                None
            }
        }
    }
}

/// Publishes one task's progress, remembering the current step.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    pipeline: ProgressPipeline,
    task_id: TaskId,
    current_step: Option<String>,
}

impl ProgressTracker {
    /// Create a tracker for `task_id`.
    #[must_use]
    pub fn new(pipeline: ProgressPipeline, task_id: TaskId) -> Self {
        Self {
            pipeline,
            task_id,
            current_step: None,
        }
    }

    /// The tracked task.
    #[must_use]
    pub const fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// The step started most recently.
    #[must_use]
    pub fn current_step(&self) -> Option<&str> {
        self.current_step.as_deref()
    }

    /// Start a step; later updates are attributed to it.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache is unreachable.
    pub async fn start_step(
        &mut self,
        step_id: impl Into<String>,
        step_name: Option<String>,
    ) -> Result<()> {
        let step_id = step_id.into();
        self.current_step = Some(step_id.clone());
        self.pipeline
            .step_started(&self.task_id, step_id, step_name)
            .await?;
        Ok(())
    }

    /// Report progress on the current step.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache is unreachable.
    pub async fn update_progress(&self, progress: i64, message: Option<String>) -> Result<()> {
        self.pipeline
            .progress(&self.task_id, progress, message, self.current_step.clone())
            .await?;
        Ok(())
    }

    /// Complete the current step. Does nothing if no step was started.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache is unreachable.
    pub async fn complete_step(&self, output: Option<serde_json::Value>) -> Result<()> {
        if let Some(step_id) = &self.current_step {
            self.pipeline
                .step_completed(&self.task_id, step_id.clone(), output)
                .await?;
        }
        Ok(())
    }

    /// Publish `completed`.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache is unreachable.
    pub async fn complete(&self, output: Option<serde_json::Value>) -> Result<()> {
        self.pipeline.completed(&self.task_id, output).await?;
        Ok(())
    }

    /// Publish `failed`.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache is unreachable.
    pub async fn fail(&self, error: impl Into<String>) -> Result<()> {
        self.pipeline.failed(&self.task_id, error).await?;
        Ok(())
    }
}
