//! Task progress event types.
//!
//! Events serialize to the JSON payload shared by the persistent stream and
//! the broadcast channel:
//! `{type, taskId?, stepId?, stepName?, progress?, message?, output?, error?, timestamp}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::TaskId;

/// Kind of progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEventType {
    /// A viewer connection was established.
    Connected,
    /// A task step began.
    StepStarted,
    /// Intermediate progress.
    Progress,
    /// A task step finished.
    StepCompleted,
    /// The task finished successfully. Terminal.
    Completed,
    /// The task failed. Terminal.
    Failed,
}

impl ProgressEventType {
    /// Whether this event closes the task's stream.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A single progress event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    /// Event kind.
    #[serde(rename = "type")]
    pub event_type: ProgressEventType,

    /// Task the event belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,

    /// Step the event belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,

    /// Display name of the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,

    /// Percentage in `0..=100`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,

    /// Free-form status message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Step or task output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,

    /// Failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// When the event was published.
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    fn bare(event_type: ProgressEventType) -> Self {
        Self {
            event_type,
            task_id: None,
            step_id: None,
            step_name: None,
            progress: None,
            message: None,
            output: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// A `connected` event announcing a live viewer connection.
    #[must_use]
    pub fn connected(task_id: TaskId) -> Self {
        Self {
            task_id: Some(task_id),
            ..Self::bare(ProgressEventType::Connected)
        }
    }

    /// A `step_started` event with the default message.
    #[must_use]
    pub fn step_started(step_id: impl Into<String>, step_name: Option<String>) -> Self {
        let step_id = step_id.into();
        let message = match &step_name {
            Some(name) => format!("Starting {name}"),
            None => format!("Starting step {step_id}"),
        };
        Self {
            step_id: Some(step_id),
            step_name,
            message: Some(message),
            ..Self::bare(ProgressEventType::StepStarted)
        }
    }

    /// A `progress` event. The percentage is clamped to `0..=100`.
    #[must_use]
    pub fn progress(progress: i64, message: Option<String>, step_id: Option<String>) -> Self {
        Self {
            step_id,
            progress: Some(clamp_percent(progress)),
            message,
            ..Self::bare(ProgressEventType::Progress)
        }
    }

    /// A `step_completed` event.
    #[must_use]
    pub fn step_completed(step_id: impl Into<String>, output: Option<serde_json::Value>) -> Self {
        Self {
            step_id: Some(step_id.into()),
            output,
            ..Self::bare(ProgressEventType::StepCompleted)
        }
    }

    /// A terminal `completed` event.
    #[must_use]
    pub fn completed(output: Option<serde_json::Value>) -> Self {
        Self {
            output,
            ..Self::bare(ProgressEventType::Completed)
        }
    }

    /// A terminal `failed` event.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::bare(ProgressEventType::Failed)
        }
    }

    /// Whether this event closes the task's stream.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.event_type.is_terminal()
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn clamp_percent(value: i64) -> u8 {
    value.clamp(0, 100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_is_clamped() {
        assert_eq!(ProgressEvent::progress(150, None, None).progress, Some(100));
        assert_eq!(ProgressEvent::progress(-5, None, None).progress, Some(0));
        assert_eq!(ProgressEvent::progress(42, None, None).progress, Some(42));
    }

    #[test]
    fn step_started_default_message() {
        let named = ProgressEvent::step_started("upscale", Some("Upscaling".into()));
        assert_eq!(named.message.as_deref(), Some("Starting Upscaling"));

        let unnamed = ProgressEvent::step_started("upscale", None);
        assert_eq!(unnamed.message.as_deref(), Some("Starting step upscale"));
    }

    #[test]
    fn payload_uses_wire_field_names() {
        let task_id = TaskId::generate();
        let mut event = ProgressEvent::progress(50, Some("halfway".into()), Some("s1".into()));
        event.task_id = Some(task_id);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["taskId"], task_id.to_string());
        assert_eq!(json["stepId"], "s1");
        assert_eq!(json["progress"], 50);
        assert!(json.get("error").is_none());
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn payload_parses_without_optional_fields() {
        let event: ProgressEvent =
            serde_json::from_str(r#"{"type":"failed","error":"boom","timestamp":"2024-05-01T10:00:00Z"}"#)
                .unwrap();
        assert_eq!(event.event_type, ProgressEventType::Failed);
        assert!(event.is_terminal());
        assert_eq!(event.task_id, None);
    }

    #[test]
    fn connected_is_not_terminal() {
        let event = ProgressEvent::connected(TaskId::generate());
        assert_eq!(event.event_type, ProgressEventType::Connected);
        assert!(!event.is_terminal());
    }
}
