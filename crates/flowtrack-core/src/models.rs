//! Data models for flowtrack: workflow handles, notification envelopes,
//! normalized signals and the observable tracker state.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

/// Identifies one tracked backend operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowHandle {
    /// Server-assigned, opaque id (unique per operation instance)
    pub workflow_id: String,
    /// Payload `type` the filter expects (e.g. "performance_benchmark")
    pub expected_type: String,
    /// Payload `category` the filter expects (e.g. "internal")
    pub expected_category: String,
}

impl WorkflowHandle {
    pub fn new(
        workflow_id: impl Into<String>,
        expected_type: impl Into<String>,
        expected_category: impl Into<String>,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            expected_type: expected_type.into(),
            expected_category: expected_category.into(),
        }
    }

    /// Interest matching only this workflow.
    pub fn interest(&self) -> WorkflowInterest {
        WorkflowInterest {
            workflow_id: Some(self.workflow_id.clone()),
            expected_type: self.expected_type.clone(),
            expected_category: self.expected_category.clone(),
        }
    }
}

/// What the event filter looks for.
///
/// `workflow_id: None` accepts any workflow of the expected type/category,
/// which is how a list view can follow every benchmark at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowInterest {
    pub workflow_id: Option<String>,
    pub expected_type: String,
    pub expected_category: String,
}

impl WorkflowInterest {
    pub fn any_workflow(
        expected_type: impl Into<String>,
        expected_category: impl Into<String>,
    ) -> Self {
        Self {
            workflow_id: None,
            expected_type: expected_type.into(),
            expected_category: expected_category.into(),
        }
    }

    pub fn with_workflow_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }
}

impl From<&WorkflowHandle> for WorkflowInterest {
    fn from(handle: &WorkflowHandle) -> Self {
        handle.interest()
    }
}

// ─── Notification envelope ───────────────────────────────────────────────────

/// Push message as delivered by the notification channel.
///
/// Every level is optional and deserialization is lenient: a field holding
/// the wrong JSON shape reads as absent instead of failing the envelope.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RawNotificationEnvelope {
    #[serde(default, deserialize_with = "lenient")]
    pub message: Option<NotificationMessage>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NotificationMessage {
    #[serde(default, deserialize_with = "lenient")]
    pub payload: Option<NotificationPayload>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NotificationPayload {
    #[serde(default, deserialize_with = "lenient")]
    pub workflow_id: Option<String>,
    #[serde(default, rename = "type", deserialize_with = "lenient")]
    pub kind: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub category: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub event: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub content: Option<NotificationContent>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NotificationContent {
    #[serde(default, deserialize_with = "lenient")]
    pub status: Option<String>,
    /// Result tag handed to `on_completed` so the caller can pick the next step.
    #[serde(default, rename = "type", deserialize_with = "lenient")]
    pub kind: Option<String>,
}

fn lenient<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(T::deserialize(value).ok())
}

impl RawNotificationEnvelope {
    /// Parse an envelope from raw text. Text that is not a JSON object
    /// yields an empty envelope, which the filter treats as irrelevant.
    pub fn from_json(text: &str) -> Self {
        serde_json::from_str(text).unwrap_or_default()
    }

    pub fn from_value(value: serde_json::Value) -> Self {
        serde_json::from_value(value).unwrap_or_default()
    }

    pub fn payload(&self) -> Option<&NotificationPayload> {
        self.message.as_ref()?.payload.as_ref()
    }
}

impl NotificationPayload {
    pub fn status(&self) -> Option<&str> {
        self.content.as_ref()?.status.as_deref()
    }
}

// ─── Signals and state ───────────────────────────────────────────────────────

/// Normalized interpretation of an envelope for one interest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkflowSignal {
    Progress,
    Completed { payload_type: Option<String> },
    Failed,
    Irrelevant,
}

impl WorkflowSignal {
    pub fn is_relevant(&self) -> bool {
        !matches!(self, WorkflowSignal::Irrelevant)
    }
}

impl std::fmt::Display for WorkflowSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowSignal::Progress => write!(f, "PROGRESS"),
            WorkflowSignal::Completed { payload_type: Some(tag) } => write!(f, "COMPLETED ({tag})"),
            WorkflowSignal::Completed { payload_type: None } => write!(f, "COMPLETED"),
            WorkflowSignal::Failed => write!(f, "FAILED"),
            WorkflowSignal::Irrelevant => write!(f, "IRRELEVANT"),
        }
    }
}

/// Status of a tracked workflow as seen by the UI.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkflowStatus {
    #[default]
    Idle,
    Loading,
    Success,
    Failed,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::Success | WorkflowStatus::Failed)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkflowStatus::Idle => write!(f, "IDLE"),
            WorkflowStatus::Loading => write!(f, "LOADING"),
            WorkflowStatus::Success => write!(f, "SUCCESS"),
            WorkflowStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Why a lifecycle ended in `Failed`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The backend reported `FAILED`.
    Backend,
    /// The caller-supplied timeout elapsed while still loading.
    TimedOut,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Backend => write!(f, "backend reported failure"),
            FailureReason::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Externally observable state of one tracker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowTrackerState {
    pub status: WorkflowStatus,
    pub handle: Option<WorkflowHandle>,
    /// When the current status was entered.
    pub since: Option<DateTime<Utc>>,
}
