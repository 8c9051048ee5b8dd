//! Workflow event filter: maps a raw envelope plus an interest to a signal.
//!
//! Pure and total. Missing or mistyped fields never panic; they make the
//! envelope irrelevant.

use crate::models::{RawNotificationEnvelope, WorkflowInterest, WorkflowSignal};

/// Workflow is executing.
pub const STATUS_RUNNING: &str = "RUNNING";

/// Alternate spelling of [`STATUS_RUNNING`] used by some job types.
pub const STATUS_IN_PROGRESS: &str = "IN_PROGRESS";

/// Workflow finished successfully.
pub const STATUS_COMPLETED: &str = "COMPLETED";

/// Workflow failed on the backend.
pub const STATUS_FAILED: &str = "FAILED";

/// `payload.event` value that also announces completion.
pub const EVENT_RESULTS: &str = "results";

/// Classify `envelope` against `interest`.
///
/// Completion wins over every other reading: `event == "results"` yields
/// `Completed` even when `status` says something else.
pub fn filter(envelope: &RawNotificationEnvelope, interest: &WorkflowInterest) -> WorkflowSignal {
    let Some(payload) = envelope.payload() else {
        return WorkflowSignal::Irrelevant;
    };

    if let Some(expected_id) = interest.workflow_id.as_deref() {
        if payload.workflow_id.as_deref() != Some(expected_id) {
            return WorkflowSignal::Irrelevant;
        }
    }

    if payload.kind.as_deref() != Some(interest.expected_type.as_str())
        || payload.category.as_deref() != Some(interest.expected_category.as_str())
    {
        return WorkflowSignal::Irrelevant;
    }

    let status = payload.status();
    if status == Some(STATUS_COMPLETED) || payload.event.as_deref() == Some(EVENT_RESULTS) {
        return WorkflowSignal::Completed {
            payload_type: payload.content.as_ref().and_then(|c| c.kind.clone()),
        };
    }

    match status {
        Some(STATUS_RUNNING) | Some(STATUS_IN_PROGRESS) => WorkflowSignal::Progress,
        Some(STATUS_FAILED) => WorkflowSignal::Failed,
        _ => WorkflowSignal::Irrelevant,
    }
}
