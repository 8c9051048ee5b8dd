//! flowtrack-core: workflow-status tracking for the serving dashboard.
//!
//! A UI flow starts a long-running backend workflow, receives its id, and
//! then follows it through push notifications instead of polling. The
//! pieces, leaves first:
//!
//! - [`channel::NotificationChannel`]: process-wide envelope stream with
//!   subscribe/unsubscribe disposers and at most one active source.
//! - [`filter::filter`]: pure envelope → [`WorkflowSignal`] mapping.
//! - [`machine::WorkflowStatusMachine`]: `Idle → Loading → Success | Failed`.
//! - [`tracker::WorkflowTracker`]: binds a machine to the channel, fires the
//!   terminal callbacks at most once per lifecycle.
//! - [`cancellation::WorkflowCancellation`]: backend cancellation.
//! - [`stale::StaleResultGuard`]: last-request-wins for overlapping lookups.

pub mod cancellation;
pub mod channel;
pub mod config;
pub mod error;
pub mod filter;
pub mod machine;
pub mod models;
pub mod stale;
pub mod tracker;
pub mod transport;

pub use cancellation::{CancellationBackend, HttpCancellationBackend, WorkflowCancellation};
pub use channel::{NotificationChannel, Subscription};
pub use config::{BackendConfig, FlowtrackConfig, TrackerConfig};
pub use error::TrackerError;
pub use filter::filter;
pub use machine::{Effect, WorkflowStatusMachine};
pub use models::{
    FailureReason, RawNotificationEnvelope, WorkflowHandle, WorkflowInterest, WorkflowSignal,
    WorkflowStatus, WorkflowTrackerState,
};
pub use stale::{RequestToken, StaleResultGuard};
pub use tracker::{WorkflowCallbacks, WorkflowTracker};
