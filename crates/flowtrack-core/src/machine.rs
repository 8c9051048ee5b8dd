//! Workflow status machine.
//!
//! `Idle → Loading → Success | Failed`. The transition function is pure and
//! synchronous: it returns an [`Effect`] describing what the owner must do
//! (schedule the delayed completion callback, fire the failure callback,
//! arm a timeout). [`crate::tracker::WorkflowTracker`] carries those out.

use chrono::Utc;

use crate::models::{
    FailureReason, WorkflowHandle, WorkflowInterest, WorkflowSignal, WorkflowStatus,
    WorkflowTrackerState,
};

/// Work the machine's owner must perform after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Entered `Loading`; arm the optional timeout for this lifecycle.
    EnteredLoading,
    /// Entered `Success`; fire `on_completed` after the completion delay.
    ScheduleCompleted { payload_type: Option<String> },
    /// Entered `Failed`; fire `on_failed` now.
    FireFailed(FailureReason),
}

#[derive(Debug, Clone, Default)]
pub struct WorkflowStatusMachine {
    state: WorkflowTrackerState,
    lifecycle: u64,
}

impl WorkflowStatusMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bound(handle: WorkflowHandle) -> Self {
        let mut machine = Self::new();
        machine.bind(handle);
        machine
    }

    /// Bind to `handle`, replacing any previous binding. Starts a new lifecycle.
    pub fn bind(&mut self, handle: WorkflowHandle) {
        self.reset();
        self.state.handle = Some(handle);
    }

    pub fn state(&self) -> &WorkflowTrackerState {
        &self.state
    }

    pub fn status(&self) -> WorkflowStatus {
        self.state.status
    }

    pub fn handle(&self) -> Option<&WorkflowHandle> {
        self.state.handle.as_ref()
    }

    pub fn interest(&self) -> Option<WorkflowInterest> {
        self.handle().map(WorkflowHandle::interest)
    }

    /// Counter identifying the current lifecycle. Bumped by every reset, so
    /// deferred work captured under an older value can tell it is stale.
    pub fn lifecycle(&self) -> u64 {
        self.lifecycle
    }

    /// `Idle → Loading` without waiting for a signal.
    pub fn start(&mut self) -> Option<Effect> {
        if self.state.status != WorkflowStatus::Idle {
            return None;
        }
        self.enter(WorkflowStatus::Loading);
        Some(Effect::EnteredLoading)
    }

    /// Return to `Idle` and begin a new lifecycle. The binding is kept.
    pub fn reset(&mut self) {
        self.lifecycle += 1;
        self.state.status = WorkflowStatus::Idle;
        self.state.since = None;
    }

    pub fn apply(&mut self, signal: WorkflowSignal) -> Option<Effect> {
        if self.state.status.is_terminal() {
            return None;
        }
        match signal {
            WorkflowSignal::Irrelevant => None,
            WorkflowSignal::Progress => self.start(),
            WorkflowSignal::Completed { payload_type } => {
                self.enter(WorkflowStatus::Success);
                Some(Effect::ScheduleCompleted { payload_type })
            }
            WorkflowSignal::Failed => {
                self.enter(WorkflowStatus::Failed);
                Some(Effect::FireFailed(FailureReason::Backend))
            }
        }
    }

    /// Timeout for `lifecycle` elapsed. Forces `Failed` only if that
    /// lifecycle is still current and has not reached a terminal state.
    pub fn expire(&mut self, lifecycle: u64) -> Option<Effect> {
        if lifecycle != self.lifecycle || self.state.status.is_terminal() {
            return None;
        }
        self.enter(WorkflowStatus::Failed);
        Some(Effect::FireFailed(FailureReason::TimedOut))
    }

    fn enter(&mut self, status: WorkflowStatus) {
        self.state.status = status;
        self.state.since = Some(Utc::now());
    }
}
