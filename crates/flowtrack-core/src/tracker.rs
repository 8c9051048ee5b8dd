//! Workflow tracker: one status machine bound to one workflow, fed by the
//! shared notification channel.
//!
//! The tracker owns its channel subscription and any pending delayed work.
//! Tearing it down (explicitly or by dropping it) removes the handler and
//! aborts the pending completion callback, so nothing fires into a flow that
//! has already been dismissed.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{NotificationChannel, Subscription};
use crate::config::TrackerConfig;
use crate::error::Result;
use crate::filter::filter;
use crate::machine::{Effect, WorkflowStatusMachine};
use crate::models::{
    FailureReason, RawNotificationEnvelope, WorkflowHandle, WorkflowStatus, WorkflowTrackerState,
};

type CompletedCallback = Box<dyn FnMut(Option<String>) + Send>;
type FailedCallback = Box<dyn FnMut(FailureReason) + Send>;

/// Terminal-state callbacks. At most one of them fires per lifecycle.
///
/// Callbacks run after the tracker's state lock is released, so they may call
/// back into the tracker (`reset`, `teardown`, dropping it). Calls that a
/// callback triggers on the same tracker are queued and delivered, in order,
/// once it returns.
#[derive(Default)]
pub struct WorkflowCallbacks {
    on_completed: Option<CompletedCallback>,
    on_failed: Option<FailedCallback>,
}

impl WorkflowCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receives the completion payload tag, if the backend sent one.
    pub fn on_completed<F>(mut self, callback: F) -> Self
    where
        F: FnMut(Option<String>) + Send + 'static,
    {
        self.on_completed = Some(Box::new(callback));
        self
    }

    pub fn on_failed<F>(mut self, callback: F) -> Self
    where
        F: FnMut(FailureReason) + Send + 'static,
    {
        self.on_failed = Some(Box::new(callback));
        self
    }
}

pub struct WorkflowTracker {
    shared: Arc<Shared>,
    subscription: Mutex<Option<Subscription>>,
}

struct Shared {
    inner: Mutex<Inner>,
    callbacks: Mutex<WorkflowCallbacks>,
    state_tx: watch::Sender<WorkflowTrackerState>,
    runtime: Handle,
    config: TrackerConfig,
}

struct Inner {
    machine: WorkflowStatusMachine,
    pending_completion: Option<JoinHandle<()>>,
    pending_timeout: Option<JoinHandle<()>>,
    outbox: VecDeque<Notice>,
    dispatching: bool,
    torn_down: bool,
}

/// A callback invocation decided under the state lock, delivered after it.
enum Notice {
    Completed {
        lifecycle: u64,
        payload_type: Option<String>,
    },
    Failed {
        lifecycle: u64,
        reason: FailureReason,
    },
}

impl Notice {
    fn lifecycle(&self) -> u64 {
        match self {
            Notice::Completed { lifecycle, .. } | Notice::Failed { lifecycle, .. } => *lifecycle,
        }
    }
}

impl WorkflowTracker {
    /// Bind a new tracker to `handle` and subscribe it to `channel`.
    ///
    /// Must be called from within a tokio runtime; delayed callbacks are
    /// scheduled on that runtime.
    pub fn bind(
        channel: &NotificationChannel,
        handle: WorkflowHandle,
        callbacks: WorkflowCallbacks,
        config: TrackerConfig,
    ) -> Result<Self> {
        let runtime = Handle::try_current()?;
        let machine = WorkflowStatusMachine::bound(handle.clone());
        let (state_tx, _) = watch::channel(machine.state().clone());

        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                machine,
                pending_completion: None,
                pending_timeout: None,
                outbox: VecDeque::new(),
                dispatching: false,
                torn_down: false,
            }),
            callbacks: Mutex::new(callbacks),
            state_tx,
            runtime,
            config,
        });

        let weak = Arc::downgrade(&shared);
        let subscription = channel.subscribe(move |envelope| {
            if let Some(shared) = weak.upgrade() {
                shared.on_envelope(envelope);
            }
        });

        info!(
            workflow = %handle.workflow_id,
            kind = %handle.expected_type,
            category = %handle.expected_category,
            "tracking workflow"
        );

        Ok(Self {
            shared,
            subscription: Mutex::new(Some(subscription)),
        })
    }

    pub fn state(&self) -> WorkflowTrackerState {
        self.shared.state_tx.borrow().clone()
    }

    pub fn status(&self) -> WorkflowStatus {
        self.shared.state_tx.borrow().status
    }

    pub fn handle(&self) -> Option<WorkflowHandle> {
        self.shared.state_tx.borrow().handle.clone()
    }

    /// Receiver that observes every state change, for UI loops that await updates.
    pub fn watch(&self) -> watch::Receiver<WorkflowTrackerState> {
        self.shared.state_tx.subscribe()
    }

    /// Mark the workflow as begun before any notification has arrived.
    pub fn start(&self) {
        {
            let mut inner = self.shared.lock();
            if inner.torn_down {
                return;
            }
            let effect = inner.machine.start();
            self.shared.run_effect(&mut inner, effect);
        }
        self.shared.deliver();
    }

    /// Return to `Idle` and begin a new lifecycle; pending callbacks of the
    /// old lifecycle are dropped.
    pub fn reset(&self) {
        let mut inner = self.shared.lock();
        inner.abort_pending();
        inner.machine.reset();
        self.shared.publish(&inner);
        debug!(lifecycle = inner.machine.lifecycle(), "tracker reset");
    }

    /// Follow a different workflow from now on. Implies [`Self::reset`].
    pub fn rebind(&self, handle: WorkflowHandle) {
        let mut inner = self.shared.lock();
        inner.abort_pending();
        info!(workflow = %handle.workflow_id, "tracker rebound");
        inner.machine.bind(handle);
        self.shared.publish(&inner);
    }

    /// Detach from the channel and cancel pending callbacks. Idempotent;
    /// also runs on drop. After teardown no callback fires and no signal
    /// changes state.
    pub fn teardown(&self) {
        {
            let mut inner = self.shared.lock();
            if !inner.torn_down {
                inner.torn_down = true;
                inner.abort_pending();
                if let Some(handle) = inner.machine.handle() {
                    debug!(workflow = %handle.workflow_id, "tracker torn down");
                }
            }
        }
        // Unsubscribe outside the state lock: the channel may be invoking
        // our handler, which takes that lock.
        let subscription = self
            .subscription
            .lock()
            .expect("tracker subscription lock poisoned")
            .take();
        drop(subscription);
    }

    pub fn is_torn_down(&self) -> bool {
        self.shared.lock().torn_down
    }
}

impl Drop for WorkflowTracker {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("tracker state lock poisoned")
    }

    fn on_envelope(self: &Arc<Self>, envelope: &RawNotificationEnvelope) {
        {
            let mut inner = self.lock();
            if inner.torn_down {
                return;
            }
            let Some(interest) = inner.machine.interest() else {
                return;
            };
            let signal = filter(envelope, &interest);
            if !signal.is_relevant() {
                return;
            }
            debug!(
                workflow = ?interest.workflow_id,
                %signal,
                status = %inner.machine.status(),
                "workflow signal"
            );
            let effect = inner.machine.apply(signal);
            self.run_effect(&mut inner, effect);
        }
        self.deliver();
    }

    fn run_effect(self: &Arc<Self>, inner: &mut Inner, effect: Option<Effect>) {
        let Some(effect) = effect else {
            return;
        };
        let lifecycle = inner.machine.lifecycle();
        match effect {
            Effect::EnteredLoading => {
                if let Some(timeout) = self.config.timeout() {
                    let weak = Arc::downgrade(self);
                    inner.pending_timeout = Some(self.runtime.spawn(async move {
                        tokio::time::sleep(timeout).await;
                        expire(weak, lifecycle);
                    }));
                }
            }
            Effect::ScheduleCompleted { payload_type } => {
                inner.abort_timeout();
                let weak = Arc::downgrade(self);
                let delay = self.config.completion_delay();
                inner.pending_completion = Some(self.runtime.spawn(async move {
                    tokio::time::sleep(delay).await;
                    fire_completed(weak, lifecycle, payload_type);
                }));
            }
            Effect::FireFailed(reason) => {
                inner.abort_timeout();
                warn!(
                    workflow = ?inner.machine.handle().map(|h| &h.workflow_id),
                    %reason,
                    "workflow failed"
                );
                inner.outbox.push_back(Notice::Failed { lifecycle, reason });
            }
        }
        self.publish(inner);
    }

    /// Run queued callbacks with the state lock released. Only one caller
    /// drains at a time; a nested call (from inside a callback) returns
    /// immediately and its notices are picked up by the outer loop.
    fn deliver(&self) {
        {
            let mut inner = self.lock();
            if inner.dispatching || inner.outbox.is_empty() {
                return;
            }
            inner.dispatching = true;
        }
        loop {
            let notice = {
                let mut inner = self.lock();
                let Some(notice) = inner.outbox.pop_front() else {
                    inner.dispatching = false;
                    return;
                };
                if inner.torn_down || inner.machine.lifecycle() != notice.lifecycle() {
                    continue;
                }
                notice
            };
            let mut callbacks = self.callbacks.lock().expect("tracker callback lock poisoned");
            match notice {
                Notice::Completed { payload_type, .. } => {
                    if let Some(on_completed) = callbacks.on_completed.as_mut() {
                        on_completed(payload_type);
                    }
                }
                Notice::Failed { reason, .. } => {
                    if let Some(on_failed) = callbacks.on_failed.as_mut() {
                        on_failed(reason);
                    }
                }
            }
        }
    }

    fn publish(&self, inner: &Inner) {
        self.state_tx.send_replace(inner.machine.state().clone());
    }
}

impl Inner {
    fn abort_timeout(&mut self) {
        if let Some(task) = self.pending_timeout.take() {
            task.abort();
        }
    }

    fn abort_pending(&mut self) {
        self.abort_timeout();
        if let Some(task) = self.pending_completion.take() {
            task.abort();
        }
    }
}

fn fire_completed(shared: Weak<Shared>, lifecycle: u64, payload_type: Option<String>) {
    let Some(shared) = shared.upgrade() else {
        return;
    };
    {
        let mut inner = shared.lock();
        if inner.torn_down
            || inner.machine.lifecycle() != lifecycle
            || inner.machine.status() != WorkflowStatus::Success
            || inner.pending_completion.is_none()
        {
            return;
        }
        inner.pending_completion = None;
        if let Some(handle) = inner.machine.handle() {
            info!(workflow = %handle.workflow_id, ?payload_type, "workflow completed");
        }
        inner.outbox.push_back(Notice::Completed {
            lifecycle,
            payload_type,
        });
    }
    shared.deliver();
}

fn expire(shared: Weak<Shared>, lifecycle: u64) {
    let Some(shared) = shared.upgrade() else {
        return;
    };
    {
        let mut inner = shared.lock();
        if inner.torn_down || inner.machine.lifecycle() != lifecycle {
            return;
        }
        inner.pending_timeout = None;
        let effect = inner.machine.expire(lifecycle);
        shared.run_effect(&mut inner, effect);
    }
    shared.deliver();
}
