//! Example of tracking a workflow with flowtrack-core directly from Rust.
//!
//! A fake push service emits progress for two workflows; the tracker only
//! reacts to the one it is bound to. A guarded lookup shows stale results
//! being discarded.

use std::time::Duration;

use flowtrack_core::{
    NotificationChannel, RawNotificationEnvelope, StaleResultGuard, TrackerConfig,
    WorkflowCallbacks, WorkflowHandle, WorkflowTracker,
};
use serde_json::json;
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

fn envelope(workflow_id: &str, status: &str) -> RawNotificationEnvelope {
    RawNotificationEnvelope::from_value(json!({
        "message": { "payload": {
            "workflow_id": workflow_id,
            "type": "model_deployment",
            "category": "internal",
            "content": { "status": status, "type": "deployment_report" }
        }}
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_target(false)
        .compact()
        .init();

    // 1. One channel per process, one tracker per flow
    let channel = NotificationChannel::new();
    let (done_tx, done_rx) = oneshot::channel();
    let callbacks = WorkflowCallbacks::new()
        .on_completed({
            let mut done_tx = Some(done_tx);
            move |payload_type| {
                if let Some(tx) = done_tx.take() {
                    let _ = tx.send(payload_type);
                }
            }
        })
        .on_failed(|reason| eprintln!("workflow failed: {reason}"));

    let tracker = WorkflowTracker::bind(
        &channel,
        WorkflowHandle::new("wf-42", "model_deployment", "internal"),
        callbacks,
        TrackerConfig::default().with_completion_delay(Duration::from_millis(250)),
    )?;
    tracker.start();

    // 2. Simulated push service
    let notifications = futures_util::stream::iter(vec![
        envelope("wf-42", "RUNNING"),
        envelope("wf-7", "FAILED"),
        envelope("wf-42", "IN_PROGRESS"),
        envelope("wf-42", "COMPLETED"),
    ]);
    channel.connect(notifications)?;

    let payload_type = done_rx.await?;
    println!(
        "wf-42 finished as {} (payload: {})",
        tracker.status(),
        payload_type.as_deref().unwrap_or("-")
    );

    // 3. Last-request-wins lookups
    let guard = StaleResultGuard::new();
    let slow = guard.run(async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        "results for 'dep'"
    });
    let fast = guard.run(async { "results for 'deploy'" });
    let (slow, fast) = tokio::join!(slow, fast);
    println!("slow lookup applied: {:?}", slow);
    println!("fast lookup applied: {:?}", fast);

    tracker.teardown();
    Ok(())
}
