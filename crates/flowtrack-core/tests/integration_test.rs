//! Integration tests for flowtrack-core.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use flowtrack_core::transport;
use flowtrack_core::{
    filter, BackendConfig, CancellationBackend, FailureReason, NotificationChannel,
    RawNotificationEnvelope, TrackerConfig, TrackerError, WorkflowCallbacks, WorkflowCancellation,
    WorkflowHandle, WorkflowSignal, WorkflowStatus, WorkflowTracker,
};

const DELAY: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, PartialEq)]
enum Fired {
    Completed(Option<String>),
    Failed(FailureReason),
}

fn recorder() -> (WorkflowCallbacks, Arc<Mutex<Vec<Fired>>>) {
    let fired = Arc::new(Mutex::new(Vec::new()));
    let on_completed = fired.clone();
    let on_failed = fired.clone();
    let callbacks = WorkflowCallbacks::new()
        .on_completed(move |tag| on_completed.lock().unwrap().push(Fired::Completed(tag)))
        .on_failed(move |reason| on_failed.lock().unwrap().push(Fired::Failed(reason)));
    (callbacks, fired)
}

fn handle(workflow_id: &str) -> WorkflowHandle {
    WorkflowHandle::new(workflow_id, "forecast", "ml")
}

fn track(
    channel: &NotificationChannel,
    config: TrackerConfig,
) -> (WorkflowTracker, Arc<Mutex<Vec<Fired>>>) {
    let (callbacks, fired) = recorder();
    let tracker = WorkflowTracker::bind(channel, handle("wf-1"), callbacks, config)
        .expect("Failed to bind tracker");
    (tracker, fired)
}

fn delay_config() -> TrackerConfig {
    TrackerConfig::default().with_completion_delay(DELAY)
}

fn status(workflow_id: &str, status: &str) -> RawNotificationEnvelope {
    RawNotificationEnvelope::from_value(json!({
        "message": { "payload": {
            "workflow_id": workflow_id,
            "type": "forecast",
            "category": "ml",
            "content": { "status": status, "type": "forecast_table" }
        }}
    }))
}

fn results_event(workflow_id: &str) -> RawNotificationEnvelope {
    RawNotificationEnvelope::from_value(json!({
        "message": { "payload": {
            "workflow_id": workflow_id,
            "type": "forecast",
            "category": "ml",
            "event": "results"
        }}
    }))
}

fn fired(log: &Arc<Mutex<Vec<Fired>>>) -> Vec<Fired> {
    log.lock().unwrap().clone()
}

// ─── Tracker lifecycle ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_completion_fires_once_after_delay() {
    let channel = NotificationChannel::new();
    let (tracker, log) = track(&channel, delay_config());

    channel.publish(&status("wf-1", "RUNNING"));
    assert_eq!(tracker.status(), WorkflowStatus::Loading);
    channel.publish(&status("wf-1", "IN_PROGRESS"));
    channel.publish(&status("wf-1", "COMPLETED"));
    assert_eq!(tracker.status(), WorkflowStatus::Success);
    assert!(fired(&log).is_empty(), "completion must wait for the delay");

    tokio::time::sleep(Duration::from_millis(999)).await;
    assert!(fired(&log).is_empty(), "completion fired early");

    tokio::time::sleep(Duration::from_millis(2)).await;
    assert_eq!(fired(&log), vec![Fired::Completed(Some("forecast_table".into()))]);

    // Terminal state absorbs everything that follows.
    channel.publish(&status("wf-1", "FAILED"));
    channel.publish(&status("wf-1", "COMPLETED"));
    tokio::time::sleep(DELAY * 2).await;
    assert_eq!(tracker.status(), WorkflowStatus::Success);
    assert_eq!(fired(&log).len(), 1, "on_completed must fire exactly once");
}

#[tokio::test(start_paused = true)]
async fn test_failure_fires_immediately_and_blocks_completion() {
    let channel = NotificationChannel::new();
    let (tracker, log) = track(&channel, delay_config());

    channel.publish(&status("wf-1", "FAILED"));
    assert_eq!(tracker.status(), WorkflowStatus::Failed);
    assert_eq!(fired(&log), vec![Fired::Failed(FailureReason::Backend)]);

    channel.publish(&status("wf-1", "COMPLETED"));
    channel.publish(&results_event("wf-1"));
    tokio::time::sleep(DELAY * 2).await;
    assert_eq!(tracker.status(), WorkflowStatus::Failed);
    assert_eq!(fired(&log).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_results_event_completes_without_tag() {
    let channel = NotificationChannel::new();
    let (tracker, log) = track(&channel, delay_config());

    channel.publish(&results_event("wf-1"));
    assert_eq!(tracker.status(), WorkflowStatus::Success);
    tokio::time::sleep(DELAY + Duration::from_millis(1)).await;
    assert_eq!(fired(&log), vec![Fired::Completed(None)]);
}

#[tokio::test(start_paused = true)]
async fn test_foreign_notifications_are_ignored() {
    let channel = NotificationChannel::new();
    let (tracker, log) = track(&channel, delay_config());
    tracker.start();

    channel.publish(&status("wf-2", "COMPLETED"));
    channel.publish(&status("wf-2", "FAILED"));
    channel.publish(&RawNotificationEnvelope::from_value(json!({
        "message": { "payload": {
            "workflow_id": "wf-1", "type": "other", "category": "ml",
            "content": { "status": "FAILED" }
        }}
    })));
    channel.publish(&RawNotificationEnvelope::from_json("not json"));
    channel.publish(&RawNotificationEnvelope::from_value(json!({ "message": 7 })));

    tokio::time::sleep(DELAY * 2).await;
    assert_eq!(tracker.status(), WorkflowStatus::Loading);
    assert!(fired(&log).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reset_starts_new_lifecycle() {
    let channel = NotificationChannel::new();
    let (tracker, log) = track(&channel, delay_config());

    channel.publish(&status("wf-1", "FAILED"));
    tracker.reset();
    assert_eq!(tracker.status(), WorkflowStatus::Idle);
    assert_eq!(tracker.handle(), Some(handle("wf-1")), "reset keeps the binding");

    channel.publish(&status("wf-1", "COMPLETED"));
    tokio::time::sleep(DELAY + Duration::from_millis(1)).await;
    assert_eq!(
        fired(&log),
        vec![
            Fired::Failed(FailureReason::Backend),
            Fired::Completed(Some("forecast_table".into())),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_reset_drops_pending_completion() {
    let channel = NotificationChannel::new();
    let (tracker, log) = track(&channel, delay_config());

    channel.publish(&status("wf-1", "COMPLETED"));
    tokio::time::sleep(DELAY / 2).await;
    tracker.reset();
    tokio::time::sleep(DELAY * 2).await;
    assert!(fired(&log).is_empty(), "a reset lifecycle must not complete");
    assert_eq!(tracker.status(), WorkflowStatus::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_rebind_follows_new_workflow() {
    let channel = NotificationChannel::new();
    let (tracker, log) = track(&channel, delay_config());
    tracker.start();

    tracker.rebind(handle("wf-2"));
    channel.publish(&status("wf-1", "FAILED"));
    assert_eq!(tracker.status(), WorkflowStatus::Idle);
    channel.publish(&status("wf-2", "FAILED"));
    assert_eq!(tracker.status(), WorkflowStatus::Failed);
    assert_eq!(fired(&log), vec![Fired::Failed(FailureReason::Backend)]);
}

#[tokio::test(start_paused = true)]
async fn test_teardown_suppresses_pending_completion() {
    let channel = NotificationChannel::new();
    let (tracker, log) = track(&channel, delay_config());
    assert_eq!(channel.subscriber_count(), 1);

    channel.publish(&status("wf-1", "COMPLETED"));
    tracker.teardown();
    tracker.teardown();
    assert!(tracker.is_torn_down());
    assert_eq!(channel.subscriber_count(), 0);

    tokio::time::sleep(DELAY * 2).await;
    assert!(fired(&log).is_empty(), "teardown must cancel the delayed callback");
}

#[tokio::test(start_paused = true)]
async fn test_drop_unsubscribes() {
    let channel = NotificationChannel::new();
    let (tracker, log) = track(&channel, delay_config());
    channel.publish(&status("wf-1", "COMPLETED"));
    drop(tracker);

    assert_eq!(channel.subscriber_count(), 0);
    tokio::time::sleep(DELAY * 2).await;
    assert!(fired(&log).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_fails_loading_workflow_once() {
    let channel = NotificationChannel::new();
    let config = delay_config().with_timeout(Duration::from_secs(5));
    let (tracker, log) = track(&channel, config);

    tracker.start();
    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(tracker.status(), WorkflowStatus::Loading);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(tracker.status(), WorkflowStatus::Failed);
    assert_eq!(fired(&log), vec![Fired::Failed(FailureReason::TimedOut)]);

    channel.publish(&status("wf-1", "COMPLETED"));
    tokio::time::sleep(DELAY * 2).await;
    assert_eq!(fired(&log).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_disarmed_by_completion() {
    let channel = NotificationChannel::new();
    let config = delay_config().with_timeout(Duration::from_secs(5));
    let (tracker, log) = track(&channel, config);

    channel.publish(&status("wf-1", "RUNNING"));
    channel.publish(&status("wf-1", "COMPLETED"));
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(tracker.status(), WorkflowStatus::Success);
    assert_eq!(fired(&log), vec![Fired::Completed(Some("forecast_table".into()))]);
}

#[tokio::test(start_paused = true)]
async fn test_callback_can_reset_its_tracker() {
    let channel = NotificationChannel::new();
    let slot: Arc<OnceLock<Weak<WorkflowTracker>>> = Arc::new(OnceLock::new());
    let log = Arc::new(Mutex::new(Vec::new()));

    let failed_slot = slot.clone();
    let failures = log.clone();
    let completions = log.clone();
    let callbacks = WorkflowCallbacks::new()
        .on_failed(move |reason| {
            failures.lock().unwrap().push(Fired::Failed(reason));
            if let Some(tracker) = failed_slot.get().and_then(Weak::upgrade) {
                tracker.reset();
            }
        })
        .on_completed(move |tag| completions.lock().unwrap().push(Fired::Completed(tag)));

    let tracker = Arc::new(
        WorkflowTracker::bind(&channel, handle("wf-1"), callbacks, delay_config())
            .expect("Failed to bind tracker"),
    );
    slot.set(Arc::downgrade(&tracker)).unwrap();

    channel.publish(&status("wf-1", "FAILED"));
    assert_eq!(tracker.status(), WorkflowStatus::Idle, "on_failed reset the tracker");

    channel.publish(&status("wf-1", "FAILED"));
    assert_eq!(fired(&log).len(), 2, "each lifecycle fails once");

    channel.publish(&status("wf-1", "COMPLETED"));
    tokio::time::sleep(DELAY + Duration::from_millis(1)).await;
    assert_eq!(
        fired(&log),
        vec![
            Fired::Failed(FailureReason::Backend),
            Fired::Failed(FailureReason::Backend),
            Fired::Completed(Some("forecast_table".into())),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_completion_callback_can_drop_its_tracker() {
    let channel = NotificationChannel::new();
    let holder: Arc<Mutex<Option<WorkflowTracker>>> = Arc::new(Mutex::new(None));
    let completions = Arc::new(AtomicUsize::new(0));

    let closing = holder.clone();
    let counter = completions.clone();
    let callbacks = WorkflowCallbacks::new().on_completed(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        let tracker = closing.lock().unwrap().take();
        drop(tracker);
    });
    let tracker = WorkflowTracker::bind(&channel, handle("wf-1"), callbacks, delay_config())
        .expect("Failed to bind tracker");
    *holder.lock().unwrap() = Some(tracker);

    channel.publish(&status("wf-1", "COMPLETED"));
    tokio::time::sleep(DELAY + Duration::from_millis(1)).await;

    assert_eq!(completions.load(Ordering::SeqCst), 1);
    assert!(holder.lock().unwrap().is_none(), "callback closed the flow");
    assert_eq!(channel.subscriber_count(), 0);
}

#[tokio::test]
async fn test_watch_observes_transitions() {
    let channel = NotificationChannel::new();
    let (tracker, _log) = track(&channel, delay_config());
    let mut states = tracker.watch();

    channel.publish(&status("wf-1", "RUNNING"));
    states.changed().await.expect("tracker dropped");
    let state = states.borrow_and_update().clone();
    assert_eq!(state.status, WorkflowStatus::Loading);
    assert!(state.since.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_connected_source_drives_tracker() {
    let channel = NotificationChannel::new();
    let (tracker, log) = track(&channel, delay_config());

    let source = futures_util::stream::iter(vec![
        status("wf-1", "RUNNING"),
        status("wf-2", "FAILED"),
        status("wf-1", "COMPLETED"),
    ]);
    channel.connect(source).expect("Failed to connect source");
    channel.closed().await;
    assert!(!channel.is_connected());
    assert_eq!(tracker.status(), WorkflowStatus::Success);

    tokio::time::sleep(DELAY + Duration::from_millis(1)).await;
    assert_eq!(fired(&log).len(), 1);
}

#[test]
fn test_bind_outside_runtime_fails() {
    let channel = NotificationChannel::new();
    let (callbacks, _) = recorder();
    let result = WorkflowTracker::bind(&channel, handle("wf-1"), callbacks, delay_config());
    assert!(matches!(result, Err(TrackerError::Runtime(_))));
}

// ─── Cancellation ─────────────────────────────────────────────────────────────

struct FakeBackend {
    accept: bool,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl CancellationBackend for FakeBackend {
    async fn cancel_workflow(&self, _workflow_id: &str) -> flowtrack_core::error::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.accept {
            Ok(())
        } else {
            Err(TrackerError::Backend {
                status: 409,
                body: "already finished".into(),
            })
        }
    }
}

fn fake(accept: bool) -> (WorkflowCancellation, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let cancellation = WorkflowCancellation::new(FakeBackend {
        accept,
        calls: calls.clone(),
    });
    (cancellation, calls)
}

#[tokio::test]
async fn test_rejected_cancellation_leaves_tracker_untouched() {
    let channel = NotificationChannel::new();
    let (tracker, _log) = track(&channel, delay_config());
    tracker.start();
    let (cancellation, calls) = fake(false);

    assert!(!cancellation.cancel("wf-1").await);
    let error = cancellation.cancel_tracked(&tracker).await.unwrap_err();
    assert!(matches!(error, TrackerError::Backend { status: 409, .. }));

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(tracker.status(), WorkflowStatus::Loading);
    assert!(!tracker.is_torn_down());
    assert_eq!(channel.subscriber_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_accepted_cancellation_tears_down_tracker() {
    let channel = NotificationChannel::new();
    let (tracker, log) = track(&channel, delay_config());
    tracker.start();
    let (cancellation, _) = fake(true);

    cancellation
        .cancel_tracked(&tracker)
        .await
        .expect("cancellation should be accepted");
    assert!(tracker.is_torn_down());
    assert_eq!(tracker.status(), WorkflowStatus::Loading, "cancel does not imply a terminal state");

    channel.publish(&status("wf-1", "COMPLETED"));
    tokio::time::sleep(DELAY * 2).await;
    assert!(fired(&log).is_empty(), "late notifications after cancel must be ignored");
}

#[tokio::test]
async fn test_http_cancellation_against_local_backend() {
    use axum::extract::Path;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::Router;

    async fn cancel(Path(id): Path<String>, headers: HeaderMap) -> (StatusCode, String) {
        let authorized = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            == Some("Bearer secret");
        match (authorized, id.as_str()) {
            (false, _) => (StatusCode::UNAUTHORIZED, "no token".into()),
            (true, "wf-ok") => (StatusCode::ACCEPTED, String::new()),
            (true, _) => (StatusCode::INTERNAL_SERVER_ERROR, "boom".into()),
        }
    }

    let app = Router::new().route("/api/workflows/{id}/cancel", post(cancel));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test listener");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let cancellation = WorkflowCancellation::from_config(&BackendConfig {
        base_url: format!("http://{addr}/api"),
        api_token: Some("secret".into()),
        ..Default::default()
    })
    .expect("Failed to build cancellation client");

    cancellation.try_cancel("wf-ok").await.expect("wf-ok should be accepted");

    match cancellation.try_cancel("wf-bad").await {
        Err(TrackerError::Backend { status, body }) => {
            assert_eq!(status, 500);
            assert_eq!(body, "boom");
        }
        other => panic!("expected backend error, got {other:?}"),
    }
    assert!(!cancellation.cancel("wf-bad").await);
}

// ─── Event stream source ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_server_sent_events_feed_envelopes() {
    use std::convert::Infallible;

    use axum::response::sse::{Event, KeepAlive, Sse};
    use axum::routing::get;
    use axum::Router;
    use futures_util::StreamExt;

    async fn events() -> Sse<impl futures_util::Stream<Item = Result<Event, Infallible>>> {
        let frames = vec![
            json!({ "message": { "payload": {
                "workflow_id": "wf-1", "type": "forecast", "category": "ml",
                "content": { "status": "RUNNING" }
            }}}),
            json!({ "message": { "payload": {
                "workflow_id": "wf-1", "type": "forecast", "category": "ml",
                "event": "results"
            }}}),
        ];
        let stream = futures_util::stream::iter(
            frames
                .into_iter()
                .map(|frame| Ok::<_, Infallible>(Event::default().data(frame.to_string()))),
        );
        Sse::new(stream).keep_alive(KeepAlive::default())
    }

    let app = Router::new().route("/events", get(events));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test listener");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let client = BackendConfig::default()
        .stream_client()
        .expect("Failed to build stream client");
    let envelopes: Vec<_> = transport::server_sent_events(&client, &format!("http://{addr}/events"))
        .await
        .expect("Failed to open event stream")
        .collect()
        .await;

    let interest = handle("wf-1").interest();
    let signals: Vec<_> = envelopes.iter().map(|e| filter(e, &interest)).collect();
    assert_eq!(
        signals,
        vec![
            WorkflowSignal::Progress,
            WorkflowSignal::Completed { payload_type: None },
        ]
    );

    let missing = transport::server_sent_events(&client, &format!("http://{addr}/missing")).await;
    assert!(matches!(missing, Err(TrackerError::Backend { status: 404, .. })));
}

#[tokio::test]
async fn test_http_cancellation_unreachable_backend() {
    let cancellation = WorkflowCancellation::from_config(&BackendConfig {
        base_url: "http://127.0.0.1:9/api".into(),
        request_timeout_secs: 2,
        ..Default::default()
    })
    .expect("Failed to build cancellation client");

    assert!(matches!(
        cancellation.try_cancel("wf-1").await,
        Err(TrackerError::Http(_))
    ));
}
