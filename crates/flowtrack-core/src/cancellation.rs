//! Workflow cancellation.
//!
//! Cancellation is advisory: a successful request does not move the tracker
//! to a terminal state, and a completion or failure notification that was
//! already in flight may still arrive. Convergence relies on the tracker's
//! terminal guard, or on tearing the tracker down once the backend accepted.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, Url};
use tracing::{info, warn};

use crate::config::{BackendConfig, WORKFLOW_ID_PLACEHOLDER};
use crate::error::{Result, TrackerError};
use crate::tracker::WorkflowTracker;

/// Backend endpoint able to cancel a workflow by id.
#[async_trait]
pub trait CancellationBackend: Send + Sync {
    async fn cancel_workflow(&self, workflow_id: &str) -> Result<()>;
}

/// REST implementation: `POST {base_url}/{cancel_path}`.
#[derive(Clone)]
pub struct HttpCancellationBackend {
    client: Client,
    base_url: Url,
    cancel_path: String,
}

impl HttpCancellationBackend {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let base_url = Url::parse(config.base_url.trim()).map_err(|error| {
            TrackerError::Config(format!("invalid backend.base_url '{}': {error}", config.base_url))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(TrackerError::Config(format!(
                "backend.base_url '{}' cannot carry a path",
                config.base_url
            )));
        }

        Ok(Self {
            client: config.http_client()?,
            base_url,
            cancel_path: config.cancel_path.clone(),
        })
    }

    /// Resolve the cancellation URL for `workflow_id`. Every placeholder is
    /// replaced in place; the id never introduces a new path segment.
    pub fn cancel_url(&self, workflow_id: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                TrackerError::Config("backend.base_url cannot carry a path".to_string())
            })?;
            segments.pop_if_empty();
            for segment in self.cancel_path.split('/').filter(|s| !s.is_empty()) {
                segments.push(&segment.replace(WORKFLOW_ID_PLACEHOLDER, workflow_id));
            }
        }
        Ok(url)
    }
}

#[async_trait]
impl CancellationBackend for HttpCancellationBackend {
    async fn cancel_workflow(&self, workflow_id: &str) -> Result<()> {
        let url = self.cancel_url(workflow_id)?;
        let response = self.client.post(url).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(TrackerError::Backend {
            status: status.as_u16(),
            body,
        })
    }
}

/// Issues cancellation requests and reconciles tracker state with the outcome.
#[derive(Clone)]
pub struct WorkflowCancellation {
    backend: Arc<dyn CancellationBackend>,
}

impl WorkflowCancellation {
    pub fn new<B>(backend: B) -> Self
    where
        B: CancellationBackend + 'static,
    {
        Self {
            backend: Arc::new(backend),
        }
    }

    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        Ok(Self::new(HttpCancellationBackend::new(config)?))
    }

    /// Request cancellation, surfacing the transport or backend error.
    pub async fn try_cancel(&self, workflow_id: &str) -> Result<()> {
        self.backend.cancel_workflow(workflow_id).await?;
        info!(workflow = %workflow_id, "cancellation accepted");
        Ok(())
    }

    /// Request cancellation. `false` means the backend did not confirm it;
    /// that is never treated as success.
    pub async fn cancel(&self, workflow_id: &str) -> bool {
        match self.try_cancel(workflow_id).await {
            Ok(()) => true,
            Err(error) => {
                warn!(workflow = %workflow_id, %error, "cancellation failed");
                false
            }
        }
    }

    /// Cancel the workflow `tracker` follows and, only if the backend
    /// accepted, tear the tracker down so late notifications are ignored.
    /// On failure the tracker is left exactly as it was.
    pub async fn cancel_tracked(&self, tracker: &WorkflowTracker) -> Result<()> {
        let handle = tracker.handle().ok_or(TrackerError::Unbound)?;
        self.try_cancel(&handle.workflow_id).await?;
        tracker.teardown();
        Ok(())
    }
}
