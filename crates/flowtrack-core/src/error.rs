//! Error types for flowtrack-core.
//!
//! Malformed notifications are never errors (the filter maps them to
//! `Irrelevant`). Errors only surface from explicit actions: loading config,
//! opening an envelope source, or asking the backend to cancel a workflow.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Backend rejected request with status {status}: {body}")]
    Backend { status: u16, body: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("No tokio runtime available: {0}")]
    Runtime(#[from] tokio::runtime::TryCurrentError),

    #[error("Workflow tracker is not bound to a workflow")]
    Unbound,
}

pub type Result<T> = std::result::Result<T, TrackerError>;
