//! Typed error hierarchy for the hookci daemon.
//!
//! One enum per failure domain:
//! - `ConfigError` — invalid startup configuration (fatal)
//! - `WebhookError` — request-level problems surfaced as HTTP statuses
//! - `SyncError` — clone/fetch/check/pull failures for one project
//! - `BuildError` — build subprocess failures for one job

use std::path::PathBuf;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Errors raised while loading or validating the daemon configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file at {path}: {source}")]
    ParseFailed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Duplicate project key '{key}'")]
    DuplicateKey { key: String },

    #[error("Invalid project '{key}': {message}")]
    InvalidProject { key: String, message: String },

    #[error("Invalid webhook route: {0}")]
    InvalidRoute(String),

    #[error("Invalid port: {0}")]
    InvalidPort(u16),

    #[error("TLS termination is not supported; serve plain HTTP behind a reverse proxy")]
    TlsUnsupported,
}

/// Request-level webhook failures. Wrong path/method are answered by the
/// router itself and never reach this type.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Malformed JSON")]
    MalformedJson(#[source] serde_json::Error),

    #[error("Unauthorized")]
    Unauthorized(String),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match self {
            WebhookError::MalformedJson(_) => StatusCode::BAD_REQUEST,
            WebhookError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        };
        (status, self.to_string()).into_response()
    }
}

/// The synchronizer step that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    Cloning,
    Fetching,
    CheckingUpdate,
    Pulling,
}

impl std::fmt::Display for SyncStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStage::Cloning => write!(f, "clone"),
            SyncStage::Fetching => write!(f, "fetch"),
            SyncStage::CheckingUpdate => write!(f, "check-update"),
            SyncStage::Pulling => write!(f, "pull"),
        }
    }
}

/// Errors from one synchronization cycle. Contained to the triggering project.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{stage} failed for project {project}: {source:#}")]
    Command {
        project: String,
        stage: SyncStage,
        #[source]
        source: anyhow::Error,
    },

    #[error("check-update for project {project} exited with unexpected code {code:?}")]
    UnexpectedCheckCode { project: String, code: Option<i32> },

    #[error("Invalid branch name '{branch}' for project {project}")]
    InvalidBranch { project: String, branch: String },
}

impl SyncError {
    /// Stage at which the cycle was aborted.
    pub fn stage(&self) -> SyncStage {
        match self {
            SyncError::Command { stage, .. } => *stage,
            SyncError::UnexpectedCheckCode { .. } => SyncStage::CheckingUpdate,
            SyncError::InvalidBranch { .. } => SyncStage::Fetching,
        }
    }
}

/// Errors from a single build job.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Failed to spawn build script {script}: {source}")]
    SpawnFailed {
        script: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to wait for build process: {0}")]
    WaitFailed(#[source] std::io::Error),
}
