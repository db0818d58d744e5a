//! Error Types
//!
//! Crate-wide error enum and helpers for turning an error chain into the
//! line-oriented "stack trace" stored in run results and terminal states.

use std::error::Error;

use thiserror::Error;

/// Boxed error returned by user-supplied step functions.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FlowError>;

/// Errors raised by volumes, workers and the engine.
///
/// Ordinary step failures are never represented here; they are recorded
/// as data in [`ExecResult`](crate::workflow::ExecResult).
#[derive(Debug, Error)]
pub enum FlowError {
    #[error("unknown file '{0}'")]
    UnknownFile(String),

    #[error("unknown {type_name} '{identifier}'")]
    UnknownObject {
        type_name: &'static str,
        identifier: String,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid state transition: {0}")]
    InvalidState(String),

    #[error("worker '{worker}' cannot execute step '{step}'")]
    UnsupportedStep { worker: String, step: String },

    #[error("invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error("container runtime error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),
}

impl FlowError {
    /// Shorthand for an unknown worker, volume or run identifier.
    pub fn unknown(type_name: &'static str, identifier: impl Into<String>) -> Self {
        Self::UnknownObject {
            type_name,
            identifier: identifier.into(),
        }
    }
}

/// Formats an error and its chain of sources, one entry per cause.
pub fn stacktrace(err: &(dyn Error + 'static)) -> Vec<String> {
    let mut lines = vec![err.to_string()];
    let mut source = err.source();
    while let Some(cause) = source {
        lines.push(format!("caused by: {}", cause));
        source = cause.source();
    }
    lines
}
