use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised by the orchestration layer.
///
/// Session-fatal variants (see [`HandoffError::is_session_fatal`]) mark the
/// session dead so the next submission recreates it.
#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("workspace unavailable at {}: {source}", path.display())]
    Workspace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to launch execution context '{context}': {reason}")]
    Launch { context: String, reason: String },

    #[error("session '{session}' did not answer the readiness probe within {}s", waited.as_secs())]
    ProbeTimeout { session: String, waited: Duration },

    #[error("delivery to '{context}' failed after {attempts} attempt(s): {reason}")]
    Delivery {
        context: String,
        attempts: u32,
        reason: String,
    },

    #[error("instruction cannot be delivered literally: {0}")]
    InvalidInstruction(String),

    #[error("session '{0}' already has a task in flight")]
    Busy(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("http error: {0}")]
    Http(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl HandoffError {
    pub fn workspace(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        HandoffError::Workspace {
            path: path.into(),
            source,
        }
    }

    /// Whether this error leaves the session unusable.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            HandoffError::Workspace { .. }
                | HandoffError::Launch { .. }
                | HandoffError::ProbeTimeout { .. }
                | HandoffError::Delivery { .. }
        )
    }

    /// Operator-facing hint for resolving the failure.
    pub fn remediation(&self) -> &'static str {
        match self {
            HandoffError::Workspace { .. } => {
                "check that the sessions directory exists, is writable, and has free space"
            }
            HandoffError::Launch { .. } => {
                "verify tmux and the assistant command are installed and on PATH"
            }
            HandoffError::ProbeTimeout { .. } => {
                "verify the target process is responsive; attach with `tmux attach -t <context>` to inspect it"
            }
            HandoffError::Delivery { .. } => {
                "verify the tmux server is running; the session will be recreated on the next submission"
            }
            HandoffError::InvalidInstruction(_) => {
                "instructions must be a single line without control characters"
            }
            HandoffError::Busy(_) => "wait for the in-flight task to finish or cancel it first",
            HandoffError::SessionNotFound(_) => "submit a task to create the session",
            HandoffError::InvalidTransition { .. } => "this is a bug; report the task history",
            HandoffError::Config(_) => "run `handoff config validate` and fix the reported fields",
            HandoffError::Http(_) => "check that `handoff serve` is running and reachable",
            HandoffError::Io(_) | HandoffError::Yaml(_) | HandoffError::Json(_) => {
                "inspect the session directory for corrupt or unreadable files"
            }
        }
    }
}

/// Task-scoped failures. The session stays reusable after any of these.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TaskError {
    #[error("no acknowledgement within {}s", .0.as_secs())]
    AckTimeout(Duration),

    #[error("task did not complete within {}s", .0.as_secs())]
    CompletionTimeout(Duration),

    #[error("result not found: {0}")]
    ResultIntegrity(String),

    #[error("{0}")]
    Remote(String),

    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl TaskError {
    pub fn remediation(&self) -> &'static str {
        match self {
            TaskError::AckTimeout(_) => {
                "verify the target process is responsive; the session will be re-probed before the next task"
            }
            TaskError::CompletionTimeout(_) => {
                "split the task into smaller units or raise timing.completion_timeout_secs"
            }
            TaskError::ResultIntegrity(_) => {
                "the assistant reported done without writing a fresh result file; check the output path in the task file"
            }
            TaskError::Remote(_) => "read the reported error and resubmit once the cause is fixed",
            TaskError::Cancelled(_) => "resubmit the task; the session will be recreated",
        }
    }
}

pub type Result<T> = std::result::Result<T, HandoffError>;
