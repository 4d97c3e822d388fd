//! Per-session status record exposed to remote observers.
//!
//! One `status.json` per session, replaced atomically on every write so a
//! concurrent reader never sees a partial document. Writers are serialized
//! by a process-wide lock; progress never moves backwards.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{HandoffError, Result};
use crate::io::atomic_write;
use crate::types::{SessionId, TaskId, TaskStatus};
use crate::workspace::WorkspaceManager;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub session_id: SessionId,
    pub task_id: Option<TaskId>,
    pub task_status: TaskStatus,
    pub progress: u8,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub result_ref: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub remediation: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update applied by [`StatusStore::update`]. `None` fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    pub task_status: Option<TaskStatus>,
    pub progress: Option<u8>,
    pub message: Option<String>,
    pub result_ref: Option<String>,
    pub error: Option<String>,
    pub remediation: Option<String>,
}

impl StatusUpdate {
    pub fn status(status: TaskStatus) -> Self {
        Self {
            task_status: Some(status),
            ..Self::default()
        }
    }

    pub fn progress(mut self, value: u8) -> Self {
        self.progress = Some(value);
        self
    }

    pub fn message(mut self, text: impl Into<String>) -> Self {
        self.message = Some(text.into());
        self
    }

    pub fn result_ref(mut self, reference: impl Into<String>) -> Self {
        self.result_ref = Some(reference.into());
        self
    }

    pub fn failure(mut self, error: impl Into<String>, remediation: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self.remediation = Some(remediation.into());
        self
    }
}

pub struct StatusStore {
    workspace: WorkspaceManager,
    write_lock: Mutex<()>,
}

impl StatusStore {
    pub fn new(workspace: WorkspaceManager) -> Self {
        Self {
            workspace,
            write_lock: Mutex::new(()),
        }
    }

    pub fn get(&self, session_id: &SessionId) -> Result<Option<SessionStatus>> {
        let path = self.workspace.handle(session_id).status_path;
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&data)?))
    }

    /// Like [`get`](Self::get) but an unknown session is an error.
    pub fn require(&self, session_id: &SessionId) -> Result<SessionStatus> {
        self.get(session_id)?
            .ok_or_else(|| HandoffError::SessionNotFound(session_id.to_string()))
    }

    /// Start a fresh record for `task_id` in the pending state.
    pub fn begin_task(&self, session_id: &SessionId, task_id: &TaskId) -> Result<SessionStatus> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        let status = SessionStatus {
            session_id: session_id.clone(),
            task_id: Some(task_id.clone()),
            task_status: TaskStatus::Pending,
            progress: 0,
            message: "task created".into(),
            result_ref: None,
            started_at: now,
            completed_at: None,
            error: None,
            remediation: None,
            updated_at: now,
        };
        self.write(&status)?;
        Ok(status)
    }

    pub fn update(&self, session_id: &SessionId, update: StatusUpdate) -> Result<SessionStatus> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut status = self.require(session_id)?;

        if let Some(next) = update.task_status {
            if next != status.task_status {
                if !status.task_status.can_transition_to(next) {
                    return Err(HandoffError::InvalidTransition {
                        from: status.task_status.to_string(),
                        to: next.to_string(),
                    });
                }
                status.task_status = next;
                if next.is_terminal() {
                    status.completed_at = Some(Utc::now());
                }
            }
        }
        if let Some(p) = update.progress {
            status.progress = status.progress.max(p.min(100));
        }
        if let Some(m) = update.message {
            status.message = m;
        }
        if update.result_ref.is_some() {
            status.result_ref = update.result_ref;
        }
        if update.error.is_some() {
            status.error = update.error;
        }
        if update.remediation.is_some() {
            status.remediation = update.remediation;
        }
        status.updated_at = Utc::now();

        self.write(&status)?;
        debug!(
            session = %session_id,
            status = %status.task_status,
            progress = status.progress,
            "status updated"
        );
        Ok(status)
    }

    fn write(&self, status: &SessionStatus) -> Result<()> {
        let path = self.workspace.handle(&status.session_id).status_path;
        let data = serde_json::to_string_pretty(status)?;
        atomic_write(&path, data.as_bytes())
    }
}
