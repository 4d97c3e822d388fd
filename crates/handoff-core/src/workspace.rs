//! On-disk layout of a session.
//!
//! ```text
//! <sessions_dir>/<session-id>/
//!     session.yaml      SessionMeta
//!     status.json       SessionStatus (atomic replace)
//!     tasks/<task>.md   task payloads, never overwritten
//!     results/<task>.md written by the assistant
//!     logs/             coordinator transcript
//! ```

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{HandoffError, Result};
use crate::io::{atomic_write, ensure_dir};
use crate::types::{SessionId, SessionMeta, TaskId};

pub const TASKS_DIR: &str = "tasks";
pub const RESULTS_DIR: &str = "results";
pub const LOGS_DIR: &str = "logs";
pub const STATUS_FILE: &str = "status.json";
pub const META_FILE: &str = "session.yaml";

/// Resolved paths of one session's directory tree.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkspaceHandle {
    pub session_id: SessionId,
    pub root: PathBuf,
    pub tasks_dir: PathBuf,
    pub results_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub status_path: PathBuf,
    pub meta_path: PathBuf,
}

impl WorkspaceHandle {
    fn new(sessions_dir: &Path, session_id: &SessionId) -> Self {
        let root = sessions_dir.join(session_id.as_str());
        Self {
            session_id: session_id.clone(),
            tasks_dir: root.join(TASKS_DIR),
            results_dir: root.join(RESULTS_DIR),
            logs_dir: root.join(LOGS_DIR),
            status_path: root.join(STATUS_FILE),
            meta_path: root.join(META_FILE),
            root,
        }
    }

    pub fn transcript_path(&self) -> PathBuf {
        self.logs_dir.join("coordinator.log")
    }
}

/// Input and output locations allocated for one task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskPaths {
    pub task_id: TaskId,
    pub input: PathBuf,
    pub output: PathBuf,
}

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    sessions_dir: PathBuf,
}

impl WorkspaceManager {
    pub fn new(sessions_dir: impl Into<PathBuf>) -> Self {
        Self {
            sessions_dir: sessions_dir.into(),
        }
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    /// Paths for `session_id` without touching the filesystem.
    pub fn handle(&self, session_id: &SessionId) -> WorkspaceHandle {
        WorkspaceHandle::new(&self.sessions_dir, session_id)
    }

    /// Create the session tree if needed. Idempotent.
    pub fn ensure(&self, session_id: &SessionId) -> Result<WorkspaceHandle> {
        let handle = self.handle(session_id);
        for dir in [&handle.tasks_dir, &handle.results_dir, &handle.logs_dir] {
            ensure_dir(dir)?;
        }
        let root = handle
            .root
            .canonicalize()
            .map_err(|e| HandoffError::workspace(&handle.root, e))?;
        debug!(session = %session_id, root = %root.display(), "workspace ready");
        Ok(WorkspaceHandle::new(
            root.parent().unwrap_or(&self.sessions_dir),
            session_id,
        ))
    }

    /// Remove the session tree and create it again, empty.
    pub fn reset(&self, session_id: &SessionId) -> Result<WorkspaceHandle> {
        let handle = self.handle(session_id);
        if handle.root.exists() {
            std::fs::remove_dir_all(&handle.root)
                .map_err(|e| HandoffError::workspace(&handle.root, e))?;
            info!(session = %session_id, "workspace reset");
        }
        self.ensure(session_id)
    }

    /// Allocate fresh, absolute paths for a new task. The input file is not
    /// created here; the dispatcher writes it with `create_new`.
    pub fn new_task_paths(&self, handle: &WorkspaceHandle) -> TaskPaths {
        loop {
            let task_id = TaskId::generate();
            let input = handle.tasks_dir.join(format!("{task_id}.md"));
            let output = handle.results_dir.join(format!("{task_id}.md"));
            if !input.exists() && !output.exists() {
                return TaskPaths {
                    task_id,
                    input,
                    output,
                };
            }
        }
    }

    pub fn load_meta(&self, session_id: &SessionId) -> Result<Option<SessionMeta>> {
        let path = self.handle(session_id).meta_path;
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&path)?;
        Ok(Some(serde_yaml::from_str(&data)?))
    }

    pub fn save_meta(&self, meta: &SessionMeta) -> Result<()> {
        let path = self.handle(&meta.session_id).meta_path;
        let data = serde_yaml::to_string(meta)?;
        atomic_write(&path, data.as_bytes())
    }

    /// Session ids with a directory under the sessions root.
    pub fn list(&self) -> Result<Vec<SessionId>> {
        if !self.sessions_dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        let entries = std::fs::read_dir(&self.sessions_dir)
            .map_err(|e| HandoffError::workspace(&self.sessions_dir, e))?;
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(id) = SessionId::parse(name) {
                    ids.push(id);
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}
