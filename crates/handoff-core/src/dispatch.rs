use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::error::{HandoffError, Result};
use crate::io::write_new;
use crate::process::{ProcessController, ProcessHandle};
use crate::types::{SessionId, Task, TaskId, TaskStatus};
use crate::workspace::{WorkspaceHandle, WorkspaceManager};

/// The one-line instruction typed into the assistant for `task`.
///
/// It names the task, both absolute paths, and says the task is new so the
/// assistant does not answer from an earlier conversation turn.
pub fn instruction_for(task: &Task) -> String {
    format!(
        "New task {}: read {} and follow it, then write your complete result to {} (this is a new, distinct task; do not reuse earlier answers)",
        task.id,
        task.input_path.display(),
        task.output_path.display()
    )
}

/// Task file contents: the caller's payload plus how to report back.
pub fn task_document(
    task_id: &TaskId,
    session_id: &SessionId,
    payload: &str,
    output: &Path,
    public_url: &str,
) -> String {
    let url = public_url.trim_end_matches('/');
    format!(
        "{payload}\n\n\
         ---\n\
         Task: {task_id}\n\
         Session: {session_id}\n\
         Result file: {output}\n\n\
         Reporting:\n\
         - As soon as you start, run: handoff emit --session {session_id} --task {task_id} --type ack\n\
         - Report progress with: handoff emit --session {session_id} --task {task_id} --type progress --data <0-100>\n\
         - Write your complete result to {output}, then run: handoff emit --session {session_id} --task {task_id} --type done\n\
         - If you cannot finish, run: handoff emit --session {session_id} --task {task_id} --type error --data \"<what went wrong>\"\n\
         - Without the CLI, POST JSON {{\"type\": \"ack\", \"taskId\": \"{task_id}\"}} to {url}/api/sessions/{session_id}/events\n",
        output = output.display(),
    )
}

pub struct Dispatcher {
    workspace: WorkspaceManager,
    public_url: String,
}

impl Dispatcher {
    pub fn new(workspace: WorkspaceManager, public_url: impl Into<String>) -> Self {
        Self {
            workspace,
            public_url: public_url.into(),
        }
    }

    /// Allocate paths and write the task file. The file's modification time
    /// becomes the task's dispatch mark, so the result file is later compared
    /// against the same filesystem clock.
    pub fn prepare(&self, ws: &WorkspaceHandle, payload: &str) -> Result<Task> {
        if payload.trim().is_empty() {
            return Err(HandoffError::InvalidInstruction("payload is empty".into()));
        }
        let paths = self.workspace.new_task_paths(ws);
        let doc = task_document(
            &paths.task_id,
            &ws.session_id,
            payload,
            &paths.output,
            &self.public_url,
        );
        write_new(&paths.input, doc.as_bytes())?;
        let mark = std::fs::metadata(&paths.input)
            .and_then(|m| m.modified())
            .map_err(|e| HandoffError::workspace(&paths.input, e))?;

        Ok(Task {
            id: paths.task_id,
            session_id: ws.session_id.clone(),
            payload: payload.to_string(),
            input_path: paths.input,
            output_path: paths.output,
            created_at: Utc::now(),
            dispatched_at: Some(DateTime::<Utc>::from(mark)),
            status: TaskStatus::Pending,
            progress: 0,
            error: None,
        })
    }

    /// Type the task's instruction into the running assistant.
    pub async fn send(
        &self,
        process: &ProcessController,
        handle: &ProcessHandle,
        task: &mut Task,
    ) -> Result<()> {
        let instruction = instruction_for(task);
        process.send(handle, &instruction).await?;
        task.transition(TaskStatus::Dispatched)?;
        info!(session = %task.session_id, task = %task.id, "task dispatched");
        Ok(())
    }

    /// Prepare and send in one step.
    pub async fn dispatch(
        &self,
        process: &ProcessController,
        handle: &ProcessHandle,
        ws: &WorkspaceHandle,
        payload: &str,
    ) -> Result<Task> {
        let mut task = self.prepare(ws, payload)?;
        self.send(process, handle, &mut task).await?;
        Ok(task)
    }
}
