//! Session coordinator: one entry point that takes an identity and a payload
//! and drives the task to a terminal state.
//!
//! Per submission: resolve the session, reuse or (re)create its execution
//! context, write the task file, arm the completion watch, deliver the
//! instruction, then wait on events. `done` is only trusted once the result
//! file passes the freshness check. Every transition lands in the status
//! store so remote observers see progress without talking to the assistant.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use chrono::Utc;
use serde::{Serialize, Serializer};
use tokio::sync::{watch, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{BusyPolicy, HandoffConfig};
use crate::dispatch::Dispatcher;
use crate::error::{HandoffError, Result, TaskError};
use crate::freshness;
use crate::io::append_text;
use crate::notifier::{AckOutcome, Notifier, TaskWatch, TaskSignals, TerminalSignal};
use crate::process::{ProcessController, ProcessHandle};
use crate::status::{SessionStatus, StatusStore, StatusUpdate};
use crate::terminal::Terminal;
use crate::types::{SessionId, SessionMeta, Task, TaskId, TaskStatus};
use crate::workspace::{WorkspaceHandle, WorkspaceManager};

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Done {
        result_path: PathBuf,
        content: String,
        summary: Option<String>,
    },
    Failed(TaskError),
    TimedOut(TaskError),
}

impl TaskOutcome {
    pub fn is_done(&self) -> bool {
        matches!(self, TaskOutcome::Done { .. })
    }

    pub fn error(&self) -> Option<&TaskError> {
        match self {
            TaskOutcome::Done { .. } => None,
            TaskOutcome::Failed(e) | TaskOutcome::TimedOut(e) => Some(e),
        }
    }
}

/// What `submit` returns for a task that reached a terminal state.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub session_id: SessionId,
    pub task: Task,
    pub outcome: TaskOutcome,
}

impl TaskReport {
    pub fn content(&self) -> Option<&str> {
        match &self.outcome {
            TaskOutcome::Done { content, .. } => Some(content),
            _ => None,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReportView<'a> {
    session_id: &'a SessionId,
    task_id: &'a TaskId,
    status: TaskStatus,
    progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    result_path: Option<&'a Path>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    remediation: Option<&'static str>,
}

impl Serialize for TaskReport {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let (result_path, content, summary) = match &self.outcome {
            TaskOutcome::Done {
                result_path,
                content,
                summary,
            } => (
                Some(result_path.as_path()),
                Some(content.as_str()),
                summary.as_deref(),
            ),
            _ => (None, None, None),
        };
        let err = self.outcome.error();
        ReportView {
            session_id: &self.session_id,
            task_id: &self.task.id,
            status: self.task.status,
            progress: self.task.progress,
            result_path,
            content,
            summary,
            error: err.map(ToString::to_string),
            remediation: err.map(TaskError::remediation),
        }
        .serialize(serializer)
    }
}

/// Handle to a task submitted with [`Coordinator::submit_async`].
pub struct TaskTicket {
    pub session_id: SessionId,
    handle: JoinHandle<Result<TaskReport>>,
}

impl TaskTicket {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn wait(self) -> Result<TaskReport> {
        self.handle.await.map_err(|e| {
            HandoffError::Io(std::io::Error::other(format!("task runner stopped: {e}")))
        })?
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Per-session serialization point. Holding `process` means owning the
/// session; at most one task is in flight per session.
struct SessionSlot {
    process: Arc<AsyncMutex<Option<ProcessHandle>>>,
    current: Mutex<Option<TaskId>>,
    recheck: AtomicBool,
    /// Submissions holding or queued for `process`.
    admitted: AtomicUsize,
    cancel: watch::Sender<CancelRequest>,
}

/// Each cancel bumps `epoch`; a submission admitted under an older epoch
/// is cancelled.
#[derive(Debug, Clone, Default)]
struct CancelRequest {
    epoch: u64,
    reason: String,
}

impl Default for SessionSlot {
    fn default() -> Self {
        Self {
            process: Arc::default(),
            current: Mutex::new(None),
            recheck: AtomicBool::new(false),
            admitted: AtomicUsize::new(0),
            cancel: watch::Sender::new(CancelRequest::default()),
        }
    }
}

impl SessionSlot {
    fn set_current(&self, task: Option<TaskId>) {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = task;
    }

    fn current(&self) -> Option<TaskId> {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn admit(self: &Arc<Self>) -> Admission {
        self.admitted.fetch_add(1, Ordering::SeqCst);
        Admission {
            slot: Arc::clone(self),
            epoch: self.cancel.borrow().epoch,
        }
    }

    fn request_cancel(&self, reason: &str) {
        self.cancel.send_modify(|req| {
            req.epoch += 1;
            req.reason = reason.to_string();
        });
    }
}

/// A submission's claim on its session, from admission until it finishes
/// or is dropped.
struct Admission {
    slot: Arc<SessionSlot>,
    epoch: u64,
}

impl Admission {
    /// The cancel reason, if the session was cancelled after admission.
    fn cancelled(&self) -> Option<String> {
        let req = self.slot.cancel.borrow();
        (req.epoch > self.epoch).then(|| req.reason.clone())
    }

    /// Resolves with the reason once a cancel covers this submission.
    async fn until_cancelled(&self) -> String {
        let mut rx = self.slot.cancel.subscribe();
        let epoch = self.epoch;
        let reason = rx
            .wait_for(|req| req.epoch > epoch)
            .await
            .ok()
            .map(|req| req.reason.clone());
        match reason {
            Some(reason) => reason,
            None => std::future::pending().await,
        }
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.slot.admitted.fetch_sub(1, Ordering::SeqCst);
    }
}

type SessionGuard = OwnedMutexGuard<Option<ProcessHandle>>;

pub struct Coordinator {
    config: HandoffConfig,
    workspace: WorkspaceManager,
    process: ProcessController,
    dispatcher: Dispatcher,
    notifier: Arc<Notifier>,
    status: Arc<StatusStore>,
    slots: Mutex<HashMap<SessionId, Arc<SessionSlot>>>,
}

impl Coordinator {
    pub fn new(
        config: HandoffConfig,
        sessions_dir: PathBuf,
        terminal: Arc<dyn Terminal>,
        notifier: Arc<Notifier>,
    ) -> Result<Self> {
        config.ensure_valid()?;
        let workspace = WorkspaceManager::new(sessions_dir);
        let process = ProcessController::new(
            terminal,
            config.assistant.clone(),
            config.timing.clone(),
        );
        let dispatcher = Dispatcher::new(workspace.clone(), config.server.public_url.clone());
        let status = Arc::new(StatusStore::new(workspace.clone()));
        Ok(Self {
            config,
            workspace,
            process,
            dispatcher,
            notifier,
            status,
            slots: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &HandoffConfig {
        &self.config
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.notifier
    }

    pub fn status_store(&self) -> &Arc<StatusStore> {
        &self.status
    }

    pub fn status(&self, session_id: &SessionId) -> Result<Option<SessionStatus>> {
        self.status.get(session_id)
    }

    pub fn sessions(&self) -> Result<Vec<SessionId>> {
        self.workspace.list()
    }

    /// Whether the session has events or a workspace on disk.
    pub fn knows(&self, session_id: &SessionId) -> bool {
        self.notifier.contains(session_id) || self.workspace.handle(session_id).root.is_dir()
    }

    /// The task currently in flight in `session_id`, if any.
    pub fn in_flight(&self, session_id: &SessionId) -> Option<TaskId> {
        self.existing_slot(session_id).and_then(|s| s.current())
    }

    /// Whether the session must pass a probe before its next task, e.g.
    /// after an acknowledgement or completion timeout.
    pub fn needs_recheck(&self, session_id: &SessionId) -> bool {
        self.existing_slot(session_id)
            .is_some_and(|s| s.recheck.load(Ordering::SeqCst))
    }

    fn slot(&self, session_id: &SessionId) -> Arc<SessionSlot> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(session_id.clone()).or_default().clone()
    }

    fn existing_slot(&self, session_id: &SessionId) -> Option<Arc<SessionSlot>> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.get(session_id).cloned()
    }

    fn try_claim(&self, slot: &SessionSlot, session_id: &SessionId) -> Result<SessionGuard> {
        slot.process
            .clone()
            .try_lock_owned()
            .map_err(|_| HandoffError::Busy(session_id.to_string()))
    }

    // ─── Submission ───────────────────────────────────────────────────────

    /// Run `payload` in the session for `identity` and wait for the outcome.
    ///
    /// Task-level failures (timeouts, remote errors, missing results) come
    /// back as `Ok` with a failed [`TaskOutcome`]. `Err` means the session
    /// itself could not be used, or it was busy under the reject policy.
    pub async fn submit<S: AsRef<str>>(&self, identity: &[S], payload: &str) -> Result<TaskReport> {
        let session_id = SessionId::from_identity(identity);
        self.submit_to(&session_id, payload).await
    }

    pub async fn submit_to(&self, session_id: &SessionId, payload: &str) -> Result<TaskReport> {
        let slot = self.slot(session_id);
        let admission = slot.admit();
        let guard = match self.config.coordinator.on_busy {
            BusyPolicy::Reject => self.try_claim(&slot, session_id)?,
            BusyPolicy::Queue => slot.process.clone().lock_owned().await,
        };
        self.run(&admission, guard, session_id, payload).await
    }

    /// Start the task in the background. Under the reject policy a busy
    /// session fails here, before anything is spawned.
    pub fn submit_async<S: AsRef<str>>(
        self: &Arc<Self>,
        identity: &[S],
        payload: &str,
    ) -> Result<TaskTicket> {
        let session_id = SessionId::from_identity(identity);
        let slot = self.slot(&session_id);
        let admission = slot.admit();
        let claimed = match self.config.coordinator.on_busy {
            BusyPolicy::Reject => Some(self.try_claim(&slot, &session_id)?),
            BusyPolicy::Queue => None,
        };

        let this = Arc::clone(self);
        let payload = payload.to_string();
        let sid = session_id.clone();
        let handle = tokio::spawn(async move {
            let guard = match claimed {
                Some(g) => g,
                None => slot.process.clone().lock_owned().await,
            };
            this.run(&admission, guard, &sid, &payload).await
        });
        Ok(TaskTicket { session_id, handle })
    }

    /// Cancel every submission for the session that is pending, queued or
    /// in flight: kill the context and resolve their waits as cancelled.
    /// Returns false when the session had nothing to cancel.
    pub async fn cancel(&self, session_id: &SessionId, reason: &str) -> Result<bool> {
        let Some(slot) = self.existing_slot(session_id) else {
            return Ok(false);
        };
        if slot.admitted.load(Ordering::SeqCst) == 0 {
            return Ok(false);
        }
        let task_id = slot.current();
        info!(session = %session_id, task = ?task_id, reason, "cancelling task");
        slot.request_cancel(reason);
        self.process.kill_context(&session_id.context_name()).await?;
        self.notifier.interrupt(session_id, reason);
        Ok(true)
    }

    async fn run(
        &self,
        admission: &Admission,
        mut guard: SessionGuard,
        session_id: &SessionId,
        payload: &str,
    ) -> Result<TaskReport> {
        let slot = &admission.slot;
        let result = self
            .run_task(admission, &mut guard, session_id, payload)
            .await;
        slot.set_current(None);
        if let Err(e) = &result {
            if e.is_session_fatal() {
                error!(session = %session_id, error = %e, "session unusable; it will be recreated");
                if let Some(handle) = guard.take() {
                    let _ = self.process.kill(&handle).await;
                }
            }
        }
        result
    }

    async fn run_task(
        &self,
        admission: &Admission,
        process: &mut Option<ProcessHandle>,
        session_id: &SessionId,
        payload: &str,
    ) -> Result<TaskReport> {
        let slot = &*admission.slot;
        if let Some(reason) = admission.cancelled() {
            return self.abandon(process, session_id, payload, reason).await;
        }

        let acquired = tokio::select! {
            acquired = self.acquire(slot, process, session_id) => acquired?,
            reason = admission.until_cancelled() => {
                return self.abandon(process, session_id, payload, reason).await;
            }
        };
        let (handle, ws) = acquired;

        let mut task = self.dispatcher.prepare(&ws, payload)?;
        self.status.begin_task(session_id, &task.id)?;
        self.transcript(&ws, &task, "created");

        let mut watch = self.notifier.arm(session_id, &task.id);
        slot.set_current(Some(task.id.clone()));

        if let Some(reason) = admission.cancelled() {
            info!(session = %session_id, task = %task.id, "cancelled before dispatch");
            *process = None;
            let outcome = self.finish(&mut task, TaskError::Cancelled(reason))?;
            self.transcript(&ws, &task, &outcome_line(&outcome));
            return Ok(TaskReport {
                session_id: session_id.clone(),
                task,
                outcome,
            });
        }

        if let Err(e) = self.dispatcher.send(&self.process, &handle, &mut task).await {
            let cancelled = match watch.snapshot().terminal {
                Some(TerminalSignal::Cancelled(reason)) => Some(reason),
                _ => admission.cancelled(),
            };
            if let Some(reason) = cancelled {
                // Cancelled mid-delivery; the kill is what broke the send.
                *process = None;
                let outcome = self.finish(&mut task, TaskError::Cancelled(reason))?;
                self.transcript(&ws, &task, &outcome_line(&outcome));
                return Ok(TaskReport {
                    session_id: session_id.clone(),
                    task,
                    outcome,
                });
            }
            task.error = Some(e.to_string());
            self.status.update(
                session_id,
                StatusUpdate::status(TaskStatus::Failed).failure(e.to_string(), e.remediation()),
            )?;
            self.transcript(&ws, &task, &format!("delivery failed: {e}"));
            return Err(e);
        }
        self.status.update(
            session_id,
            StatusUpdate::status(TaskStatus::Dispatched).message("instruction delivered"),
        )?;
        self.transcript(&ws, &task, "dispatched");

        let outcome = self.observe(slot, process, &mut watch, &mut task).await?;
        self.transcript(&ws, &task, &outcome_line(&outcome));
        info!(
            session = %session_id,
            task = %task.id,
            status = %task.status,
            "task finished"
        );
        Ok(TaskReport {
            session_id: session_id.clone(),
            task,
            outcome,
        })
    }

    /// Close out a submission cancelled before its instruction was sent.
    /// The task is still recorded so observers see why nothing ran.
    async fn abandon(
        &self,
        process: &mut Option<ProcessHandle>,
        session_id: &SessionId,
        payload: &str,
        reason: String,
    ) -> Result<TaskReport> {
        *process = None;
        if let Err(e) = self.process.kill_context(&session_id.context_name()).await {
            warn!(session = %session_id, error = %e, "kill after cancel failed");
        }

        let ws = self.workspace.ensure(session_id)?;
        let mut task = self.dispatcher.prepare(&ws, payload)?;
        self.status.begin_task(session_id, &task.id)?;
        info!(session = %session_id, task = %task.id, reason = %reason, "cancelled before dispatch");
        let outcome = self.finish(&mut task, TaskError::Cancelled(reason))?;
        self.transcript(&ws, &task, &outcome_line(&outcome));
        Ok(TaskReport {
            session_id: session_id.clone(),
            task,
            outcome,
        })
    }

    // ─── Session acquisition ──────────────────────────────────────────────

    async fn acquire(
        &self,
        slot: &SessionSlot,
        process: &mut Option<ProcessHandle>,
        session_id: &SessionId,
    ) -> Result<(ProcessHandle, WorkspaceHandle)> {
        let policy = &self.config.session;
        let meta = match self.workspace.load_meta(session_id) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(session = %session_id, error = %e, "unreadable session metadata; recreating");
                None
            }
        };

        if meta
            .as_ref()
            .is_some_and(|m| m.is_stale(Utc::now(), policy.max_age()))
        {
            info!(session = %session_id, max_age_days = policy.max_age_days, "session expired; starting over");
            if let Some(old) = process.take() {
                let _ = self.process.kill(&old).await;
            }
            let ws = self.workspace.reset(session_id)?;
            return self.launch(slot, process, session_id, ws, true).await;
        }

        let ws = self.workspace.ensure(session_id)?;
        if let Some(meta) = &meta {
            let handle = match process.clone() {
                Some(h) => h,
                None => self.process.attach(session_id, &ws.root, meta.created_at),
            };
            if self.process.is_alive(&handle).await {
                let recheck = slot.recheck.load(Ordering::SeqCst);
                if !policy.probe_on_reuse && !recheck {
                    debug!(session = %session_id, "reusing execution context");
                    *process = Some(handle.clone());
                    return Ok((handle, ws));
                }
                match self.process.probe(&handle).await {
                    Ok(()) => {
                        debug!(session = %session_id, recheck, "reusing probed execution context");
                        slot.recheck.store(false, Ordering::SeqCst);
                        *process = Some(handle.clone());
                        return Ok((handle, ws));
                    }
                    Err(e) if e.is_session_fatal() => {
                        warn!(session = %session_id, error = %e, "reuse probe failed; recreating");
                    }
                    Err(e) => return Err(e),
                }
            } else {
                info!(session = %session_id, "execution context is gone; recreating");
            }
        }

        *process = None;
        self.launch(slot, process, session_id, ws, meta.is_none())
            .await
    }

    async fn launch(
        &self,
        slot: &SessionSlot,
        process: &mut Option<ProcessHandle>,
        session_id: &SessionId,
        ws: WorkspaceHandle,
        new_session: bool,
    ) -> Result<(ProcessHandle, WorkspaceHandle)> {
        let mut recreated = 0;
        loop {
            match self.process.start(session_id, &ws.root).await {
                Ok(handle) => {
                    if new_session {
                        self.workspace.save_meta(&SessionMeta::new(session_id))?;
                    }
                    slot.recheck.store(false, Ordering::SeqCst);
                    *process = Some(handle.clone());
                    return Ok((handle, ws));
                }
                Err(HandoffError::ProbeTimeout { .. })
                    if recreated < self.config.session.recreate_attempts =>
                {
                    recreated += 1;
                    warn!(session = %session_id, attempt = recreated, "readiness probe timed out; recreating");
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ─── Completion ───────────────────────────────────────────────────────

    async fn observe(
        &self,
        slot: &SessionSlot,
        process: &mut Option<ProcessHandle>,
        watch: &mut TaskWatch,
        task: &mut Task,
    ) -> Result<TaskOutcome> {
        let timing = &self.config.timing;
        let started = Instant::now();

        match watch.wait_ack(started + timing.ack_timeout()).await {
            AckOutcome::Acknowledged => {
                task.transition(TaskStatus::Acknowledged)?;
                self.status.update(
                    &task.session_id,
                    StatusUpdate::status(TaskStatus::Acknowledged).message("acknowledged"),
                )?;
            }
            AckOutcome::TimedOut => {
                warn!(session = %task.session_id, task = %task.id, "no acknowledgement");
                slot.recheck.store(true, Ordering::SeqCst);
                return self.finish(task, TaskError::AckTimeout(timing.ack_timeout()));
            }
            AckOutcome::Cancelled(reason) => {
                *process = None;
                return self.finish(task, TaskError::Cancelled(reason));
            }
        }

        let deadline = started + timing.completion_timeout();
        let mut seen_updates = 0;
        loop {
            let signals = watch.snapshot();
            self.record_signals(task, &signals, &mut seen_updates)?;

            if let Some(terminal) = signals.terminal {
                return match terminal {
                    TerminalSignal::Done { summary } => self.verify_result(task, summary),
                    TerminalSignal::Failed(message) => self.finish(task, TaskError::Remote(message)),
                    TerminalSignal::Cancelled(reason) => {
                        *process = None;
                        self.finish(task, TaskError::Cancelled(reason))
                    }
                };
            }

            if !watch.changed_before(deadline).await {
                if Instant::now() >= deadline {
                    warn!(session = %task.session_id, task = %task.id, "completion timeout");
                    slot.recheck.store(true, Ordering::SeqCst);
                    return self.finish(task, TaskError::CompletionTimeout(timing.completion_timeout()));
                }
                return self.finish(task, TaskError::Cancelled("task watch superseded".into()));
            }
        }
    }

    /// Mirror informational events into the task and the status record.
    fn record_signals(&self, task: &mut Task, signals: &TaskSignals, seen_updates: &mut u64) -> Result<()> {
        let progressed = signals.progress.is_some_and(|p| p > task.progress);
        if !progressed && signals.updates <= *seen_updates {
            return Ok(());
        }
        *seen_updates = signals.updates;

        let mut update = StatusUpdate::default();
        if task.status != TaskStatus::Working {
            task.transition(TaskStatus::Working)?;
            update.task_status = Some(TaskStatus::Working);
        }
        if let Some(p) = signals.progress {
            task.record_progress(p);
            update.progress = Some(p);
        }
        update.message = signals.message.clone();
        self.status.update(&task.session_id, update)?;
        Ok(())
    }

    fn verify_result(&self, task: &mut Task, summary: Option<String>) -> Result<TaskOutcome> {
        let reference = task
            .dispatched_at
            .map(SystemTime::from)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let check = freshness::check(&task.output_path, reference, self.config.result.min_bytes);
        if !check.is_fresh() {
            warn!(task = %task.id, result = %check.describe(&task.output_path), "done without a fresh result");
            return self.finish(task, TaskError::ResultIntegrity(check.describe(&task.output_path)));
        }
        let content = match std::fs::read_to_string(&task.output_path) {
            Ok(c) => c,
            Err(e) => {
                return self.finish(
                    task,
                    TaskError::ResultIntegrity(format!("{}: {e}", task.output_path.display())),
                )
            }
        };

        task.transition(TaskStatus::Done)?;
        task.record_progress(100);
        let result_ref = task.output_path.display().to_string();
        self.status.update(
            &task.session_id,
            StatusUpdate::status(TaskStatus::Done)
                .progress(100)
                .message(summary.clone().unwrap_or_else(|| "done".into()))
                .result_ref(result_ref),
        )?;
        Ok(TaskOutcome::Done {
            result_path: task.output_path.clone(),
            content,
            summary,
        })
    }

    fn finish(&self, task: &mut Task, error: TaskError) -> Result<TaskOutcome> {
        let timed_out = matches!(
            error,
            TaskError::AckTimeout(_) | TaskError::CompletionTimeout(_)
        );
        let next = if timed_out {
            TaskStatus::TimedOut
        } else {
            TaskStatus::Failed
        };
        task.transition(next)?;
        task.error = Some(error.to_string());
        self.status.update(
            &task.session_id,
            StatusUpdate::status(next)
                .message(next.as_str())
                .failure(error.to_string(), error.remediation()),
        )?;
        Ok(if timed_out {
            TaskOutcome::TimedOut(error)
        } else {
            TaskOutcome::Failed(error)
        })
    }

    fn transcript(&self, ws: &WorkspaceHandle, task: &Task, line: &str) {
        let entry = format!("{} {} {}\n", Utc::now().to_rfc3339(), task.id, line);
        if let Err(e) = append_text(&ws.transcript_path(), &entry) {
            warn!(session = %ws.session_id, error = %e, "transcript write failed");
        }
    }
}

fn outcome_line(outcome: &TaskOutcome) -> String {
    match outcome {
        TaskOutcome::Done { result_path, .. } => format!("done {}", result_path.display()),
        TaskOutcome::Failed(e) => format!("failed: {e}"),
        TaskOutcome::TimedOut(e) => format!("timed out: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{publish, publish_data, sleep_ms, FakeTerminal, Step};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        coord: Arc<Coordinator>,
        fake: Arc<FakeTerminal>,
        _dir: TempDir,
    }

    const USER: [&str; 2] = ["alice@example.com", "+15550100"];

    fn harness(tweak: impl FnOnce(&mut HandoffConfig)) -> Harness {
        let dir = TempDir::new().unwrap();
        let mut config = HandoffConfig::default();
        config.timing.init_settle_ms = 100;
        config.timing.probe_timeout_secs = 2;
        config.timing.probe_interval_ms = 50;
        config.timing.ack_timeout_secs = 30;
        config.timing.completion_timeout_secs = 120;
        config.timing.delivery_retries = 1;
        config.timing.delivery_backoff_ms = 100;
        tweak(&mut config);
        let notifier = Arc::new(Notifier::new(config.notifier.history));
        let fake = Arc::new(FakeTerminal::with_notifier(notifier.clone()));
        let coord = Coordinator::new(config, dir.path().join("sessions"), fake.clone(), notifier).unwrap();
        Harness {
            coord: Arc::new(coord),
            fake,
            _dir: dir,
        }
    }

    fn sid() -> SessionId {
        SessionId::from_identity(&USER)
    }

    fn well_behaved(fake: &FakeTerminal) {
        fake.script(|t| {
            vec![
                sleep_ms(500),
                publish("ack"),
                Step::Publish(crate::types::EventInput::new("progress").with_data(40.0)),
                sleep_ms(500),
                Step::WriteResult(format!("result {}", t.index)),
                publish("done"),
            ]
        });
    }

    fn probes_sent(fake: &FakeTerminal) -> usize {
        let probe = crate::config::AssistantConfig::default().probe_instruction;
        fake.literals().iter().filter(|l| **l == probe).count()
    }

    #[tokio::test(start_paused = true)]
    async fn successful_task_reaches_done_with_content() {
        let h = harness(|_| {});
        well_behaved(&h.fake);

        let report = h.coord.submit(&USER, "Summarize the report").await.unwrap();
        assert_eq!(report.task.status, TaskStatus::Done);
        assert_eq!(report.content(), Some("result 0"));
        assert_eq!(report.task.progress, 100);

        let status = h.coord.status(&sid()).unwrap().unwrap();
        assert_eq!(status.task_status, TaskStatus::Done);
        assert_eq!(status.progress, 100);
        assert_eq!(
            status.result_ref.as_deref(),
            Some(report.task.output_path.to_str().unwrap())
        );
        assert!(h.coord.in_flight(&sid()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn signals_published_before_the_wait_are_not_lost() {
        let h = harness(|_| {});
        // Everything happens while the coordinator is still in submit_settle.
        h.fake.script(|_| {
            vec![
                publish("ack"),
                Step::WriteResult("fast".into()),
                publish("done"),
            ]
        });
        let report = h.coord.submit(&USER, "quick").await.unwrap();
        assert_eq!(report.content(), Some("fast"));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_process_times_out_and_is_rechecked() {
        let h = harness(|c| c.session.probe_on_reuse = false);
        h.fake.script(|_| Vec::new());

        let report = h.coord.submit(&USER, "anything").await.unwrap();
        assert_eq!(report.task.status, TaskStatus::TimedOut);
        assert_eq!(
            report.outcome,
            TaskOutcome::TimedOut(TaskError::AckTimeout(Duration::from_secs(30)))
        );
        assert!(h.coord.needs_recheck(&sid()));
        let status = h.coord.status(&sid()).unwrap().unwrap();
        assert_eq!(status.task_status, TaskStatus::TimedOut);
        assert!(status.remediation.unwrap().contains("responsive"));

        let probes_before = probes_sent(&h.fake);
        well_behaved(&h.fake);
        h.coord.submit(&USER, "again").await.unwrap();
        assert_eq!(probes_sent(&h.fake), probes_before + 1);
        assert!(!h.coord.needs_recheck(&sid()));
    }

    #[tokio::test(start_paused = true)]
    async fn remote_error_is_reported_verbatim() {
        let h = harness(|_| {});
        h.fake.script(|_| vec![publish("ack"), publish_data("error", "File not found")]);

        let report = h.coord.submit(&USER, "read the missing file").await.unwrap();
        assert_eq!(report.task.status, TaskStatus::Failed);
        assert_eq!(
            report.outcome,
            TaskOutcome::Failed(TaskError::Remote("File not found".into()))
        );
        let status = h.coord.status(&sid()).unwrap().unwrap();
        assert_eq!(status.error.as_deref(), Some("File not found"));
    }

    #[tokio::test(start_paused = true)]
    async fn done_with_stale_result_is_a_failure() {
        let h = harness(|_| {});
        h.fake.script(|_| {
            vec![
                publish("ack"),
                Step::StaleResult("yesterday's answer".into()),
                publish("done"),
            ]
        });
        let report = h.coord.submit(&USER, "x").await.unwrap();
        assert_eq!(report.task.status, TaskStatus::Failed);
        match report.outcome {
            TaskOutcome::Failed(TaskError::ResultIntegrity(msg)) => {
                assert!(msg.contains("before the task was dispatched"), "{msg}")
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn done_without_result_file_is_a_failure() {
        let h = harness(|_| {});
        h.fake.script(|_| vec![publish("ack"), publish("done")]);
        let report = h.coord.submit(&USER, "x").await.unwrap();
        let err = report.outcome.error().unwrap().to_string();
        assert!(err.starts_with("result not found"), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn completion_timeout_is_distinct_from_ack_timeout() {
        let h = harness(|_| {});
        h.fake.script(|_| vec![publish("ack")]);
        let report = h.coord.submit(&USER, "x").await.unwrap();
        assert_eq!(
            report.outcome,
            TaskOutcome::TimedOut(TaskError::CompletionTimeout(Duration::from_secs(120)))
        );
        assert!(h.coord.needs_recheck(&sid()));
    }

    #[tokio::test(start_paused = true)]
    async fn working_progress_is_visible_while_in_flight() {
        let h = harness(|_| {});
        h.fake.script(|_| {
            vec![
                publish("ack"),
                Step::Publish(crate::types::EventInput::new("progress").with_data(50.0)),
                publish_data("phase", "compiling"),
                sleep_ms(10_000),
                Step::WriteResult("ok".into()),
                publish("done"),
            ]
        });
        let ticket = h.coord.submit_async(&USER, "long job").unwrap();

        let mut seen = None;
        for _ in 0..200 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if let Some(s) = h.coord.status(&sid()).unwrap() {
                if s.task_status == TaskStatus::Working {
                    seen = Some(s);
                    break;
                }
            }
        }
        let seen = seen.expect("task never reported working");
        assert_eq!(seen.progress, 50);
        assert_eq!(seen.message, "phase: compiling");

        let report = ticket.wait().await.unwrap();
        assert!(report.outcome.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn second_submission_is_rejected_while_busy() {
        let h = harness(|_| {});
        h.fake.script(|_| {
            vec![
                sleep_ms(5_000),
                publish("ack"),
                Step::WriteResult("first".into()),
                publish("done"),
            ]
        });
        let ticket = h.coord.submit_async(&USER, "first").unwrap();
        let err = h.coord.submit(&USER, "second").await.unwrap_err();
        assert!(matches!(err, HandoffError::Busy(_)));
        assert!(!err.is_session_fatal());
        assert_eq!(ticket.wait().await.unwrap().content(), Some("first"));
    }

    #[tokio::test(start_paused = true)]
    async fn queue_policy_runs_submissions_one_after_another() {
        let h = harness(|c| c.coordinator.on_busy = BusyPolicy::Queue);
        well_behaved(&h.fake);
        let a = h.coord.submit_async(&USER, "first").unwrap();
        let b = h.coord.submit_async(&USER, "second").unwrap();
        let a = a.wait().await.unwrap();
        let b = b.wait().await.unwrap();
        assert!(a.outcome.is_done() && b.outcome.is_done());
        let mut contents = vec![a.content().unwrap().to_string(), b.content().unwrap().to_string()];
        contents.sort();
        assert_eq!(contents, vec!["result 0", "result 1"]);
        assert_eq!(h.fake.creates(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_tasks_get_their_own_results() {
        let h = harness(|_| {});
        well_behaved(&h.fake);
        let first = h.coord.submit(&USER, "same payload").await.unwrap();
        let second = h.coord.submit(&USER, "same payload").await.unwrap();
        assert_ne!(first.task.output_path, second.task.output_path);
        assert_eq!(first.content(), Some("result 0"));
        assert_eq!(second.content(), Some("result 1"));
    }

    #[tokio::test(start_paused = true)]
    async fn live_session_is_reused() {
        let h = harness(|_| {});
        well_behaved(&h.fake);
        h.coord.submit(&USER, "one").await.unwrap();
        h.coord.submit(&USER, "two").await.unwrap();
        assert_eq!(h.fake.creates(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dead_context_is_recreated() {
        let h = harness(|_| {});
        well_behaved(&h.fake);
        h.coord.submit(&USER, "one").await.unwrap();
        h.fake.vanish(&sid().context_name());
        let report = h.coord.submit(&USER, "two").await.unwrap();
        assert!(report.outcome.is_done());
        assert_eq!(h.fake.creates(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_session_gets_a_fresh_workspace() {
        let h = harness(|_| {});
        well_behaved(&h.fake);
        let first = h.coord.submit(&USER, "one").await.unwrap();

        let mut meta = h.coord.workspace.load_meta(&sid()).unwrap().unwrap();
        meta.created_at = Utc::now() - chrono::Duration::days(6);
        h.coord.workspace.save_meta(&meta).unwrap();

        let second = h.coord.submit(&USER, "two").await.unwrap();
        assert!(second.outcome.is_done());
        assert_eq!(h.fake.creates(), 2);
        assert!(!first.task.output_path.exists());
        let fresh = h.coord.workspace.load_meta(&sid()).unwrap().unwrap();
        assert!(!fresh.is_stale(Utc::now(), chrono::Duration::days(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn unresponsive_process_is_a_session_error() {
        let h = harness(|c| c.session.recreate_attempts = 1);
        h.fake.set_responsive(false);
        let err = h.coord.submit(&USER, "x").await.unwrap_err();
        assert!(matches!(err, HandoffError::ProbeTimeout { .. }));
        assert!(err.is_session_fatal());
        assert_eq!(h.fake.creates(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn launch_failure_is_a_session_error() {
        let h = harness(|_| {});
        h.fake.fail_create(true);
        let err = h.coord.submit(&USER, "x").await.unwrap_err();
        assert!(matches!(err, HandoffError::Launch { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_failure_marks_task_failed_and_kills_context() {
        let h = harness(|c| c.session.probe_on_reuse = false);
        well_behaved(&h.fake);
        h.coord.submit(&USER, "one").await.unwrap();

        h.fake.fail_next_literals(100);
        let err = h.coord.submit(&USER, "two").await.unwrap_err();
        assert!(matches!(err, HandoffError::Delivery { attempts: 2, .. }));
        let status = h.coord.status(&sid()).unwrap().unwrap();
        assert_eq!(status.task_status, TaskStatus::Failed);
        assert!(h
            .fake
            .calls()
            .contains(&crate::testing::Call::Kill(sid().context_name())));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_resolves_the_wait_and_forces_recreation() {
        let h = harness(|_| {});
        h.fake.script(|t| {
            if t.index == 0 {
                vec![publish("ack"), sleep_ms(60_000)]
            } else {
                vec![publish("ack"), Step::WriteResult("after".into()), publish("done")]
            }
        });
        let ticket = h.coord.submit_async(&USER, "slow").unwrap();
        loop {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let status = h.coord.status(&sid()).unwrap();
            if status.is_some_and(|s| s.task_status == TaskStatus::Acknowledged) {
                break;
            }
        }
        assert!(h.coord.in_flight(&sid()).is_some());
        assert!(h.coord.cancel(&sid(), "caller gave up").await.unwrap());

        let report = ticket.wait().await.unwrap();
        assert_eq!(
            report.outcome,
            TaskOutcome::Failed(TaskError::Cancelled("caller gave up".into()))
        );
        assert!(!h.coord.cancel(&sid(), "nothing running").await.unwrap());

        let next = h.coord.submit(&USER, "next").await.unwrap();
        assert_eq!(next.content(), Some("after"));
        assert_eq!(h.fake.creates(), 2);
    }

    fn task_instructions(fake: &FakeTerminal) -> usize {
        fake.literals()
            .iter()
            .filter(|l| l.starts_with("New task"))
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_while_the_context_starts_stops_before_dispatch() {
        let h = harness(|c| c.timing.init_settle_ms = 5_000);
        well_behaved(&h.fake);
        let ticket = h.coord.submit_async(&USER, "never delivered").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(h.coord.in_flight(&sid()).is_none());

        assert!(h.coord.cancel(&sid(), "caller gave up").await.unwrap());
        let report = ticket.wait().await.unwrap();
        assert_eq!(
            report.outcome,
            TaskOutcome::Failed(TaskError::Cancelled("caller gave up".into()))
        );
        assert_eq!(report.task.status, TaskStatus::Failed);
        assert_eq!(task_instructions(&h.fake), 0);
        assert!(h.fake.literals().is_empty(), "{:?}", h.fake.literals());

        let status = h.coord.status(&sid()).unwrap().unwrap();
        assert_eq!(status.task_status, TaskStatus::Failed);
        assert_eq!(status.task_id.as_ref(), Some(&report.task.id));
        assert!(status.error.unwrap().contains("caller gave up"));

        // The cancel applies only to submissions that existed when it was made.
        let next = h.coord.submit(&USER, "next").await.unwrap();
        assert!(next.outcome.is_done());
        assert_eq!(task_instructions(&h.fake), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_reaches_submissions_queued_behind_the_running_one() {
        let h = harness(|c| c.coordinator.on_busy = BusyPolicy::Queue);
        h.fake.script(|t| {
            if t.index == 0 {
                vec![publish("ack"), sleep_ms(60_000)]
            } else {
                vec![publish("ack"), Step::WriteResult("after".into()), publish("done")]
            }
        });
        let running = h.coord.submit_async(&USER, "slow").unwrap();
        loop {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let status = h.coord.status(&sid()).unwrap();
            if status.is_some_and(|s| s.task_status == TaskStatus::Acknowledged) {
                break;
            }
        }
        let queued = h.coord.submit_async(&USER, "waiting its turn").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!queued.is_finished());

        assert!(h.coord.cancel(&sid(), "stop everything").await.unwrap());
        let cancelled = TaskOutcome::Failed(TaskError::Cancelled("stop everything".into()));
        assert_eq!(running.wait().await.unwrap().outcome, cancelled);
        assert_eq!(queued.wait().await.unwrap().outcome, cancelled);
        assert_eq!(task_instructions(&h.fake), 1);
        assert!(!h.coord.cancel(&sid(), "nothing left").await.unwrap());

        let next = h.coord.submit(&USER, "next").await.unwrap();
        assert_eq!(next.content(), Some("after"));
        assert_eq!(task_instructions(&h.fake), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_with_nothing_submitted_is_a_no_op() {
        let h = harness(|_| {});
        assert!(!h.coord.cancel(&sid(), "idle").await.unwrap());
        well_behaved(&h.fake);
        h.coord.submit(&USER, "x").await.unwrap();
        assert!(!h.coord.cancel(&sid(), "already finished").await.unwrap());
        assert!(h.fake.exists(&sid().context_name()).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn report_serializes_with_camel_case_fields() {
        let h = harness(|_| {});
        h.fake.script(|_| vec![publish("ack"), publish_data("error", "boom")]);
        let report = h.coord.submit(&USER, "x").await.unwrap();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"], "boom");
        assert!(json["remediation"].is_string());
        assert!(json["taskId"].is_string());
        assert!(json.get("content").is_none());
    }

    #[test]
    fn invalid_config_is_rejected_up_front() {
        let dir = TempDir::new().unwrap();
        let mut config = HandoffConfig::default();
        config.assistant.command.clear();
        let notifier = Arc::new(Notifier::new(10));
        let err = Coordinator::new(
            config,
            dir.path().to_path_buf(),
            Arc::new(FakeTerminal::new()),
            notifier,
        )
        .err()
        .unwrap();
        assert!(matches!(err, HandoffError::Config(_)));
    }
}
