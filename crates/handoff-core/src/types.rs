use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{HandoffError, Result};

// ---------------------------------------------------------------------------
// SessionId
// ---------------------------------------------------------------------------

/// Stable identifier of a session, derived from the caller's identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Derive the session id for an identity such as `[email, phone]`.
    ///
    /// Parts are trimmed and lowercased before hashing, so cosmetic
    /// differences in caller input address the same session.
    pub fn from_identity<S: AsRef<str>>(parts: &[S]) -> Self {
        let normalized: Vec<String> = parts
            .iter()
            .map(|p| p.as_ref().trim().to_lowercase())
            .collect();
        let digest = Sha256::digest(normalized.join("\n").as_bytes());
        let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
        SessionId(format!("s-{hex}"))
    }

    /// Accept an id supplied over the wire. Only `[a-z0-9_-]` is allowed so
    /// the id is safe as a directory and tmux session name.
    pub fn parse(raw: &str) -> Result<Self> {
        let ok = !raw.is_empty()
            && raw.len() <= 64
            && raw
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
        if !ok {
            return Err(HandoffError::SessionNotFound(format!(
                "'{raw}' is not a valid session id"
            )));
        }
        Ok(SessionId(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Name of the tmux session hosting this session's assistant.
    pub fn context_name(&self) -> String {
        format!("handoff-{}", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// TaskId
// ---------------------------------------------------------------------------

static TASK_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Task identifier, unique within a session even for tasks created in the
/// same millisecond: `<utc timestamp>-<millis>-<counter>-<random>`. The
/// counter is printed in full and never wraps within a process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn generate() -> Self {
        let now = Utc::now();
        let seq = TASK_COUNTER.fetch_add(1, Ordering::Relaxed);
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(6)
            .map(|b| char::from(b).to_ascii_lowercase())
            .collect();
        TaskId(format!(
            "{}-{:03}-{:04}-{}",
            now.format("%Y%m%dT%H%M%S"),
            now.timestamp_subsec_millis(),
            seq,
            suffix
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        TaskId(s.to_string())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Dispatched,
    Acknowledged,
    Working,
    Done,
    Failed,
    TimedOut,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Dispatched => "dispatched",
            TaskStatus::Acknowledged => "acknowledged",
            TaskStatus::Working => "working",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
            TaskStatus::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Done | TaskStatus::Failed | TaskStatus::TimedOut
        )
    }

    /// Dispatched but not yet finished; at most one such task per session.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            TaskStatus::Dispatched | TaskStatus::Acknowledged | TaskStatus::Working
        )
    }

    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, Dispatched | Failed) => true,
            (Dispatched, Acknowledged | Failed | TimedOut) => true,
            (Acknowledged, Working | Done | Failed | TimedOut) => true,
            (Working, Working | Done | Failed | TimedOut) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// One unit of work submitted into a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub session_id: SessionId,
    pub payload: String,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    pub progress: u8,
    pub error: Option<String>,
}

impl Task {
    /// Move to `next`, refusing transitions the lifecycle does not allow.
    pub fn transition(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(HandoffError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Record progress; values below the current maximum are ignored.
    pub fn record_progress(&mut self, value: u8) {
        self.progress = self.progress.max(value.min(100));
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Event type. The vocabulary is open: unrecognised names are carried as
/// [`EventKind::Other`] and forwarded unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    Ack,
    Status,
    Working,
    Progress,
    Finding,
    Phase,
    Deployed,
    Summary,
    Done,
    Error,
    Other(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Ack => "ack",
            EventKind::Status => "status",
            EventKind::Working => "working",
            EventKind::Progress => "progress",
            EventKind::Finding => "finding",
            EventKind::Phase => "phase",
            EventKind::Deployed => "deployed",
            EventKind::Summary => "summary",
            EventKind::Done => "done",
            EventKind::Error => "error",
            EventKind::Other(name) => name,
        }
    }

    /// Ack, done, and error drive the task state machine.
    pub fn is_terminal_signal(&self) -> bool {
        matches!(self, EventKind::Ack | EventKind::Done | EventKind::Error)
    }
}

impl From<String> for EventKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "ack" | "acknowledged" => EventKind::Ack,
            "status" => EventKind::Status,
            "working" => EventKind::Working,
            "progress" | "percent" => EventKind::Progress,
            "finding" => EventKind::Finding,
            "phase" => EventKind::Phase,
            "deployed" => EventKind::Deployed,
            "summary" | "summary_ready" => EventKind::Summary,
            "done" => EventKind::Done,
            "error" => EventKind::Error,
            _ => EventKind::Other(s),
        }
    }
}

impl From<&str> for EventKind {
    fn from(s: &str) -> Self {
        EventKind::from(s.to_string())
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Other(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventData {
    Number(f64),
    Text(String),
}

impl EventData {
    /// Interpret the payload as a percentage: `42`, `42.5`, `"42"`, `"42%"`.
    pub fn as_percent(&self) -> Option<u8> {
        let value = match self {
            EventData::Number(n) => *n,
            EventData::Text(s) => s.trim().trim_end_matches('%').trim().parse::<f64>().ok()?,
        };
        if !value.is_finite() {
            return None;
        }
        Some(value.clamp(0.0, 100.0).round() as u8)
    }

    pub fn text(&self) -> String {
        match self {
            EventData::Number(n) => n.to_string(),
            EventData::Text(s) => s.clone(),
        }
    }
}

impl From<&str> for EventData {
    fn from(s: &str) -> Self {
        EventData::Text(s.to_string())
    }
}

impl From<f64> for EventData {
    fn from(n: f64) -> Self {
        EventData::Number(n)
    }
}

/// A published event, as stored in history and sent to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub data: Option<EventData>,
    pub session_id: SessionId,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default)]
    pub seq: u64,
}

impl Event {
    pub fn data_text(&self) -> String {
        self.data.as_ref().map(EventData::text).unwrap_or_default()
    }
}

/// What a producer sends; the channel fills in session, sequence, and
/// (if absent) the timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventInput {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default)]
    pub data: Option<EventData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl EventInput {
    pub fn new(kind: impl Into<EventKind>) -> Self {
        Self {
            kind: kind.into(),
            data: None,
            task_id: None,
            timestamp: None,
        }
    }

    pub fn with_data(mut self, data: impl Into<EventData>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn for_task(mut self, task_id: &TaskId) -> Self {
        self.task_id = Some(task_id.clone());
        self
    }
}

// ---------------------------------------------------------------------------
// SessionMeta
// ---------------------------------------------------------------------------

/// Persisted facts about a session, stored as `session.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub session_id: SessionId,
    pub context: String,
    pub created_at: DateTime<Utc>,
}

impl SessionMeta {
    pub fn new(session_id: &SessionId) -> Self {
        Self {
            session_id: session_id.clone(),
            context: session_id.context_name(),
            created_at: Utc::now(),
        }
    }

    pub fn is_stale(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
        now - self.created_at >= max_age
    }
}
