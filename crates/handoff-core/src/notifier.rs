//! Completion notifier channel.
//!
//! A per-session event bus with bounded history. Producers (the assistant,
//! via `handoff emit` or the HTTP/WebSocket surface) publish typed events;
//! observers subscribe to a replay-then-live stream; the coordinator arms a
//! [`TaskWatch`] before dispatching so that acknowledgement and completion
//! are observed the instant they are published, including signals that land
//! before anyone is waiting.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt as _};
use tracing::{debug, warn};

use crate::types::{Event, EventInput, EventKind, SessionId, TaskId};

/// Tagged signals kept for tasks that have not been armed yet.
const EARLY_SIGNAL_SLOTS: usize = 16;

pub type EventStream = Pin<Box<dyn Stream<Item = Event> + Send>>;

// ─── Signals ──────────────────────────────────────────────────────────────

/// How a task ended, as far as the event channel is concerned.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalSignal {
    Done { summary: Option<String> },
    Failed(String),
    Cancelled(String),
}

/// Cumulative view of everything published for one task.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskSignals {
    pub acknowledged: bool,
    pub progress: Option<u8>,
    /// Last informational text (status, working, phase, ...).
    pub message: Option<String>,
    pub summary: Option<String>,
    /// Informational events seen since arming.
    pub updates: u64,
    /// First terminal signal wins; later ones are ignored.
    pub terminal: Option<TerminalSignal>,
}

impl TaskSignals {
    fn apply(&mut self, event: &Event) {
        let text = event.data.as_ref().map(|d| d.text());
        match &event.kind {
            EventKind::Ack => self.acknowledged = true,
            EventKind::Done => {
                self.acknowledged = true;
                let summary = text.filter(|t| !t.is_empty()).or_else(|| self.summary.clone());
                self.terminal.get_or_insert(TerminalSignal::Done { summary });
            }
            EventKind::Error => {
                self.acknowledged = true;
                let message = text
                    .filter(|t| !t.is_empty())
                    .unwrap_or_else(|| "the assistant reported an error without details".into());
                self.terminal.get_or_insert(TerminalSignal::Failed(message));
            }
            EventKind::Progress => {
                self.updates += 1;
                if let Some(p) = event.data.as_ref().and_then(|d| d.as_percent()) {
                    self.progress = Some(self.progress.map_or(p, |cur| cur.max(p)));
                }
            }
            EventKind::Summary => {
                self.updates += 1;
                self.summary = text;
            }
            _ => {
                self.updates += 1;
                if let Some(t) = text {
                    self.message = Some(format!("{}: {t}", event.kind));
                }
            }
        }
    }

    fn is_relevant(kind: &EventKind) -> bool {
        !matches!(kind, EventKind::Other(_) | EventKind::Finding | EventKind::Deployed)
            || kind.is_terminal_signal()
    }
}

/// Result of waiting for acknowledgement.
#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    Acknowledged,
    Cancelled(String),
    TimedOut,
}

/// Result of waiting for a terminal event. A timeout is distinct from an
/// error reported by the assistant.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalOutcome {
    Done { summary: Option<String> },
    Failed(String),
    Cancelled(String),
    TimedOut,
}

impl From<TerminalSignal> for TerminalOutcome {
    fn from(signal: TerminalSignal) -> Self {
        match signal {
            TerminalSignal::Done { summary } => TerminalOutcome::Done { summary },
            TerminalSignal::Failed(m) => TerminalOutcome::Failed(m),
            TerminalSignal::Cancelled(r) => TerminalOutcome::Cancelled(r),
        }
    }
}

// ─── Channel ──────────────────────────────────────────────────────────────

struct Armed {
    task_id: TaskId,
    tx: watch::Sender<TaskSignals>,
}

struct ChannelInner {
    history: VecDeque<Event>,
    next_seq: u64,
    armed: Option<Armed>,
    early: VecDeque<(TaskId, TaskSignals)>,
}

struct Channel {
    inner: Mutex<ChannelInner>,
    tx: broadcast::Sender<Event>,
}

impl Channel {
    fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(16));
        Self {
            inner: Mutex::new(ChannelInner {
                history: VecDeque::with_capacity(capacity.min(1024)),
                next_seq: 0,
                armed: None,
                early: VecDeque::new(),
            }),
            tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChannelInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ─── Notifier ─────────────────────────────────────────────────────────────

pub struct Notifier {
    capacity: usize,
    channels: Mutex<HashMap<SessionId, Arc<Channel>>>,
}

impl Notifier {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            capacity: history_capacity.max(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn channel(&self, session_id: &SessionId) -> Arc<Channel> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(Channel::new(self.capacity)))
            .clone()
    }

    /// Lookup without registering. Reads go through here so unknown ids
    /// never grow the channel map.
    fn existing(&self, session_id: &SessionId) -> Option<Arc<Channel>> {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels.get(session_id).cloned()
    }

    /// True once anything has published to, subscribed to or armed the session.
    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.existing(session_id).is_some()
    }

    /// Append an event to the session's history, fan it out to subscribers,
    /// and route it to the armed task. Returns the stored event.
    pub fn publish(&self, session_id: &SessionId, input: EventInput) -> Event {
        let channel = self.channel(session_id);
        let mut inner = channel.lock();

        inner.next_seq += 1;
        let event = Event {
            kind: input.kind,
            data: input.data,
            session_id: session_id.clone(),
            timestamp: input.timestamp.unwrap_or_else(Utc::now),
            task_id: input.task_id,
            seq: inner.next_seq,
        };

        inner.history.push_back(event.clone());
        while inner.history.len() > self.capacity {
            inner.history.pop_front();
        }

        let routed = match &inner.armed {
            Some(armed)
                if event.task_id.is_none() || event.task_id.as_ref() == Some(&armed.task_id) =>
            {
                armed.tx.send_modify(|s| s.apply(&event));
                true
            }
            _ => false,
        };
        if !routed && TaskSignals::is_relevant(&event.kind) {
            if let Some(task_id) = &event.task_id {
                remember_early(&mut inner.early, task_id, &event);
            }
        }

        debug!(session = %session_id, seq = event.seq, kind = %event.kind, "event published");
        // Sent under the lock so history order and live order agree.
        let _ = channel.tx.send(event.clone());
        event
    }

    /// Replay buffered events with `seq > after_seq`, then follow live ones.
    /// The stream never ends on its own; drop it to unsubscribe.
    pub fn subscribe(&self, session_id: &SessionId, after_seq: Option<u64>) -> EventStream {
        let channel = self.channel(session_id);
        let (backlog, rx) = {
            let inner = channel.lock();
            let after = after_seq.unwrap_or(0);
            let backlog: Vec<Event> = inner
                .history
                .iter()
                .filter(|e| e.seq > after)
                .cloned()
                .collect();
            (backlog, channel.tx.subscribe())
        };
        let session = session_id.clone();
        let live = BroadcastStream::new(rx).filter_map(move |msg| match msg {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(n)) => {
                warn!(session = %session, skipped = n, "subscriber lagged; events dropped");
                None
            }
        });
        Box::pin(tokio_stream::iter(backlog).chain(live))
    }

    pub fn history(&self, session_id: &SessionId) -> Vec<Event> {
        match self.existing(session_id) {
            Some(channel) => channel.lock().history.iter().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Register the wait conditions for `task_id`. Must happen before the
    /// task is dispatched. Signals already published for this task id are
    /// applied immediately.
    pub fn arm(&self, session_id: &SessionId, task_id: &TaskId) -> TaskWatch {
        let channel = self.channel(session_id);
        let mut inner = channel.lock();
        let initial = match inner.early.iter().position(|(t, _)| t == task_id) {
            Some(pos) => inner.early.remove(pos).map(|(_, s)| s).unwrap_or_default(),
            None => TaskSignals::default(),
        };
        let (tx, rx) = watch::channel(initial);
        if let Some(previous) = inner.armed.replace(Armed {
            task_id: task_id.clone(),
            tx,
        }) {
            warn!(session = %session_id, task = %previous.task_id, "replacing armed task");
        }
        TaskWatch {
            rx,
            task_id: task_id.clone(),
            channel: Arc::downgrade(&channel),
        }
    }

    /// Resolve the armed task as cancelled. Returns false when nothing was armed.
    pub fn interrupt(&self, session_id: &SessionId, reason: &str) -> bool {
        let Some(channel) = self.existing(session_id) else {
            return false;
        };
        let inner = channel.lock();
        match &inner.armed {
            Some(armed) => {
                armed.tx.send_modify(|s| {
                    s.terminal
                        .get_or_insert(TerminalSignal::Cancelled(reason.to_string()));
                });
                true
            }
            None => false,
        }
    }

    /// Arm (if needed) and wait for the task's terminal event.
    pub async fn await_terminal(
        &self,
        session_id: &SessionId,
        task_id: &TaskId,
        timeout: std::time::Duration,
    ) -> TerminalOutcome {
        let mut watch = self.arm(session_id, task_id);
        watch.wait_terminal(Instant::now() + timeout).await
    }

    pub fn sessions(&self) -> Vec<SessionId> {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<SessionId> = channels.keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn remember_early(early: &mut VecDeque<(TaskId, TaskSignals)>, task_id: &TaskId, event: &Event) {
    if let Some((_, signals)) = early.iter_mut().find(|(t, _)| t == task_id) {
        signals.apply(event);
        return;
    }
    let mut signals = TaskSignals::default();
    signals.apply(event);
    early.push_back((task_id.clone(), signals));
    while early.len() > EARLY_SIGNAL_SLOTS {
        early.pop_front();
    }
}

// ─── TaskWatch ────────────────────────────────────────────────────────────

/// Armed wait conditions for one task. Dropping it disarms the task.
pub struct TaskWatch {
    rx: watch::Receiver<TaskSignals>,
    task_id: TaskId,
    channel: Weak<Channel>,
}

impl TaskWatch {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Latest signals, marking them seen for [`changed_before`](Self::changed_before).
    pub fn snapshot(&mut self) -> TaskSignals {
        self.rx.borrow_and_update().clone()
    }

    /// Wait until something new is published for this task.
    /// Returns false on deadline or when the watch was superseded.
    pub async fn changed_before(&mut self, deadline: Instant) -> bool {
        matches!(
            tokio::time::timeout_at(deadline, self.rx.changed()).await,
            Ok(Ok(()))
        )
    }

    pub async fn wait_ack(&mut self, deadline: Instant) -> AckOutcome {
        let waited = tokio::time::timeout_at(
            deadline,
            self.rx.wait_for(|s| s.acknowledged || s.terminal.is_some()),
        )
        .await;
        match waited {
            Err(_) => AckOutcome::TimedOut,
            Ok(Err(_)) => AckOutcome::Cancelled("task watch superseded".into()),
            Ok(Ok(signals)) => match &signals.terminal {
                Some(TerminalSignal::Cancelled(reason)) if !signals.acknowledged => {
                    AckOutcome::Cancelled(reason.clone())
                }
                _ => AckOutcome::Acknowledged,
            },
        }
    }

    pub async fn wait_terminal(&mut self, deadline: Instant) -> TerminalOutcome {
        let waited =
            tokio::time::timeout_at(deadline, self.rx.wait_for(|s| s.terminal.is_some())).await;
        match waited {
            Err(_) => TerminalOutcome::TimedOut,
            Ok(Err(_)) => TerminalOutcome::Cancelled("task watch superseded".into()),
            Ok(Ok(signals)) => signals
                .terminal
                .clone()
                .map(TerminalOutcome::from)
                .unwrap_or(TerminalOutcome::TimedOut),
        }
    }
}

impl Drop for TaskWatch {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.upgrade() {
            let mut inner = channel.lock();
            if inner
                .armed
                .as_ref()
                .is_some_and(|a| a.task_id == self.task_id)
            {
                inner.armed = None;
            }
        }
    }
}
