//! In-memory [`Terminal`] that plays both tmux and the assistant it hosts.
//!
//! Probe instructions are answered on the pane; task instructions are parsed
//! and handed to a per-test script that publishes events and writes results.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::config::AssistantConfig;
use crate::error::{HandoffError, Result};
use crate::notifier::Notifier;
use crate::terminal::{Key, Terminal};
use crate::types::{EventInput, SessionId, TaskId};

pub(crate) enum Step {
    Publish(EventInput),
    WriteResult(String),
    /// Write the result file but backdate it to before the task existed.
    StaleResult(String),
    Sleep(Duration),
}

pub(crate) fn publish(kind: &str) -> Step {
    Step::Publish(EventInput::new(kind))
}

pub(crate) fn publish_data(kind: &str, data: &str) -> Step {
    Step::Publish(EventInput::new(kind).with_data(data))
}

pub(crate) fn sleep_ms(ms: u64) -> Step {
    Step::Sleep(Duration::from_millis(ms))
}

#[derive(Debug, Clone)]
pub(crate) struct FakeTask {
    pub task_id: TaskId,
    pub input: PathBuf,
    pub output: PathBuf,
    /// Zero-based count of task instructions seen by this terminal.
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Call {
    Create(String),
    Literal(String, String),
    Key(String, Key),
    Kill(String),
    ExitCopyMode(String),
}

type Script = Arc<dyn Fn(&FakeTask) -> Vec<Step> + Send + Sync>;

#[derive(Default)]
struct Pane {
    line: String,
    screen: String,
}

struct FakeState {
    panes: HashMap<String, Pane>,
    log: Vec<(Instant, Call)>,
    responsive: bool,
    fail_literals: u32,
    fail_create: bool,
    tasks_seen: usize,
}

pub(crate) struct FakeTerminal {
    assistant: AssistantConfig,
    notifier: Option<Arc<Notifier>>,
    script: Mutex<Option<Script>>,
    state: Mutex<FakeState>,
}

impl FakeTerminal {
    pub fn new() -> Self {
        Self {
            assistant: AssistantConfig::default(),
            notifier: None,
            script: Mutex::new(None),
            state: Mutex::new(FakeState {
                panes: HashMap::new(),
                log: Vec::new(),
                responsive: true,
                fail_literals: 0,
                fail_create: false,
                tasks_seen: 0,
            }),
        }
    }

    pub fn with_notifier(notifier: Arc<Notifier>) -> Self {
        Self {
            notifier: Some(notifier),
            ..Self::new()
        }
    }

    pub fn script(&self, f: impl Fn(&FakeTask) -> Vec<Step> + Send + Sync + 'static) {
        *self.script.lock().unwrap() = Some(Arc::new(f));
    }

    pub fn set_responsive(&self, responsive: bool) {
        self.state.lock().unwrap().responsive = responsive;
    }

    pub fn fail_next_literals(&self, n: u32) {
        self.state.lock().unwrap().fail_literals = n;
    }

    pub fn fail_create(&self, fail: bool) {
        self.state.lock().unwrap().fail_create = fail;
    }

    /// Simulate the context dying without the coordinator's involvement.
    pub fn vanish(&self, name: &str) {
        self.state.lock().unwrap().panes.remove(name);
    }

    pub fn timed_calls(&self) -> Vec<(Instant, Call)> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.timed_calls().into_iter().map(|(_, c)| c).collect()
    }

    pub fn creates(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Create(_)))
            .count()
    }

    pub fn literals(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Literal(_, text) => Some(text),
                _ => None,
            })
            .collect()
    }

    fn record(state: &mut FakeState, call: Call) {
        state.log.push((Instant::now(), call));
    }

    fn submit_line(&self, name: &str, line: String) {
        let mut state = self.state.lock().unwrap();
        let responsive = state.responsive;
        let Some(pane) = state.panes.get_mut(name) else {
            return;
        };
        pane.screen.push_str(&format!("> {line}\n"));
        if !responsive {
            return;
        }
        if line == self.assistant.probe_instruction {
            pane.screen.push_str(&format!("{}\n", self.assistant.probe_expect));
            return;
        }
        let Some((task_id, input, output)) = parse_instruction(&line) else {
            return;
        };
        let index = state.tasks_seen;
        state.tasks_seen += 1;
        drop(state);

        let script = self.script.lock().unwrap().clone();
        let (Some(script), Some(notifier)) = (script, self.notifier.clone()) else {
            return;
        };
        let Some(session_id) = name
            .strip_prefix("handoff-")
            .and_then(|s| SessionId::parse(s).ok())
        else {
            return;
        };
        let steps = script(&FakeTask {
            task_id,
            input,
            output: output.clone(),
            index,
        });
        tokio::spawn(async move {
            for step in steps {
                match step {
                    Step::Sleep(d) => tokio::time::sleep(d).await,
                    Step::Publish(input) => {
                        notifier.publish(&session_id, input);
                    }
                    Step::WriteResult(content) => {
                        std::fs::write(&output, content).unwrap();
                    }
                    Step::StaleResult(content) => {
                        std::fs::write(&output, content).unwrap();
                        let hour_ago = std::time::SystemTime::now() - Duration::from_secs(3600);
                        std::fs::File::options()
                            .write(true)
                            .open(&output)
                            .unwrap()
                            .set_modified(hour_ago)
                            .unwrap();
                    }
                }
            }
        });
    }
}

/// Pull the task id and the two absolute paths out of a task instruction.
fn parse_instruction(line: &str) -> Option<(TaskId, PathBuf, PathBuf)> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let pos = tokens.iter().position(|t| *t == "task")?;
    let task_id = tokens.get(pos + 1)?.trim_end_matches(':');
    let mut paths = tokens
        .iter()
        .filter(|t| t.starts_with('/'))
        .map(|t| PathBuf::from(t.trim_end_matches(|c| ".,;:()".contains(c))));
    let input = paths.next()?;
    let output = paths.next()?;
    Some((TaskId::from(task_id), input, output))
}

#[async_trait]
impl Terminal for FakeTerminal {
    async fn create(&self, name: &str, _cwd: &Path, _argv: &[String]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, Call::Create(name.to_string()));
        if state.fail_create {
            return Err(HandoffError::Launch {
                context: name.to_string(),
                reason: "scripted launch failure".into(),
            });
        }
        state.panes.insert(name.to_string(), Pane::default());
        Ok(())
    }

    async fn send_literal(&self, name: &str, text: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, Call::Literal(name.to_string(), text.to_string()));
        if state.fail_literals > 0 {
            state.fail_literals -= 1;
            return Err(HandoffError::Delivery {
                context: name.to_string(),
                attempts: 1,
                reason: "scripted send failure".into(),
            });
        }
        match state.panes.get_mut(name) {
            Some(pane) => {
                pane.line.push_str(text);
                Ok(())
            }
            None => Err(HandoffError::Delivery {
                context: name.to_string(),
                attempts: 1,
                reason: "no such session".into(),
            }),
        }
    }

    async fn send_key(&self, name: &str, key: Key) -> Result<()> {
        let line = {
            let mut state = self.state.lock().unwrap();
            Self::record(&mut state, Call::Key(name.to_string(), key));
            let Some(pane) = state.panes.get_mut(name) else {
                return Err(HandoffError::Delivery {
                    context: name.to_string(),
                    attempts: 1,
                    reason: "no such session".into(),
                });
            };
            match key {
                Key::Enter => Some(std::mem::take(&mut pane.line)),
                Key::ClearLine => {
                    pane.line.clear();
                    None
                }
                Key::Quit => None,
            }
        };
        if let Some(line) = line {
            self.submit_line(name, line);
        }
        Ok(())
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().panes.contains_key(name))
    }

    async fn kill(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, Call::Kill(name.to_string()));
        state.panes.remove(name);
        Ok(())
    }

    async fn capture(&self, name: &str) -> Result<String> {
        let state = self.state.lock().unwrap();
        state
            .panes
            .get(name)
            .map(|p| p.screen.clone())
            .ok_or_else(|| HandoffError::Delivery {
                context: name.to_string(),
                attempts: 1,
                reason: "no such session".into(),
            })
    }

    async fn exit_copy_mode(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::record(&mut state, Call::ExitCopyMode(name.to_string()));
        Ok(())
    }
}
