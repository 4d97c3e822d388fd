use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::{AssistantConfig, TimingConfig};
use crate::error::{HandoffError, Result};
use crate::terminal::{Key, Terminal};
use crate::types::SessionId;

/// A running assistant inside a named terminal context.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessHandle {
    pub session_id: SessionId,
    pub context: String,
    pub work_dir: PathBuf,
    pub started_at: DateTime<Utc>,
}

/// Reject text that the terminal would interpret instead of typing.
pub fn validate_instruction(text: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Err(HandoffError::InvalidInstruction("instruction is empty".into()));
    }
    if let Some(c) = text.chars().find(|c| c.is_control()) {
        return Err(HandoffError::InvalidInstruction(format!(
            "contains control character {:?}",
            c
        )));
    }
    Ok(())
}

/// Starts, probes, feeds, and stops the assistant in its terminal context.
pub struct ProcessController {
    terminal: Arc<dyn Terminal>,
    assistant: AssistantConfig,
    timing: TimingConfig,
}

impl ProcessController {
    pub fn new(terminal: Arc<dyn Terminal>, assistant: AssistantConfig, timing: TimingConfig) -> Self {
        Self {
            terminal,
            assistant,
            timing,
        }
    }

    /// Handle for a context that was started earlier (e.g. by a previous run).
    pub fn attach(&self, session_id: &SessionId, work_dir: &Path, started_at: DateTime<Utc>) -> ProcessHandle {
        ProcessHandle {
            session_id: session_id.clone(),
            context: session_id.context_name(),
            work_dir: work_dir.to_path_buf(),
            started_at,
        }
    }

    /// Launch the assistant, give it time to initialize, and confirm it
    /// answers a probe. A context left over under the same name is replaced.
    pub async fn start(&self, session_id: &SessionId, work_dir: &Path) -> Result<ProcessHandle> {
        let handle = self.attach(session_id, work_dir, Utc::now());
        if self.terminal.exists(&handle.context).await? {
            debug!(context = %handle.context, "replacing leftover context");
            self.terminal.kill(&handle.context).await?;
        }

        self.terminal
            .create(&handle.context, work_dir, &self.assistant.command)
            .await?;
        info!(
            context = %handle.context,
            command = %self.assistant.command.join(" "),
            "execution context started"
        );
        sleep(self.timing.init_settle()).await;

        if let Err(e) = self.probe(&handle).await {
            let _ = self.terminal.kill(&handle.context).await;
            return Err(e);
        }
        Ok(handle)
    }

    /// Send the probe instruction and wait for the expected reply on the pane.
    ///
    /// Only replies that appear after the probe was sent count, so an answer
    /// left in scrollback by an earlier probe does not satisfy this one.
    pub async fn probe(&self, handle: &ProcessHandle) -> Result<()> {
        let expect = self.assistant.probe_expect.as_str();
        let seen_before = self.terminal.capture(&handle.context).await?.matches(expect).count();

        self.send(handle, &self.assistant.probe_instruction).await?;

        let deadline = Instant::now() + self.timing.probe_timeout();
        loop {
            let pane = self.terminal.capture(&handle.context).await?;
            if pane.matches(expect).count() > seen_before {
                debug!(context = %handle.context, "probe answered");
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(context = %handle.context, "probe timed out");
                return Err(HandoffError::ProbeTimeout {
                    session: handle.session_id.to_string(),
                    waited: self.timing.probe_timeout(),
                });
            }
            sleep(self.timing.probe_interval()).await;
        }
    }

    /// Deliver `text` as typed input followed by Enter.
    ///
    /// Each attempt leaves copy mode, types the text literally, waits
    /// `literal_settle`, presses Enter, then waits `submit_settle`. Failed
    /// attempts clear the input line and retry with exponential backoff.
    pub async fn send(&self, handle: &ProcessHandle, text: &str) -> Result<()> {
        validate_instruction(text)?;

        let attempts = self.timing.delivery_retries + 1;
        let mut backoff = self.timing.delivery_backoff();
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.deliver_once(&handle.context, text, attempt > 1).await {
                Ok(()) => {
                    debug!(context = %handle.context, attempt, chars = text.len(), "delivered");
                    return Ok(());
                }
                Err(e) => {
                    warn!(context = %handle.context, attempt, error = %e, "delivery attempt failed");
                    last_error = e.to_string();
                    if attempt < attempts {
                        sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }
        Err(HandoffError::Delivery {
            context: handle.context.clone(),
            attempts,
            reason: last_error,
        })
    }

    async fn deliver_once(&self, context: &str, text: &str, clear_first: bool) -> Result<()> {
        self.terminal.exit_copy_mode(context).await?;
        if clear_first {
            self.terminal.send_key(context, Key::ClearLine).await?;
        }
        self.terminal.send_literal(context, text).await?;
        sleep(self.timing.literal_settle()).await;
        self.terminal.send_key(context, Key::Enter).await?;
        sleep(self.timing.submit_settle()).await;
        Ok(())
    }

    pub async fn is_alive(&self, handle: &ProcessHandle) -> bool {
        self.terminal.exists(&handle.context).await.unwrap_or(false)
    }

    pub async fn kill(&self, handle: &ProcessHandle) -> Result<()> {
        self.kill_context(&handle.context).await
    }

    pub async fn kill_context(&self, context: &str) -> Result<()> {
        info!(context, "killing execution context");
        self.terminal.kill(context).await
    }
}
