use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::error::{HandoffError, Result};

/// Non-literal keys the automation layer sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Enter,
    /// Clear the current input line.
    ClearLine,
    /// Leave tmux copy mode.
    Quit,
}

impl Key {
    pub fn tmux_name(self) -> &'static str {
        match self {
            Key::Enter => "C-m",
            Key::ClearLine => "C-u",
            Key::Quit => "q",
        }
    }
}

/// The terminal-multiplexer primitive the process controller drives.
///
/// Every method addresses an isolated context by name. Implementations must
/// deliver `send_literal` text without interpreting or re-escaping it.
#[async_trait]
pub trait Terminal: Send + Sync {
    /// Start `argv` inside a new detached context rooted at `cwd`.
    async fn create(&self, name: &str, cwd: &Path, argv: &[String]) -> Result<()>;
    async fn send_literal(&self, name: &str, text: &str) -> Result<()>;
    async fn send_key(&self, name: &str, key: Key) -> Result<()>;
    async fn exists(&self, name: &str) -> Result<bool>;
    async fn kill(&self, name: &str) -> Result<()>;
    /// Visible pane content plus recent scrollback.
    async fn capture(&self, name: &str) -> Result<String>;
    /// Leave copy/scroll mode if the pane is in it, so input reaches the
    /// program instead of the multiplexer.
    async fn exit_copy_mode(&self, _name: &str) -> Result<()> {
        Ok(())
    }
}

// ─── Tmux ─────────────────────────────────────────────────────────────────

/// [`Terminal`] backed by the `tmux` binary.
#[derive(Debug, Clone)]
pub struct Tmux {
    binary: String,
    scrollback_lines: u32,
}

impl Default for Tmux {
    fn default() -> Self {
        Self {
            binary: "tmux".to_string(),
            scrollback_lines: 200,
        }
    }
}

impl Tmux {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific tmux executable (e.g. a wrapper with `-L <socket>`).
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            ..Self::default()
        }
    }

    /// Fail early with a launch error when tmux is not installed.
    pub fn check_installed(&self) -> Result<()> {
        which::which(&self.binary).map(|_| ()).map_err(|e| HandoffError::Launch {
            context: "-".into(),
            reason: format!("'{}' not found on PATH: {e}", self.binary),
        })
    }

    async fn run(&self, name: &str, args: &[&str]) -> Result<std::process::Output> {
        debug!(context = name, args = ?args, "tmux");
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| HandoffError::Launch {
                context: name.to_string(),
                reason: format!("failed to run {}: {e}", self.binary),
            })
    }

    async fn run_ok(&self, name: &str, args: &[&str]) -> Result<std::process::Output> {
        let output = self.run(name, args).await?;
        if !output.status.success() {
            return Err(HandoffError::Delivery {
                context: name.to_string(),
                attempts: 1,
                reason: format!(
                    "tmux {} failed: {}",
                    args.first().copied().unwrap_or_default(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(output)
    }
}

#[async_trait]
impl Terminal for Tmux {
    async fn create(&self, name: &str, cwd: &Path, argv: &[String]) -> Result<()> {
        let cwd = cwd.to_string_lossy().into_owned();
        let mut args: Vec<&str> = vec!["new-session", "-d", "-s", name, "-c", cwd.as_str(), "--"];
        args.extend(argv.iter().map(String::as_str));
        let output = self.run(name, &args).await?;
        if !output.status.success() {
            return Err(HandoffError::Launch {
                context: name.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn send_literal(&self, name: &str, text: &str) -> Result<()> {
        // `-l` disables key-name lookup so the text arrives byte for byte.
        self.run_ok(name, &["send-keys", "-t", name, "-l", text])
            .await
            .map(|_| ())
    }

    async fn send_key(&self, name: &str, key: Key) -> Result<()> {
        self.run_ok(name, &["send-keys", "-t", name, key.tmux_name()])
            .await
            .map(|_| ())
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        let output = self.run(name, &["has-session", "-t", name]).await?;
        Ok(output.status.success())
    }

    async fn kill(&self, name: &str) -> Result<()> {
        // Killing a context that is already gone is not an error.
        let _ = self.run(name, &["kill-session", "-t", name]).await?;
        Ok(())
    }

    async fn capture(&self, name: &str) -> Result<String> {
        let start = format!("-{}", self.scrollback_lines);
        let output = self
            .run_ok(name, &["capture-pane", "-p", "-t", name, "-S", &start])
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn exit_copy_mode(&self, name: &str) -> Result<()> {
        let output = self
            .run(name, &["display-message", "-p", "-t", name, "#{pane_in_mode}"])
            .await?;
        if String::from_utf8_lossy(&output.stdout).trim() == "1" {
            self.send_key(name, Key::Quit).await?;
        }
        Ok(())
    }
}
