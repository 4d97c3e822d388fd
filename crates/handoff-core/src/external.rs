use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{HandoffError, Result};

/// Captured result of a bounded external command.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutcome {
    pub success: bool,
    /// `None` when the process was killed by a signal or the timeout.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub elapsed_ms: u64,
}

/// Run `argv` in `cwd`, killing it if it outlives `timeout`.
///
/// A non-zero exit is reported in the outcome, not as an error. Only a
/// command that cannot be started at all is an `Err`.
pub async fn run_command(argv: &[String], cwd: &Path, timeout: Duration) -> Result<CommandOutcome> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| HandoffError::InvalidInstruction("command is empty".into()))?;

    debug!(program = %program, args = ?args, cwd = %cwd.display(), "running command");
    let started = Instant::now();
    let child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| HandoffError::Launch {
            context: program.clone(),
            reason: e.to_string(),
        })?;

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(CommandOutcome {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            timed_out: false,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }),
        Ok(Err(e)) => Err(HandoffError::Launch {
            context: program.clone(),
            reason: e.to_string(),
        }),
        Err(_) => {
            // Dropping the wait future drops the child, which kills it.
            warn!(program = %program, timeout_ms = timeout.as_millis() as u64, "command timed out");
            Ok(CommandOutcome {
                success: false,
                exit_code: None,
                stdout: String::new(),
                stderr: format!("timed out after {}ms", timeout.as_millis()),
                timed_out: true,
                elapsed_ms: started.elapsed().as_millis() as u64,
            })
        }
    }
}
