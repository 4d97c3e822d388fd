use crate::error::{HandoffError, Result};
use crate::io::atomic_write;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const HANDOFF_DIR: &str = ".handoff";
pub const CONFIG_FILE: &str = ".handoff/config.yaml";
pub const SESSIONS_DIR: &str = ".handoff/sessions";

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// AssistantConfig
// ---------------------------------------------------------------------------

/// The interactive program hosted inside each execution context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssistantConfig {
    #[serde(default = "default_command")]
    pub command: Vec<String>,
    /// Instruction sent by the readiness probe.
    #[serde(default = "default_probe_instruction")]
    pub probe_instruction: String,
    /// Text the assistant must print in response to the probe. Must not occur
    /// verbatim inside `probe_instruction`, or the echoed input would match.
    #[serde(default = "default_probe_expect")]
    pub probe_expect: String,
}

fn default_command() -> Vec<String> {
    vec!["claude".to_string()]
}

fn default_probe_instruction() -> String {
    "Reply with the words PROBE and OK joined by a hyphen and nothing else.".to_string()
}

fn default_probe_expect() -> String {
    "PROBE-OK".to_string()
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            probe_instruction: default_probe_instruction(),
            probe_expect: default_probe_expect(),
        }
    }
}

// ---------------------------------------------------------------------------
// TimingConfig
// ---------------------------------------------------------------------------

/// Settle delays and timeouts. The settle delays are empirically tuned for
/// tmux automation; sending Enter before the literal text registers drops
/// input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimingConfig {
    #[serde(default = "default_init_settle_ms")]
    pub init_settle_ms: u64,
    #[serde(default = "default_literal_settle_ms")]
    pub literal_settle_ms: u64,
    #[serde(default = "default_submit_settle_ms")]
    pub submit_settle_ms: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,
    #[serde(default = "default_completion_timeout_secs")]
    pub completion_timeout_secs: u64,
    #[serde(default = "default_delivery_retries")]
    pub delivery_retries: u32,
    #[serde(default = "default_delivery_backoff_ms")]
    pub delivery_backoff_ms: u64,
}

fn default_init_settle_ms() -> u64 {
    5000
}

fn default_literal_settle_ms() -> u64 {
    300
}

fn default_submit_settle_ms() -> u64 {
    1000
}

fn default_probe_timeout_secs() -> u64 {
    60
}

fn default_probe_interval_ms() -> u64 {
    500
}

fn default_ack_timeout_secs() -> u64 {
    30
}

fn default_completion_timeout_secs() -> u64 {
    600
}

fn default_delivery_retries() -> u32 {
    3
}

fn default_delivery_backoff_ms() -> u64 {
    250
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            init_settle_ms: default_init_settle_ms(),
            literal_settle_ms: default_literal_settle_ms(),
            submit_settle_ms: default_submit_settle_ms(),
            probe_timeout_secs: default_probe_timeout_secs(),
            probe_interval_ms: default_probe_interval_ms(),
            ack_timeout_secs: default_ack_timeout_secs(),
            completion_timeout_secs: default_completion_timeout_secs(),
            delivery_retries: default_delivery_retries(),
            delivery_backoff_ms: default_delivery_backoff_ms(),
        }
    }
}

impl TimingConfig {
    pub fn init_settle(&self) -> Duration {
        Duration::from_millis(self.init_settle_ms)
    }

    pub fn literal_settle(&self) -> Duration {
        Duration::from_millis(self.literal_settle_ms)
    }

    pub fn submit_settle(&self) -> Duration {
        Duration::from_millis(self.submit_settle_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.completion_timeout_secs)
    }

    pub fn delivery_backoff(&self) -> Duration {
        Duration::from_millis(self.delivery_backoff_ms)
    }
}

// ---------------------------------------------------------------------------
// SessionPolicy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionPolicy {
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u32,
    /// Probe the assistant before every reuse, not only after a timeout.
    #[serde(default = "default_probe_on_reuse")]
    pub probe_on_reuse: bool,
    /// Recreations attempted after a failed readiness probe.
    #[serde(default = "default_recreate_attempts")]
    pub recreate_attempts: u32,
}

fn default_max_age_days() -> u32 {
    5
}

fn default_probe_on_reuse() -> bool {
    true
}

fn default_recreate_attempts() -> u32 {
    1
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            max_age_days: default_max_age_days(),
            probe_on_reuse: default_probe_on_reuse(),
            recreate_attempts: default_recreate_attempts(),
        }
    }
}

impl SessionPolicy {
    pub fn max_age(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.max_age_days))
    }
}

// ---------------------------------------------------------------------------
// BusyPolicy / CoordinatorConfig
// ---------------------------------------------------------------------------

/// What happens when a task is submitted while another one is in flight.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BusyPolicy {
    #[default]
    Reject,
    Queue,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub on_busy: BusyPolicy,
}

// ---------------------------------------------------------------------------
// ResultConfig / NotifierConfig / ServerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultConfig {
    /// Result files smaller than this are treated as not written yet.
    #[serde(default = "default_min_bytes")]
    pub min_bytes: u64,
}

fn default_min_bytes() -> u64 {
    1
}

impl Default for ResultConfig {
    fn default() -> Self {
        Self {
            min_bytes: default_min_bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotifierConfig {
    #[serde(default = "default_history")]
    pub history: usize,
}

fn default_history() -> usize {
    500
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            history: default_history(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Base URL the assistant uses to publish events.
    #[serde(default = "default_public_url")]
    pub public_url: String,
}

fn default_port() -> u16 {
    3142
}

fn default_public_url() -> String {
    format!("http://localhost:{}", default_port())
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            public_url: default_public_url(),
        }
    }
}

// ---------------------------------------------------------------------------
// HandoffConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HandoffConfig {
    /// Sessions directory; relative paths resolve against the project root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sessions_dir: Option<PathBuf>,
    #[serde(default)]
    pub assistant: AssistantConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub session: SessionPolicy,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub result: ResultConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl HandoffConfig {
    /// Load `<root>/.handoff/config.yaml`, falling back to defaults when the
    /// file does not exist.
    pub fn load(root: &Path) -> Result<Self> {
        let path = config_path(root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: HandoffConfig = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        atomic_write(&config_path(root), data.as_bytes())
    }

    pub fn sessions_dir(&self, root: &Path) -> PathBuf {
        match &self.sessions_dir {
            Some(p) if p.is_absolute() => p.clone(),
            Some(p) => root.join(p),
            None => root.join(SESSIONS_DIR),
        }
    }

    /// Check the config for settings that would break delivery or detection.
    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut error = |message: String| {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message,
            })
        };

        if self.assistant.command.is_empty() {
            error("assistant.command must name a program".into());
        }
        if self.assistant.probe_expect.trim().is_empty() {
            error("assistant.probe_expect must not be empty".into());
        } else if self
            .assistant
            .probe_instruction
            .contains(&self.assistant.probe_expect)
        {
            error(format!(
                "assistant.probe_instruction contains '{}'; the echoed input would satisfy the probe",
                self.assistant.probe_expect
            ));
        }
        if self.timing.completion_timeout_secs <= self.timing.ack_timeout_secs {
            error(format!(
                "timing.completion_timeout_secs ({}) must exceed timing.ack_timeout_secs ({})",
                self.timing.completion_timeout_secs, self.timing.ack_timeout_secs
            ));
        }
        if self.notifier.history == 0 {
            error("notifier.history must be at least 1".into());
        }

        if self.timing.literal_settle_ms < 100 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: format!(
                    "timing.literal_settle_ms is {}ms; values below 100ms are known to drop input",
                    self.timing.literal_settle_ms
                ),
            });
        }
        if self.result.min_bytes == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "result.min_bytes is 0; empty result files will be accepted".into(),
            });
        }

        warnings
    }

    /// Like [`validate`](Self::validate) but fails on the first error-level warning.
    pub fn ensure_valid(&self) -> Result<()> {
        match self
            .validate()
            .into_iter()
            .find(|w| w.level == WarnLevel::Error)
        {
            Some(w) => Err(HandoffError::Config(w.message)),
            None => Ok(()),
        }
    }
}
