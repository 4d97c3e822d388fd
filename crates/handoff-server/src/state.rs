use std::path::PathBuf;
use std::sync::Arc;

use handoff_core::config::HandoffConfig;
use handoff_core::terminal::Terminal;
use handoff_core::types::SessionId;
use handoff_core::{Coordinator, HandoffError, Notifier};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub root: PathBuf,
    pub coordinator: Arc<Coordinator>,
}

impl AppState {
    pub fn new(
        root: PathBuf,
        config: HandoffConfig,
        terminal: Arc<dyn Terminal>,
    ) -> handoff_core::Result<Self> {
        let notifier = Arc::new(Notifier::new(config.notifier.history));
        Self::with_notifier(root, config, terminal, notifier)
    }

    /// Build state around an existing notifier, so a caller can publish into
    /// the same channels the server serves.
    pub fn with_notifier(
        root: PathBuf,
        config: HandoffConfig,
        terminal: Arc<dyn Terminal>,
        notifier: Arc<Notifier>,
    ) -> handoff_core::Result<Self> {
        let sessions_dir = config.sessions_dir(&root);
        let coordinator = Coordinator::new(config, sessions_dir, terminal, notifier)?;
        Ok(Self {
            root,
            coordinator: Arc::new(coordinator),
        })
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        self.coordinator.notifier()
    }

    /// Parse `id` and require that the session has events or a workspace.
    /// Read routes use this so unknown ids get a 404 instead of a channel.
    pub fn known_session(&self, id: &str) -> handoff_core::Result<SessionId> {
        let sid = SessionId::parse(id)?;
        if self.coordinator.knows(&sid) {
            Ok(sid)
        } else {
            Err(HandoffError::SessionNotFound(id.to_string()))
        }
    }
}
