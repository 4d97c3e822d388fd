use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use handoff_core::config::HandoffConfig;
use handoff_core::terminal::Tmux;
use handoff_server::AppState;

pub fn run(root: &Path, port: Option<u16>) -> anyhow::Result<()> {
    let config = HandoffConfig::load(root).context("failed to load config")?;
    let tmux = Tmux::new();
    tmux.check_installed()?;
    let port = port.unwrap_or(config.server.port);

    let state = AppState::new(root.to_path_buf(), config, Arc::new(tmux))
        .context("invalid configuration; run `handoff config validate`")?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(handoff_server::serve(state, port))
}
