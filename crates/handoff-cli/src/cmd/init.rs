use std::path::Path;

use anyhow::Context;
use handoff_core::config::{config_path, HandoffConfig};
use handoff_core::io::ensure_dir;

use crate::output::print_json;

pub fn run(root: &Path, force: bool, json: bool) -> anyhow::Result<()> {
    let path = config_path(root);
    let existed = path.exists();

    let config = if existed && !force {
        HandoffConfig::load(root).context("existing config is unreadable; rerun with --force")?
    } else {
        let config = HandoffConfig::default();
        config.save(root).context("failed to write config")?;
        config
    };
    let sessions = config.sessions_dir(root);
    ensure_dir(&sessions).context("failed to create sessions directory")?;

    if json {
        print_json(&serde_json::json!({
            "config": path,
            "sessionsDir": sessions,
            "created": !existed || force,
        }))?;
    } else if existed && !force {
        println!("Already initialized: {}", path.display());
    } else {
        println!("Wrote {}", path.display());
        println!("Sessions live in {}", sessions.display());
    }
    Ok(())
}
