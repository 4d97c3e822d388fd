use std::path::Path;

use anyhow::Context;
use handoff_core::config::HandoffConfig;
use handoff_core::status::{SessionStatus, StatusStore};
use handoff_core::types::SessionId;
use handoff_core::workspace::WorkspaceManager;

use crate::output::{print_fields, print_json, print_table};

/// Reads status records straight from disk; no server needed.
pub fn run(root: &Path, session: Option<&str>, json: bool) -> anyhow::Result<()> {
    let config = HandoffConfig::load(root).context("failed to load config")?;
    let workspace = WorkspaceManager::new(config.sessions_dir(root));
    let ids = workspace.list()?;
    let store = StatusStore::new(workspace);

    if let Some(raw) = session {
        let sid = SessionId::parse(raw)?;
        let status = store.require(&sid)?;
        if json {
            return print_json(&status);
        }
        print_status(&status);
        return Ok(());
    }

    let mut records = Vec::new();
    for id in &ids {
        if let Some(status) = store.get(id)? {
            records.push(status);
        }
    }

    if json {
        return print_json(&records);
    }
    if records.is_empty() {
        println!("No sessions.");
        return Ok(());
    }
    let rows = records
        .iter()
        .map(|s| {
            vec![
                s.session_id.to_string(),
                s.task_id.as_ref().map(|t| t.to_string()).unwrap_or_default(),
                s.task_status.as_str().to_string(),
                format!("{}%", s.progress),
                s.updated_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            ]
        })
        .collect();
    print_table(&["SESSION", "TASK", "STATUS", "PROGRESS", "UPDATED"], rows);
    Ok(())
}

fn print_status(status: &SessionStatus) {
    let mut fields = vec![
        ("session", status.session_id.to_string()),
        (
            "task",
            status
                .task_id
                .as_ref()
                .map(|t| t.to_string())
                .unwrap_or_else(|| "-".into()),
        ),
        ("status", status.task_status.as_str().to_string()),
        ("progress", format!("{}%", status.progress)),
        ("started", status.started_at.to_rfc3339()),
    ];
    if let Some(done) = status.completed_at {
        fields.push(("completed", done.to_rfc3339()));
    }
    if !status.message.is_empty() {
        fields.push(("message", status.message.clone()));
    }
    if let Some(result) = &status.result_ref {
        fields.push(("result", result.clone()));
    }
    if let Some(err) = &status.error {
        fields.push(("error", err.clone()));
    }
    if let Some(fix) = &status.remediation {
        fields.push(("fix", fix.clone()));
    }
    print_fields(&fields);
}
