use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::client;
use crate::output::{print_fields, print_json};

pub struct SubmitArgs {
    pub identity: Vec<String>,
    pub payload: Option<String>,
    pub file: Option<PathBuf>,
    pub wait: bool,
    pub server: Option<String>,
}

pub fn run(root: &Path, args: SubmitArgs, json: bool) -> anyhow::Result<()> {
    let payload = match (&args.payload, &args.file) {
        (Some(text), _) => text.clone(),
        (None, Some(path)) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        (None, None) => anyhow::bail!("provide the task text or --file"),
    };
    if payload.trim().is_empty() {
        anyhow::bail!("task text is empty");
    }

    let url = format!("{}/api/submit", client::base_url(root, args.server.as_deref())?);
    let body = serde_json::json!({
        "identity": args.identity,
        "payload": payload,
        "wait": args.wait,
    });
    let (_, report) = client::post_json(&url, &body, None)?;

    if json {
        print_json(&report)?;
    } else if !args.wait {
        print_fields(&[
            ("session", text(&report["sessionId"])),
            ("status", text(&report["status"])),
            ("events", text(&report["events"])),
        ]);
    } else {
        print_report(&report);
    }

    if args.wait && report["status"] != "done" {
        anyhow::bail!("task {} ended as {}", text(&report["taskId"]), text(&report["status"]));
    }
    Ok(())
}

fn print_report(report: &serde_json::Value) {
    let mut fields = vec![
        ("session", text(&report["sessionId"])),
        ("task", text(&report["taskId"])),
        ("status", text(&report["status"])),
    ];
    if let Some(path) = report["resultPath"].as_str() {
        fields.push(("result", path.to_string()));
    }
    if let Some(err) = report["error"].as_str() {
        fields.push(("error", err.to_string()));
    }
    if let Some(fix) = report["remediation"].as_str() {
        fields.push(("fix", fix.to_string()));
    }
    print_fields(&fields);
    if let Some(content) = report["content"].as_str() {
        println!();
        println!("{}", content.trim_end());
    }
}

fn text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => "-".into(),
        other => other.to_string(),
    }
}
