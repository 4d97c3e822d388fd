use std::path::Path;
use std::time::Duration;

use handoff_core::types::SessionId;

use crate::client;
use crate::output::print_json;

/// Numbers go over the wire as numbers so `progress` events parse as percentages.
fn data_value(raw: &str) -> serde_json::Value {
    raw.trim()
        .parse::<f64>()
        .ok()
        .and_then(serde_json::Number::from_f64)
        .map(serde_json::Value::Number)
        .unwrap_or_else(|| serde_json::Value::String(raw.to_string()))
}

pub fn run(
    root: &Path,
    session: &str,
    task: Option<&str>,
    kind: &str,
    data: Option<&str>,
    server: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let sid = SessionId::parse(session)?;
    if kind.trim().is_empty() {
        anyhow::bail!("--type must not be empty");
    }

    let mut body = serde_json::json!({ "type": kind });
    if let Some(data) = data {
        body["data"] = data_value(data);
    }
    if let Some(task) = task {
        body["taskId"] = serde_json::Value::String(task.to_string());
    }

    let url = format!("{}/api/sessions/{sid}/events", client::base_url(root, server)?);
    let (_, event) = client::post_json(&url, &body, Some(Duration::from_secs(10)))?;

    if json {
        print_json(&event)?;
    } else {
        println!("published {kind} (seq {})", event["seq"]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_data_is_a_number() {
        assert_eq!(data_value("40"), serde_json::json!(40.0));
        assert_eq!(data_value(" 12.5 "), serde_json::json!(12.5));
    }

    #[test]
    fn text_data_is_kept_verbatim() {
        assert_eq!(data_value("build failed: exit 2"), serde_json::json!("build failed: exit 2"));
        assert_eq!(data_value("NaN"), serde_json::json!("NaN"));
    }
}
