use std::path::Path;
use std::time::Duration;

use handoff_core::types::SessionId;

use crate::client;
use crate::output::print_json;

pub fn run(
    root: &Path,
    session: &str,
    reason: Option<&str>,
    server: Option<&str>,
    json: bool,
) -> anyhow::Result<()> {
    let sid = SessionId::parse(session)?;
    let url = format!("{}/api/sessions/{sid}/cancel", client::base_url(root, server)?);
    let body = match reason {
        Some(reason) => serde_json::json!({ "reason": reason }),
        None => serde_json::json!({}),
    };
    let (_, value) = client::post_json(&url, &body, Some(Duration::from_secs(30)))?;

    if json {
        print_json(&value)?;
    } else if value["cancelled"] == true {
        println!("Cancelled the task in flight for {sid}.");
    } else {
        println!("Nothing in flight for {sid}.");
    }
    Ok(())
}
