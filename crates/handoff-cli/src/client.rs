//! Blocking HTTP calls against a running `handoff serve`.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context};
use handoff_core::config::HandoffConfig;

/// `--server` if given, else `server.public_url` from the config.
pub fn base_url(root: &Path, explicit: Option<&str>) -> anyhow::Result<String> {
    let url = match explicit {
        Some(url) => url.to_string(),
        None => {
            HandoffConfig::load(root)
                .context("failed to load config")?
                .server
                .public_url
        }
    };
    Ok(url.trim_end_matches('/').to_string())
}

fn agent(timeout: Option<Duration>) -> ureq::Agent {
    let mut builder = ureq::AgentBuilder::new().timeout_connect(Duration::from_secs(5));
    if let Some(t) = timeout {
        builder = builder.timeout(t);
    }
    builder.build()
}

/// POST a JSON body and return the JSON response.
///
/// Error responses are turned into an error carrying the server's message
/// and remediation. `timeout` of `None` waits indefinitely, for calls that
/// block until a task finishes.
pub fn post_json(
    url: &str,
    body: &serde_json::Value,
    timeout: Option<Duration>,
) -> anyhow::Result<(u16, serde_json::Value)> {
    match agent(timeout).post(url).send_json(body) {
        Ok(resp) => {
            let status = resp.status();
            let value = resp
                .into_json()
                .with_context(|| format!("invalid JSON from {url}"))?;
            Ok((status, value))
        }
        Err(ureq::Error::Status(code, resp)) => {
            let value: serde_json::Value = resp.into_json().unwrap_or_default();
            let message = value["error"].as_str().unwrap_or("request failed");
            match value["remediation"].as_str() {
                Some(fix) => Err(anyhow!("{message} (HTTP {code})\n  fix: {fix}")),
                None => Err(anyhow!("{message} (HTTP {code})")),
            }
        }
        Err(e) => Err(anyhow!(e)).with_context(|| {
            format!("could not reach the handoff server at {url}; is `handoff serve` running?")
        }),
    }
}
