use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{HandoffError, Result};

/// How hard to try before declaring an endpoint unhealthy.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthPolicy {
    /// Per-request timeout.
    pub timeout: Duration,
    /// Extra attempts after the first failure.
    pub retries: u32,
    pub backoff: Duration,
    /// Accept only this status; any 2xx when unset.
    pub expect_status: Option<u16>,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            retries: 2,
            backoff: Duration::from_secs(1),
            expect_status: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub url: String,
    pub ok: bool,
    pub status: Option<u16>,
    pub attempts: u32,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub elapsed_ms: u64,
    pub error: Option<String>,
}

/// GET `url` until it answers as expected or the retries run out.
///
/// Unreachable or unhealthy endpoints produce a report with `ok == false`;
/// `Err` is reserved for a URL that cannot be requested at all.
pub async fn check(url: &str, policy: &HealthPolicy) -> Result<HealthReport> {
    let client = reqwest::Client::builder()
        .timeout(policy.timeout)
        .build()
        .map_err(|e| HandoffError::Http(e.to_string()))?;
    let parsed = reqwest::Url::parse(url).map_err(|e| HandoffError::Http(format!("{url}: {e}")))?;

    let started = Instant::now();
    let attempts = policy.retries + 1;
    let mut backoff = policy.backoff;
    let mut report = HealthReport {
        url: url.to_string(),
        ok: false,
        status: None,
        attempts: 0,
        content_type: None,
        content_length: None,
        elapsed_ms: 0,
        error: None,
    };

    for attempt in 1..=attempts {
        report.attempts = attempt;
        match client.get(parsed.clone()).send().await {
            Ok(resp) => {
                let status = resp.status();
                report.status = Some(status.as_u16());
                report.content_type = resp
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                report.content_length = resp.content_length();
                report.ok = match policy.expect_status {
                    Some(code) => status.as_u16() == code,
                    None => status.is_success(),
                };
                report.error = (!report.ok).then(|| format!("unexpected status {status}"));
            }
            Err(e) => {
                report.status = None;
                report.ok = false;
                report.error = Some(e.to_string());
            }
        }
        if report.ok {
            debug!(url, attempt, "health check passed");
            break;
        }
        warn!(url, attempt, error = ?report.error, "health check failed");
        if attempt < attempts {
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }
    }

    report.elapsed_ms = started.elapsed().as_millis() as u64;
    Ok(report)
}
