use std::time::Duration;

use handoff_core::health::{self, HealthPolicy};

use crate::output::{print_fields, print_json};

pub fn run(
    url: &str,
    timeout: u64,
    retries: u32,
    expect_status: Option<u16>,
    json: bool,
) -> anyhow::Result<()> {
    let policy = HealthPolicy {
        timeout: Duration::from_secs(timeout),
        retries,
        expect_status,
        ..HealthPolicy::default()
    };
    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(health::check(url, &policy))?;

    if json {
        print_json(&report)?;
    } else {
        let mut fields = vec![
            ("url", report.url.clone()),
            ("ok", report.ok.to_string()),
            (
                "status",
                report.status.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
            ),
            ("attempts", report.attempts.to_string()),
            ("elapsed", format!("{}ms", report.elapsed_ms)),
        ];
        if let Some(ct) = &report.content_type {
            fields.push(("type", ct.clone()));
        }
        if let Some(err) = &report.error {
            fields.push(("error", err.clone()));
        }
        print_fields(&fields);
    }

    if !report.ok {
        anyhow::bail!("{url} is unhealthy");
    }
    Ok(())
}
