use std::path::Path;
use std::time::Duration;

use handoff_core::external::run_command;

use crate::output::print_json;

pub fn run(root: &Path, argv: &[String], timeout: u64, json: bool) -> anyhow::Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    let outcome = rt.block_on(run_command(argv, root, Duration::from_secs(timeout)))?;

    if json {
        print_json(&outcome)?;
    } else {
        print!("{}", outcome.stdout);
        eprint!("{}", outcome.stderr);
    }

    if outcome.timed_out {
        anyhow::bail!("{} timed out after {timeout}s", argv[0]);
    }
    if !outcome.success {
        match outcome.exit_code {
            Some(code) => anyhow::bail!("{} exited with status {code}", argv[0]),
            None => anyhow::bail!("{} was terminated by a signal", argv[0]),
        }
    }
    Ok(())
}
