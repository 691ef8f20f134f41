//! Command handlers, one module per subcommand.

pub mod completions;
pub mod devices;
pub mod download;
pub mod install;
pub mod key;
pub mod logs;
pub mod packages;
pub mod repos;
pub mod token;
pub mod uninstall;

use std::future::Future;

use anyhow::{Result, bail};
use penumbra_core::InstallationEngine;
use penumbra_schema::{JobState, JobSummary};

use crate::ui::table::summary_table;

/// Drive a job to completion, turning Ctrl-C into a cancellation request.
async fn run_interruptible<F>(engine: &InstallationEngine, job: F) -> Result<JobSummary>
where
    F: Future<Output = penumbra_core::Result<JobSummary>>,
{
    tokio::pin!(job);
    loop {
        tokio::select! {
            summary = &mut job => return Ok(summary?),
            signal = tokio::signal::ctrl_c() => {
                signal?;
                if engine.cancel_installation() {
                    eprintln!("Cancelling, waiting for running steps to stop...");
                }
            }
        }
    }
}

/// Print a finished job and fail if any repository did not complete.
fn report(summary: &JobSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
    } else {
        println!();
        println!("{}", summary_table(summary));
        if summary.rebooted {
            println!("Device is rebooting.");
        }
    }

    let failed = summary
        .repositories
        .values()
        .filter(|s| s.is_failed())
        .count();
    match summary.state {
        JobState::Cancelled => bail!("{} cancelled", summary.operation),
        _ if failed > 0 => bail!("{failed} of {} repositories failed", summary.repositories.len()),
        _ => Ok(()),
    }
}
