//! `redock trigger`: hand a reconcile request to the running daemon.

use anyhow::{Context, Result};
use clap::Args;

use redock_daemon::request_reconcile;

/// Arguments for `redock trigger`.
#[derive(Args, Debug)]
pub struct TriggerArgs {
    /// Recorded as the run's trigger source.
    #[arg(long, default_value = "cli")]
    pub source: String,

    /// Emit the run record as JSON.
    #[arg(long)]
    pub json: bool,
}

impl TriggerArgs {
    /// Returns the exit status of the run that served this trigger.
    pub fn run(self) -> Result<i32> {
        let home = super::home()?;
        let reply = request_reconcile(&home, Some(self.source))
            .context("failed to trigger reconcile via daemon")?;

        if self.json {
            super::reconcile::print_json(&reply.record)?;
        } else {
            if reply.coalesced > 1 {
                println!("served together with {} other trigger(s)", reply.coalesced - 1);
            }
            super::reconcile::print_record(&reply.record);
        }
        Ok(reply.record.exit_code())
    }
}
