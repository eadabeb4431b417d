//! `redock reconcile`: one Synchronize → Build → Prune run in this process.

use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use redock_core::types::{StackStatus, SyncAction};
use redock_reconcile::{pipeline, CancelToken, Orchestrator, RunRecord, RunResult};

use super::super::StrategyArg;

/// Arguments for `redock reconcile`.
#[derive(Args, Debug)]
pub struct ReconcileArgs {
    /// Override the configured strategy for this run.
    #[arg(long, short = 's', value_name = "STRATEGY")]
    pub strategy: Option<StrategyArg>,

    /// Recorded as the run's trigger source.
    #[arg(long, default_value = "cli")]
    pub source: String,

    /// Emit the run record as JSON.
    #[arg(long)]
    pub json: bool,
}

impl ReconcileArgs {
    /// Returns the process exit status.
    pub fn run(self, config_override: Option<&Path>) -> Result<i32> {
        let home = super::home()?;
        let mut cfg = super::load_config(config_override, &home)?;
        if let Some(strategy) = self.strategy {
            cfg.strategy = strategy.into();
        }

        let orchestrator = Orchestrator::from_config(cfg, &home)
            .with_last_good_stack(pipeline::previous_good_stack(&home));
        let record = pipeline::run(&orchestrator, &home, &self.source, &CancelToken::new());

        if self.json {
            print_json(&record)?;
        } else {
            print_record(&record);
        }
        Ok(record.exit_code())
    }
}

pub(crate) fn print_json(record: &RunRecord) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(record).context("failed to serialize run record")?
    );
    Ok(())
}

/// Human summary of a run, shared with `trigger` and `status`.
pub(crate) fn print_record(record: &RunRecord) {
    match &record.result {
        RunResult::Success(outcome) => {
            let from = outcome
                .sync
                .previous
                .as_ref()
                .map(|c| c.short().to_string())
                .unwrap_or_else(|| "(none)".to_string());
            let action = match outcome.sync.action {
                SyncAction::UpToDate => "already at tip".to_string(),
                SyncAction::Advanced => format!("{from} → {}", outcome.sync.current.short()),
                SyncAction::DiscardedLocalChanges => {
                    format!("{from} → {}, local changes discarded", outcome.sync.current.short())
                }
                SyncAction::ReappliedLocalChanges => {
                    format!("{from} → {}, local changes reapplied", outcome.sync.current.short())
                }
            };
            println!(
                "{} reconciled ({}, {} ms)",
                "✓".green().bold(),
                action,
                record.duration_ms
            );
            println!("  stack: {}", outcome.stack);
            match (&outcome.pruned_images, &outcome.prune_warning) {
                (Some(n), _) => println!("  pruned images: {n}"),
                (None, Some(warning)) => println!("  {} {warning}", "warning:".yellow()),
                (None, None) => {}
            }
        }
        RunResult::Failure(report) => {
            println!(
                "{} {} failed at {} stage (exit {})",
                "✗".red().bold(),
                report.kind,
                report.stage,
                report.exit_code
            );
            println!("  {}", report.message);
            if let Some(stash) = &report.stash {
                println!("  local changes kept in stash {stash}");
            }
            match (report.stack_status, &report.last_known_stack) {
                (StackStatus::Unknown, Some(stack)) => {
                    println!("  running stack: unknown (last known good {stack})")
                }
                (StackStatus::Unknown, None) => println!("  running stack: unknown"),
                (StackStatus::Untouched, Some(stack)) => {
                    println!("  running stack: untouched ({stack})")
                }
                (StackStatus::Untouched, None) => println!("  running stack: untouched"),
            }
        }
    }
}
