//! `redock status`: the last reconciliation, from the run record.

use anyhow::{Context, Result};
use clap::Args;
use tabled::{settings::Style, Table, Tabled};

use redock_reconcile::{run_record, RunRecord, RunResult};

/// Arguments for `redock status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct StatusTableRow {
    #[tabled(rename = "finished")]
    finished: String,
    #[tabled(rename = "source")]
    source: String,
    #[tabled(rename = "result")]
    result: String,
    #[tabled(rename = "commit")]
    commit: String,
    #[tabled(rename = "stack")]
    stack: String,
    #[tabled(rename = "duration")]
    duration: String,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let record = run_record::load_at(&home).context("failed to read last run record")?;

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&record).context("failed to serialize status JSON")?
            );
            return Ok(());
        }

        let Some(record) = record else {
            println!("No reconciliation has run yet. Run `redock reconcile`.");
            return Ok(());
        };

        let mut table = Table::new([row(&record)]);
        table.with(Style::rounded());
        println!("{table}");
        super::reconcile::print_record(&record);
        Ok(())
    }
}

fn row(record: &RunRecord) -> StatusTableRow {
    let (result, commit) = match &record.result {
        RunResult::Success(outcome) => ("ok".to_string(), outcome.sync.current.short().to_string()),
        RunResult::Failure(report) => (format!("{} ({})", report.kind, report.exit_code), "-".to_string()),
    };
    StatusTableRow {
        finished: record.finished_at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        source: record.source.clone(),
        result,
        commit,
        stack: record
            .last_good_stack
            .as_ref()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "-".to_string()),
        duration: format!("{} ms", record.duration_ms),
    }
}
