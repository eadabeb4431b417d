//! Shared reconcile entrypoint used by the CLI and the daemon.

use std::path::Path;
use std::time::Instant;

use chrono::Utc;

use crate::orchestrator::{CancelToken, Orchestrator};
use crate::run_record::{self, RunRecord, RunResult};

/// Run one reconciliation and persist its record under `home`.
///
/// The record is written before the tree lock is released, so runs against
/// one tree persist in the order they ran. A failure to write it is logged;
/// the run's own result is what callers act on.
pub fn run(orchestrator: &Orchestrator, home: &Path, source: &str, cancel: &CancelToken) -> RunRecord {
    let started = Instant::now();
    tracing::info!(source, worktree = %orchestrator.config().worktree.display(), "reconciliation requested");

    orchestrator.reconcile_then(cancel, |result| {
        let result = match result {
            Ok(outcome) => RunResult::Success(outcome),
            Err(err) => RunResult::Failure(orchestrator.report(&err)),
        };
        let record = RunRecord {
            finished_at: Utc::now(),
            source: source.to_string(),
            duration_ms: started.elapsed().as_millis() as u64,
            result,
            last_good_stack: orchestrator.last_good_stack(),
        };
        if let Err(err) = run_record::save_at(home, &record) {
            tracing::warn!(error = %err, "could not persist run record");
        }
        record
    })
}

/// Last good stack from a previous run, for seeding a fresh orchestrator.
pub fn previous_good_stack(home: &Path) -> Option<redock_core::StackIdentity> {
    match run_record::load_at(home) {
        Ok(record) => record.and_then(|r| r.last_good_stack),
        Err(err) => {
            tracing::warn!(error = %err, "ignoring unreadable run record");
            None
        }
    }
}
