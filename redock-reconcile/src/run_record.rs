//! Persisted record of the last reconciliation.
//!
//! One JSON document at `<home>/.redock/state/last_run.json`, written with
//! the same atomic `.tmp` + rename pattern as the config. Each writer uses
//! its own temporary name.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use redock_core::paths;
use redock_core::types::{ErrorReport, ReconciliationOutcome, StackIdentity};

use crate::error::{io_err, RecordError};

/// Outcome of the recorded run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RunResult {
    Success(ReconciliationOutcome),
    Failure(ErrorReport),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub finished_at: DateTime<Utc>,
    /// Who asked for the run: `cli`, `daemon`, `webhook`, ...
    pub source: String,
    pub duration_ms: u64,
    pub result: RunResult,
    /// Most recent stack that built successfully, carried across failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_good_stack: Option<StackIdentity>,
}

impl RunRecord {
    pub fn is_success(&self) -> bool {
        matches!(self.result, RunResult::Success(_))
    }

    /// Process exit status for this run.
    pub fn exit_code(&self) -> i32 {
        match &self.result {
            RunResult::Success(_) => 0,
            RunResult::Failure(report) => report.exit_code,
        }
    }
}

/// Load the last run record; `None` if no run has finished yet.
pub fn load_at(home: &Path) -> Result<Option<RunRecord>, RecordError> {
    let path = paths::last_run_path(home);
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    Ok(Some(serde_json::from_str(&contents)?))
}

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Replace the last run record atomically.
pub fn save_at(home: &Path, record: &RunRecord) -> Result<(), RecordError> {
    let path = paths::last_run_path(home);
    let dir = paths::state_dir(home);
    std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;

    let json = serde_json::to_string_pretty(record)?;
    // Per-writer name: a CLI run and the daemon may save at the same moment.
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let tmp = path.with_extension(format!("json.{}-{seq}.tmp", std::process::id()));
    std::fs::write(&tmp, &json).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
    Ok(())
}
