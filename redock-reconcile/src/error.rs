//! Error types for redock-reconcile.

use std::path::PathBuf;

use thiserror::Error;

use redock_core::types::{
    CommitRef, ErrorKind, ErrorReport, StackIdentity, StackStatus, Stage, StashRef,
};

use crate::runner::CommandError;

/// Tagged failure of one reconciliation. Every variant maps to exactly one
/// [`ErrorKind`] so callers can alert or retry without parsing messages.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Set-aside local modifications do not apply on top of the new tip.
    /// The tree was restored to the clean tip; the modifications live on in
    /// `stash`.
    #[error("local changes conflict with {}; preserved in stash {stash}: {detail}", .tip.short())]
    SyncConflict {
        tip: CommitRef,
        stash: StashRef,
        detail: String,
    },

    #[error("remote '{remote}' unreachable after {attempts} attempt(s): {detail}")]
    RemoteUnreachable {
        remote: String,
        attempts: u32,
        detail: String,
    },

    #[error("no git repository at {path}; the host needs re-provisioning")]
    RepositoryMissing { path: PathBuf },

    /// Any other git failure (unknown branch, corrupt index, ...).
    #[error("git {step} failed: {detail}")]
    Sync { step: &'static str, detail: String },

    #[error("runtime config file {path} is missing and could not be created: {source}")]
    ConfigMissing {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("build failed: {0}")]
    BuildFailed(#[from] BuildError),

    #[error("could not lock working tree via {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Shutdown was requested; the pipeline stopped at a stage boundary.
    #[error("cancelled before {next} stage")]
    Cancelled { next: Stage },
}

impl ReconcileError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReconcileError::SyncConflict { .. } => ErrorKind::SyncConflict,
            ReconcileError::RemoteUnreachable { .. } => ErrorKind::RemoteUnreachable,
            ReconcileError::RepositoryMissing { .. } => ErrorKind::RepositoryMissing,
            ReconcileError::Sync { .. } => ErrorKind::SyncFailed,
            ReconcileError::ConfigMissing { .. } => ErrorKind::ConfigMissing,
            ReconcileError::BuildFailed(_) => ErrorKind::BuildFailed,
            ReconcileError::Lock { .. } => ErrorKind::LockFailed,
            ReconcileError::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// Stage that was running (or about to run) when the error occurred.
    pub fn stage(&self) -> Stage {
        match self {
            ReconcileError::ConfigMissing { .. } | ReconcileError::BuildFailed(_) => Stage::Build,
            ReconcileError::Cancelled { next } => *next,
            _ => Stage::Sync,
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }

    /// Build the serializable report, attaching what is known about the
    /// running stack.
    pub fn to_report(&self, last_known_stack: Option<StackIdentity>) -> ErrorReport {
        let stack_status = match self {
            ReconcileError::BuildFailed(_) => StackStatus::Unknown,
            _ => StackStatus::Untouched,
        };
        let stash = match self {
            ReconcileError::SyncConflict { stash, .. } => Some(stash.clone()),
            _ => None,
        };
        ErrorReport {
            kind: self.kind(),
            stage: self.stage(),
            message: self.to_string(),
            exit_code: self.exit_code(),
            stack_status,
            last_known_stack,
            stash,
        }
    }
}

/// Failure of the container build-and-run primitive.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("`{command}` exited with {code}: {stderr}")]
    Exited {
        command: String,
        code: String,
        stderr: String,
    },
}

/// Failure of the image prune primitive. Never fatal.
#[derive(Debug, Error)]
pub enum PruneError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("`{command}` exited with {code}: {stderr}")]
    Exited {
        command: String,
        code: String,
        stderr: String,
    },
}

/// Failure reading or writing the persisted run record.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("run record JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience constructor for [`RecordError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> RecordError {
    RecordError::Io {
        path: path.into(),
        source,
    }
}

/// Keep diagnostics readable: the last few lines of a child's stderr carry
/// the actual error, the rest is progress noise.
pub(crate) fn tail_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.is_empty())
        .collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}
