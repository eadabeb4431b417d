//! Domain types for deployment reconciliation.
//!
//! Everything here is serializable so the same values flow through the run
//! record on disk, the daemon socket, and `--json` CLI output.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A full git commit id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitRef(pub String);

impl CommitRef {
    /// First seven characters, the way `git log --oneline` prints them.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(7);
        &self.0[..end]
    }
}

impl fmt::Display for CommitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for CommitRef {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CommitRef {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A stash entry holding set-aside local modifications (e.g. `stash@{0}`
/// or the stash commit id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StashRef(pub String);

impl fmt::Display for StashRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for StashRef {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// How local drift in the working tree is resolved before checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Reset and clean: every local modification is erased.
    #[default]
    Discard,
    /// Stash, check out, reapply; conflicts abort with the stash kept.
    Preserve,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Discard => write!(f, "discard"),
            Strategy::Preserve => write!(f, "preserve"),
        }
    }
}

/// A pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Sync,
    Build,
    Prune,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Sync => write!(f, "sync"),
            Stage::Build => write!(f, "build"),
            Stage::Prune => write!(f, "prune"),
        }
    }
}

/// Orchestrator state machine.
///
/// ```text
/// Idle → Syncing → Building → Pruning → Idle
///          └────────┴──→ Failed → Idle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReconcileState {
    #[default]
    Idle,
    Syncing,
    Building,
    Pruning,
    Failed,
}

impl ReconcileState {
    /// Whether `self → next` is an edge of the state machine.
    pub fn can_transition_to(self, next: ReconcileState) -> bool {
        use ReconcileState::*;
        matches!(
            (self, next),
            (Idle, Syncing)
                | (Syncing, Building)
                | (Building, Pruning)
                | (Pruning, Idle)
                | (Syncing, Failed)
                | (Building, Failed)
                | (Failed, Idle)
        )
    }
}

impl fmt::Display for ReconcileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReconcileState::Idle => "idle",
            ReconcileState::Syncing => "syncing",
            ReconcileState::Building => "building",
            ReconcileState::Pruning => "pruning",
            ReconcileState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What the synchronizer had to do to reach the remote tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    /// Already at the tip with no local modifications.
    UpToDate,
    /// Moved to a new tip; nothing local to resolve.
    Advanced,
    /// Local modifications were erased (Discard).
    DiscardedLocalChanges,
    /// Local modifications were set aside and reapplied cleanly (Preserve).
    ReappliedLocalChanges,
}

impl SyncAction {
    pub fn is_noop(self) -> bool {
        matches!(self, SyncAction::UpToDate)
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Result of one synchronizer pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub strategy: Strategy,
    /// `HEAD` before the pass; `None` for an unborn branch.
    pub previous: Option<CommitRef>,
    /// `HEAD` after the pass, always the remote tip.
    pub current: CommitRef,
    pub action: SyncAction,
}

/// Identity of the stack materialized from a tree: the commit plus a short
/// digest over the descriptor files.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StackIdentity {
    pub commit: CommitRef,
    pub descriptor_digest: String,
}

impl fmt::Display for StackIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.commit.short(), self.descriptor_digest)
    }
}

/// Successful reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationOutcome {
    /// Last stage that completed.
    pub completed: Stage,
    pub sync: SyncReport,
    pub stack: StackIdentity,
    /// Images removed, or `None` when pruning is disabled or failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pruned_images: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prune_warning: Option<String>,
}

/// Failure taxonomy as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SyncConflict,
    RemoteUnreachable,
    RepositoryMissing,
    SyncFailed,
    ConfigMissing,
    BuildFailed,
    LockFailed,
    Cancelled,
}

impl ErrorKind {
    /// Process exit status: 1x for sync failures, 2x for build failures,
    /// 3x for everything that is not a stage failure.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorKind::SyncConflict => 10,
            ErrorKind::RemoteUnreachable => 11,
            ErrorKind::RepositoryMissing => 12,
            ErrorKind::SyncFailed => 13,
            ErrorKind::ConfigMissing => 20,
            ErrorKind::BuildFailed => 21,
            ErrorKind::LockFailed => 30,
            ErrorKind::Cancelled => 31,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::SyncConflict => "sync_conflict",
            ErrorKind::RemoteUnreachable => "remote_unreachable",
            ErrorKind::RepositoryMissing => "repository_missing",
            ErrorKind::SyncFailed => "sync_failed",
            ErrorKind::ConfigMissing => "config_missing",
            ErrorKind::BuildFailed => "build_failed",
            ErrorKind::LockFailed => "lock_failed",
            ErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// What is known about the running stack after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StackStatus {
    /// The build stage never ran; the previous stack was not touched.
    Untouched,
    /// The build primitive failed part way; the previous stack may or may
    /// not still be serving.
    Unknown,
}

/// Cloneable, serializable description of a failed reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    /// Stage that was running when the failure happened.
    pub stage: Stage,
    pub message: String,
    pub exit_code: i32,
    pub stack_status: StackStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_known_stack: Option<StackIdentity>,
    /// Where preserved local modifications live after a conflict.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stash: Option<StashRef>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_short_handles_short_ids() {
        assert_eq!(CommitRef::from("0123456789abcdef").short(), "0123456");
        assert_eq!(CommitRef::from("abc").short(), "abc");
    }

    #[test]
    fn state_machine_success_path() {
        use ReconcileState::*;
        let path = [Idle, Syncing, Building, Pruning, Idle];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} → {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn state_machine_rejects_skipping_stages() {
        use ReconcileState::*;
        assert!(!Idle.can_transition_to(Building));
        assert!(!Syncing.can_transition_to(Pruning));
        assert!(!Pruning.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Syncing));
    }

    #[test]
    fn exit_codes_separate_sync_from_build() {
        assert!((10..20).contains(&ErrorKind::SyncConflict.exit_code()));
        assert!((10..20).contains(&ErrorKind::RemoteUnreachable.exit_code()));
        assert!((20..30).contains(&ErrorKind::BuildFailed.exit_code()));
        assert!((20..30).contains(&ErrorKind::ConfigMissing.exit_code()));
    }

    #[test]
    fn stack_identity_display() {
        let id = StackIdentity {
            commit: CommitRef::from("deadbeefcafe"),
            descriptor_digest: "0011aabb".into(),
        };
        assert_eq!(id.to_string(), "deadbee+0011aabb");
    }

    #[test]
    fn strategy_serde_is_lowercase() {
        let yaml = serde_yaml::to_string(&Strategy::Preserve).expect("serialize");
        assert_eq!(yaml.trim(), "preserve");
    }
}
