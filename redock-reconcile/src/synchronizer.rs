//! Working-tree synchronizer.
//!
//! Brings a checkout, possibly carrying local drift, to exactly the remote
//! branch tip. The remote is fetched before anything local is touched, so an
//! unreachable remote leaves the tree as it was.

use std::path::{Path, PathBuf};

use redock_core::types::{CommitRef, Strategy, SyncAction, SyncReport};
use redock_core::{paths, DeployConfig};

use crate::error::ReconcileError;
use crate::git::{GitError, SourceRepository};
use crate::retry::RetryPolicy;

/// Everything one synchronizer pass needs, derived from [`DeployConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPlan {
    pub worktree: PathBuf,
    pub remote: String,
    pub branch: String,
    pub strategy: Strategy,
    /// Tree-relative paths that are never discarded or stashed.
    pub keep: Vec<PathBuf>,
}

impl SyncPlan {
    /// Only an env file that resolves to a path inside the tree is kept;
    /// one outside it (`../shared.env`, `/etc/app.env`) is not git's business.
    pub fn from_config(config: &DeployConfig) -> Self {
        let tree = paths::normalize(&config.worktree);
        let env_file = paths::normalize(&config.env_file_path());
        let keep = env_file
            .strip_prefix(&tree)
            .ok()
            .filter(|rel| !rel.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .into_iter()
            .collect();
        Self {
            worktree: config.worktree.clone(),
            remote: config.remote.clone(),
            branch: config.branch.clone(),
            strategy: config.strategy,
            keep,
        }
    }
}

/// Run one synchronizer pass.
pub fn synchronize(
    repo: &dyn SourceRepository,
    plan: &SyncPlan,
    retry: &RetryPolicy,
) -> Result<SyncReport, ReconcileError> {
    if !repo.exists() {
        return Err(ReconcileError::RepositoryMissing {
            path: plan.worktree.clone(),
        });
    }

    let previous = repo.head().map_err(sync_err("rev-parse"))?;
    let tip = retry
        .run(
            |attempt| {
                tracing::debug!(remote = %plan.remote, branch = %plan.branch, attempt, "fetching");
                repo.fetch(&plan.remote, &plan.branch)
            },
            GitError::is_network,
        )
        .map_err(|(err, attempts)| {
            if err.is_network() {
                ReconcileError::RemoteUnreachable {
                    remote: plan.remote.clone(),
                    attempts,
                    detail: err.detail(),
                }
            } else {
                sync_err("fetch")(err)
            }
        })?;

    let dirty = repo
        .has_local_changes(&plan.keep)
        .map_err(sync_err("status"))?;
    let at_tip = previous.as_ref() == Some(&tip);

    let action = if !dirty && at_tip {
        SyncAction::UpToDate
    } else {
        let kept = KeptFiles::capture(&plan.worktree, &plan.keep)?;
        let moved = move_to_tip(repo, plan, &tip, dirty);
        match (moved, kept.restore()) {
            (Ok(action), Ok(())) => action,
            (Ok(_), Err(err)) => return Err(err),
            (Err(err), restored) => {
                if let Err(restore_err) = restored {
                    tracing::error!(error = %restore_err, "could not restore host-owned files");
                }
                return Err(err);
            }
        }
    };

    tracing::info!(
        strategy = %plan.strategy,
        from = previous.as_ref().map(|c| c.short()).unwrap_or("(none)"),
        commit = %tip.short(),
        ?action,
        "working tree synchronized"
    );
    Ok(SyncReport {
        strategy: plan.strategy,
        previous,
        current: tip,
        action,
    })
}

fn move_to_tip(
    repo: &dyn SourceRepository,
    plan: &SyncPlan,
    tip: &CommitRef,
    dirty: bool,
) -> Result<SyncAction, ReconcileError> {
    match (plan.strategy, dirty) {
        (_, false) => {
            repo.checkout(&plan.branch, tip)
                .map_err(sync_err("checkout"))?;
            Ok(SyncAction::Advanced)
        }
        (Strategy::Discard, true) => {
            tracing::warn!(worktree = %plan.worktree.display(), "discarding local changes");
            repo.discard_local_changes(&plan.keep)
                .map_err(sync_err("reset"))?;
            repo.checkout(&plan.branch, tip)
                .map_err(sync_err("checkout"))?;
            Ok(SyncAction::DiscardedLocalChanges)
        }
        (Strategy::Preserve, true) => preserve(repo, plan, tip),
    }
}

/// Host-owned files (the env file) as they were before the tree moved.
///
/// Tracked or not, their contents survive every strategy: a reset or a
/// forced checkout that rewrites one is undone once the tree is at the tip.
struct KeptFiles(Vec<(PathBuf, Vec<u8>)>);

impl KeptFiles {
    fn capture(worktree: &Path, keep: &[PathBuf]) -> Result<Self, ReconcileError> {
        let mut files = Vec::new();
        for rel in keep {
            let path = worktree.join(rel);
            if !path.is_file() {
                continue;
            }
            let contents = std::fs::read(&path).map_err(keep_err("read", &path))?;
            files.push((path, contents));
        }
        Ok(Self(files))
    }

    fn restore(&self) -> Result<(), ReconcileError> {
        for (path, contents) in &self.0 {
            if std::fs::read(path).ok().as_ref() == Some(contents) {
                continue;
            }
            tracing::info!(path = %path.display(), "restoring host-owned file after sync");
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir).map_err(keep_err("restore", path))?;
            }
            std::fs::write(path, contents).map_err(keep_err("restore", path))?;
        }
        Ok(())
    }
}

fn keep_err<'a>(op: &'static str, path: &'a Path) -> impl Fn(std::io::Error) -> ReconcileError + 'a {
    move |err| ReconcileError::Sync {
        step: "keep",
        detail: format!("{op} {}: {err}", path.display()),
    }
}

/// Stash, move to the tip, reapply. A reapply that does not go through
/// cleanly leaves the tree at the clean tip with the stash entry kept.
fn preserve(
    repo: &dyn SourceRepository,
    plan: &SyncPlan,
    tip: &CommitRef,
) -> Result<SyncAction, ReconcileError> {
    let message = format!("redock: local changes before {}", tip.short());
    let stash = repo
        .stash(&message, &plan.keep)
        .map_err(sync_err("stash"))?;
    repo.checkout(&plan.branch, tip)
        .map_err(sync_err("checkout"))?;

    let Some(stash) = stash else {
        return Ok(SyncAction::Advanced);
    };

    match repo.unstash(&stash) {
        Ok(()) => {
            repo.drop_stash(&stash).map_err(sync_err("stash drop"))?;
            Ok(SyncAction::ReappliedLocalChanges)
        }
        Err(err) => {
            tracing::warn!(stash = %stash, commit = %tip.short(), "local changes conflict with remote tip");
            repo.discard_local_changes(&plan.keep)
                .map_err(sync_err("reset"))?;
            Err(ReconcileError::SyncConflict {
                tip: tip.clone(),
                stash,
                detail: err.detail(),
            })
        }
    }
}

fn sync_err(step: &'static str) -> impl Fn(GitError) -> ReconcileError {
    move |err| ReconcileError::Sync {
        step,
        detail: err.detail(),
    }
}
