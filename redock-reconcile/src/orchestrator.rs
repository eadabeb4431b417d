//! Deployment orchestrator: Synchronize → Build-and-Run → Garbage-Collect
//! under the working-tree lock.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use redock_core::types::{
    ErrorReport, ReconcileState, ReconciliationOutcome, StackIdentity, Stage,
};
use redock_core::{paths, DeployConfig};

use crate::driver::{self, ComposeRuntime, ContainerRuntime, DeploymentDescriptor};
use crate::error::ReconcileError;
use crate::gc;
use crate::git::{GitCli, SourceRepository};
use crate::lock::WorktreeLock;
use crate::retry::RetryPolicy;
use crate::synchronizer::{self, SyncPlan};

/// Cooperative shutdown flag, checked at every stage boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Single entry point of the pipeline.
pub struct Orchestrator {
    config: DeployConfig,
    locks_dir: PathBuf,
    repo: Box<dyn SourceRepository>,
    runtime: Box<dyn ContainerRuntime>,
    retry: RetryPolicy,
    state: Mutex<ReconcileState>,
    last_good: Mutex<Option<StackIdentity>>,
}

impl Orchestrator {
    pub fn new(
        config: DeployConfig,
        home: &Path,
        repo: Box<dyn SourceRepository>,
        runtime: Box<dyn ContainerRuntime>,
    ) -> Self {
        let retry = RetryPolicy::from(&config.retry);
        Self {
            config,
            locks_dir: paths::locks_dir(home),
            repo,
            runtime,
            retry,
            state: Mutex::new(ReconcileState::Idle),
            last_good: Mutex::new(None),
        }
    }

    /// Production wiring: `git` and `docker compose` on `PATH`.
    pub fn from_config(config: DeployConfig, home: &Path) -> Self {
        let repo = GitCli::new(&config.worktree, config.fetch_timeout());
        Self::new(config, home, Box::new(repo), Box::new(ComposeRuntime::new()))
    }

    /// Seed the last known good stack, e.g. from the persisted run record.
    pub fn with_last_good_stack(self, stack: Option<StackIdentity>) -> Self {
        *self.last_good.lock().unwrap_or_else(PoisonError::into_inner) = stack;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &DeployConfig {
        &self.config
    }

    pub fn state(&self) -> ReconcileState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn last_good_stack(&self) -> Option<StackIdentity> {
        self.last_good
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run one reconciliation, waiting for the tree lock if needed.
    pub fn reconcile(&self) -> Result<ReconciliationOutcome, ReconcileError> {
        self.reconcile_with(&CancelToken::new())
    }

    /// [`Self::reconcile`] with a cancellation token checked before each
    /// stage.
    pub fn reconcile_with(
        &self,
        cancel: &CancelToken,
    ) -> Result<ReconciliationOutcome, ReconcileError> {
        self.reconcile_then(cancel, |result| result)
    }

    /// Run one reconciliation and hand its result to `finish` before the
    /// tree lock is released. If the lock itself cannot be taken, `finish`
    /// sees that error without holding it.
    pub fn reconcile_then<R>(
        &self,
        cancel: &CancelToken,
        finish: impl FnOnce(Result<ReconciliationOutcome, ReconcileError>) -> R,
    ) -> R {
        let _lock = match WorktreeLock::acquire(&self.locks_dir, &self.config.worktree) {
            Ok(lock) => lock,
            Err(err) => return finish(Err(err)),
        };
        finish(self.run_locked(cancel))
    }

    fn run_locked(&self, cancel: &CancelToken) -> Result<ReconciliationOutcome, ReconcileError> {

        // Failed is transient: a new trigger starts over from Idle.
        if self.state() == ReconcileState::Failed {
            self.transition(ReconcileState::Idle);
        }

        let result = self.run_stages(cancel);
        match &result {
            Ok(outcome) => {
                tracing::info!(stack = %outcome.stack, "reconciliation complete");
            }
            Err(err) => {
                if self.state() != ReconcileState::Idle {
                    self.transition(ReconcileState::Failed);
                }
                tracing::error!(kind = %err.kind(), stage = %err.stage(), error = %err, "reconciliation failed");
            }
        }
        result
    }

    /// Error report with the last known good stack attached.
    pub fn report(&self, err: &ReconcileError) -> ErrorReport {
        err.to_report(self.last_good_stack())
    }

    fn run_stages(&self, cancel: &CancelToken) -> Result<ReconciliationOutcome, ReconcileError> {
        checkpoint(cancel, Stage::Sync)?;
        self.transition(ReconcileState::Syncing);
        let plan = SyncPlan::from_config(&self.config);
        let sync = synchronizer::synchronize(self.repo.as_ref(), &plan, &self.retry)?;

        checkpoint(cancel, Stage::Build)?;
        self.transition(ReconcileState::Building);
        let descriptor = DeploymentDescriptor::from_config(&self.config);
        driver::ensure_env_file(&descriptor.env_file)?;
        self.runtime.build_and_run(&descriptor)?;
        let stack = driver::stack_identity(&sync.current, &descriptor);
        *self.last_good.lock().unwrap_or_else(PoisonError::into_inner) = Some(stack.clone());

        self.transition(ReconcileState::Pruning);
        let mut outcome = ReconciliationOutcome {
            completed: Stage::Build,
            sync,
            stack,
            pruned_images: None,
            prune_warning: None,
        };
        if self.config.prune_images {
            if cancel.is_cancelled() {
                tracing::info!("shutdown requested, skipping image prune");
            } else {
                let pruned = gc::collect_garbage(self.runtime.as_ref());
                outcome.pruned_images = pruned.pruned;
                outcome.prune_warning = pruned.warning;
                outcome.completed = Stage::Prune;
            }
        }
        self.transition(ReconcileState::Idle);
        Ok(outcome)
    }

    fn transition(&self, next: ReconcileState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let from = *state;
        debug_assert!(from.can_transition_to(next), "illegal transition {from} -> {next}");
        tracing::debug!(%from, to = %next, "state");
        *state = next;
    }
}

fn checkpoint(cancel: &CancelToken, next: Stage) -> Result<(), ReconcileError> {
    if cancel.is_cancelled() {
        tracing::info!(stage = %next, "shutdown requested, stopping");
        return Err(ReconcileError::Cancelled { next });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tempfile::TempDir;

    use redock_core::types::{CommitRef, StackStatus, StashRef, SyncAction};

    use super::*;
    use crate::error::{BuildError, PruneError};
    use crate::git::GitError;

    /// Always at `tip`; optionally trips `cancel_on_fetch` while fetching.
    #[derive(Default)]
    struct StaticRepo {
        cancel_on_fetch: Option<CancelToken>,
    }

    const TIP: &str = "abc123";

    impl SourceRepository for StaticRepo {
        fn exists(&self) -> bool {
            true
        }
        fn head(&self) -> Result<Option<CommitRef>, GitError> {
            Ok(Some(CommitRef::from(TIP)))
        }
        fn fetch(&self, _r: &str, _b: &str) -> Result<CommitRef, GitError> {
            if let Some(cancel) = &self.cancel_on_fetch {
                cancel.cancel();
            }
            Ok(CommitRef::from(TIP))
        }
        fn has_local_changes(&self, _k: &[PathBuf]) -> Result<bool, GitError> {
            Ok(false)
        }
        fn discard_local_changes(&self, _k: &[PathBuf]) -> Result<(), GitError> {
            Ok(())
        }
        fn checkout(&self, _b: &str, _c: &CommitRef) -> Result<(), GitError> {
            Ok(())
        }
        fn stash(&self, _m: &str, _k: &[PathBuf]) -> Result<Option<StashRef>, GitError> {
            Ok(None)
        }
        fn unstash(&self, _s: &StashRef) -> Result<(), GitError> {
            Ok(())
        }
        fn drop_stash(&self, _s: &StashRef) -> Result<(), GitError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingRuntime {
        builds: Arc<AtomicUsize>,
        prunes: Arc<AtomicUsize>,
        fail_build: bool,
        fail_prune: bool,
        cancel_on_build: Option<CancelToken>,
    }

    impl ContainerRuntime for CountingRuntime {
        fn build_and_run(&self, _d: &DeploymentDescriptor) -> Result<(), BuildError> {
            if let Some(cancel) = &self.cancel_on_build {
                cancel.cancel();
            }
            self.builds.fetch_add(1, Ordering::SeqCst);
            if self.fail_build {
                return Err(BuildError::Exited {
                    command: "docker compose up".into(),
                    code: "1".into(),
                    stderr: "build failed".into(),
                });
            }
            Ok(())
        }
        fn prune_unused_images(&self) -> Result<usize, PruneError> {
            self.prunes.fetch_add(1, Ordering::SeqCst);
            if self.fail_prune {
                return Err(PruneError::Exited {
                    command: "docker image prune".into(),
                    code: "1".into(),
                    stderr: "daemon down".into(),
                });
            }
            Ok(0)
        }
    }

    fn orchestrator(home: &TempDir, tree: &TempDir, runtime: CountingRuntime) -> Orchestrator {
        let config = DeployConfig::new(tree.path());
        Orchestrator::new(config, home.path(), Box::new(StaticRepo::default()), Box::new(runtime))
    }

    #[test]
    fn success_returns_to_idle_and_records_stack() {
        let (home, tree) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let orch = orchestrator(&home, &tree, CountingRuntime::default());

        let outcome = orch.reconcile().expect("reconcile");
        assert_eq!(outcome.completed, Stage::Prune);
        assert_eq!(outcome.sync.action, SyncAction::UpToDate);
        assert_eq!(outcome.pruned_images, Some(0));
        assert_eq!(orch.state(), ReconcileState::Idle);
        assert_eq!(orch.last_good_stack(), Some(outcome.stack.clone()));
        assert!(tree.path().join(".env").is_file());
    }

    #[test]
    fn build_failure_reports_unknown_stack_and_recovers_on_next_trigger() {
        let (home, tree) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let previous = StackIdentity {
            commit: CommitRef::from("0000000"),
            descriptor_digest: "feedface0000".into(),
        };
        let orch = orchestrator(
            &home,
            &tree,
            CountingRuntime {
                fail_build: true,
                ..Default::default()
            },
        )
        .with_last_good_stack(Some(previous.clone()));

        let err = orch.reconcile().unwrap_err();
        assert_eq!(orch.state(), ReconcileState::Failed);
        let report = orch.report(&err);
        assert_eq!(report.exit_code, 21);
        assert_eq!(report.stack_status, StackStatus::Unknown);
        assert_eq!(report.last_known_stack, Some(previous));

        // Next trigger starts over from Idle and fails the same way.
        assert!(orch.reconcile().is_err());
        assert_eq!(orch.state(), ReconcileState::Failed);
    }

    #[test]
    fn prune_failure_does_not_fail_reconciliation() {
        let (home, tree) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let orch = orchestrator(
            &home,
            &tree,
            CountingRuntime {
                fail_prune: true,
                ..Default::default()
            },
        );
        let outcome = orch.reconcile().expect("reconcile");
        assert_eq!(outcome.pruned_images, None);
        assert!(outcome.prune_warning.is_some());
    }

    #[test]
    fn cancelled_token_stops_before_sync() {
        let (home, tree) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let builds = Arc::new(AtomicUsize::new(0));
        let orch = orchestrator(
            &home,
            &tree,
            CountingRuntime {
                builds: builds.clone(),
                ..Default::default()
            },
        );
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = orch.reconcile_with(&cancel).unwrap_err();
        assert!(matches!(err, ReconcileError::Cancelled { next: Stage::Sync }));
        assert_eq!(err.exit_code(), 31);
        assert_eq!(builds.load(Ordering::SeqCst), 0);
        assert_eq!(orch.state(), ReconcileState::Idle);
    }

    #[test]
    fn cancel_during_sync_stops_before_build_and_fails() {
        let (home, tree) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let cancel = CancelToken::new();
        let builds = Arc::new(AtomicUsize::new(0));
        let runtime = CountingRuntime {
            builds: builds.clone(),
            ..Default::default()
        };
        let repo = StaticRepo {
            cancel_on_fetch: Some(cancel.clone()),
        };
        let orch = Orchestrator::new(
            DeployConfig::new(tree.path()),
            home.path(),
            Box::new(repo),
            Box::new(runtime),
        );

        let err = orch.reconcile_with(&cancel).unwrap_err();
        assert!(matches!(err, ReconcileError::Cancelled { next: Stage::Build }), "got {err}");
        assert_eq!(err.exit_code(), 31);
        assert_eq!(builds.load(Ordering::SeqCst), 0);
        assert_eq!(orch.state(), ReconcileState::Failed);
        assert_eq!(orch.report(&err).stack_status, StackStatus::Untouched);
    }

    #[test]
    fn cancel_during_build_finishes_build_and_skips_prune() {
        let (home, tree) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let cancel = CancelToken::new();
        let (builds, prunes) = (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)));
        let orch = orchestrator(
            &home,
            &tree,
            CountingRuntime {
                builds: builds.clone(),
                prunes: prunes.clone(),
                cancel_on_build: Some(cancel.clone()),
                ..Default::default()
            },
        );

        let outcome = orch.reconcile_with(&cancel).expect("build completes");
        assert_eq!(outcome.completed, Stage::Build);
        assert_eq!(outcome.pruned_images, None);
        assert_eq!(outcome.prune_warning, None);
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(prunes.load(Ordering::SeqCst), 0);
        assert_eq!(orch.state(), ReconcileState::Idle);
        assert_eq!(orch.last_good_stack(), Some(outcome.stack));
    }

    #[test]
    fn finish_runs_while_tree_lock_is_held() {
        let (home, tree) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let orch = orchestrator(&home, &tree, CountingRuntime::default());
        let locks = paths::locks_dir(home.path());

        let contended = orch.reconcile_then(&CancelToken::new(), |result| {
            assert!(result.is_ok());
            WorktreeLock::try_acquire(&locks, tree.path()).unwrap().is_none()
        });
        assert!(contended, "lock released before finish ran");
        assert!(WorktreeLock::try_acquire(&locks, tree.path()).unwrap().is_some());
    }

    #[test]
    fn held_lock_blocks_until_released() {
        let (home, tree) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let orch = Arc::new(orchestrator(&home, &tree, CountingRuntime::default()));
        let held = WorktreeLock::acquire(&paths::locks_dir(home.path()), tree.path()).unwrap();

        let worker = {
            let orch = orch.clone();
            std::thread::spawn(move || orch.reconcile())
        };
        std::thread::sleep(std::time::Duration::from_millis(150));
        assert!(!worker.is_finished());
        drop(held);
        assert!(worker.join().unwrap().is_ok());
    }
}
