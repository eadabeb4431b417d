mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use common::{Fixture, RecordingRuntime};
use redock_core::types::{ReconcileState, Stage, Strategy, SyncAction};
use redock_core::DeployConfig;
use redock_reconcile::{
    pipeline, run_record, CancelToken, GitCli, Orchestrator, RetryPolicy, RunResult,
};

fn orchestrator(fx: &Fixture, strategy: Strategy, runtime: RecordingRuntime) -> Orchestrator {
    let mut config = DeployConfig::new(&fx.deploy);
    config.strategy = strategy;
    let repo = GitCli::new(&fx.deploy, Duration::from_secs(30));
    Orchestrator::new(config, fx.home.path(), Box::new(repo), Box::new(runtime))
        .with_retry(RetryPolicy::none())
}

#[test]
fn clean_tree_moves_from_a_to_b_and_rebuilds() {
    let fx = Fixture::new();
    let a = fx.deploy_head();
    let b = fx.publish(&[("app.txt", "version = 2\n")]);
    let runtime = RecordingRuntime::default();
    let orch = orchestrator(&fx, Strategy::Discard, runtime.clone());

    let outcome = orch.reconcile().expect("reconcile");
    assert_eq!(outcome.completed, Stage::Prune);
    assert_eq!(outcome.sync.previous, Some(a));
    assert_eq!(outcome.sync.current, b);
    assert_eq!(outcome.stack.commit, b);
    assert!(outcome.pruned_images.is_some());
    assert_eq!(fx.deploy_head(), b);
    assert_eq!(runtime.build_count(), 1);
    assert_eq!(runtime.prunes.load(Ordering::SeqCst), 1);
    assert_eq!(orch.state(), ReconcileState::Idle);
}

#[test]
fn dirty_tracked_file_at_unchanged_tip_is_discarded() {
    let fx = Fixture::new();
    let a = fx.deploy_head();
    fx.write("app.txt", "edited in place\n");
    let orch = orchestrator(&fx, Strategy::Discard, RecordingRuntime::default());

    let outcome = orch.reconcile().expect("reconcile");
    assert_eq!(outcome.sync.action, SyncAction::DiscardedLocalChanges);
    assert_eq!(fx.deploy_head(), a);
    assert_eq!(fx.read("app.txt"), "version = 1\n");
}

#[test]
fn repeated_runs_at_tip_are_idempotent() {
    let fx = Fixture::new();
    let runtime = RecordingRuntime::default();
    let orch = orchestrator(&fx, Strategy::Preserve, runtime.clone());

    let first = orch.reconcile().expect("first");
    let second = orch.reconcile().expect("second");
    assert_eq!(first, second);
    assert!(second.sync.action.is_noop());
    assert_eq!(runtime.build_count(), 2);
}

#[test]
fn absent_env_file_is_created_before_build() {
    let fx = Fixture::new();
    assert!(!fx.deploy.join(".env").exists());
    let orch = orchestrator(&fx, Strategy::Discard, RecordingRuntime::default());

    orch.reconcile().expect("reconcile");
    let meta = std::fs::metadata(fx.deploy.join(".env")).expect(".env");
    assert!(meta.is_file());
    assert_eq!(fx.status(), "?? .env");
}

#[test]
fn conflict_fails_before_build_and_pipeline_records_it() {
    let fx = Fixture::new();
    fx.publish(&[("app.txt", "version = 2\n")]);
    fx.write("app.txt", "version = 1-hotfix\n");
    let runtime = RecordingRuntime::default();
    let orch = orchestrator(&fx, Strategy::Preserve, runtime.clone());

    let record = pipeline::run(&orch, fx.home.path(), "webhook", &CancelToken::new());
    assert_eq!(record.exit_code(), 10);
    assert_eq!(record.source, "webhook");
    match &record.result {
        RunResult::Failure(report) => {
            assert_eq!(report.stage, Stage::Sync);
            assert!(report.stash.is_some());
        }
        RunResult::Success(_) => panic!("expected conflict"),
    }
    assert_eq!(runtime.build_count(), 0);
    assert_eq!(orch.state(), ReconcileState::Failed);

    let persisted = run_record::load_at(fx.home.path()).unwrap().unwrap();
    assert_eq!(persisted, record);
}

#[test]
fn pipeline_carries_last_good_stack_across_failures() {
    let fx = Fixture::new();
    let orch = orchestrator(&fx, Strategy::Preserve, RecordingRuntime::default());
    let ok = pipeline::run(&orch, fx.home.path(), "cli", &CancelToken::new());
    assert!(ok.is_success());
    let good = ok.last_good_stack.clone().expect("stack");

    fx.publish(&[("app.txt", "version = 2\n")]);
    fx.write("app.txt", "conflicting edit\n");
    let failed = pipeline::run(&orch, fx.home.path(), "cli", &CancelToken::new());
    assert!(!failed.is_success());
    assert_eq!(failed.last_good_stack, Some(good.clone()));
    assert_eq!(pipeline::previous_good_stack(fx.home.path()), Some(good));
}
