//! # redock-reconcile
//!
//! Keeps a running container stack in step with a remote git branch.
//!
//! [`Orchestrator::reconcile`] runs Synchronize → Build-and-Run →
//! Garbage-Collect under an exclusive per-tree lock; [`pipeline::run`] wraps
//! it with the persisted run record for the CLI and the daemon.

pub mod driver;
pub mod error;
pub mod gc;
pub mod git;
pub mod lock;
pub mod orchestrator;
pub mod pipeline;
pub mod retry;
pub mod run_record;
pub mod runner;
pub mod synchronizer;

pub use driver::{ComposeRuntime, ContainerRuntime, DeploymentDescriptor};
pub use error::{BuildError, PruneError, ReconcileError, RecordError};
pub use git::{GitCli, GitError, SourceRepository};
pub use orchestrator::{CancelToken, Orchestrator};
pub use retry::RetryPolicy;
pub use run_record::{RunRecord, RunResult};
pub use synchronizer::{synchronize, SyncPlan};
