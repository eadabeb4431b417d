//! redock core library: domain types, configuration, paths, errors.
//!
//! - [`types`]: commits, strategies, stages, outcomes and error reports
//! - [`config`]: [`DeployConfig`] load / save / validate
//! - [`paths`]: layout of `~/.redock/`
//! - [`error`]: [`ConfigError`]

pub mod config;
pub mod error;
pub mod paths;
pub mod types;

pub use config::{Backoff, DeployConfig, RetryConfig};
pub use error::ConfigError;
pub use types::{
    CommitRef, ErrorKind, ErrorReport, ReconcileState, ReconciliationOutcome, StackIdentity,
    StackStatus, Stage, StashRef, Strategy, SyncAction, SyncReport,
};
