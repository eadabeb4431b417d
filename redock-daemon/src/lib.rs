//! redock daemon runtime: trigger queue + reconcile processor + socket server.

mod error;
pub mod protocol;
mod runtime;

pub use error::DaemonError;
pub use protocol::{
    request_reconcile, request_status, request_stop, send_request, DaemonRequest, DaemonResponse,
    TriggerReply,
};
pub use runtime::{init_tracing, run, start_blocking, Deployer, OrchestratorDeployer};
