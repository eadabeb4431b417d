//! Image garbage collection after a successful stack replacement.

use crate::driver::ContainerRuntime;

/// Result of a best-effort prune.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PruneReport {
    pub pruned: Option<usize>,
    pub warning: Option<String>,
}

/// Remove dangling images. A failure is logged and reported as a warning;
/// it never fails the reconciliation.
pub fn collect_garbage(runtime: &dyn ContainerRuntime) -> PruneReport {
    match runtime.prune_unused_images() {
        Ok(count) => {
            tracing::info!(pruned = count, "pruned dangling images");
            PruneReport {
                pruned: Some(count),
                warning: None,
            }
        }
        Err(err) => {
            tracing::warn!(error = %err, "PruneFailed: image prune failed, continuing");
            PruneReport {
                pruned: None,
                warning: Some(format!("prune failed: {err}")),
            }
        }
    }
}
