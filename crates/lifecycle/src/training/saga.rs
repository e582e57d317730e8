//! Undoing a partially applied bill of materials.

use tracing::{info, warn};

use crate::cluster::{ClusterClient, ResourceKind};

/// Deletions that undo the objects created so far, most recent last.
///
/// Only objects this deployment created are recorded, so unwinding never removes an object that
/// was present before the deployment started.
#[derive(Debug, Default)]
pub struct Compensations {
    created: Vec<(ResourceKind, String)>,
}

impl Compensations {
    /// Records that an object was created.
    pub fn push(&mut self, kind: ResourceKind, name: impl Into<String>) {
        self.created.push((kind, name.into()));
    }

    /// The objects recorded so far, in creation order.
    pub fn created(&self) -> &[(ResourceKind, String)] {
        &self.created
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
    }

    /// Deletes every recorded object, newest first. Every deletion is attempted; the number that
    /// failed is returned.
    pub async fn unwind(self, cluster: &dyn ClusterClient, namespace: &str) -> usize {
        let mut failures = 0;
        for (kind, name) in self.created.into_iter().rev() {
            info!(%kind, name = %name, "Rolling back");
            if let Err(e) = cluster.delete(namespace, kind, &name).await {
                warn!(%kind, name = %name, error = %e, "Rollback failed");
                failures += 1;
            }
        }
        failures
    }
}
