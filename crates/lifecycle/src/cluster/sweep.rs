//! Best-effort removal of everything created for a job.

use tracing::{info, warn};

use super::{ClusterClient, ResourceKind};
use crate::coord::{job, Coordinator};
use crate::job::selector_for;

/// Deletes every Service, Deployment, StatefulSet, PersistentVolumeClaim and Secret labelled
/// with the training ID, in that order, and then purges the job's coordination subtree.
///
/// A failure in one category is logged and the sweep moves on to the next one. The number of
/// failed list or delete calls is returned.
pub async fn delete_job(
    cluster: &dyn ClusterClient,
    coordinator: &dyn Coordinator,
    namespace: &str,
    training_id: &str,
) -> usize {
    let selector = selector_for(training_id);
    let mut failures = 0;
    for kind in ResourceKind::SWEEP_ORDER.iter().copied() {
        let names = match cluster.list_names(namespace, kind, &selector).await {
            Ok(n) => n,
            Err(e) => {
                warn!(%kind, error = %e, "Failed to list objects for deletion");
                failures += 1;
                continue;
            }
        };
        for name in names {
            info!(%kind, name = %name, "Deleting");
            if let Err(e) = cluster.delete(namespace, kind, &name).await {
                warn!(%kind, name = %name, error = %e, "Failed to delete");
                failures += 1;
            }
        }
    }

    if let Err(e) = coordinator
        .delete_key_with_prefix(&job::job_prefix(training_id))
        .await
    {
        warn!(error = %e, "Failed to delete coordination subtree");
        failures += 1;
    }
    failures
}
