//! A point-in-time view of cluster capacity.
//!
//! The snapshot is advisory. It is logged before a job is deployed and after one is killed, but
//! it never reserves capacity and an undersized cluster does not stop a deployment. Only an
//! unreachable cluster does.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use tracing::{debug, info, warn};

use super::quantity;
use super::ClusterClient;
use crate::config::RetryConfig;
use crate::job::JobDeploymentRequest;
use crate::Result;

/// The extended resource GPUs are requested under.
pub const GPU_RESOURCE: &str = "nvidia.com/gpu";

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Totals of the three resources a job competes for.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Capacity {
    /// CPU cores
    pub cpus: f64,
    /// GPU devices
    pub gpus: f64,
    /// Memory in bytes
    pub memory: f64,
}

impl Capacity {
    fn add(&mut self, resources: Option<&BTreeMap<String, Quantity>>) {
        if let Some(r) = resources {
            self.cpus += r.get("cpu").map(quantity::value).unwrap_or_default();
            self.memory += r.get("memory").map(quantity::value).unwrap_or_default();
            self.gpus += r.get(GPU_RESOURCE).map(quantity::value).unwrap_or_default();
        }
    }
}

/// Allocatable capacity across all nodes and what the pods in one namespace already request.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ResourceSnapshot {
    /// Sum of node allocatable resources
    pub allocatable: Capacity,
    /// Sum of container requests in the namespace
    pub requested: Capacity,
}

impl ResourceSnapshot {
    /// Computes a snapshot from already listed nodes and pods.
    pub fn from_objects(nodes: &[Node], pods: &[Pod]) -> Self {
        let mut allocatable = Capacity::default();
        for node in nodes {
            allocatable.add(node.status.as_ref().and_then(|s| s.allocatable.as_ref()));
        }
        let mut requested = Capacity::default();
        for pod in pods {
            debug!(pod = ?pod.metadata.name, "Inspecting pod");
            let containers = pod.spec.iter().flat_map(|s| s.containers.iter());
            for container in containers {
                requested.add(container.resources.as_ref().and_then(|r| r.requests.as_ref()));
            }
        }
        ResourceSnapshot {
            allocatable,
            requested,
        }
    }

    /// Allocatable minus requested.
    pub fn available(&self) -> Capacity {
        Capacity {
            cpus: self.allocatable.cpus - self.requested.cpus,
            gpus: self.allocatable.gpus - self.requested.gpus,
            memory: self.allocatable.memory - self.requested.memory,
        }
    }

    fn log(&self, training_id: &str) {
        let available = self.available();
        debug!(
            cpus = self.allocatable.cpus,
            gpus = self.allocatable.gpus,
            "Allocatable across the cluster"
        );
        debug!(
            cpus = self.requested.cpus,
            gpus = self.requested.gpus,
            memory_gb = self.requested.memory / GIB,
            "Requested already by existing pods"
        );
        debug!(
            training_id,
            cpus = available.cpus,
            gpus = available.gpus,
            memory_gb = available.memory / GIB,
            "Available for training job"
        );
    }
}

/// What a job needs: every learner, one CPU for the job monitor and, for distributed jobs, a
/// learner's worth of CPU for the parameter server.
pub fn required_for(request: &JobDeploymentRequest) -> Capacity {
    let learners = request.num_learners();
    let mut cpus = f64::from(learners) * request.resources.cpus + 1.0;
    if learners > 1 {
        cpus += request.resources.cpus;
    }
    Capacity {
        cpus,
        gpus: (i64::from(learners) * request.resources.gpus as i64) as f64,
        memory: 0.0,
    }
}

/// Lists nodes and pods, retrying with a fixed pause. The error of the last attempt is returned
/// once every attempt failed.
pub async fn take(
    cluster: &dyn ClusterClient,
    namespace: &str,
    retry: &RetryConfig,
) -> Result<ResourceSnapshot> {
    let listed = retry!(
        async {
            let nodes = cluster.list_nodes().await?;
            let pods = cluster.list_pods(namespace, None).await?;
            Ok::<_, crate::Error>((nodes, pods))
        }
        .await,
        times: retry.snapshot_attempts.max(1),
        interval: retry.snapshot_interval,
        log_error: |e: &crate::Error, n| info!(error = %e, attempt = n, "Could not read cluster capacity, retrying")
    );
    match listed {
        Ok((nodes, pods)) => Ok(ResourceSnapshot::from_objects(&nodes, &pods)),
        Err(e) => {
            warn!(
                error = %e,
                attempts = retry.snapshot_attempts,
                "Giving up on reading cluster capacity"
            );
            Err(e)
        }
    }
}

/// Logs capacity before deploying a job. Returns an error only when the cluster could not be
/// reached.
pub async fn before_deploy(
    cluster: &dyn ClusterClient,
    namespace: &str,
    retry: &RetryConfig,
    request: &JobDeploymentRequest,
) -> Result<ResourceSnapshot> {
    let snapshot = take(cluster, namespace, retry).await?;
    let required = required_for(request);
    debug!(
        training_id = %request.training_id,
        cpus = required.cpus,
        gpus = required.gpus,
        "Resources required for training job"
    );
    snapshot.log(&request.training_id);
    let available = snapshot.available();
    if available.cpus < required.cpus || available.gpus < required.gpus {
        info!(
            training_id = %request.training_id,
            "Cluster looks short on capacity, deploying anyway"
        );
    }
    Ok(snapshot)
}

/// Logs capacity after a job was killed. Failures are only logged.
pub async fn after_delete(cluster: &dyn ClusterClient, namespace: &str, retry: &RetryConfig, training_id: &str) {
    match take(cluster, namespace, retry).await {
        Ok(snapshot) => snapshot.log(training_id),
        Err(e) => debug!(error = %e, "Cannot determine resource snapshot on deletion"),
    }
}
