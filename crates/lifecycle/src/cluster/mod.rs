//! Access to the Kubernetes cluster the learners run in.
//!
//! Everything the lifecycle manager does to the cluster goes through [`ClusterClient`], so tests
//! can substitute an in-memory cluster. [`KubeCluster`] is the production implementation.

use futures::stream::BoxStream;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Node, PersistentVolumeClaim, Pod, Secret, Service};

use crate::Result;

#[cfg(test)]
pub(crate) mod fake;
mod kube;
pub(crate) mod quantity;
pub mod snapshot;
pub mod sweep;

pub use self::kube::KubeCluster;

/// The kinds of objects created for a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    /// A Service
    Service,
    /// A Deployment
    Deployment,
    /// A StatefulSet
    StatefulSet,
    /// A PersistentVolumeClaim
    PersistentVolumeClaim,
    /// A Secret
    Secret,
}

impl ResourceKind {
    /// Every kind, in the order a job is swept.
    pub const SWEEP_ORDER: [ResourceKind; 5] = [
        ResourceKind::Service,
        ResourceKind::Deployment,
        ResourceKind::StatefulSet,
        ResourceKind::PersistentVolumeClaim,
        ResourceKind::Secret,
    ];
}

impl AsRef<str> for ResourceKind {
    fn as_ref(&self) -> &str {
        match self {
            Self::Service => "Service",
            Self::Deployment => "Deployment",
            Self::StatefulSet => "StatefulSet",
            Self::PersistentVolumeClaim => "PersistentVolumeClaim",
            Self::Secret => "Secret",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

/// One object to be created in the cluster.
#[derive(Clone, Debug)]
pub enum Resource {
    /// A Service
    Service(Service),
    /// A Deployment
    Deployment(Deployment),
    /// A StatefulSet
    StatefulSet(StatefulSet),
    /// A PersistentVolumeClaim
    PersistentVolumeClaim(PersistentVolumeClaim),
    /// A Secret
    Secret(Secret),
}

impl Resource {
    /// The kind of the object.
    pub fn kind(&self) -> ResourceKind {
        match self {
            Resource::Service(_) => ResourceKind::Service,
            Resource::Deployment(_) => ResourceKind::Deployment,
            Resource::StatefulSet(_) => ResourceKind::StatefulSet,
            Resource::PersistentVolumeClaim(_) => ResourceKind::PersistentVolumeClaim,
            Resource::Secret(_) => ResourceKind::Secret,
        }
    }

    /// The object's name, or an empty string when none was set.
    pub fn name(&self) -> &str {
        let name = match self {
            Resource::Service(o) => o.metadata.name.as_ref(),
            Resource::Deployment(o) => o.metadata.name.as_ref(),
            Resource::StatefulSet(o) => o.metadata.name.as_ref(),
            Resource::PersistentVolumeClaim(o) => o.metadata.name.as_ref(),
            Resource::Secret(o) => o.metadata.name.as_ref(),
        };
        name.map(String::as_str).unwrap_or_default()
    }
}

/// Raw chunks read from a container's log.
pub type LogStream = BoxStream<'static, Result<Vec<u8>>>;

/// The cluster operations the lifecycle manager relies on.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    /// Creates an object. An object that is already present is reported as
    /// [`Error::AlreadyExists`](crate::Error::AlreadyExists).
    async fn create(&self, namespace: &str, resource: &Resource) -> Result<()>;

    /// Lists the names of objects of one kind matching a label selector.
    async fn list_names(
        &self,
        namespace: &str,
        kind: ResourceKind,
        selector: &str,
    ) -> Result<Vec<String>>;

    /// Deletes an object with background cascading propagation.
    async fn delete(&self, namespace: &str, kind: ResourceKind, name: &str) -> Result<()>;

    /// Lists pods, optionally filtered by a label selector.
    async fn list_pods(&self, namespace: &str, selector: Option<&str>) -> Result<Vec<Pod>>;

    /// Fetches one pod, returning `None` when it does not exist.
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>>;

    /// Lists every node in the cluster.
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Opens the log of one container.
    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        follow: bool,
    ) -> Result<LogStream>;
}
