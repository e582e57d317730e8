//! The bill of materials of a job: the ordered list of objects submitted to the cluster.

use tracing::{debug, info, warn};

use super::saga::Compensations;
use crate::backoff::{retry_notify, ExponentialBackoffStrategy};
use crate::cluster::{ClusterClient, Resource};
use crate::config::BackoffConfig;
use crate::{Error, Result};

/// How each object of a bill of materials is created.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CreatePolicy {
    /// One attempt per object; an object that already exists is an error
    Once,
    /// Retried under an exponential backoff; an object that already exists is left in place
    Retry(BackoffConfig),
}

/// Objects to create, in order.
#[derive(Clone, Debug)]
pub struct Bom {
    resources: Vec<Resource>,
    policy: CreatePolicy,
}

impl Bom {
    /// A bill of materials created under `policy`.
    pub fn new(resources: Vec<Resource>, policy: CreatePolicy) -> Self {
        Bom { resources, policy }
    }

    /// The objects, in creation order.
    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    /// The creation policy.
    pub fn policy(&self) -> CreatePolicy {
        self.policy
    }

    /// Creates every object in order. The first failure stops creation, deletes whatever this
    /// call created (newest first) and is returned. Under [`CreatePolicy::Retry`] an object that
    /// already existed is not this call's to delete and stays in place on a later failure.
    pub async fn apply(&self, cluster: &dyn ClusterClient, namespace: &str) -> Result<()> {
        let mut created = Compensations::default();
        for resource in &self.resources {
            match self.create(cluster, namespace, resource).await {
                Ok(true) => created.push(resource.kind(), resource.name()),
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        kind = %resource.kind(),
                        name = %resource.name(),
                        error = %e,
                        rollback = created.created().len(),
                        "Deployment failed, rolling back"
                    );
                    let failures = created.unwind(cluster, namespace).await;
                    if failures > 0 {
                        warn!(failures, "Some objects could not be rolled back");
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Creates one object, returning whether it was created by this call.
    async fn create(
        &self,
        cluster: &dyn ClusterClient,
        namespace: &str,
        resource: &Resource,
    ) -> Result<bool> {
        let kind = resource.kind();
        let name = resource.name();
        match self.policy {
            CreatePolicy::Once => {
                cluster.create(namespace, resource).await?;
                debug!(%kind, name = %name, "Created");
                Ok(true)
            }
            CreatePolicy::Retry(config) => {
                let mut backoff = ExponentialBackoffStrategy::new(config);
                let result = retry_notify(
                    &mut backoff,
                    || async {
                        match cluster.create(namespace, resource).await {
                            Ok(()) => Ok(true),
                            Err(e) if e.is_already_exists() => {
                                info!(%kind, name = %name, "Already exists, leaving in place");
                                Ok(false)
                            }
                            Err(e) => Err(e),
                        }
                    },
                    |e, pause| {
                        warn!(%kind, name = %name, error = %e, ?pause, "Create failed");
                    },
                )
                .await;
                match result {
                    Ok(created) => {
                        debug!(%kind, name = %name, "Created");
                        Ok(created)
                    }
                    Err((source, attempts)) => Err(Error::RetriesExhausted {
                        kind,
                        name: name.to_string(),
                        attempts,
                        source: Box::new(source),
                    }),
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use k8s_openapi::api::core::v1::{Secret, Service};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;
    use crate::cluster::fake::FakeCluster;
    use crate::cluster::ResourceKind;

    fn meta(name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    fn secret(name: &str) -> Resource {
        Resource::Secret(Secret {
            metadata: meta(name),
            ..Default::default()
        })
    }

    fn service(name: &str) -> Resource {
        Resource::Service(Service {
            metadata: meta(name),
            ..Default::default()
        })
    }

    fn quick() -> CreatePolicy {
        CreatePolicy::Retry(BackoffConfig {
            initial: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
            max_elapsed: Duration::from_millis(50),
        })
    }

    #[tokio::test]
    async fn creates_in_order() {
        let cluster = FakeCluster::default();
        let bom = Bom::new(vec![secret("a"), service("b")], CreatePolicy::Once);
        bom.apply(&cluster, "ns").await.unwrap();
        assert_eq!(
            cluster.created(),
            vec![
                (ResourceKind::Secret, "a".to_string()),
                (ResourceKind::Service, "b".to_string())
            ]
        );
    }

    #[tokio::test]
    async fn single_attempt_rejects_existing_objects_and_rolls_back() {
        let cluster = FakeCluster::default();
        cluster.preexisting(service("b"));
        let bom = Bom::new(vec![secret("a"), service("b")], CreatePolicy::Once);
        let err = bom.apply(&cluster, "ns").await.unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(cluster.deleted(), vec![(ResourceKind::Secret, "a".to_string())]);
        // the object that was there before is untouched
        assert_eq!(cluster.names(), vec![(ResourceKind::Service, "b".to_string())]);
    }

    #[tokio::test]
    async fn retries_tolerate_existing_objects_and_transient_failures() {
        let cluster = FakeCluster::default();
        cluster.preexisting(secret("a"));
        cluster.fail_creates(ResourceKind::Service, 2);
        let bom = Bom::new(vec![secret("a"), service("b")], quick());
        bom.apply(&cluster, "ns").await.unwrap();
        assert_eq!(cluster.created(), vec![(ResourceKind::Service, "b".to_string())]);
    }

    #[tokio::test]
    async fn exhausted_retries_unwind_newest_first() {
        let cluster = FakeCluster::default();
        cluster.break_kind(ResourceKind::StatefulSet);
        let set = Resource::StatefulSet(Default::default());
        let bom = Bom::new(vec![secret("a"), service("b"), set], quick());
        match bom.apply(&cluster, "ns").await {
            Err(Error::RetriesExhausted { kind, attempts, .. }) => {
                assert_eq!(kind, ResourceKind::StatefulSet);
                assert!(attempts >= 1);
            }
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
        assert_eq!(
            cluster.deleted(),
            vec![
                (ResourceKind::Service, "b".to_string()),
                (ResourceKind::Secret, "a".to_string())
            ]
        );
        assert!(cluster.names().is_empty());
    }

    #[tokio::test]
    async fn retried_rollback_leaves_existing_objects_in_place() {
        let cluster = FakeCluster::default();
        cluster.preexisting(secret("a"));
        cluster.break_kind(ResourceKind::StatefulSet);
        let set = Resource::StatefulSet(Default::default());
        let bom = Bom::new(vec![secret("a"), service("b"), set], quick());
        bom.apply(&cluster, "ns").await.unwrap_err();
        assert_eq!(cluster.deleted(), vec![(ResourceKind::Service, "b".to_string())]);
        assert_eq!(cluster.names(), vec![(ResourceKind::Secret, "a".to_string())]);
    }
}
