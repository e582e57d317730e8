use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Node, PersistentVolumeClaim, Pod, Secret, Service};
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams, PropagationPolicy};
use kube::error::ErrorResponse;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::{ClusterClient, LogStream, Resource, ResourceKind};
use crate::{Error, Result};

/// A [`ClusterClient`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeCluster {
    client: kube::Client,
}

impl KubeCluster {
    /// Wraps a connected client.
    pub fn new(client: kube::Client) -> Self {
        KubeCluster { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn create_object<K>(&self, namespace: &str, kind: ResourceKind, obj: &K) -> Result<()>
    where
        K: kube::Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + std::fmt::Debug,
    {
        match self.api::<K>(namespace).create(&PostParams::default(), obj).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ErrorResponse { code: 409, .. })) => Err(Error::AlreadyExists {
                kind,
                name: obj.meta().name.clone().unwrap_or_default(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn names<K>(&self, namespace: &str, selector: &str) -> Result<Vec<String>>
    where
        K: kube::Resource<DynamicType = ()> + Clone + DeserializeOwned + std::fmt::Debug,
    {
        let list = self
            .api::<K>(namespace)
            .list(&ListParams::default().labels(selector))
            .await?;
        Ok(list
            .items
            .iter()
            .filter_map(|o| o.meta().name.clone())
            .collect())
    }

    async fn delete_object<K>(&self, namespace: &str, name: &str) -> Result<()>
    where
        K: kube::Resource<DynamicType = ()> + Clone + DeserializeOwned + std::fmt::Debug,
    {
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        self.api::<K>(namespace).delete(name, &params).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ClusterClient for KubeCluster {
    async fn create(&self, namespace: &str, resource: &Resource) -> Result<()> {
        debug!(kind = %resource.kind(), name = resource.name(), namespace, "Creating object");
        let kind = resource.kind();
        match resource {
            Resource::Service(o) => self.create_object(namespace, kind, o).await,
            Resource::Deployment(o) => self.create_object(namespace, kind, o).await,
            Resource::StatefulSet(o) => self.create_object(namespace, kind, o).await,
            Resource::PersistentVolumeClaim(o) => self.create_object(namespace, kind, o).await,
            Resource::Secret(o) => self.create_object(namespace, kind, o).await,
        }
    }

    async fn list_names(
        &self,
        namespace: &str,
        kind: ResourceKind,
        selector: &str,
    ) -> Result<Vec<String>> {
        match kind {
            ResourceKind::Service => self.names::<Service>(namespace, selector).await,
            ResourceKind::Deployment => self.names::<Deployment>(namespace, selector).await,
            ResourceKind::StatefulSet => self.names::<StatefulSet>(namespace, selector).await,
            ResourceKind::PersistentVolumeClaim => {
                self.names::<PersistentVolumeClaim>(namespace, selector).await
            }
            ResourceKind::Secret => self.names::<Secret>(namespace, selector).await,
        }
    }

    async fn delete(&self, namespace: &str, kind: ResourceKind, name: &str) -> Result<()> {
        debug!(%kind, name, namespace, "Deleting object");
        match kind {
            ResourceKind::Service => self.delete_object::<Service>(namespace, name).await,
            ResourceKind::Deployment => self.delete_object::<Deployment>(namespace, name).await,
            ResourceKind::StatefulSet => self.delete_object::<StatefulSet>(namespace, name).await,
            ResourceKind::PersistentVolumeClaim => {
                self.delete_object::<PersistentVolumeClaim>(namespace, name).await
            }
            ResourceKind::Secret => self.delete_object::<Secret>(namespace, name).await,
        }
    }

    async fn list_pods(&self, namespace: &str, selector: Option<&str>) -> Result<Vec<Pod>> {
        let params = match selector {
            Some(s) => ListParams::default().labels(s),
            None => ListParams::default(),
        };
        let list = self.api::<Pod>(namespace).list(&params).await?;
        Ok(list.items)
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>> {
        match self.api::<Pod>(namespace).get(name).await {
            Ok(pod) => Ok(Some(pod)),
            Err(kube::Error::Api(ErrorResponse { code: 404, .. })) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes.list(&ListParams::default()).await?;
        Ok(list.items)
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        follow: bool,
    ) -> Result<LogStream> {
        let params = LogParams {
            container: Some(container.to_string()),
            follow,
            ..Default::default()
        };
        let api = self.api::<Pod>(namespace);
        let pod = pod.to_string();
        let (opened_tx, opened_rx) = tokio::sync::oneshot::channel();
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        // The stream borrows the API handle, so it is read on a task that owns both.
        tokio::spawn(async move {
            let mut stream = match api.log_stream(&pod, &params).await {
                Ok(s) => {
                    let _ = opened_tx.send(Ok(()));
                    Box::pin(s)
                }
                Err(e) => {
                    let _ = opened_tx.send(Err(e));
                    return;
                }
            };
            while let Some(chunk) = stream.next().await {
                let item = chunk.map(|c| c.to_vec()).map_err(Error::from);
                if tx.send(item).await.is_err() {
                    debug!(pod = %pod, "Log receiver dropped");
                    break;
                }
            }
        });
        match opened_rx.await {
            Ok(Ok(())) => Ok(tokio_stream::wrappers::ReceiverStream::new(rx).boxed()),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(Error::LogStream(format!("log reader for {} stopped", container))),
        }
    }
}
