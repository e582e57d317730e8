//! An in-memory cluster for unit tests.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, Pod};

use super::{ClusterClient, LogStream, Resource, ResourceKind};
use crate::{Error, Result};

#[derive(Default)]
struct State {
    objects: BTreeMap<(ResourceKind, String), Resource>,
    created: Vec<(ResourceKind, String)>,
    deleted: Vec<(ResourceKind, String)>,
    create_failures: HashMap<ResourceKind, u32>,
    broken: HashSet<ResourceKind>,
    pods: Vec<Pod>,
    pod_queries: Vec<(String, Option<String>)>,
    pods_unreachable: bool,
    nodes: Vec<Node>,
    logs: VecDeque<Vec<Result<Vec<u8>>>>,
    log_opens: u32,
}

#[derive(Default)]
pub(crate) struct FakeCluster {
    state: Mutex<State>,
}

impl FakeCluster {
    pub(crate) fn preexisting(&self, resource: Resource) {
        let mut state = self.state.lock().unwrap();
        state
            .objects
            .insert((resource.kind(), resource.name().to_string()), resource);
    }

    /// The next `times` creations of `kind` fail.
    pub(crate) fn fail_creates(&self, kind: ResourceKind, times: u32) {
        self.state.lock().unwrap().create_failures.insert(kind, times);
    }

    /// Every call touching `kind` fails.
    pub(crate) fn break_kind(&self, kind: ResourceKind) {
        self.state.lock().unwrap().broken.insert(kind);
    }

    pub(crate) fn created(&self) -> Vec<(ResourceKind, String)> {
        self.state.lock().unwrap().created.clone()
    }

    pub(crate) fn deleted(&self) -> Vec<(ResourceKind, String)> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub(crate) fn add_pod(&self, pod: Pod) {
        self.state.lock().unwrap().pods.push(pod);
    }

    /// Namespace and selector of every pod listing so far.
    pub(crate) fn pod_queries(&self) -> Vec<(String, Option<String>)> {
        self.state.lock().unwrap().pod_queries.clone()
    }

    /// Every pod listing fails.
    pub(crate) fn pods_unreachable(&self) {
        self.state.lock().unwrap().pods_unreachable = true;
    }

    pub(crate) fn add_node(&self, node: Node) {
        self.state.lock().unwrap().nodes.push(node);
    }

    /// Queues the chunks served by the next successful log open. Opens beyond the queue fail.
    pub(crate) fn queue_logs(&self, chunks: Vec<Result<Vec<u8>>>) {
        self.state.lock().unwrap().logs.push_back(chunks);
    }

    pub(crate) fn log_opens(&self) -> u32 {
        self.state.lock().unwrap().log_opens
    }

    pub(crate) fn names(&self) -> Vec<(ResourceKind, String)> {
        self.state.lock().unwrap().objects.keys().cloned().collect()
    }
}

fn unavailable(kind: ResourceKind) -> Error {
    Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".into(),
        message: format!("{} API unavailable", kind),
        reason: "ServiceUnavailable".into(),
        code: 503,
    }))
}

#[async_trait::async_trait]
impl ClusterClient for FakeCluster {
    async fn create(&self, _namespace: &str, resource: &Resource) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let kind = resource.kind();
        if state.broken.contains(&kind) {
            return Err(unavailable(kind));
        }
        if let Some(left) = state.create_failures.get_mut(&kind) {
            if *left > 0 {
                *left -= 1;
                return Err(unavailable(kind));
            }
        }
        let key = (kind, resource.name().to_string());
        if state.objects.contains_key(&key) {
            return Err(Error::AlreadyExists {
                kind,
                name: key.1,
            });
        }
        state.created.push(key.clone());
        state.objects.insert(key, resource.clone());
        Ok(())
    }

    async fn list_names(
        &self,
        _namespace: &str,
        kind: ResourceKind,
        _selector: &str,
    ) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        if state.broken.contains(&kind) {
            return Err(unavailable(kind));
        }
        Ok(state
            .objects
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, name)| name.clone())
            .collect())
    }

    async fn delete(&self, _namespace: &str, kind: ResourceKind, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.broken.contains(&kind) {
            return Err(unavailable(kind));
        }
        state.objects.remove(&(kind, name.to_string()));
        state.deleted.push((kind, name.to_string()));
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, selector: Option<&str>) -> Result<Vec<Pod>> {
        let mut state = self.state.lock().unwrap();
        state
            .pod_queries
            .push((namespace.to_string(), selector.map(str::to_string)));
        if state.pods_unreachable {
            return Err(Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".into(),
                message: "pods API unavailable".into(),
                reason: "ServiceUnavailable".into(),
                code: 503,
            })));
        }
        Ok(state.pods.clone())
    }

    async fn get_pod(&self, _namespace: &str, name: &str) -> Result<Option<Pod>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .pods
            .iter()
            .find(|p| p.metadata.name.as_deref() == Some(name))
            .cloned())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.state.lock().unwrap().nodes.clone())
    }

    async fn pod_logs(
        &self,
        _namespace: &str,
        pod: &str,
        _container: &str,
        _follow: bool,
    ) -> Result<LogStream> {
        let mut state = self.state.lock().unwrap();
        match state.logs.pop_front() {
            Some(chunks) => {
                state.log_opens += 1;
                Ok(futures::stream::iter(chunks).boxed())
            }
            None => Err(Error::LogStream(format!("no logs for {}", pod))),
        }
    }
}
