//! In-memory stand-ins for the cluster, the trainer and a log consumer.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::error::ErrorResponse;
use lifecycle::cluster::{ClusterClient, LogStream, Resource, ResourceKind};
use lifecycle::logs::{LogSink, SendError};
use lifecycle::trainer::{Status, StatusUpdate, Trainer};
use lifecycle::{Error, Result};

fn unavailable(what: &str) -> Error {
    Error::Kube(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{} unavailable", what),
        reason: "ServiceUnavailable".to_string(),
        code: 503,
    }))
}

fn labels(resource: &Resource) -> Option<&BTreeMap<String, String>> {
    let meta = match resource {
        Resource::Service(o) => &o.metadata,
        Resource::Deployment(o) => &o.metadata,
        Resource::StatefulSet(o) => &o.metadata,
        Resource::PersistentVolumeClaim(o) => &o.metadata,
        Resource::Secret(o) => &o.metadata,
    };
    meta.labels.as_ref()
}

fn matches_selector(resource: &Resource, selector: &str) -> bool {
    selector.split(',').all(|term| match term.split_once("==") {
        Some((key, value)) => labels(resource)
            .and_then(|l| l.get(key))
            .map(|v| v == value)
            .unwrap_or(false),
        None => true,
    })
}

#[derive(Default)]
struct ClusterState {
    objects: BTreeMap<(ResourceKind, String), Resource>,
    created: Vec<Resource>,
    deleted: Vec<(ResourceKind, String)>,
    broken: HashSet<ResourceKind>,
    nodes_unreachable: bool,
}

/// A cluster that keeps objects in memory and can be told to fail per kind.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    pub fn preexisting(&self, resource: Resource) {
        let key = (resource.kind(), resource.name().to_string());
        self.state.lock().unwrap().objects.insert(key, resource);
    }

    /// Every call touching `kind` fails.
    pub fn break_kind(&self, kind: ResourceKind) {
        self.state.lock().unwrap().broken.insert(kind);
    }

    pub fn nodes_unreachable(&self) {
        self.state.lock().unwrap().nodes_unreachable = true;
    }

    pub fn created(&self) -> Vec<Resource> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn created_names(&self) -> Vec<(ResourceKind, String)> {
        self.created()
            .iter()
            .map(|r| (r.kind(), r.name().to_string()))
            .collect()
    }

    pub fn deleted(&self) -> Vec<(ResourceKind, String)> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn remaining(&self) -> Vec<(ResourceKind, String)> {
        self.state.lock().unwrap().objects.keys().cloned().collect()
    }
}

#[async_trait::async_trait]
impl ClusterClient for FakeCluster {
    async fn create(&self, _namespace: &str, resource: &Resource) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let kind = resource.kind();
        if state.broken.contains(&kind) {
            return Err(unavailable(kind.as_ref()));
        }
        let key = (kind, resource.name().to_string());
        if state.objects.contains_key(&key) {
            return Err(Error::AlreadyExists { kind, name: key.1 });
        }
        state.created.push(resource.clone());
        state.objects.insert(key, resource.clone());
        Ok(())
    }

    async fn list_names(
        &self,
        _namespace: &str,
        kind: ResourceKind,
        selector: &str,
    ) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        if state.broken.contains(&kind) {
            return Err(unavailable(kind.as_ref()));
        }
        Ok(state
            .objects
            .iter()
            .filter(|((k, _), r)| *k == kind && matches_selector(r, selector))
            .map(|((_, name), _)| name.clone())
            .collect())
    }

    async fn delete(&self, _namespace: &str, kind: ResourceKind, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.broken.contains(&kind) {
            return Err(unavailable(kind.as_ref()));
        }
        state.objects.remove(&(kind, name.to_string()));
        state.deleted.push((kind, name.to_string()));
        Ok(())
    }

    async fn list_pods(&self, _namespace: &str, _selector: Option<&str>) -> Result<Vec<Pod>> {
        Ok(Vec::new())
    }

    async fn get_pod(&self, _namespace: &str, _name: &str) -> Result<Option<Pod>> {
        Ok(None)
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        if self.state.lock().unwrap().nodes_unreachable {
            return Err(unavailable("nodes"));
        }
        Ok(Vec::new())
    }

    async fn pod_logs(
        &self,
        _namespace: &str,
        pod: &str,
        _container: &str,
        _follow: bool,
    ) -> Result<LogStream> {
        Err(Error::LogStream(format!("no logs for {}", pod)))
    }
}

/// A trainer that records every status update and reports a fixed status.
pub struct RecordingTrainer {
    updates: Mutex<Vec<StatusUpdate>>,
    status: Status,
    archived: Vec<u8>,
}

impl RecordingTrainer {
    pub fn new(status: Status, archived: &[u8]) -> Self {
        RecordingTrainer {
            updates: Mutex::new(Vec::new()),
            status,
            archived: archived.to_vec(),
        }
    }

    pub fn updates(&self) -> Vec<StatusUpdate> {
        self.updates.lock().unwrap().clone()
    }
}

impl Default for RecordingTrainer {
    fn default() -> Self {
        Self::new(Status::Pending, b"")
    }
}

#[async_trait::async_trait]
impl Trainer for RecordingTrainer {
    async fn update_job(&self, update: &StatusUpdate) -> Result<()> {
        self.updates.lock().unwrap().push(update.clone());
        Ok(())
    }

    async fn status(&self, _training_id: &str, _user_id: &str) -> Result<Status> {
        Ok(self.status)
    }

    async fn training_logs(
        &self,
        _training_id: &str,
        _user_id: &str,
        _metrics: bool,
    ) -> Result<LogStream> {
        let chunks: Vec<Result<Vec<u8>>> = self
            .archived
            .split_inclusive(|b| *b == b'\n')
            .map(|line| Ok(line.to_vec()))
            .collect();
        Ok(futures::stream::iter(chunks).boxed())
    }
}

/// Collects everything sent to it.
#[derive(Default)]
pub struct Collector {
    pub data: Vec<u8>,
}

impl Collector {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).to_string()
    }
}

#[async_trait::async_trait]
impl LogSink for Collector {
    async fn send(&mut self, data: Vec<u8>) -> std::result::Result<(), SendError> {
        self.data.extend(data);
        Ok(())
    }
}
