//! The per-job subtree in the coordination store.

use tracing::debug;

use super::Coordinator;
use crate::job::JobDeploymentRequest;
use crate::{Error, Result};

/// The key the job monitor watches for halt requests.
pub fn halt_key(training_id: &str) -> String {
    format!("{}/halt", training_id)
}

/// The prefix holding every key of a job.
pub fn job_prefix(training_id: &str) -> String {
    format!("{}/", training_id)
}

/// The job's root, including the store's prefix, as handed to containers that talk to the
/// store directly.
pub fn job_base_path(store_prefix: &str, training_id: &str) -> String {
    format!("{}{}", store_prefix, training_id)
}

/// The root of the learner nodes.
pub fn learners_base_path(store_prefix: &str, training_id: &str) -> String {
    format!("{}/learners", job_base_path(store_prefix, training_id))
}

/// The node of one learner.
pub fn learner_node_base_path(store_prefix: &str, training_id: &str, learner: i32) -> String {
    format!(
        "{}/learner_{}",
        learners_base_path(store_prefix, training_id),
        learner
    )
}

/// Where one learner reports its status.
pub fn learner_node_status_path(store_prefix: &str, training_id: &str, learner: i32) -> String {
    format!(
        "{}/status",
        learner_node_base_path(store_prefix, training_id, learner)
    )
}

/// Where one learner reports its summary metrics.
pub fn learner_summary_metrics_path(store_prefix: &str, training_id: &str, learner: i32) -> String {
    format!(
        "{}/summary_metrics",
        learner_node_base_path(store_prefix, training_id, learner)
    )
}

/// The keys and initial values written when a job is accepted, in creation order.
pub fn initial_nodes(request: &JobDeploymentRequest) -> Vec<(String, String)> {
    let tid = &request.training_id;
    let mut nodes = vec![
        (format!("{}/notes", tid), String::new()),
        (format!("{}/userid", tid), request.user_id.clone()),
        (format!("{}/framework", tid), request.framework.clone()),
        (
            format!("{}/learners/total_learners", tid),
            request.num_learners().to_string(),
        ),
        (format!("{}/jobname", tid), request.name.clone()),
        (format!("{}/learners/lock", tid), String::new()),
        (format!("{}/learners/counter", tid), "1".to_string()),
        (format!("{}/learners/alive_learners", tid), "0".to_string()),
        (format!("{}/globalcursor/gcstate", tid), "0".to_string()),
    ];
    if request.needs_parameter_server() {
        nodes.push((format!("{}/parameter-server", tid), String::new()));
    }
    nodes
}

/// Creates the job's subtree. Every key must be new: one that is already present means the job
/// was deployed twice and fails with [`Error::NodeExists`].
pub async fn create_job_nodes(
    coordinator: &dyn Coordinator,
    request: &JobDeploymentRequest,
) -> Result<()> {
    for (key, value) in initial_nodes(request) {
        if !coordinator.put_if_key_missing(&key, &value).await? {
            return Err(Error::NodeExists { key });
        }
        debug!(key = %key, "Created coordination node");
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::coord::MemoryCoordinator;
    use crate::job::ResourceRequirements;

    fn request(framework: &str, learners: i32) -> JobDeploymentRequest {
        JobDeploymentRequest {
            training_id: "training-1".into(),
            name: "job-1".into(),
            user_id: "user-1".into(),
            framework: framework.into(),
            resources: ResourceRequirements {
                learners,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn creates_the_documented_keys() {
        let store = MemoryCoordinator::default();
        create_job_nodes(&store, &request("tensorflow", 2)).await.unwrap();
        let entries = store.snapshot();
        assert_eq!(entries.len(), 9);
        assert_eq!(entries["training-1/learners/total_learners"], "2");
        assert_eq!(entries["training-1/learners/counter"], "1");
        assert_eq!(entries["training-1/userid"], "user-1");
        assert_eq!(entries["training-1/jobname"], "job-1");
        assert!(!entries.contains_key("training-1/parameter-server"));
    }

    #[tokio::test]
    async fn parameter_server_marker_for_non_native_distribution() {
        let store = MemoryCoordinator::default();
        create_job_nodes(&store, &request("caffe", 2)).await.unwrap();
        assert!(store.snapshot().contains_key("training-1/parameter-server"));
    }

    #[tokio::test]
    async fn second_creation_fails_with_node_exists() {
        let store = MemoryCoordinator::default();
        let req = request("tensorflow", 1);
        create_job_nodes(&store, &req).await.unwrap();
        match create_job_nodes(&store, &req).await {
            Err(Error::NodeExists { key }) => assert_eq!(key, "training-1/notes"),
            other => panic!("expected NodeExists, got {:?}", other),
        }
    }

    #[test]
    fn paths_include_the_store_prefix() {
        assert_eq!(job_base_path("/dlaas/", "t1"), "/dlaas/t1");
        assert_eq!(
            learner_node_status_path("/dlaas/", "t1", 2),
            "/dlaas/t1/learners/learner_2/status"
        );
        assert_eq!(
            learner_summary_metrics_path("", "t1", 1),
            "t1/learners/learner_1/summary_metrics"
        );
    }

    #[tokio::test]
    async fn halt_requests_are_swept_with_the_job() {
        let store = MemoryCoordinator::default();
        create_job_nodes(&store, &request("tensorflow", 1)).await.unwrap();
        assert!(store.put_if_key_missing(&halt_key("training-1"), "").await.unwrap());
        assert!(halt_key("training-1").starts_with(&job_prefix("training-1")));

        store.delete_key_with_prefix(&job_prefix("training-1")).await.unwrap();
        assert!(store.snapshot().is_empty());
    }
}
