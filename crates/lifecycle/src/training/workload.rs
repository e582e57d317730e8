//! Pod templates and the controllers that run them.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, LocalObjectReference, PodSpec, PodTemplateSpec, Service, ServicePort, ServiceSpec,
    Toleration, Volume,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::config::Config;
use crate::container::{SSH_PORT, WORKER_PORT};
use crate::job::JobDeploymentRequest;

/// Label value learner pods are marked with.
pub const LEARNER_SERVICE_LABEL: &str = "dlaas-learner";
/// Label value helper pods are marked with.
pub const HELPER_SERVICE_LABEL: &str = "dlaas-lhelper";

const GPU_TYPE_SELECTOR: &str = "ibm-cloud.kubernetes.io/gpu-type";
const TOLERATIONS_ANNOTATION: &str = "scheduler.alpha.kubernetes.io/tolerations";
const GPU_POLICY_ANNOTATION: &str = "scheduler.alpha.kubernetes.io/nvidiaGPU";

/// `training_id`, `user_id` and the `service` role label.
pub fn pod_labels(request: &JobDeploymentRequest, service: &str) -> BTreeMap<String, String> {
    let mut labels = request.training_labels();
    labels.insert("user_id".to_string(), request.user_id.clone());
    labels.insert("service".to_string(), service.to_string());
    labels
}

fn selector(request: &JobDeploymentRequest, service: &str) -> LabelSelector {
    let mut labels = request.training_labels();
    labels.insert("service".to_string(), service.to_string());
    LabelSelector {
        match_labels: Some(labels),
        match_expressions: None,
    }
}

fn metadata(config: &Config, name: &str, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(config.learner_namespace.clone()),
        labels: Some(labels),
        ..Default::default()
    }
}

/// The learner pod template. Learners tolerate the GPU taint and are pinned to the requested GPU
/// model when they use GPUs.
pub fn learner_pod(
    request: &JobDeploymentRequest,
    containers: Vec<Container>,
    volumes: Vec<Volume>,
    pull_secret: &str,
) -> PodTemplateSpec {
    let r = &request.resources;
    let allocation = if r.schedpolicy.eq_ignore_ascii_case("spread") {
        "Spread"
    } else {
        "Dense"
    };
    let mut annotations = BTreeMap::new();
    annotations.insert(
        TOLERATIONS_ANNOTATION.to_string(),
        r#"[ { "key": "dedicated", "operator": "Equal", "value": "gpu-task" } ]"#.to_string(),
    );
    annotations.insert(
        GPU_POLICY_ANNOTATION.to_string(),
        format!(r#"{{ "AllocationPriority": "{}" }}"#, allocation),
    );

    let node_selector = if r.gpus > 0.0 {
        let mut s = BTreeMap::new();
        s.insert(GPU_TYPE_SELECTOR.to_string(), r.gpu_type.clone());
        Some(s)
    } else {
        None
    };

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(pod_labels(request, LEARNER_SERVICE_LABEL)),
            annotations: Some(annotations),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers,
            volumes: Some(volumes),
            image_pull_secrets: Some(vec![LocalObjectReference {
                name: Some(pull_secret.to_string()),
            }]),
            tolerations: Some(vec![Toleration {
                key: Some("dedicated".to_string()),
                operator: Some("Equal".to_string()),
                value: Some("gpu-task".to_string()),
                effect: Some("NoSchedule".to_string()),
                toleration_seconds: None,
            }]),
            node_selector,
            automount_service_account_token: Some(false),
            ..Default::default()
        }),
    }
}

/// The StatefulSet running every learner of a job, started in parallel.
pub fn learner_stateful_set(
    config: &Config,
    request: &JobDeploymentRequest,
    name: &str,
    template: PodTemplateSpec,
) -> StatefulSet {
    StatefulSet {
        metadata: metadata(config, name, pod_labels(request, LEARNER_SERVICE_LABEL)),
        spec: Some(StatefulSetSpec {
            replicas: Some(request.num_learners()),
            service_name: name.to_string(),
            pod_management_policy: Some("Parallel".to_string()),
            revision_history_limit: Some(0),
            selector: selector(request, LEARNER_SERVICE_LABEL),
            template,
            ..Default::default()
        }),
        status: None,
    }
}

/// The headless Service giving learners stable DNS names.
pub fn learner_service(config: &Config, request: &JobDeploymentRequest, name: &str) -> Service {
    let port = |name: &str, port: i32| ServicePort {
        name: Some(name.to_string()),
        port,
        protocol: Some("TCP".to_string()),
        target_port: Some(IntOrString::Int(port)),
        ..Default::default()
    };
    Service {
        metadata: metadata(config, name, request.training_labels()),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(request.training_labels()),
            ports: Some(vec![port("ssh", SSH_PORT), port("tf-distributed", WORKER_PORT)]),
            ..Default::default()
        }),
        status: None,
    }
}

/// The Deployment running the helpers of a split job.
pub fn helper_deployment(
    config: &Config,
    request: &JobDeploymentRequest,
    name: &str,
    containers: Vec<Container>,
    volumes: Vec<Volume>,
) -> Deployment {
    let labels = pod_labels(request, HELPER_SERVICE_LABEL);
    Deployment {
        metadata: metadata(config, name, labels.clone()),
        spec: Some(DeploymentSpec {
            selector: selector(request, HELPER_SERVICE_LABEL),
            revision_history_limit: Some(0),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers,
                    volumes: Some(volumes),
                    image_pull_secrets: Some(vec![LocalObjectReference {
                        name: Some(config.registry.image_pull_secret.clone()),
                    }]),
                    automount_service_account_token: Some(false),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}
