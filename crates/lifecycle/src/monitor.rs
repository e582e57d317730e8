//! The job monitor, a per-job Deployment that watches learner progress in the coordination
//! store and reports it to the trainer.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, LocalObjectReference, PodSpec, PodTemplateSpec, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use tracing::{debug, info};

use crate::cluster::{ClusterClient, Resource};
use crate::config::{Config, DeploymentMode};
use crate::env;
use crate::image;
use crate::job::JobDeploymentRequest;
use crate::naming;
use crate::sizing::{byte_quantity, cpu_quantity};
use crate::training::{Bom, CreatePolicy};
use crate::volume;
use crate::Result;

const MILLI_CPU: i64 = 500;
const MEMORY_BYTES: i64 = 512 * 1024 * 1024;
const SERVICE_LABEL: &str = "dlaas-jobmonitor";

/// The job monitor's variables.
pub fn job_monitor_env(config: &Config, request: &JobDeploymentRequest) -> Vec<EnvVar> {
    let mut vars = vec![
        env::value(
            "USE_NATIVE_DISTRIBUTION",
            request.uses_native_distribution().to_string(),
        ),
        env::value("TRAINING_ID", request.training_id.clone()),
        env::value("JOB_NAME", request.name.clone()),
        env::value("USER_ID", request.user_id.clone()),
        env::value("NUM_LEARNERS", request.num_learners().to_string()),
        env::value("DLAAS_PUSH_METRICS_ENABLED", config.push_metrics.to_string()),
    ];
    vars.extend(env::etcd_secret_vars());
    vars.push(env::value("DLAAS_ENV", config.env_name.clone()));
    vars.push(env::value("DLAAS_LOGLEVEL", config.log_level.clone()));
    vars.push(env::value("DLAAS_POD_NAMESPACE", config.pod_namespace.clone()));
    vars.push(env::value(
        "DLAAS_LEARNER_KUBE_NAMESPACE",
        config.learner_namespace.clone(),
    ));
    vars
}

fn labels(request: &JobDeploymentRequest, name: &str) -> BTreeMap<String, String> {
    let mut labels: BTreeMap<String, String> = request
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    labels.insert("app".to_string(), name.to_string());
    labels.insert("training_id".to_string(), request.training_id.clone());
    labels.insert("service".to_string(), SERVICE_LABEL.to_string());
    labels.insert("user_id".to_string(), request.user_id.clone());
    labels
}

/// The job monitor Deployment of a job.
pub fn deployment(config: &Config, request: &JobDeploymentRequest) -> Deployment {
    let name = naming::job_monitor(&request.name);
    let labels = labels(request, &name);
    let mut selector = BTreeMap::new();
    selector.insert("app".to_string(), name.clone());

    let mut resources = BTreeMap::new();
    resources.insert("cpu".to_string(), cpu_quantity(MILLI_CPU));
    resources.insert("memory".to_string(), byte_quantity(MEMORY_BYTES));

    let image = image::job_monitor_image(config);
    debug!(image = %image, pull_secret = %config.registry.image_pull_secret, "Job monitor image");

    Deployment {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(config.learner_namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            selector: LabelSelector {
                match_labels: Some(selector),
                match_expressions: None,
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: name.clone(),
                        image: Some(image),
                        env: Some(job_monitor_env(config, request)),
                        volume_mounts: Some(vec![volume::etcd_cert_mount(
                            volume::ETCD_CERT_VOLUME,
                        )]),
                        resources: Some(ResourceRequirements {
                            requests: Some(resources.clone()),
                            limits: Some(resources),
                        }),
                        ..Default::default()
                    }],
                    volumes: Some(vec![volume::etcd_cert_volume(volume::ETCD_CERT_VOLUME)]),
                    image_pull_secrets: Some(vec![LocalObjectReference {
                        name: Some(config.registry.image_pull_secret.clone()),
                    }]),
                    restart_policy: Some("Always".to_string()),
                    dns_policy: Some("ClusterFirst".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Launches the job monitor. A monitor that already exists is left in place, and nothing is
/// deployed when the lifecycle manager runs in process.
pub async fn deploy(
    config: &Config,
    cluster: &dyn ClusterClient,
    request: &JobDeploymentRequest,
) -> Result<()> {
    if config.deployment_mode == DeploymentMode::InProcess {
        info!("Running in process, not deploying a job monitor");
        return Ok(());
    }
    let bom = Bom::new(
        vec![Resource::Deployment(deployment(config, request))],
        CreatePolicy::Retry(config.retry.kube_backoff),
    );
    bom.apply(cluster, &config.learner_namespace).await?;
    info!(name = %naming::job_monitor(&request.name), "Job monitor deployed");
    Ok(())
}
