//! The parameter server deployed ahead of learners whose framework does not distribute natively.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, LocalObjectReference, PodSpec, PodTemplateSpec,
    ResourceRequirements, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use tracing::info;

use crate::cluster::{ClusterClient, Resource};
use crate::config::Config;
use crate::env::{self, PARAMETER_SERVER_JOB_ID, PARAMETER_SERVER_PORT};
use crate::image;
use crate::job::JobDeploymentRequest;
use crate::naming;
use crate::sizing::{byte_quantity, cpu_quantity, milli_cpu, to_bytes};
use crate::training::{Bom, CreatePolicy};
use crate::volume;
use crate::Result;

const SERVICE_LABEL: &str = "dlaas-parameter-server";
const CERT_VOLUME: &str = "etcd-ssl-cert-vol";

/// The parameter server's variables followed by the request's own, sorted by name.
pub fn parameter_server_env(request: &JobDeploymentRequest) -> Vec<EnvVar> {
    let mut vars = vec![
        env::value("JOBID", PARAMETER_SERVER_JOB_ID),
        env::value("NUM_LEARNERS", request.num_learners().to_string()),
        env::value("TCP_PORT", PARAMETER_SERVER_PORT.to_string()),
        env::value("ZK_DIR", format!("{}/parameter-server", request.training_id)),
    ];
    vars.extend(env::etcd_secret_vars());
    vars.push(env::value("DLAAS_JOB_ID", request.training_id.clone()));
    vars.push(env::value("ZNODE_NAME", "singleshard"));

    let mut keys: Vec<&String> = request.env_vars.keys().collect();
    keys.sort();
    vars.extend(keys.into_iter().map(|k| env::value(k, request.env(k))));
    vars
}

fn labels(request: &JobDeploymentRequest, name: &str) -> BTreeMap<String, String> {
    let mut labels = request.training_labels();
    labels.insert("app".to_string(), name.to_string());
    labels.insert("service".to_string(), SERVICE_LABEL.to_string());
    labels
}

fn app_selector(name: &str) -> BTreeMap<String, String> {
    let mut selector = BTreeMap::new();
    selector.insert("app".to_string(), name.to_string());
    selector
}

fn metadata(config: &Config, request: &JobDeploymentRequest, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(config.learner_namespace.clone()),
        labels: Some(labels(request, name)),
        ..Default::default()
    }
}

/// The parameter server Deployment. It gets the same CPU and memory as one learner.
pub fn deployment(config: &Config, request: &JobDeploymentRequest) -> Deployment {
    let name = naming::parameter_server(&request.name);
    let r = &request.resources;
    let mut resources = BTreeMap::new();
    resources.insert("cpu".to_string(), cpu_quantity(milli_cpu(r.cpus)));
    resources.insert(
        "memory".to_string(),
        byte_quantity(to_bytes(r.memory, r.memory_unit)),
    );

    Deployment {
        metadata: metadata(config, request, &name),
        spec: Some(DeploymentSpec {
            selector: LabelSelector {
                match_labels: Some(app_selector(&name)),
                match_expressions: None,
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels(request, &name)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: name.clone(),
                        image: Some(image::parameter_server_image(config)),
                        env: Some(parameter_server_env(request)),
                        ports: Some(vec![ContainerPort {
                            container_port: PARAMETER_SERVER_PORT,
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        }]),
                        resources: Some(ResourceRequirements {
                            requests: Some(resources.clone()),
                            limits: Some(resources),
                        }),
                        volume_mounts: Some(vec![volume::etcd_cert_mount(CERT_VOLUME)]),
                        image_pull_policy: Some("Always".to_string()),
                        ..Default::default()
                    }],
                    volumes: Some(vec![volume::etcd_cert_volume(CERT_VOLUME)]),
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

/// The ClusterIP Service learners reach the parameter server through.
pub fn service(config: &Config, request: &JobDeploymentRequest) -> Service {
    let name = naming::parameter_server(&request.name);
    Service {
        metadata: metadata(config, request, &name),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(app_selector(&name)),
            ports: Some(vec![ServicePort {
                name: Some("grpc".to_string()),
                protocol: Some("TCP".to_string()),
                port: PARAMETER_SERVER_PORT,
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

/// Creates the parameter server and its Service, retrying each under the cluster backoff.
pub async fn deploy(
    config: &Config,
    cluster: &dyn ClusterClient,
    request: &JobDeploymentRequest,
) -> Result<()> {
    let bom = Bom::new(
        vec![
            Resource::Deployment(deployment(config, request)),
            Resource::Service(service(config, request)),
        ],
        CreatePolicy::Retry(config.retry.kube_backoff),
    );
    bom.apply(cluster, &config.learner_namespace).await?;
    info!("Finished creating parameter server");
    Ok(())
}
