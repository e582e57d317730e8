//! Secrets created for a job.
//!
//! Every secret carries the `training_id` label so the kill sweep finds it.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::config::Config;
use crate::job::JobDeploymentRequest;

pub mod cos;
pub mod pull;
pub mod ssh;

pub use self::pull::PullSecret;

fn string_secret(
    config: &Config,
    request: &JobDeploymentRequest,
    name: String,
    type_: &str,
    data: BTreeMap<String, String>,
) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(config.learner_namespace.clone()),
            labels: Some(request.training_labels()),
            ..Default::default()
        },
        type_: Some(type_.to_string()),
        string_data: Some(data),
        ..Default::default()
    }
}
