//! Container specifications for every role in a job.
//!
//! Every role except the log collector wraps its payload in a [`ControlScript`], so helpers and
//! the learner sequence their work through control files in the shared job directory. Requests
//! always equal limits.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{EnvVar, ResourceRequirements, VolumeMount};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::config::{Config, HelperSpec};
use crate::env::MountedStores;
use crate::job::JobDeploymentRequest;
use crate::sizing::{byte_quantity, cpu_quantity};

mod command;
mod helper;
mod learner;

pub use self::command::{ControlScript, ExitPolicy};
pub use self::helper::{
    auxiliary_containers, controller, load_data, load_model, log_collector, store_logs,
    store_results,
};
pub use self::learner::{learner, LearnerSpec, SSH_PORT, WORKER_PORT};

/// The shared job directory every container of a job mounts.
pub const JOB_DIR: &str = "/job";
/// Where helpers and the learner write their logs.
pub const LOG_DIR: &str = "/job/logs";

/// The controller container
pub const CONTROLLER: &str = "controller";
/// The training data loader
pub const LOAD_DATA: &str = "load-data";
/// The model loader
pub const LOAD_MODEL: &str = "load-model";
/// The learner container
pub const LEARNER: &str = "learner";
/// The results uploader
pub const STORE_RESULTS: &str = "store-results";
/// The log uploader
pub const STORE_LOGS: &str = "store-logs";
/// The log and metrics collector
pub const LOG_COLLECTOR: &str = "log-collector";

const PULL_POLICY: &str = "IfNotPresent";

/// Everything helper containers are built from.
#[derive(Clone, Debug)]
pub struct HelperContext<'a> {
    /// Process configuration
    pub config: &'a Config,
    /// The job
    pub request: &'a JobDeploymentRequest,
    /// The job's base variables
    pub job_env: &'a [EnvVar],
    /// The shared job directory mount
    pub shared_mount: VolumeMount,
    /// The coordination store certificate mount
    pub etcd_mount: VolumeMount,
    /// Which data stores the learner mounts itself
    pub mounted: MountedStores,
    /// Tag of the log collector image when the metrics description names none
    pub log_collector_tag: &'a str,
}

fn requests_and_limits(resources: BTreeMap<String, Quantity>) -> ResourceRequirements {
    ResourceRequirements {
        requests: Some(resources.clone()),
        limits: Some(resources),
    }
}

fn helper_resources(spec: HelperSpec) -> ResourceRequirements {
    let mut resources = BTreeMap::new();
    resources.insert("cpu".to_string(), cpu_quantity(spec.milli_cpu));
    resources.insert(
        "memory".to_string(),
        byte_quantity(spec.memory_mb * 1024 * 1024),
    );
    requests_and_limits(resources)
}

fn shell(interpreter: &str, script: String) -> Vec<String> {
    vec![interpreter.to_string(), "-c".to_string(), script]
}
