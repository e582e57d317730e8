//! The training job request accepted by the lifecycle manager.

use std::collections::HashMap;

use crate::sizing::SizeUnit;

/// Frameworks whose learners distribute work among themselves without a parameter server.
pub const NATIVE_FRAMEWORKS: &[&str] = &["tensorflow", "caffe2", "mxnet", "horovod"];

/// A request to deploy one training job. It is never modified once accepted.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JobDeploymentRequest {
    /// Unique ID of the training run. Every object created for the job is labelled with it.
    pub training_id: String,
    /// Job name, used to derive object names
    pub name: String,
    /// The owning user
    pub user_id: String,
    /// Learning framework, e.g. `tensorflow`
    pub framework: String,
    /// Framework version, e.g. `1.5`
    pub version: String,
    /// Learner image tag given in the job manifest
    pub image_tag: String,
    /// What the job asks for
    pub resources: ResourceRequirements,
    /// Free-form variables from the manifest and the trainer
    pub env_vars: HashMap<String, String>,
    /// Extra labels placed on the job monitor
    pub labels: HashMap<String, String>,
    /// Where a custom learner image lives, if one was requested
    pub image_location: Option<ImageLocation>,
    /// YAML evaluation metrics description
    pub evaluation_metrics_spec: String,
}

/// Resources requested by a job, in the units the user gave.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResourceRequirements {
    /// Fractional CPU count per learner
    pub cpus: f64,
    /// Memory per learner
    pub memory: f64,
    /// Unit `memory` is given in
    pub memory_unit: SizeUnit,
    /// Shared volume size
    pub storage: f64,
    /// Unit `storage` is given in
    pub storage_unit: SizeUnit,
    /// GPUs per learner
    pub gpus: f64,
    /// GPU model used as a node selector
    pub gpu_type: String,
    /// Number of learners
    pub learners: i32,
    /// Scheduling policy annotation, e.g. `spread` or `dense`
    pub schedpolicy: String,
}

/// A custom learner image.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ImageLocation {
    /// Registry host
    pub registry: String,
    /// Namespace within the registry
    pub namespace: String,
    /// Token used to pull from the registry
    pub access_token: String,
    /// Email attached to the pull credentials
    pub email: String,
}

impl JobDeploymentRequest {
    /// The number of learners, never less than one.
    pub fn num_learners(&self) -> i32 {
        self.resources.learners.max(1)
    }

    /// Whether the learners distribute among themselves without a parameter server.
    pub fn uses_native_distribution(&self) -> bool {
        NATIVE_FRAMEWORKS.contains(&self.framework.to_lowercase().as_str())
    }

    /// Whether a parameter server must be deployed before the learners.
    pub fn needs_parameter_server(&self) -> bool {
        !self.uses_native_distribution() && self.num_learners() > 1
    }

    /// Looks up one of the request's variables, treating a missing one as empty.
    pub fn env(&self, key: &str) -> &str {
        self.env_vars.get(key).map(String::as_str).unwrap_or_default()
    }

    /// The `training_id` label attached to every object created for this job.
    pub fn training_labels(&self) -> std::collections::BTreeMap<String, String> {
        let mut labels = std::collections::BTreeMap::new();
        labels.insert("training_id".to_string(), self.training_id.clone());
        labels
    }

    /// The label selector matching every object created for this job.
    pub fn selector(&self) -> String {
        selector_for(&self.training_id)
    }
}

/// The label selector matching every object created for a training ID.
pub fn selector_for(training_id: &str) -> String {
    format!("training_id=={}", training_id)
}
