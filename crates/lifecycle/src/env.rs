//! Environment variables for every container role.
//!
//! All roles start from the job's variables ([`job_env`]). The learner keeps a fixed whitelist
//! and has its `*_DIR` variables rewritten into the container's file layout. Helpers select the
//! variables of the store they move data for and see them under the `DATA_STORE_` prefix. The
//! coordination store credentials are always passed by reference into the `lcm-secrets` secret.

use std::collections::BTreeSet;
use std::path::Path;

use k8s_openapi::api::core::v1::{
    EnvVar, EnvVarSource, ObjectFieldSelector, SecretKeySelector,
};

use crate::container::{JOB_DIR, LOG_DIR};
use crate::coord::job;
use crate::job::JobDeploymentRequest;

/// The secret holding the coordination store address, credentials and certificate.
pub const LCM_SECRET: &str = "lcm-secrets";

/// Port the parameter server listens on.
pub const PARAMETER_SERVER_PORT: i32 = 50051;

/// Job ID the parameter server and learners agree on.
pub const PARAMETER_SERVER_JOB_ID: &str = "1111";

const DATA_MOUNT_ROOT: &str = "/mnt/data";
const RESULTS_MOUNT_ROOT: &str = "/mnt/results";
const CHECKPOINT_SUBDIR: &str = "_wml_checkpoints";

lazy_static::lazy_static! {
    static ref LEARNER_WHITELIST: BTreeSet<&'static str> = [
        "MODEL_DIR",
        "DATA_DIR",
        "RESULT_DIR",
        "RESULT_BUCKET_DIR",
        "LOG_DIR",
        "CHECKPOINT_DIR",
        "JOB_STATE_DIR",
        "TRAINING_JOB",
        "TRAINING_COMMAND",
        "TRAINING_ID",
        "LEARNER_ID",
        "GPU_COUNT",
        "NUM_LEARNERS",
        "LEARNER_NAME_PREFIX",
        "DOWNWARD_API_POD_NAME",
        "DOWNWARD_API_POD_NAMESPACE",
    ]
    .iter()
    .copied()
    .collect();
}

/// A plain name and value.
pub fn value(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        value_from: None,
    }
}

/// A variable read from the key of the same name in the `lcm-secrets` secret.
pub fn lcm_secret_ref(name: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                key: name.to_string(),
                name: Some(LCM_SECRET.to_string()),
                optional: None,
            }),
            ..Default::default()
        }),
    }
}

/// A variable filled in from the pod's own metadata.
pub fn field_ref(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                api_version: None,
            }),
            ..Default::default()
        }),
    }
}

/// The literal value of a variable, or an empty string when it is a reference.
pub fn value_of<'a>(vars: &'a [EnvVar], name: &str) -> Option<&'a str> {
    vars.iter()
        .rev()
        .find(|v| v.name == name)
        .map(|v| v.value.as_deref().unwrap_or_default())
}

/// Sets a variable, replacing any earlier one of the same name in place.
pub fn upsert(vars: &mut Vec<EnvVar>, var: EnvVar) {
    match vars.iter_mut().find(|v| v.name == var.name) {
        Some(existing) => *existing = var,
        None => vars.push(var),
    }
}

/// The coordination store address, credentials and prefix.
pub fn etcd_secret_vars() -> Vec<EnvVar> {
    [
        "DLAAS_ETCD_ADDRESS",
        "DLAAS_ETCD_USERNAME",
        "DLAAS_ETCD_PASSWORD",
        "DLAAS_ETCD_PREFIX",
    ]
    .iter()
    .map(|n| lcm_secret_ref(n))
    .collect()
}

/// The secret references plus the learner paths the log collector watches.
pub fn etcd_learner_vars(store_prefix: &str, training_id: &str) -> Vec<EnvVar> {
    let learners = job::learners_base_path(store_prefix, training_id);
    let mut vars = etcd_secret_vars();
    vars.push(value("ZK_DIR", learners.clone()));
    vars.push(value("ZK_LOCK_PATH", format!("{}/lock", learners)));
    vars.push(value("ZK_COUNTER_PATH", format!("{}/counter", learners)));
    vars.push(value("ZNODE_NAME", "learnershard"));
    vars
}

/// The pod's name and namespace through the downward API.
pub fn downward_api_vars() -> Vec<EnvVar> {
    vec![
        field_ref("DOWNWARD_API_POD_NAME", "metadata.name"),
        field_ref("DOWNWARD_API_POD_NAMESPACE", "metadata.namespace"),
    ]
}

/// The variables every container of a job starts from: the request's own variables in key
/// order, followed by the identifiers of the job and, for distributed jobs, the parameter
/// server and global cursor locations.
pub fn job_env(request: &JobDeploymentRequest, store_prefix: &str) -> Vec<EnvVar> {
    let mut keys: Vec<&String> = request.env_vars.keys().collect();
    keys.sort();
    let mut vars: Vec<EnvVar> = keys
        .into_iter()
        .map(|k| value(k, request.env_vars[k].clone()))
        .collect();

    if request.uses_native_distribution() {
        vars.push(value("IS_DISTRIBUTED_TF", "1"));
    }
    upsert(&mut vars, value("TRAINING_ID", request.training_id.clone()));
    upsert(&mut vars, value("DLAAS_JOB_ID", request.training_id.clone()));
    upsert(&mut vars, value("DLAAS_PLATFORM", "kubernetes"));

    let learners = request.num_learners();
    if learners > 1 {
        vars.push(value(
            "PARAMSERVER_HOST",
            crate::naming::parameter_server(&request.name),
        ));
        vars.push(value("PARAMSERVER_PORT", PARAMETER_SERVER_PORT.to_string()));
        vars.push(value("PARAMSERVER_JOBID", PARAMETER_SERVER_JOB_ID));
        vars.push(value(
            "GLOBAL_CURSOR_ZNODE",
            format!("{}{}/globalcursor/gcstate", store_prefix, request.training_id),
        ));
        upsert(&mut vars, value("NUM_LEARNERS", learners.to_string()));
    }
    vars
}

/// Where data reaches the learner from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MountedStores {
    /// Training data is mounted directly into the learner
    pub training_data: bool,
    /// Results are written directly to a mounted bucket
    pub results: bool,
}

/// The learner's variables: the job's variables plus its pod identity, reduced to the whitelist,
/// with every `*_DIR` moved under the directory it is reachable at inside the learner.
pub fn learner_env(
    job_vars: &[EnvVar],
    request: &JobDeploymentRequest,
    stateful_set: &str,
    mounted: MountedStores,
) -> Vec<EnvVar> {
    let mut all = job_vars.to_vec();
    all.extend(downward_api_vars());
    upsert(&mut all, value("LEARNER_NAME_PREFIX", stateful_set));
    upsert(&mut all, value("TRAINING_ID", request.training_id.clone()));
    upsert(&mut all, value("DLAAS_JOB_ID", request.training_id.clone()));
    upsert(&mut all, value("NUM_LEARNERS", request.num_learners().to_string()));

    let mut checkpoint_dir = String::new();
    let mut result_bucket_dir = String::new();
    let mut vars = Vec::new();
    for var in all
        .into_iter()
        .filter(|v| LEARNER_WHITELIST.contains(v.name.as_str()))
    {
        if !var.name.ends_with("_DIR") {
            vars.push(var);
            continue;
        }
        let raw = var.value.as_deref().unwrap_or_default();
        let dir = if var.name == "DATA_DIR" && mounted.training_data {
            join(DATA_MOUNT_ROOT, raw)
        } else if var.name == "RESULT_DIR" && mounted.results {
            result_bucket_dir = join(RESULTS_MOUNT_ROOT, raw);
            checkpoint_dir = join(&result_bucket_dir, CHECKPOINT_SUBDIR);
            join(&result_bucket_dir, &request.training_id)
        } else {
            join(JOB_DIR, raw)
        };
        vars.push(value(&var.name, dir));
    }

    upsert(&mut vars, value("JOB_STATE_DIR", JOB_DIR));
    upsert(&mut vars, value("CHECKPOINT_DIR", checkpoint_dir));
    upsert(&mut vars, value("RESULT_BUCKET_DIR", result_bucket_dir));
    vars
}

/// Which store a helper moves data for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreRole {
    /// Training data, read by load-data
    TrainingData,
    /// The initial model, read by load-model
    Model,
    /// Results and logs, written by store-results and store-logs
    Results,
}

impl StoreRole {
    fn prefix(&self) -> &'static str {
        match self {
            StoreRole::TrainingData => "DATA_STORE_",
            StoreRole::Model => "MODEL_STORE_",
            StoreRole::Results => "RESULT_STORE_",
        }
    }

    fn dir_var(&self) -> &'static str {
        match self {
            StoreRole::TrainingData => "DATA_DIR",
            StoreRole::Model => "MODEL_DIR",
            StoreRole::Results => "RESULT_DIR",
        }
    }

    fn object_var(&self) -> &'static str {
        match self {
            StoreRole::Model => "DATA_STORE_OBJECT",
            _ => "DATA_STORE_BUCKET",
        }
    }
}

/// A data mover's variables: the role's store variables renamed under `DATA_STORE_`, with the API
/// key passed as the password and the object ID as the bucket (or object, for the model), and
/// the role's directory exported as `DATA_DIR` under the shared job directory. Roles other than
/// load-data also see their pod identity.
pub fn store_env(job_vars: &[EnvVar], role: StoreRole) -> Vec<EnvVar> {
    let mut vars = if role == StoreRole::TrainingData {
        Vec::new()
    } else {
        downward_api_vars()
    };
    let prefix = role.prefix();
    for var in job_vars {
        let raw = var.value.clone().unwrap_or_default();
        if let Some(field) = var.name.strip_prefix(prefix) {
            let name = match field {
                "APIKEY" => "DATA_STORE_PASSWORD".to_string(),
                "OBJECTID" => role.object_var().to_string(),
                other => format!("DATA_STORE_{}", other),
            };
            vars.push(value(&name, raw));
        } else if var.name == role.dir_var() {
            vars.push(value("DATA_DIR", join(JOB_DIR, &raw)));
        }
    }
    vars
}

/// The store-logs variables: the results store, but writing into a per-learner folder of the
/// bucket and reading from the shared log directory.
pub fn store_logs_env(job_vars: &[EnvVar], learner_id: i32) -> Vec<EnvVar> {
    let mut vars = store_env(job_vars, StoreRole::Results);
    for var in vars.iter_mut() {
        if var.name == "DATA_STORE_BUCKET" {
            let bucket = var.value.clone().unwrap_or_default();
            var.value = Some(format!("{}/learner-{}", bucket, learner_id));
        } else if var.name == "DATA_DIR" {
            var.value = Some(LOG_DIR.to_string());
        }
    }
    vars
}

/// The log collector's variables: the job's and the coordination store's, with every `*_DIR`
/// placed under the shared job directory.
pub fn log_collector_env(
    job_vars: &[EnvVar],
    request: &JobDeploymentRequest,
    store_prefix: &str,
    pod_namespace: &str,
) -> Vec<EnvVar> {
    let mut vars: Vec<EnvVar> = job_vars
        .iter()
        .cloned()
        .chain(etcd_learner_vars(store_prefix, &request.training_id))
        .map(|v| {
            if v.name.ends_with("_DIR") {
                let dir = join(JOB_DIR, v.value.as_deref().unwrap_or_default());
                value(&v.name, dir)
            } else {
                v
            }
        })
        .collect();
    upsert(&mut vars, value("JOB_STATE_DIR", JOB_DIR));
    vars.push(value("TRAINING_DATA_NAMESPACE", pod_namespace));
    if !request.evaluation_metrics_spec.is_empty() {
        vars.push(value("EM_DESCRIPTION", request.evaluation_metrics_spec.clone()));
    }
    vars
}

/// Joins a directory under a root the way a shell path would read: an absolute `dir` still
/// lands under `root`.
pub fn join(root: &str, dir: &str) -> String {
    let relative = dir.trim_start_matches('/');
    if relative.is_empty() {
        return root.to_string();
    }
    Path::new(root).join(relative).to_string_lossy().into_owned()
}
