use k8s_openapi::api::core::v1::Container;
use tracing::debug;

use super::{
    helper_resources, shell, ControlScript, HelperContext, CONTROLLER, JOB_DIR, LOAD_DATA,
    LOAD_MODEL, LOG_COLLECTOR, LOG_DIR, PULL_POLICY, STORE_LOGS, STORE_RESULTS,
};
use crate::config::HelperSpec;
use crate::coord::job;
use crate::env::{self, StoreRole};
use crate::image::{self, EvaluationMetrics};

/// The learner the helpers of a pod serve.
const HELPER_LEARNER_ID: i32 = 1;

/// The controller. It starts the other containers of the pod by writing their start files and
/// reports learner progress to the coordination store. Helpers made redundant by mounted stores
/// are marked as done before it starts.
pub fn controller(ctx: &HelperContext<'_>) -> Container {
    let mut cmd = "controller.sh".to_string();
    if ctx.mounted.results {
        cmd = format!(
            "echo 0 > {dir}/{}.exit && echo 0 > {dir}/{}.exit && {}",
            STORE_RESULTS,
            STORE_LOGS,
            cmd,
            dir = JOB_DIR
        );
    }
    if ctx.mounted.training_data {
        cmd = format!("echo 0 > {}/{}.exit && {}", JOB_DIR, LOAD_DATA, cmd);
    }

    let prefix = &ctx.config.coordination.prefix;
    let tid = &ctx.request.training_id;
    let mut vars = vec![
        env::value("JOB_STATE_DIR", JOB_DIR),
        env::value(
            "JOB_LEARNER_ZNODE_PATH",
            job::learner_node_base_path(prefix, tid, HELPER_LEARNER_ID),
        ),
        env::value("JOB_BASE_PATH", job::job_base_path(prefix, tid)),
        env::value(
            "JOB_LEARNER_ZNODE_STATUS_PATH",
            job::learner_node_status_path(prefix, tid, HELPER_LEARNER_ID),
        ),
        env::value(
            "JOB_LEARNER_SUMMARY_STATS_PATH",
            job::learner_summary_metrics_path(prefix, tid, HELPER_LEARNER_ID),
        ),
    ];
    vars.extend(env::downward_api_vars());
    vars.extend(env::etcd_secret_vars());

    Container {
        name: CONTROLLER.to_string(),
        image: Some(image::controller_image(ctx.config)),
        command: Some(shell("sh", cmd)),
        env: Some(vars),
        resources: Some(helper_resources(ctx.config.helpers.controller)),
        volume_mounts: Some(vec![ctx.shared_mount.clone(), ctx.etcd_mount.clone()]),
        image_pull_policy: Some(PULL_POLICY.to_string()),
        ..Default::default()
    }
}

fn data_mover(
    ctx: &HelperContext<'_>,
    name: &str,
    payload: String,
    vars: Vec<k8s_openapi::api::core::v1::EnvVar>,
    spec: HelperSpec,
) -> Container {
    let store_type = env::value_of(&vars, "DATA_STORE_TYPE").unwrap_or_default();
    let image = image::databroker_image(ctx.config, store_type);
    let script = ControlScript::new(name, JOB_DIR, payload);
    Container {
        name: name.to_string(),
        image: Some(image),
        command: Some(shell("sh", script.render())),
        env: Some(vars),
        resources: Some(helper_resources(spec)),
        volume_mounts: Some(vec![ctx.shared_mount.clone()]),
        image_pull_policy: Some(PULL_POLICY.to_string()),
        ..Default::default()
    }
}

/// Copies training data from the data store into the shared directory.
pub fn load_data(ctx: &HelperContext<'_>) -> Container {
    data_mover(
        ctx,
        LOAD_DATA,
        format!("load.sh |tee -a {}/{}.log", LOG_DIR, LOAD_DATA),
        env::store_env(ctx.job_env, StoreRole::TrainingData),
        ctx.config.helpers.load_data,
    )
}

/// Copies the initial model from the model store into the shared directory.
pub fn load_model(ctx: &HelperContext<'_>) -> Container {
    data_mover(
        ctx,
        LOAD_MODEL,
        format!("loadmodel.sh |tee -a {}/{}.log", LOG_DIR, LOAD_MODEL),
        env::store_env(ctx.job_env, StoreRole::Model),
        ctx.config.helpers.load_model,
    )
}

/// Uploads results. Only the first learner uploads; the others complete the protocol with a
/// no-op.
pub fn store_results(ctx: &HelperContext<'_>, learner_id: i32) -> Container {
    let payload = if learner_id == 1 { "store.sh" } else { "true" };
    data_mover(
        ctx,
        STORE_RESULTS,
        payload.to_string(),
        env::store_env(ctx.job_env, StoreRole::Results),
        ctx.config.helpers.store_results,
    )
}

/// Uploads a learner's logs into its own folder of the results bucket.
pub fn store_logs(ctx: &HelperContext<'_>, learner_id: i32) -> Container {
    data_mover(
        ctx,
        STORE_LOGS,
        "store.sh".to_string(),
        env::store_logs_env(ctx.job_env, learner_id),
        ctx.config.helpers.store_results,
    )
}

/// Follows the learner's output and extracts metrics from it. It runs alongside the learner and
/// is not sequenced by control files.
pub fn log_collector(ctx: &HelperContext<'_>) -> Container {
    let metrics = EvaluationMetrics::parse(&ctx.request.evaluation_metrics_spec);
    let image = image::log_collector_image(ctx.config, &metrics, ctx.log_collector_tag);
    debug!(image = %image, "Resolved log collector image");
    let vars = env::log_collector_env(
        ctx.job_env,
        ctx.request,
        &ctx.config.coordination.prefix,
        &ctx.config.pod_namespace,
    );
    Container {
        name: LOG_COLLECTOR.to_string(),
        image: Some(image),
        command: Some(shell("bash", "/scripts/run.sh".to_string())),
        env: Some(vars),
        resources: Some(helper_resources(ctx.config.helpers.log_collector)),
        volume_mounts: Some(vec![ctx.shared_mount.clone()]),
        image_pull_policy: Some(PULL_POLICY.to_string()),
        ..Default::default()
    }
}

/// Every helper a learner needs. Data movers for stores the learner mounts itself are left out.
pub fn auxiliary_containers(ctx: &HelperContext<'_>) -> Vec<Container> {
    let mut containers = vec![controller(ctx)];
    if !ctx.mounted.training_data {
        containers.push(load_data(ctx));
    }
    containers.push(load_model(ctx));
    if !ctx.mounted.results {
        containers.push(store_results(ctx, HELPER_LEARNER_ID));
        containers.push(store_logs(ctx, HELPER_LEARNER_ID));
    }
    containers.push(log_collector(ctx));
    containers
}
