use std::sync::Arc;

use tracing::{error, info, info_span, warn};
use tracing_futures::Instrument;

use crate::cluster::{snapshot, sweep, ClusterClient};
use crate::config::Config;
use crate::coord::{job as nodes, Coordinator};
use crate::events::{self, Endpoint};
use crate::job::JobDeploymentRequest;
use crate::logs::{self, LogRequest, LogSink};
use crate::monitor;
use crate::ps;
use crate::trainer::{update_job_status, Status, StatusUpdate, Trainer};
use crate::training::Training;
use crate::{Error, ErrorCode, Result};

const NORMAL_OPERATION: &str = "NORMAL_OPERATION";
const INTERNAL_ERROR: &str = "INTERNAL_ERROR";

/// Deploys, halts and kills training jobs, and streams their logs.
///
/// Cloning is cheap; every clone shares the same collaborators.
#[derive(Clone)]
pub struct LifecycleManager {
    config: Arc<Config>,
    coordinator: Arc<dyn Coordinator>,
    cluster: Arc<dyn ClusterClient>,
    trainer: Arc<dyn Trainer>,
}

/// A deployment step that failed, with the code reported to the trainer.
struct StepFailure {
    step: &'static str,
    code: ErrorCode,
    error: Error,
    sweep: bool,
}

trait StepContext<T> {
    fn step(self, step: &'static str, code: ErrorCode) -> std::result::Result<T, StepFailure>;
}

impl<T> StepContext<T> for Result<T> {
    fn step(self, step: &'static str, code: ErrorCode) -> std::result::Result<T, StepFailure> {
        self.map_err(|error| StepFailure {
            step,
            code,
            error,
            sweep: true,
        })
    }
}

impl LifecycleManager {
    /// Creates a lifecycle manager from its collaborators.
    pub fn new(
        config: Arc<Config>,
        coordinator: Arc<dyn Coordinator>,
        cluster: Arc<dyn ClusterClient>,
        trainer: Arc<dyn Trainer>,
    ) -> Self {
        LifecycleManager {
            config,
            coordinator,
            cluster,
            trainer,
        }
    }

    /// The configuration in use.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Accepts a job: records it as PENDING and deploys it in the background. Returns the job
    /// name right away; deployment failures surface as a FAILED status.
    pub async fn deploy_training_job(&self, request: JobDeploymentRequest) -> Result<String> {
        let span = info_span!(
            "job",
            training_id = %request.training_id,
            user_id = %request.user_id
        );
        let name = request.name.clone();
        let mut pending = StatusUpdate::new(&request.training_id, &request.user_id, Status::Pending);
        pending.message = NORMAL_OPERATION.to_string();
        update_job_status(self.trainer.as_ref(), &self.config.retry, pending)
            .instrument(span.clone())
            .await;

        let lcm = self.clone();
        tokio::spawn(
            async move {
                // The outcome has already been reported to the trainer.
                let _ = lcm.run_deployment(&request).await;
            }
            .instrument(span),
        );
        Ok(name)
    }

    /// Deploys a job in the foreground. On failure the job is marked FAILED, everything
    /// created for it is swept, and the error is returned.
    pub async fn run_deployment(&self, request: &JobDeploymentRequest) -> Result<()> {
        info!(
            job_name = %request.name,
            framework = %request.framework,
            learners = request.num_learners(),
            gpus = request.resources.gpus,
            cpus = request.resources.cpus,
            "Starting deployment of training job"
        );
        let failure = match self.deploy_steps(request).await {
            Ok(()) => {
                info!("Training job deployed");
                return Ok(());
            }
            Err(failure) => failure,
        };

        error!(step = failure.step, code = %failure.code, error = %failure.error, "Deployment failed");
        let update = StatusUpdate::failed(
            &request.training_id,
            &request.user_id,
            failure.code,
            INTERNAL_ERROR.to_string(),
        );
        update_job_status(self.trainer.as_ref(), &self.config.retry, update).await;
        if failure.sweep {
            warn!("Training failed, cleaning up its resources");
            self.sweep(&request.training_id).await;
        }
        Err(failure.error)
    }

    async fn deploy_steps(
        &self,
        request: &JobDeploymentRequest,
    ) -> std::result::Result<(), StepFailure> {
        let config = self.config.as_ref();
        let cluster = self.cluster.as_ref();

        snapshot::before_deploy(cluster, &config.learner_namespace, &config.retry, request)
            .await
            .map_err(|error| StepFailure {
                step: "resource snapshot",
                code: ErrorCode::KubernetesConnection,
                error,
                sweep: false,
            })?;

        nodes::create_job_nodes(self.coordinator.as_ref(), request)
            .await
            .step("coordination nodes", ErrorCode::CoordinationConnection)?;

        info!("Deploying job monitor");
        monitor::deploy(config, cluster, request)
            .await
            .step("job monitor", ErrorCode::FailedDeploy)?;

        if request.needs_parameter_server() {
            info!("Deploying parameter server");
            ps::deploy(config, cluster, request)
                .await
                .step("parameter server", ErrorCode::FailedParameterServer)?;
        }

        info!("Deploying learners");
        let training = Training::prepare(config, cluster, request)
            .await
            .step("learner planning", ErrorCode::FailedDeploy)?;
        training
            .start(config, cluster)
            .await
            .step("learner deployment", ErrorCode::FailedDeploy)?;
        Ok(())
    }

    /// Asks the job monitor to stop a job. Asking twice is not an error.
    pub async fn halt_training_job(&self, training_id: &str, user_id: &str) -> Result<()> {
        let span = info_span!("job", training_id, user_id);
        async {
            info!("Halting training job");
            let key = nodes::halt_key(training_id);
            if !self.coordinator.put_if_key_missing(&key, "").await? {
                warn!(key = %key, "Halt was already requested");
            }
            Ok::<_, Error>(())
        }
        .instrument(span)
        .await
    }

    /// Removes everything created for a job. Individual failures are logged, not returned.
    pub async fn kill_training_job(&self, training_id: &str, user_id: &str) -> Result<()> {
        let span = info_span!("job", training_id, user_id);
        async {
            info!("Killing training job");
            self.sweep(training_id).await;
            snapshot::after_delete(
                self.cluster.as_ref(),
                &self.config.learner_namespace,
                &self.config.retry,
                training_id,
            )
            .await;
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn sweep(&self, training_id: &str) {
        let failures = sweep::delete_job(
            self.cluster.as_ref(),
            self.coordinator.as_ref(),
            &self.config.learner_namespace,
            training_id,
        )
        .await;
        if failures > 0 {
            warn!(failures, "Some of the job's resources could not be deleted");
        }
    }

    /// Streams a job's logs or metrics into `sink`.
    pub async fn training_log_stream(
        &self,
        request: LogRequest,
        sink: &mut dyn LogSink,
    ) -> Result<()> {
        let span = info_span!(
            "logs",
            training_id = %request.training_id,
            user_id = %request.user_id
        );
        logs::stream_training_logs(
            &self.config,
            self.cluster.as_ref(),
            self.trainer.as_ref(),
            request,
            sink,
        )
        .instrument(span)
        .await
    }

    /// Registers a webhook for a job's events.
    pub async fn create_event_endpoint(
        &self,
        training_id: &str,
        event_type: &str,
        endpoint_id: &str,
        url: &str,
    ) -> Result<()> {
        events::create_endpoint(
            self.coordinator.as_ref(),
            training_id,
            event_type,
            endpoint_id,
            url,
        )
        .await
    }

    /// Removes a webhook.
    pub async fn delete_event_endpoint(
        &self,
        training_id: &str,
        event_type: &str,
        endpoint_id: &str,
    ) -> Result<()> {
        events::delete_endpoint(self.coordinator.as_ref(), training_id, event_type, endpoint_id)
            .await
    }

    /// Looks up one webhook.
    pub async fn event_endpoint(
        &self,
        training_id: &str,
        event_type: &str,
        endpoint_id: &str,
    ) -> Result<Endpoint> {
        events::get_endpoint(self.coordinator.as_ref(), training_id, event_type, endpoint_id).await
    }

    /// Every webhook registered for one event type.
    pub async fn event_type_endpoints(
        &self,
        training_id: &str,
        event_type: &str,
    ) -> Result<Vec<Endpoint>> {
        events::type_endpoints(self.coordinator.as_ref(), training_id, event_type).await
    }
}
