use std::sync::Arc;

use anyhow::{bail, Context};
use lifecycle::cluster::KubeCluster;
use lifecycle::config::Config;
use lifecycle::coord::EtcdCoordinator;
use lifecycle::grpc::LifecycleService;
use lifecycle::trainer::GrpcTrainer;
use lifecycle::LifecycleManager;
use tonic::transport::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::new_from_flags(env!("CARGO_PKG_VERSION"));

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("invalid log level")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        mode = ?config.deployment_mode,
        pod_namespace = %config.pod_namespace,
        learner_namespace = %config.learner_namespace,
        databroker_tag = %config.registry.databroker_tag,
        learner_tag = %config.registry.learner_tag,
        "Starting lifecycle manager"
    );

    if config.coordination.endpoints.is_empty() {
        bail!("no coordination store endpoints configured");
    }

    // Tries a kubeconfig file first, then the in-cluster configuration.
    let client = kube::Client::try_default()
        .await
        .context("failed to create a kubernetes client")?;
    let coordinator = EtcdCoordinator::connect(&config.coordination)
        .await
        .context("failed to connect to the coordination store")?;
    let trainer = GrpcTrainer::connect(config.trainer_address.clone())
        .await
        .context("failed to connect to the trainer")?;

    let addr = config.listen_addr;
    let lcm = LifecycleManager::new(
        Arc::new(config),
        Arc::new(coordinator),
        Arc::new(KubeCluster::new(client)),
        Arc::new(trainer),
    );

    info!(%addr, "Serving lifecycle manager");
    Server::builder()
        .add_service(LifecycleService::new(lcm).into_server())
        .serve(addr)
        .await
        .context("lifecycle manager server failed")?;
    Ok(())
}
