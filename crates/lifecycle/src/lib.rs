//! A crate for planning and running distributed training jobs on Kubernetes.
//!
//! A training job arrives as a [`JobDeploymentRequest`]. The lifecycle manager records it in
//! a coordination store, launches a job monitor, and then compiles the request into a bill of
//! materials (secrets, a service, an optional shared volume claim, a learner stateful set and,
//! in split mode, a helper deployment) that is submitted to the cluster. Killing a job sweeps
//! every object labelled with the training ID and purges the job's coordination subtree.
//!
//! The three collaborators are traits so they can be swapped out in tests:
//! [`coord::Coordinator`], [`cluster::ClusterClient`] and [`trainer::Trainer`].
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use lifecycle::cluster::KubeCluster;
//! use lifecycle::config::Config;
//! use lifecycle::coord::MemoryCoordinator;
//! use lifecycle::trainer::GrpcTrainer;
//! use lifecycle::LifecycleManager;
//!
//! async fn start() -> anyhow::Result<()> {
//!     let config = Arc::new(Config::default_config());
//!     let client = kube::Client::try_default().await?;
//!     let trainer = GrpcTrainer::connect(config.trainer_address.clone()).await?;
//!     let lcm = LifecycleManager::new(
//!         config,
//!         Arc::new(MemoryCoordinator::default()),
//!         Arc::new(KubeCluster::new(client)),
//!         Arc::new(trainer),
//!     );
//!     lcm.halt_training_job("training-abc", "user-1").await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![cfg_attr(feature = "docs", feature(doc_cfg))]

#[macro_use]
mod retry;

pub mod backoff;
pub mod cluster;
pub mod config;
pub mod container;
pub mod coord;
pub mod env;
pub mod error;
pub mod events;
pub mod grpc;
pub mod image;
pub mod job;
pub mod logs;
pub mod monitor;
pub mod naming;
pub mod ps;
pub mod secret;
mod service;
pub mod sizing;
pub mod trainer;
pub mod training;
pub mod volume;

/// Generated protobuf types for the lifecycle manager service.
#[allow(missing_docs)]
pub mod lcm_api {
    /// Version 1 of the lifecycle manager API.
    pub mod v1 {
        tonic::include_proto!("lcm.v1");
    }
}

/// Generated protobuf types for the trainer service client.
#[allow(missing_docs)]
pub mod trainer_api {
    /// Version 1 of the trainer API.
    pub mod v1 {
        tonic::include_proto!("trainer.v1");
    }
}

#[doc(inline)]
pub use error::{Error, ErrorCode, Result};
#[doc(inline)]
pub use job::JobDeploymentRequest;
pub use service::LifecycleManager;
