//! Container image references for every role in a job.
//!
//! Learner images come either from a custom registry given with the request or from the
//! configured learner registry, tagged with (in order of precedence) the tag from the manifest,
//! the build tag listed for the framework version in the framework metadata file, or the
//! configured default. Every other role is `<registry>/[prefix]<role>:<tag>`.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::cluster::ClusterClient;
use crate::config::{Config, RegistryConfig};
use crate::job::JobDeploymentRequest;

const S3_DATASTORE: &str = "s3_datastore";
const GENERIC_LOG_COLLECTOR: &str = "log_collector";
const FILE_EXTRACTOR: &str = "emetrics_file_extractor";
const TENSORBOARD_VERSION: &str = "1.3-py3";
const TRAINING_DATA_SELECTOR: &str = "service==ffdl-trainingdata";

/// The framework metadata document, listing the image build of every supported version.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct FrameworkMetadata {
    /// Versions per framework name
    #[serde(rename = "Frameworks", default)]
    pub frameworks: HashMap<String, FrameworkVersions>,
}

/// The versions of one framework.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct FrameworkVersions {
    /// Every known version
    #[serde(rename = "Versions", default)]
    pub versions: Vec<VersionDetails>,
}

/// One framework version and the image build that provides it.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct VersionDetails {
    /// The framework version, e.g. `1.5`
    #[serde(rename = "Version", default)]
    pub version: String,
    /// Whether the version is offered to users
    #[serde(rename = "External", default)]
    pub external: bool,
    /// Image tag of the current build
    #[serde(rename = "Build", default)]
    pub build: String,
    /// Image tag of the previous build
    #[serde(rename = "PrevBuild", default)]
    pub prev_build: String,
}

impl FrameworkMetadata {
    /// Reads the metadata file. A missing or malformed file yields `None`.
    pub async fn load(path: &Path) -> Option<Self> {
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "No framework metadata available");
                return None;
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Framework metadata is malformed, ignoring it");
                None
            }
        }
    }

    /// The build tag listed for a framework version, if there is a non-empty one.
    pub fn build_tag(&self, framework: &str, version: &str) -> Option<&str> {
        self.frameworks
            .get(framework)?
            .versions
            .iter()
            .find(|v| v.version == version)
            .map(|v| v.build.as_str())
            .filter(|b| !b.is_empty())
    }
}

/// Resolves the learner image for a request.
pub fn learner_image(
    registry: &RegistryConfig,
    request: &JobDeploymentRequest,
    metadata: Option<&FrameworkMetadata>,
) -> String {
    if let Some(location) = &request.image_location {
        if !location.registry.is_empty() && !location.namespace.is_empty() {
            return format!(
                "{}/{}/{}:{}",
                location.registry, location.namespace, request.framework, request.version
            );
        }
    }
    let tag = if !request.image_tag.is_empty() {
        request.image_tag.as_str()
    } else {
        metadata
            .and_then(|m| m.build_tag(&request.framework, &request.version))
            .unwrap_or(&registry.learner_tag)
    };
    format!(
        "{}/{}_gpu_{}:{}",
        registry.learner_registry, request.framework, request.version, tag
    )
}

/// `<registry>/[prefix]<role>:<tag>`.
pub fn role_image(registry: &str, prefix: &str, role: &str, tag: &str) -> String {
    format!("{}/{}{}:{}", registry, prefix, role, tag)
}

/// The controller image.
pub fn controller_image(config: &Config) -> String {
    let r = &config.registry;
    role_image(&r.learner_registry, &r.image_prefix, "controller", &r.services_tag)
}

/// The data broker image for a store type: the S3 broker for `s3_datastore` and the generic
/// object storage broker for everything else.
pub fn databroker_image(config: &Config, store_type: &str) -> String {
    let kind = if store_type == S3_DATASTORE {
        "s3"
    } else {
        "objectstorage"
    };
    let r = &config.registry;
    role_image(
        &r.learner_registry,
        &r.image_prefix,
        &format!("databroker_{}", kind),
        &r.databroker_tag,
    )
}

/// The job monitor image, pulled from the hybrid registry in hybrid mode.
pub fn job_monitor_image(config: &Config) -> String {
    let r = &config.registry;
    role_image(
        config.job_monitor_registry(),
        &r.image_prefix,
        "jobmonitor",
        &r.jobmonitor_tag,
    )
}

/// The parameter server image.
pub fn parameter_server_image(config: &Config) -> String {
    format!(
        "{}/parameter-server:{}",
        config.registry.learner_registry, config.registry.learner_tag
    )
}

/// Finds the tag the training data service runs with, so log collectors match its build.
/// Pods are searched newest listed first. Lookup failures count as not found.
pub async fn training_data_service_tag(
    cluster: &dyn ClusterClient,
    namespace: &str,
) -> Option<String> {
    let pods = match cluster
        .list_pods(namespace, Some(TRAINING_DATA_SELECTOR))
        .await
    {
        Ok(pods) => pods,
        Err(e) => {
            debug!(error = %e, "Could not list training data service pods");
            return None;
        }
    };
    pods.iter()
        .rev()
        .filter_map(|pod| pod.status.as_ref()?.container_statuses.as_ref())
        .flat_map(|statuses| statuses.iter())
        .find_map(|status| image_tag(&status.image))
}

/// The tag of an image reference, if it carries one.
fn image_tag(image: &str) -> Option<String> {
    let (_, tag) = image.rsplit_once(':')?;
    if tag.is_empty() || tag.contains('/') {
        return None;
    }
    Some(tag.to_string())
}

/// The log collector image for an evaluation metrics description. `default_tag` applies when
/// the description names no tag.
pub fn log_collector_image(
    config: &Config,
    metrics: &EvaluationMetrics,
    default_tag: &str,
) -> String {
    let tag = if metrics.image_tag.is_empty() {
        default_tag
    } else {
        metrics.image_tag.as_str()
    };
    format!(
        "{}/{}:{}",
        config.registry.learner_registry,
        metrics.extractor().image_name(),
        tag
    )
}

/// How metrics are extracted from a learner's output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Extractor {
    /// Logs are collected, no metrics are extracted
    Logger,
    /// Metrics are read from an evaluation metrics file
    File,
    /// Metrics are read from tensorboard event logs
    Tensorboard,
}

impl Extractor {
    /// Maps a type name and its synonyms. Empty and unknown names get the generic collector.
    pub fn from_type(kind: &str) -> Self {
        match kind.trim() {
            "optivist" | "emetrics_file" | "file" | FILE_EXTRACTOR => Extractor::File,
            "tensorboard" | "tensorboard_extractor" | "tensorboard_extract" => {
                Extractor::Tensorboard
            }
            "" | "null" | "nil" | "logger" | "none" | GENERIC_LOG_COLLECTOR => Extractor::Logger,
            other => {
                warn!(kind = other, "Unknown evaluation metrics type, collecting logs only");
                Extractor::Logger
            }
        }
    }

    /// The short image name of the log collector.
    pub fn image_name(&self) -> String {
        match self {
            Extractor::Logger => GENERIC_LOG_COLLECTOR.to_string(),
            Extractor::File => FILE_EXTRACTOR.to_string(),
            Extractor::Tensorboard => format!("tensorboard_extract_{}", TENSORBOARD_VERSION),
        }
    }
}

/// The evaluation metrics description given with a job.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct EvaluationMetrics {
    /// Extractor type
    #[serde(rename = "type", default)]
    pub kind: String,
    /// Log collector image tag
    #[serde(alias = "imagetag", default)]
    pub image_tag: String,
}

#[derive(Deserialize)]
struct MetricsDocument {
    evaluation_metrics: Option<EvaluationMetrics>,
}

impl EvaluationMetrics {
    /// Parses the YAML description. An empty or malformed one yields the default, which selects
    /// the generic log collector with the services tag.
    pub fn parse(spec: &str) -> Self {
        if spec.trim().is_empty() {
            return Self::default();
        }
        match serde_yaml::from_str::<MetricsDocument>(spec) {
            Ok(doc) => doc.evaluation_metrics.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "evaluation_metrics was given but cannot be parsed");
                Self::default()
            }
        }
    }

    /// The extractor selected by the type.
    pub fn extractor(&self) -> Extractor {
        Extractor::from_type(&self.kind)
    }
}
