//! Errors returned by the lifecycle manager and the machine-readable codes reported with a
//! failed job.
use thiserror::Error;

use crate::cluster::ResourceKind;

/// A convenience alias for results returned by this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Describes the errors that can occur while planning, deploying or tearing down a job.
#[derive(Error, Debug)]
pub enum Error {
    /// The coordination store could not be reached or rejected an operation.
    #[error("coordination store error: {0}")]
    Coordination(String),
    /// A key that must be created exactly once already exists.
    #[error("coordination key {key} already exists")]
    NodeExists {
        /// The full key path
        key: String,
    },
    /// An object with the same name is already present in the cluster.
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// The kind of object
        kind: ResourceKind,
        /// The object's name
        name: String,
    },
    /// A call to the Kubernetes API failed.
    #[error(transparent)]
    Kube(#[from] kube::Error),
    /// The cluster-interaction backoff gave up.
    #[error("gave up on {kind} {name} after {attempts} attempts: {source}")]
    RetriesExhausted {
        /// The kind of object being created
        kind: ResourceKind,
        /// The object's name
        name: String,
        /// How many times creation was attempted
        attempts: u32,
        /// The last error seen
        #[source]
        source: Box<Error>,
    },
    /// The trainer service returned an error or could not be reached.
    #[error("trainer error: {0}")]
    Trainer(String),
    /// An event type outside of the supported set was given.
    #[error("Event type is not valid: {0}")]
    InvalidEventType(String),
    /// An event endpoint was registered twice.
    #[error("Endpoint already exists")]
    EndpointExists,
    /// The requested event endpoint does not exist.
    #[error("Endpoint does not exist")]
    EndpointNotFound,
    /// A custom learner image was requested without an access token.
    #[error("Custom image access token is missing")]
    MissingImageToken,
    /// Generating the SSH keypair for a job failed.
    #[error("could not generate ssh keypair: {0}")]
    KeyGeneration(String),
    /// The log stream for a job failed.
    #[error("log stream error: {0}")]
    LogStream(String),
    /// Logs could not be read after every retry was used.
    #[error("After multiple retries, can't read training logs for {training_id}")]
    LogsUnavailable {
        /// The job whose logs were requested
        training_id: String,
    },
    /// The log consumer went away.
    #[error("log receiver disconnected")]
    ReceiverClosed,
    /// JSON (de)serialization failed.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// YAML (de)serialization failed.
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    /// Reading a local file failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error means the object was already present.
    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::AlreadyExists { .. } => true,
            Error::Kube(kube::Error::Api(e)) => e.code == 409,
            _ => false,
        }
    }
}

impl From<etcd_client::Error> for Error {
    fn from(e: etcd_client::Error) -> Self {
        Error::Coordination(e.to_string())
    }
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        Error::Trainer(format!("{}: {}", status.code(), status.message()))
    }
}

impl From<tonic::transport::Error> for Error {
    fn from(e: tonic::transport::Error) -> Self {
        Error::Trainer(e.to_string())
    }
}

/// Short machine-readable codes attached to status updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Nothing went wrong
    Normal,
    /// The cluster does not have room for the job
    InsufficientResources,
    /// Creating the job's workloads failed
    FailedDeploy,
    /// Creating the parameter server failed
    FailedParameterServer,
    /// The learner image could not be pulled
    ImagePull,
    /// A pod failed for a reason that could not be determined
    UnknownPodFailure,
    /// The Kubernetes API could not be reached
    KubernetesConnection,
    /// The coordination store could not be reached
    CoordinationConnection,
}

impl AsRef<str> for ErrorCode {
    fn as_ref(&self) -> &str {
        match self {
            Self::Normal => "000",
            Self::InsufficientResources => "100",
            Self::FailedDeploy => "101",
            Self::FailedParameterServer => "102",
            Self::ImagePull => "103",
            Self::UnknownPodFailure => "104",
            Self::KubernetesConnection => "200",
            Self::CoordinationConnection => "201",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}
