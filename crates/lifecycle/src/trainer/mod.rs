//! The trainer service, which keeps the job record users query.
//!
//! The lifecycle manager pushes every status change of a job to the trainer and asks it for the
//! job's status and archived logs while streaming logs.

use std::str::FromStr;

use tracing::{debug, warn};

use crate::cluster::LogStream;
use crate::config::RetryConfig;
use crate::error::ErrorCode;
use crate::{Error, Result};

mod grpc;

pub use self::grpc::GrpcTrainer;

/// The status of a job as the trainer records it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    /// No status has been recorded
    NotStarted,
    /// Accepted, not yet running
    Pending,
    /// Learners are running
    Processing,
    /// Results are being uploaded
    Storing,
    /// Finished successfully
    Completed,
    /// Finished unsuccessfully
    Failed,
    /// Stopped on request
    Halted,
}

impl Status {
    /// Whether the job will not change status again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Halted)
    }
}

impl AsRef<str> for Status {
    fn as_ref(&self) -> &str {
        match self {
            Status::NotStarted => "NOT_STARTED",
            Status::Pending => "PENDING",
            Status::Processing => "PROCESSING",
            Status::Storing => "STORING",
            Status::Completed => "COMPLETED",
            Status::Failed => "FAILED",
            Status::Halted => "HALTED",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

impl FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let status = match s.trim().to_uppercase().as_str() {
            "NOT_STARTED" => Status::NotStarted,
            "PENDING" => Status::Pending,
            "PROCESSING" => Status::Processing,
            "STORING" => Status::Storing,
            "COMPLETED" => Status::Completed,
            "FAILED" => Status::Failed,
            "HALTED" => Status::Halted,
            other => return Err(Error::Trainer(format!("unknown status {}", other))),
        };
        Ok(status)
    }
}

/// A status change pushed to the trainer.
#[derive(Clone, Debug, PartialEq)]
pub struct StatusUpdate {
    /// The job
    pub training_id: String,
    /// The job's owner
    pub user_id: String,
    /// The new status
    pub status: Status,
    /// A human-readable explanation
    pub message: String,
    /// The machine-readable reason
    pub error_code: ErrorCode,
}

impl StatusUpdate {
    /// An update without an error.
    pub fn new(training_id: &str, user_id: &str, status: Status) -> Self {
        StatusUpdate {
            training_id: training_id.to_string(),
            user_id: user_id.to_string(),
            status,
            message: String::new(),
            error_code: ErrorCode::Normal,
        }
    }

    /// A FAILED update carrying an error code and message.
    pub fn failed(training_id: &str, user_id: &str, code: ErrorCode, message: String) -> Self {
        StatusUpdate {
            status: Status::Failed,
            message,
            error_code: code,
            ..Self::new(training_id, user_id, Status::Failed)
        }
    }
}

/// The trainer operations the lifecycle manager relies on.
#[async_trait::async_trait]
pub trait Trainer: Send + Sync {
    /// Records a status change.
    async fn update_job(&self, update: &StatusUpdate) -> Result<()>;

    /// The recorded status of a job.
    async fn status(&self, training_id: &str, user_id: &str) -> Result<Status>;

    /// The archived logs, or metrics when `metrics` is set, of a finished job.
    async fn training_logs(&self, training_id: &str, user_id: &str, metrics: bool)
        -> Result<LogStream>;
}

/// Pushes a status change, retrying with a fixed pause. A change that still cannot be recorded
/// is logged and dropped, leaving the trainer's record stale.
pub async fn update_job_status(trainer: &dyn Trainer, retry: &RetryConfig, update: StatusUpdate) {
    debug!(status = %update.status, code = %update.error_code, "Updating job status");
    let result = retry!(
        trainer.update_job(&update).await,
        times: retry.status_attempts,
        interval: retry.status_interval,
        log_error: |e: &Error, n| debug!(error = %e, attempt = n, "Status update failed")
    );
    if let Err(e) = result {
        warn!(
            status = %update.status,
            error = %e,
            "Unable to record job status, trainer and lifecycle manager are now out of sync"
        );
    }
}
