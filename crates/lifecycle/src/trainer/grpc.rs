use futures::{StreamExt, TryStreamExt};
use tonic::transport::Channel;
use tracing::debug;

use super::{Status, StatusUpdate, Trainer};
use crate::cluster::LogStream;
use crate::trainer_api::v1 as api;
use crate::trainer_api::v1::trainer_client::TrainerClient;
use crate::{Error, Result};

/// A [`Trainer`] reached over gRPC.
#[derive(Clone, Debug)]
pub struct GrpcTrainer {
    client: TrainerClient<Channel>,
}

impl GrpcTrainer {
    /// Connects to the trainer at `address`, e.g. `http://ffdl-trainer:80`.
    pub async fn connect(address: String) -> Result<Self> {
        debug!(address = %address, "Connecting to trainer");
        let client = TrainerClient::connect(address).await?;
        Ok(GrpcTrainer { client })
    }
}

impl From<Status> for api::Status {
    fn from(status: Status) -> Self {
        match status {
            Status::NotStarted => api::Status::NotStarted,
            Status::Pending => api::Status::Pending,
            Status::Processing => api::Status::Processing,
            Status::Storing => api::Status::Storing,
            Status::Completed => api::Status::Completed,
            Status::Failed => api::Status::Failed,
            Status::Halted => api::Status::Halted,
        }
    }
}

impl From<api::Status> for Status {
    fn from(status: api::Status) -> Self {
        match status {
            api::Status::NotStarted => Status::NotStarted,
            api::Status::Pending => Status::Pending,
            api::Status::Processing => Status::Processing,
            api::Status::Storing => Status::Storing,
            api::Status::Completed => Status::Completed,
            api::Status::Failed => Status::Failed,
            api::Status::Halted => Status::Halted,
        }
    }
}

#[async_trait::async_trait]
impl Trainer for GrpcTrainer {
    async fn update_job(&self, update: &StatusUpdate) -> Result<()> {
        let request = api::UpdateRequest {
            training_id: update.training_id.clone(),
            user_id: update.user_id.clone(),
            status: api::Status::from(update.status) as i32,
            status_message: update.message.clone(),
            error_code: update.error_code.to_string(),
        };
        self.client.clone().update_training_job(request).await?;
        Ok(())
    }

    async fn status(&self, training_id: &str, user_id: &str) -> Result<Status> {
        let response = self
            .client
            .clone()
            .get_training_status(api::StatusRequest {
                training_id: training_id.to_string(),
                user_id: user_id.to_string(),
            })
            .await?
            .into_inner();
        let status = api::Status::from_i32(response.status)
            .ok_or_else(|| Error::Trainer(format!("unknown status {}", response.status)))?;
        Ok(status.into())
    }

    async fn training_logs(
        &self,
        training_id: &str,
        user_id: &str,
        metrics: bool,
    ) -> Result<LogStream> {
        let stream = self
            .client
            .clone()
            .get_training_logs(api::LogsRequest {
                training_id: training_id.to_string(),
                user_id: user_id.to_string(),
                metrics,
            })
            .await?
            .into_inner();
        Ok(stream
            .map_ok(|chunk| chunk.data)
            .map_err(Error::from)
            .boxed())
    }
}
