//! The gRPC face of the lifecycle manager.
//!
//! Requests are translated into calls on [`LifecycleManager`](crate::LifecycleManager) and
//! errors into [`tonic::Status`] codes callers can act on.

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{debug, warn};

use crate::events::Endpoint;
use crate::job::{ImageLocation, JobDeploymentRequest, ResourceRequirements};
use crate::lcm_api::v1 as api;
use crate::lcm_api::v1::lifecycle_manager_server::{
    LifecycleManager as LifecycleManagerApi, LifecycleManagerServer,
};
use crate::logs::{LogRequest, LogSink, SendError};
use crate::{Error, LifecycleManager};

const LOG_BUFFER: usize = 16;

/// Serves a [`LifecycleManager`] over gRPC.
#[derive(Clone)]
pub struct LifecycleService {
    lcm: LifecycleManager,
}

impl LifecycleService {
    /// Wraps a lifecycle manager.
    pub fn new(lcm: LifecycleManager) -> Self {
        LifecycleService { lcm }
    }

    /// The tonic service, ready to be added to a router.
    pub fn into_server(self) -> LifecycleManagerServer<Self> {
        LifecycleManagerServer::new(self)
    }
}

/// Maps a crate error onto the gRPC status returned to callers.
pub fn to_status(error: Error) -> Status {
    let message = error.to_string();
    match error {
        Error::InvalidEventType(_) | Error::MissingImageToken => Status::invalid_argument(message),
        Error::EndpointExists | Error::NodeExists { .. } | Error::AlreadyExists { .. } => {
            Status::already_exists(message)
        }
        Error::EndpointNotFound => Status::not_found(message),
        Error::Coordination(_) | Error::Trainer(_) => Status::unavailable(message),
        Error::ReceiverClosed => Status::cancelled(message),
        _ => Status::internal(message),
    }
}

impl From<api::JobDeploymentRequest> for JobDeploymentRequest {
    fn from(req: api::JobDeploymentRequest) -> Self {
        let resources = req.resources.unwrap_or_default();
        JobDeploymentRequest {
            training_id: req.training_id,
            name: req.name,
            user_id: req.user_id,
            framework: req.framework,
            version: req.version,
            image_tag: req.image_tag,
            resources: ResourceRequirements {
                cpus: f64::from(resources.cpus),
                memory: f64::from(resources.memory),
                memory_unit: resources.memory_unit.parse().unwrap_or_default(),
                storage: f64::from(resources.storage),
                storage_unit: resources.storage_unit.parse().unwrap_or_default(),
                gpus: f64::from(resources.gpus),
                gpu_type: resources.gpu_type,
                learners: resources.learners,
                schedpolicy: resources.schedpolicy,
            },
            env_vars: req.env_vars.into_iter().collect(),
            labels: req.labels.into_iter().collect(),
            image_location: req.image_location.map(|l| ImageLocation {
                registry: l.registry,
                namespace: l.namespace,
                access_token: l.access_token,
                email: l.email,
            }),
            evaluation_metrics_spec: req.evaluation_metrics_spec,
        }
    }
}

impl From<Endpoint> for api::EventEndpoint {
    fn from(endpoint: Endpoint) -> Self {
        api::EventEndpoint {
            endpoint_id: endpoint.id,
            url: endpoint.url,
        }
    }
}

/// Forwards log chunks into the response stream of one call.
struct ResponseSink(mpsc::Sender<Result<api::TrainerLogStreamResponse, Status>>);

#[async_trait::async_trait]
impl LogSink for ResponseSink {
    async fn send(&mut self, data: Vec<u8>) -> Result<(), SendError> {
        self.0
            .send(Ok(api::TrainerLogStreamResponse { data }))
            .await
            .map_err(|_| SendError::ChannelClosed)
    }
}

#[tonic::async_trait]
impl LifecycleManagerApi for LifecycleService {
    async fn deploy_training_job(
        &self,
        request: Request<api::JobDeploymentRequest>,
    ) -> Result<Response<api::JobDeploymentResponse>, Status> {
        let name = self
            .lcm
            .deploy_training_job(request.into_inner().into())
            .await
            .map_err(to_status)?;
        Ok(Response::new(api::JobDeploymentResponse { name }))
    }

    async fn halt_training_job(
        &self,
        request: Request<api::JobHaltRequest>,
    ) -> Result<Response<api::JobHaltResponse>, Status> {
        let req = request.into_inner();
        self.lcm
            .halt_training_job(&req.training_id, &req.user_id)
            .await
            .map_err(to_status)?;
        Ok(Response::new(api::JobHaltResponse {}))
    }

    async fn kill_training_job(
        &self,
        request: Request<api::JobKillRequest>,
    ) -> Result<Response<api::JobKillResponse>, Status> {
        let req = request.into_inner();
        self.lcm
            .kill_training_job(&req.training_id, &req.user_id)
            .await
            .map_err(to_status)?;
        Ok(Response::new(api::JobKillResponse {}))
    }

    type GetTrainingLogStreamStream =
        ReceiverStream<Result<api::TrainerLogStreamResponse, Status>>;

    async fn get_training_log_stream(
        &self,
        request: Request<api::TrainerContainerInfosRequest>,
    ) -> Result<Response<Self::GetTrainingLogStreamStream>, Status> {
        let req = request.into_inner();
        let log_request = LogRequest {
            training_id: req.training_id,
            user_id: req.user_id,
            follow: req.follow,
            metrics: req.metrics,
        };
        let (tx, rx) = mpsc::channel(LOG_BUFFER);
        let lcm = self.lcm.clone();
        tokio::spawn(async move {
            let mut sink = ResponseSink(tx.clone());
            if let Err(e) = lcm.training_log_stream(log_request, &mut sink).await {
                warn!(error = %e, "Log stream failed");
                if tx.send(Err(to_status(e))).await.is_err() {
                    debug!("Log receiver went away before the error could be sent");
                }
            }
        });
        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn create_event_endpoint(
        &self,
        request: Request<api::CreateEventEndpointRequest>,
    ) -> Result<Response<api::EventEndpointResponse>, Status> {
        let req = request.into_inner();
        self.lcm
            .create_event_endpoint(&req.training_id, &req.event_type, &req.endpoint_id, &req.url)
            .await
            .map_err(to_status)?;
        Ok(Response::new(api::EventEndpointResponse {
            endpoint: Some(api::EventEndpoint {
                endpoint_id: req.endpoint_id,
                url: req.url,
            }),
        }))
    }

    async fn delete_event_endpoint(
        &self,
        request: Request<api::EventEndpointRequest>,
    ) -> Result<Response<api::EventEndpointResponse>, Status> {
        let req = request.into_inner();
        self.lcm
            .delete_event_endpoint(&req.training_id, &req.event_type, &req.endpoint_id)
            .await
            .map_err(to_status)?;
        Ok(Response::new(api::EventEndpointResponse { endpoint: None }))
    }

    async fn get_event_endpoint(
        &self,
        request: Request<api::EventEndpointRequest>,
    ) -> Result<Response<api::EventEndpointResponse>, Status> {
        let req = request.into_inner();
        let endpoint = self
            .lcm
            .event_endpoint(&req.training_id, &req.event_type, &req.endpoint_id)
            .await
            .map_err(to_status)?;
        Ok(Response::new(api::EventEndpointResponse {
            endpoint: Some(endpoint.into()),
        }))
    }

    async fn get_event_type_endpoints(
        &self,
        request: Request<api::EventTypeRequest>,
    ) -> Result<Response<api::EventEndpointsResponse>, Status> {
        let req = request.into_inner();
        let endpoints = self
            .lcm
            .event_type_endpoints(&req.training_id, &req.event_type)
            .await
            .map_err(to_status)?;
        Ok(Response::new(api::EventEndpointsResponse {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
        }))
    }
}
