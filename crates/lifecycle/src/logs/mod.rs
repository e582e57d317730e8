//! Streaming a job's logs, or its metrics, to a caller.
//!
//! While a job runs, its output is read straight from the learner pod (the `learner` container
//! for logs, the `log-collector` container for metrics). Once the job has finished, or when no
//! pod can be found, the archived copy held by the trainer is streamed instead. While waiting,
//! the caller receives periodic status messages so the connection is not idle.

use std::time::Instant;

use chrono::{DateTime, SecondsFormat, Utc};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterClient, LogStream};
use crate::config::{Config, LogStreamConfig};
use crate::container::{LEARNER, LOG_COLLECTOR};
use crate::job::selector_for;
use crate::trainer::{Status, Trainer};
use crate::{Error, Result};

/// Possible errors sending log data.
#[derive(Debug, Error)]
pub enum SendError {
    /// The caller disconnected.
    #[error("The receiver of the log stream went away")]
    ChannelClosed,
    /// Any other error.
    #[error(transparent)]
    Abnormal(#[from] anyhow::Error),
}

/// Where streamed log data goes.
#[async_trait::async_trait]
pub trait LogSink: Send + Sync {
    /// Sends one chunk.
    async fn send(&mut self, data: Vec<u8>) -> std::result::Result<(), SendError>;
}

#[async_trait::async_trait]
impl LogSink for tokio::sync::mpsc::Sender<Vec<u8>> {
    async fn send(&mut self, data: Vec<u8>) -> std::result::Result<(), SendError> {
        tokio::sync::mpsc::Sender::send(self, data)
            .await
            .map_err(|_| SendError::ChannelClosed)
    }
}

/// What to stream.
#[derive(Clone, Debug, Default)]
pub struct LogRequest {
    /// The job
    pub training_id: String,
    /// The job's owner
    pub user_id: String,
    /// Keep streaming as new output arrives
    pub follow: bool,
    /// Stream metrics instead of logs
    pub metrics: bool,
}

impl LogRequest {
    fn container(&self) -> &'static str {
        if self.metrics {
            LOG_COLLECTOR
        } else {
            LEARNER
        }
    }
}

#[derive(Serialize)]
struct MetricValues<'a> {
    #[serde(rename = "Message")]
    message: &'a str,
}

#[derive(Serialize)]
struct MetricRecord<'a> {
    #[serde(rename = "Values")]
    values: MetricValues<'a>,
    timestamp: String,
    #[serde(rename = "type")]
    kind: &'static str,
}

/// Formats a status message the way the requested stream is framed: a JSON metrics record
/// when streaming metrics, a plain `Status:` line otherwise.
pub fn status_message(text: &str, metrics: bool, now: DateTime<Utc>) -> Vec<u8> {
    if metrics {
        let record = MetricRecord {
            values: MetricValues { message: text },
            timestamp: now.to_rfc3339_opts(SecondsFormat::AutoSi, true),
            kind: "Status",
        };
        match serde_json::to_string(&record) {
            Ok(line) => format!("{}\n", line).into_bytes(),
            Err(_) => format!("Status: {}\n", text).into_bytes(),
        }
    } else {
        format!("Status: {}\n", text).into_bytes()
    }
}

/// The pod carrying the container whose output is wanted.
pub fn pick_pod<'a>(pods: &'a [Pod], container: &str) -> Option<&'a Pod> {
    pods.iter().find(|p| {
        p.spec
            .as_ref()
            .map(|s| s.containers.iter().any(|c| c.name == container))
            .unwrap_or(false)
    })
}

fn container_started(pod: &Pod, container: &str) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .map(|statuses| {
            statuses.iter().any(|c| {
                c.name == container
                    && c.state
                        .as_ref()
                        .map(|s| s.running.is_some() || s.terminated.is_some())
                        .unwrap_or(false)
            })
        })
        .unwrap_or(false)
}

fn pod_phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Unknown")
}

enum Attach {
    Stream { pod: String, stream: LogStream },
    Done,
}

/// Streams the logs or metrics of one job into `sink`.
///
/// Returns once the job's output has been fully delivered, the caller has disconnected, or
/// the logs could not be read.
pub async fn stream_training_logs(
    config: &Config,
    cluster: &dyn ClusterClient,
    trainer: &dyn Trainer,
    request: LogRequest,
    sink: &mut dyn LogSink,
) -> Result<()> {
    let mut streamer = LogStreamer {
        namespace: &config.learner_namespace,
        settings: &config.retry.log_stream,
        cluster,
        trainer,
        request,
        sink,
        last_report: None,
    };
    match streamer.run().await {
        Err(Error::ReceiverClosed) => {
            debug!("Log receiver went away");
            Ok(())
        }
        other => other,
    }
}

struct LogStreamer<'a> {
    namespace: &'a str,
    settings: &'a LogStreamConfig,
    cluster: &'a dyn ClusterClient,
    trainer: &'a dyn Trainer,
    request: LogRequest,
    sink: &'a mut dyn LogSink,
    last_report: Option<Instant>,
}

impl<'a> LogStreamer<'a> {
    async fn run(&mut self) -> Result<()> {
        let tid = self.request.training_id.clone();
        info!(
            training_id = %tid,
            metrics = self.request.metrics,
            follow = self.request.follow,
            "Streaming training logs"
        );

        let (mut pod, mut stream) = match self.attach().await? {
            Attach::Stream { pod, stream } => (pod, stream),
            Attach::Done => return Ok(()),
        };
        let mut reattached = 0;
        let mut streamed = 0usize;
        loop {
            let broken = match stream.next().await {
                Some(Ok(chunk)) => {
                    streamed += chunk.len();
                    self.send(chunk).await?;
                    continue;
                }
                Some(Err(e)) => {
                    debug!(error = %e, pod = %pod, "Log stream broke");
                    true
                }
                None => false,
            };
            if !broken && !self.request.follow {
                return Ok(());
            }

            if self.job_finished().await? {
                debug!(pod = %pod, bytes = streamed, "Log stream finished");
                if streamed == 0 {
                    self.archived().await?;
                }
                return Ok(());
            }

            if reattached >= self.settings.reattach_limit {
                warn!(training_id = %tid, attempts = reattached, "Giving up on log stream");
                return Err(Error::LogsUnavailable { training_id: tid });
            }
            reattached += 1;
            self.report_now("Restart").await?;
            match self.attach().await? {
                Attach::Stream {
                    pod: p,
                    stream: s,
                } => {
                    pod = p;
                    stream = s;
                }
                Attach::Done => return Ok(()),
            }
        }
    }

    async fn send(&mut self, data: Vec<u8>) -> Result<()> {
        match self.sink.send(data).await {
            Ok(()) => Ok(()),
            Err(SendError::ChannelClosed) => Err(Error::ReceiverClosed),
            Err(SendError::Abnormal(e)) => Err(Error::LogStream(e.to_string())),
        }
    }

    async fn report_now(&mut self, text: &str) -> Result<()> {
        self.last_report = Some(Instant::now());
        let message = status_message(text, self.request.metrics, Utc::now());
        self.send(message).await
    }

    /// Sends a status message unless one went out within the reporting interval.
    async fn report(&mut self, text: &str) -> Result<()> {
        let due = self
            .last_report
            .map(|t| t.elapsed() >= self.settings.status_interval)
            .unwrap_or(true);
        if due {
            self.report_now(text).await?;
        }
        Ok(())
    }

    async fn pause(&self) {
        tokio::time::sleep(self.settings.poll_interval).await;
    }

    /// Finds the job's pod and opens its log. Archived logs are streamed instead, and `Done`
    /// returned, when the job has finished or no pod turns up.
    async fn attach(&mut self) -> Result<Attach> {
        let container = self.request.container();
        let attempts = if self.request.follow {
            self.settings.wait_attempts_follow.max(1)
        } else {
            1
        };

        let mut found = None;
        for attempt in 1..=attempts {
            if attempt > 1 {
                self.pause().await;
            }
            let status = match self
                .trainer
                .status(&self.request.training_id, &self.request.user_id)
                .await
            {
                Ok(status) => status,
                Err(e) => {
                    debug!(error = %e, "Could not read job status");
                    self.report("Waiting for training to start").await?;
                    continue;
                }
            };
            if status.is_terminal() {
                return self.archived().await;
            }
            if status == Status::NotStarted {
                self.report("Waiting for training to start").await?;
                continue;
            }
            self.report(status.as_ref()).await?;

            let selector = selector_for(&self.request.training_id);
            match self.cluster.list_pods(self.namespace, Some(&selector)).await {
                Ok(pods) => {
                    if let Some(pod) = pick_pod(&pods, container) {
                        found = pod.metadata.name.clone();
                        break;
                    }
                }
                Err(e) => debug!(error = %e, "Could not list pods"),
            }
        }
        let pod = match found {
            Some(pod) => pod,
            None => {
                debug!("No pod to stream from");
                return self.archived().await;
            }
        };

        for _ in 0..self.settings.ready_polls {
            match self
                .trainer
                .status(&self.request.training_id, &self.request.user_id)
                .await
            {
                Ok(status) if status.is_terminal() => return self.archived().await,
                Ok(status) => self.report(status.as_ref()).await?,
                Err(e) => {
                    if self.check_persistent_store().await? {
                        return Ok(Attach::Done);
                    }
                    return Err(e);
                }
            }

            let started = match self.cluster.get_pod(self.namespace, &pod).await {
                Ok(Some(p)) => container_started(&p, container),
                Ok(None) => return self.archived().await,
                Err(e) => {
                    debug!(error = %e, pod = %pod, "Could not read pod");
                    false
                }
            };
            if started {
                if let Some(stream) = self.open(&pod, container).await {
                    return Ok(Attach::Stream { pod, stream });
                }
                break;
            }
            self.pause().await;
        }
        self.archived().await
    }

    async fn open(&self, pod: &str, container: &str) -> Option<LogStream> {
        for attempt in 1..=self.settings.open_attempts {
            match self
                .cluster
                .pod_logs(self.namespace, pod, container, self.request.follow)
                .await
            {
                Ok(stream) => return Some(stream),
                Err(e) => {
                    debug!(error = %e, pod, container, attempt, "Could not open log stream");
                    if attempt < self.settings.open_attempts {
                        self.pause().await;
                    }
                }
            }
        }
        None
    }

    /// Waits out a job that is storing results. Returns `true` once the archived logs of a
    /// finished job have been delivered.
    async fn check_persistent_store(&mut self) -> Result<bool> {
        for _ in 0..self.settings.storing_polls {
            let status = self
                .trainer
                .status(&self.request.training_id, &self.request.user_id)
                .await?;
            if status.is_terminal() {
                self.archived().await?;
                return Ok(true);
            }
            if status != Status::Storing {
                break;
            }
            self.pause().await;
        }
        Ok(false)
    }

    /// Whether the job is done producing output. A job still storing results is polled for a
    /// while, after which the learner pod decides.
    async fn job_finished(&self) -> Result<bool> {
        let polls = self.settings.storing_polls.max(1);
        for poll in 1..=polls {
            let status = self
                .trainer
                .status(&self.request.training_id, &self.request.user_id)
                .await?;
            if status.is_terminal() {
                return Ok(true);
            }
            if status != Status::Storing {
                return Ok(false);
            }
            if poll < polls {
                self.pause().await;
            }
        }

        let selector = selector_for(&self.request.training_id);
        let pods = self.cluster.list_pods(self.namespace, Some(&selector)).await?;
        Ok(match pick_pod(&pods, self.request.container()) {
            Some(pod) => matches!(pod_phase(pod), "Succeeded" | "Failed"),
            None => true,
        })
    }

    /// Streams the trainer's archived copy.
    async fn archived(&mut self) -> Result<Attach> {
        debug!("Streaming archived logs");
        let mut stream = self
            .trainer
            .training_logs(
                &self.request.training_id,
                &self.request.user_id,
                self.request.metrics,
            )
            .await?;
        while let Some(chunk) = stream.next().await {
            self.send(chunk?).await?;
        }
        Ok(Attach::Done)
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use chrono::TimeZone;
    use k8s_openapi::api::core::v1::{
        Container, ContainerState, ContainerStateRunning, ContainerStatus, PodSpec, PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;
    use crate::cluster::fake::FakeCluster;
    use crate::trainer::fake::RecordingTrainer;

    #[derive(Default)]
    struct Collect(Vec<u8>);

    #[async_trait::async_trait]
    impl LogSink for Collect {
        async fn send(&mut self, data: Vec<u8>) -> std::result::Result<(), SendError> {
            self.0.extend(data);
            Ok(())
        }
    }

    impl Collect {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0).to_string()
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        let s = &mut config.retry.log_stream;
        s.poll_interval = Duration::from_millis(1);
        s.status_interval = Duration::from_secs(3600);
        s.wait_attempts_follow = 3;
        s.ready_polls = 3;
        s.open_attempts = 2;
        s.reattach_limit = 2;
        s.storing_polls = 2;
        config
    }

    fn request(metrics: bool) -> LogRequest {
        LogRequest {
            training_id: "training-1".into(),
            user_id: "user-1".into(),
            follow: true,
            metrics,
        }
    }

    fn running_pod(phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("learner-0-job".into()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: LEARNER.into(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some(phase.into()),
                container_statuses: Some(vec![ContainerStatus {
                    name: LEARNER.into(),
                    state: Some(ContainerState {
                        running: Some(ContainerStateRunning::default()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn status_messages_follow_the_stream_framing() {
        let now = Utc.ymd(2020, 1, 2).and_hms(3, 4, 5);
        assert_eq!(
            status_message("PENDING", false, now),
            b"Status: PENDING\n".to_vec()
        );
        let line = String::from_utf8(status_message("PENDING", true, now)).unwrap();
        assert_eq!(
            line,
            "{\"Values\":{\"Message\":\"PENDING\"},\"timestamp\":\"2020-01-02T03:04:05Z\",\"type\":\"Status\"}\n"
        );
    }

    #[test]
    fn picks_the_pod_with_the_wanted_container() {
        let pods = vec![Pod::default(), running_pod("Running")];
        let pod = pick_pod(&pods, LEARNER).unwrap();
        assert_eq!(pod.metadata.name.as_deref(), Some("learner-0-job"));
        assert!(pick_pod(&pods, LOG_COLLECTOR).is_none());
    }

    #[tokio::test]
    async fn finished_jobs_stream_archived_logs() {
        let trainer = RecordingTrainer::with_statuses(vec![Status::Completed]);
        let mut sink = Collect::default();
        stream_training_logs(
            &config(),
            &FakeCluster::default(),
            &trainer,
            request(false),
            &mut sink,
        )
        .await
        .unwrap();
        assert_eq!(sink.text(), "archived logs\n");
    }

    #[tokio::test]
    async fn running_jobs_stream_from_the_learner() {
        let cluster = FakeCluster::default();
        cluster.add_pod(running_pod("Running"));
        cluster.queue_logs(vec![Ok(b"epoch 1\n".to_vec()), Ok(b"epoch 2\n".to_vec())]);
        let trainer = RecordingTrainer::with_statuses(vec![
            Status::Processing,
            Status::Processing,
            Status::Completed,
        ]);
        let mut sink = Collect::default();
        stream_training_logs(
            &config(),
            &cluster,
            &trainer,
            request(false),
            &mut sink,
        )
        .await
        .unwrap();
        assert_eq!(sink.text(), "Status: PROCESSING\nepoch 1\nepoch 2\n");
        assert_eq!(cluster.log_opens(), 1);
    }

    #[tokio::test]
    async fn restarting_learners_are_reattached() {
        let cluster = FakeCluster::default();
        cluster.add_pod(running_pod("Running"));
        cluster.queue_logs(vec![Ok(b"first\n".to_vec())]);
        cluster.queue_logs(vec![Ok(b"second\n".to_vec())]);
        cluster.queue_logs(vec![Err(Error::LogStream("connection reset".into()))]);
        let trainer = RecordingTrainer::with_statuses(vec![Status::Processing]);
        let mut sink = Collect::default();
        let err = stream_training_logs(
            &config(),
            &cluster,
            &trainer,
            request(false),
            &mut sink,
        )
        .await
        .unwrap_err();

        let text = sink.text();
        assert!(text.contains("first\n"));
        assert!(text.contains("Status: Restart\n"));
        assert!(text.contains("second\n"));
        assert_eq!(cluster.log_opens(), 3);
        assert!(matches!(err, Error::LogsUnavailable { .. }));
    }

    #[tokio::test]
    async fn empty_streams_of_stored_jobs_fall_back_to_archived_logs() {
        let cluster = FakeCluster::default();
        cluster.add_pod(running_pod("Running"));
        cluster.queue_logs(Vec::new());
        let trainer = RecordingTrainer::with_statuses(vec![
            Status::Processing,
            Status::Processing,
            Status::Storing,
            Status::Completed,
        ]);
        let mut sink = Collect::default();
        stream_training_logs(&config(), &cluster, &trainer, request(false), &mut sink)
            .await
            .unwrap();
        assert_eq!(sink.text(), "Status: PROCESSING\narchived logs\n");
    }

    #[tokio::test]
    async fn missing_pods_fall_back_to_archived_logs() {
        let trainer = RecordingTrainer::with_statuses(vec![Status::Processing]);
        let mut sink = Collect::default();
        stream_training_logs(
            &config(),
            &FakeCluster::default(),
            &trainer,
            request(true),
            &mut sink,
        )
        .await
        .unwrap();
        let text = sink.text();
        assert!(text.starts_with("{\"Values\":{\"Message\":\"PROCESSING\"}"));
        assert!(text.ends_with("archived logs\n"));
    }

    #[tokio::test]
    async fn closed_receivers_end_the_stream_quietly() {
        let trainer = RecordingTrainer::with_statuses(vec![Status::Completed]);
        let (mut tx, rx) = tokio::sync::mpsc::channel::<Vec<u8>>(1);
        drop(rx);
        stream_training_logs(
            &config(),
            &FakeCluster::default(),
            &trainer,
            request(false),
            &mut tx,
        )
        .await
        .unwrap();
    }
}
