//! Compiling a job into the objects that run it.
//!
//! A job runs in one of two topologies. When its learners and helpers can share a network
//! volume, the helpers get a Deployment of their own next to the learner StatefulSet
//! ([`Training::Split`]). Otherwise every learner pod carries the helpers as sidecars and the
//! shared directory is pod-local ([`Training::NonSplit`]).
//!
//! Either way the job is described by a [`LearnerDefinition`] and a [`HelperDefinition`], turned
//! into a [`Bom`] and applied in order. A failure part way through deletes what was created.

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Container, EnvVar, Secret, VolumeMount};
use tracing::{debug, info};

use crate::cluster::{ClusterClient, Resource};
use crate::config::Config;
use crate::container::{self, HelperContext, LearnerSpec};
use crate::env;
use crate::image::{self, FrameworkMetadata};
use crate::job::JobDeploymentRequest;
use crate::naming;
use crate::secret::{self, PullSecret};
use crate::volume::{self, static_volumes, LearnerVolumes, SharedVolume, StaticVolume};
use crate::Result;

pub mod bom;
pub mod saga;
pub mod workload;

pub use self::bom::{Bom, CreatePolicy};

/// Everything the learner StatefulSet of a job is built from.
#[derive(Clone, Debug)]
pub struct LearnerDefinition {
    /// Name of the StatefulSet and its headless Service
    pub name: String,
    /// The resolved learner image
    pub image: String,
    /// The learner's variables
    pub env: Vec<EnvVar>,
    /// Directly mounted data stores
    pub volumes: LearnerVolumes,
    /// Credentials of the mounted buckets
    pub store_secrets: Vec<Secret>,
    /// The image pull secret
    pub pull_secret: PullSecret,
    /// The generated SSH keypair, for jobs that need one
    pub ssh_secret: Option<Secret>,
}

/// Everything the helper containers of a job are built from.
#[derive(Clone, Debug)]
pub struct HelperDefinition {
    /// Name of the helper Deployment in split mode
    pub name: String,
    /// The job's base variables
    pub job_env: Vec<EnvVar>,
    /// Tag of the log collector image
    pub log_collector_tag: String,
}

/// A job compiled for one topology.
#[derive(Clone, Debug)]
pub struct JobPlan {
    /// The job
    pub request: JobDeploymentRequest,
    /// Where learners and helpers share files
    pub shared: SharedVolume,
    /// The learners
    pub learner: LearnerDefinition,
    /// The helpers
    pub helper: HelperDefinition,
}

/// The topology a job runs in.
#[derive(Clone, Debug)]
pub enum Training {
    /// Helpers run in a Deployment of their own and share a network volume with the learners
    Split(JobPlan),
    /// Helpers run as sidecars of every learner
    NonSplit(JobPlan),
}

/// What a job is compiled from besides its request, gathered ahead of planning.
#[derive(Clone, Debug, Default)]
pub struct PlanInputs {
    /// The framework metadata document, if it could be read
    pub metadata: Option<FrameworkMetadata>,
    /// The static volume picked for the job's shared directory
    pub static_volume: Option<StaticVolume>,
    /// The generated SSH keypair, for jobs that need one
    pub ssh_secret: Option<Secret>,
    /// Tag of the running training data service
    pub log_collector_tag: Option<String>,
}

impl PlanInputs {
    /// Reads the files named in `config`, looks up the training data service and generates the
    /// job's keypair.
    pub async fn gather(
        config: &Config,
        cluster: &dyn ClusterClient,
        request: &JobDeploymentRequest,
    ) -> Result<Self> {
        Ok(PlanInputs {
            metadata: FrameworkMetadata::load(&config.learner_config_path).await,
            static_volume: static_volumes::pick(&config.static_volumes_path).await,
            ssh_secret: secret::ssh::generate(config, request).await?,
            log_collector_tag: image::training_data_service_tag(cluster, &config.pod_namespace)
                .await,
        })
    }
}

impl Training {
    /// Compiles a job from the inputs gathered for it.
    pub async fn prepare(
        config: &Config,
        cluster: &dyn ClusterClient,
        request: &JobDeploymentRequest,
    ) -> Result<Self> {
        let inputs = PlanInputs::gather(config, cluster, request).await?;
        Self::plan(config, request, inputs)
    }

    /// Compiles a job. Split mode is chosen whenever the shared volume is a network claim.
    pub fn plan(
        config: &Config,
        request: &JobDeploymentRequest,
        inputs: PlanInputs,
    ) -> Result<Self> {
        let PlanInputs {
            metadata,
            static_volume,
            ssh_secret,
            log_collector_tag,
        } = inputs;
        let shared = SharedVolume::plan(config, request, static_volume);
        let volumes = LearnerVolumes::plan(config, request);
        let job_env = env::job_env(request, &config.coordination.prefix);
        let learner_name = naming::learner_set(&request.name);

        let learner = LearnerDefinition {
            image: image::learner_image(&config.registry, request, metadata.as_ref()),
            env: env::learner_env(&job_env, request, &learner_name, volumes.mounted()),
            name: learner_name,
            store_secrets: secret::cos::secrets(config, request),
            pull_secret: PullSecret::resolve(config, request)?,
            ssh_secret,
            volumes,
        };
        let helper = HelperDefinition {
            name: naming::helper(&request.name),
            job_env,
            log_collector_tag: log_collector_tag
                .unwrap_or_else(|| config.registry.services_tag.clone()),
        };
        let plan = JobPlan {
            request: request.clone(),
            shared,
            learner,
            helper,
        };
        let training = if plan.shared.is_network() {
            Training::Split(plan)
        } else {
            Training::NonSplit(plan)
        };
        debug!(
            training_id = %request.training_id,
            split = training.is_split(),
            "Planned job"
        );
        Ok(training)
    }

    /// Whether helpers run apart from the learners.
    pub fn is_split(&self) -> bool {
        matches!(self, Training::Split(_))
    }

    /// The compiled job.
    pub fn plan_ref(&self) -> &JobPlan {
        match self {
            Training::Split(plan) | Training::NonSplit(plan) => plan,
        }
    }

    /// The objects to create, in order.
    ///
    /// Split jobs create the shared volume claim, the helper Deployment, the secrets, the learner
    /// Service and the learner StatefulSet, retrying each step. Non-split jobs create the
    /// secrets, the Service and the StatefulSet with a single attempt each. The Service is only
    /// created for jobs with more than one learner.
    pub fn bom(&self, config: &Config) -> Bom {
        let plan = self.plan_ref();
        let request = &plan.request;
        let learner = &plan.learner;
        let mut resources = Vec::new();

        let policy = match self {
            Training::Split(_) => {
                if let Some(pvc) = plan.shared.claim() {
                    resources.push(Resource::PersistentVolumeClaim(pvc.clone()));
                }
                let ctx = plan.helper_context(config);
                let mut volumes = vec![volume::etcd_cert_volume(volume::ETCD_CERT_VOLUME)];
                volumes.push(plan.shared.volume());
                resources.push(Resource::Deployment(workload::helper_deployment(
                    config,
                    request,
                    &plan.helper.name,
                    container::auxiliary_containers(&ctx),
                    volumes,
                )));
                CreatePolicy::Retry(config.retry.kube_backoff)
            }
            Training::NonSplit(_) => CreatePolicy::Once,
        };

        resources.extend(plan.secrets().into_iter().cloned().map(Resource::Secret));
        if request.num_learners() > 1 {
            resources.push(Resource::Service(workload::learner_service(
                config,
                request,
                &learner.name,
            )));
        }
        resources.push(Resource::StatefulSet(self.stateful_set(config)));
        Bom::new(resources, policy)
    }

    fn stateful_set(&self, config: &Config) -> StatefulSet {
        let plan = self.plan_ref();
        let learner = plan.learner_container();
        let mut volumes = plan.learner.volumes.volumes();
        let containers = match self {
            Training::Split(_) => vec![learner],
            Training::NonSplit(_) => {
                volumes.push(volume::etcd_cert_volume(volume::ETCD_CERT_VOLUME));
                let mut containers = container::auxiliary_containers(&plan.helper_context(config));
                containers.push(learner);
                containers
            }
        };
        volumes.push(plan.shared.volume());
        if plan.learner.ssh_secret.is_some() {
            volumes.push(secret::ssh::volume(&plan.request.name));
        }
        let template = workload::learner_pod(
            &plan.request,
            containers,
            volumes,
            plan.learner.pull_secret.name(),
        );
        workload::learner_stateful_set(config, &plan.request, &plan.learner.name, template)
    }

    /// Submits the job's objects to the cluster.
    pub async fn start(&self, config: &Config, cluster: &dyn ClusterClient) -> Result<()> {
        let bom = self.bom(config);
        info!(
            training_id = %self.plan_ref().request.training_id,
            split = self.is_split(),
            objects = bom.resources().len(),
            "Creating job objects"
        );
        bom.apply(cluster, &config.learner_namespace).await
    }
}

impl JobPlan {
    fn helper_context<'a>(&'a self, config: &'a Config) -> HelperContext<'a> {
        HelperContext {
            config,
            request: &self.request,
            job_env: &self.helper.job_env,
            shared_mount: self.shared.mount(&self.request.training_id),
            etcd_mount: volume::etcd_cert_mount(volume::ETCD_CERT_VOLUME),
            mounted: self.learner.volumes.mounted(),
            log_collector_tag: &self.helper.log_collector_tag,
        }
    }

    fn learner_mounts(&self) -> Vec<VolumeMount> {
        let mut mounts = vec![self.shared.mount(&self.request.training_id)];
        mounts.extend(self.learner.volumes.mounts());
        if self.learner.ssh_secret.is_some() {
            mounts.push(secret::ssh::mount(&self.request.name));
        }
        mounts
    }

    fn learner_container(&self) -> Container {
        container::learner(LearnerSpec {
            request: &self.request,
            image: self.learner.image.clone(),
            env: self.learner.env.clone(),
            mounts: self.learner_mounts(),
            mounted: self.learner.volumes.mounted(),
        })
    }

    /// Every secret the job creates: bucket credentials, the custom pull secret and the SSH
    /// keypair.
    pub fn secrets(&self) -> Vec<&Secret> {
        let mut secrets: Vec<&Secret> = self.learner.store_secrets.iter().collect();
        secrets.extend(self.learner.pull_secret.to_create());
        secrets.extend(self.learner.ssh_secret.as_ref());
        secrets
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::cluster::fake::FakeCluster;
    use crate::cluster::ResourceKind;
    use crate::config::BackoffConfig;
    use crate::job::ResourceRequirements;
    use crate::sizing::SizeUnit;

    fn request(learners: i32, storage_gib: f64, vars: &[(&str, &str)]) -> JobDeploymentRequest {
        JobDeploymentRequest {
            training_id: "training-1".into(),
            name: "job".into(),
            user_id: "user-1".into(),
            framework: "tensorflow".into(),
            version: "1.5".into(),
            resources: ResourceRequirements {
                cpus: 1.0,
                memory: 1.0,
                memory_unit: SizeUnit::GiB,
                storage: storage_gib,
                storage_unit: SizeUnit::GiB,
                learners,
                ..Default::default()
            },
            env_vars: vars
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            evaluation_metrics_spec: String::new(),
            ..Default::default()
        }
    }

    fn s3_stores() -> Vec<(&'static str, &'static str)> {
        vec![
            ("DATA_STORE_TYPE", "s3_datastore"),
            ("DATA_STORE_OBJECTID", "mnist"),
            ("RESULT_STORE_TYPE", "s3_datastore"),
            ("RESULT_STORE_OBJECTID", "results"),
            ("DATA_DIR", "data"),
            ("RESULT_DIR", "out"),
        ]
    }

    fn kinds(bom: &Bom) -> Vec<ResourceKind> {
        bom.resources().iter().map(Resource::kind).collect()
    }

    fn quick_config() -> Config {
        let mut config = Config::default();
        config.retry.kube_backoff = BackoffConfig {
            initial: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
            max_elapsed: Duration::from_millis(20),
        };
        config
    }

    fn offline_config() -> Config {
        let mut config = Config::default();
        config.learner_config_path = "/nonexistent/learner-config.json".into();
        config.static_volumes_path = "/nonexistent/static-volumes.yml".into();
        config.registry.services_tag = "svc".into();
        config
    }

    fn log_collector_image(training: &Training, config: &Config) -> String {
        let set = training.stateful_set(config);
        let pod = set.spec.unwrap().template.spec.unwrap();
        pod.containers
            .into_iter()
            .find(|c| c.name == container::LOG_COLLECTOR)
            .and_then(|c| c.image)
            .unwrap()
    }

    #[tokio::test]
    async fn log_collector_follows_the_training_data_service_build() {
        let config = offline_config();
        let cluster = FakeCluster::default();
        cluster.add_pod(
            serde_json::from_value(serde_json::json!({
                "metadata": {"name": "ffdl-trainingdata-0"},
                "status": {"containerStatuses": [{
                    "name": "trainingdata",
                    "image": "registry:5000/ffdl-trainingdata:tds-7",
                    "imageID": "",
                    "ready": true,
                    "restartCount": 0,
                }]},
            }))
            .unwrap(),
        );
        let req = request(1, 0.0, &s3_stores());

        let training = Training::prepare(&config, &cluster, &req).await.unwrap();
        assert!(log_collector_image(&training, &config).ends_with("/log_collector:tds-7"));

        let training = Training::prepare(&config, &FakeCluster::default(), &req)
            .await
            .unwrap();
        assert!(log_collector_image(&training, &config).ends_with("/log_collector:svc"));
    }

    #[test]
    fn single_learner_without_storage_runs_sidecars() {
        let config = Config::default();
        let training = Training::plan(&config, &request(1, 0.0, &s3_stores()), PlanInputs::default()).unwrap();
        assert!(!training.is_split());
        let bom = training.bom(&config);
        assert_eq!(bom.policy(), CreatePolicy::Once);
        assert_eq!(kinds(&bom), vec![ResourceKind::StatefulSet]);

        let set = match &bom.resources()[0] {
            Resource::StatefulSet(s) => s.clone(),
            other => panic!("unexpected {:?}", other.kind()),
        };
        assert_eq!(set.metadata.name.as_deref(), Some("learner-job"));
        let pod = set.spec.unwrap().template.spec.unwrap();
        let names: Vec<&str> = pod.containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "controller",
                "load-data",
                "load-model",
                "store-results",
                "store-logs",
                "log-collector",
                "learner"
            ]
        );
        let volumes: Vec<&str> = pod
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .map(|v| v.name.as_str())
            .collect();
        assert_eq!(volumes, vec!["etcd-ssl-cert", "jobdata"]);
        assert!(pod.volumes.unwrap()[1].empty_dir.is_some());
    }

    #[test]
    fn storage_request_splits_helpers_out() {
        let config = Config::default();
        let training =
            Training::plan(&config, &request(4, 50.0, &s3_stores()), PlanInputs::default())
                .unwrap();
        assert!(training.is_split());
        let bom = training.bom(&config);
        assert_eq!(bom.policy(), CreatePolicy::Retry(config.retry.kube_backoff));
        assert_eq!(
            kinds(&bom),
            vec![
                ResourceKind::PersistentVolumeClaim,
                ResourceKind::Deployment,
                ResourceKind::Service,
                ResourceKind::StatefulSet
            ]
        );
        match &bom.resources()[0] {
            Resource::PersistentVolumeClaim(pvc) => {
                let requests = pvc.spec.as_ref().unwrap().resources.as_ref().unwrap();
                assert_eq!(requests.requests.as_ref().unwrap()["storage"].0, "80Gi");
            }
            other => panic!("unexpected {:?}", other.kind()),
        }
        match &bom.resources()[3] {
            Resource::StatefulSet(set) => {
                let spec = set.spec.as_ref().unwrap();
                assert_eq!(spec.replicas, Some(4));
                let pod = spec.template.spec.as_ref().unwrap();
                assert_eq!(pod.containers.len(), 1);
                assert_eq!(pod.containers[0].name, "learner");
            }
            other => panic!("unexpected {:?}", other.kind()),
        }
    }

    #[test]
    fn static_volume_splits_without_a_claim() {
        let config = Config::default();
        let picked = StaticVolume {
            name: "static-pvc-1".into(),
            ..Default::default()
        };
        let inputs = PlanInputs {
            static_volume: Some(picked),
            ..Default::default()
        };
        let training = Training::plan(&config, &request(1, 0.0, &s3_stores()), inputs).unwrap();
        assert!(training.is_split());
        assert_eq!(
            kinds(&training.bom(&config)),
            vec![ResourceKind::Deployment, ResourceKind::StatefulSet]
        );
    }

    #[tokio::test]
    async fn secrets_come_before_workloads() {
        let config = offline_config();
        let mut vars = s3_stores();
        vars[0] = ("DATA_STORE_TYPE", "mount_cos");
        let mut req = request(2, 0.0, &vars);
        req.version = "1.5-horovod".into();
        let training = Training::prepare(&config, &FakeCluster::default(), &req)
            .await
            .unwrap();
        let bom = training.bom(&config);
        assert_eq!(
            kinds(&bom),
            vec![
                ResourceKind::Secret,
                ResourceKind::Secret,
                ResourceKind::Service,
                ResourceKind::StatefulSet
            ]
        );
        let names: Vec<&str> = bom.resources().iter().map(Resource::name).collect();
        assert_eq!(names[0], "cossecretdata-job");
        assert_eq!(names[1], "jobsshcert-job");
    }

    #[test]
    fn custom_image_without_token_fails_planning() {
        let mut req = request(1, 0.0, &s3_stores());
        req.image_location = Some(crate::job::ImageLocation {
            registry: "registry.example.com".into(),
            namespace: "team".into(),
            ..Default::default()
        });
        assert!(Training::plan(&Config::default(), &req, PlanInputs::default()).is_err());
    }

    #[tokio::test]
    async fn failed_split_start_rolls_back_what_it_created() {
        let config = quick_config();
        let cluster = FakeCluster::default();
        cluster.break_kind(ResourceKind::StatefulSet);
        let training =
            Training::plan(&config, &request(4, 50.0, &s3_stores()), PlanInputs::default())
                .unwrap();
        assert!(training.start(&config, &cluster).await.is_err());
        let deleted: Vec<ResourceKind> = cluster.deleted().into_iter().map(|(k, _)| k).collect();
        assert_eq!(
            deleted,
            vec![
                ResourceKind::Service,
                ResourceKind::Deployment,
                ResourceKind::PersistentVolumeClaim
            ]
        );
    }
}
