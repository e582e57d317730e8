//! Configuration for the lifecycle manager
//!
//! The configuration is built once at start up, either with [`Config::default_config`] or, with
//! the "cli" feature turned on, with [`Config::new_from_flags`]. It is then shared behind an
//! `Arc` and passed to every planner that needs it.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[cfg(feature = "cli")]
use structopt::StructOpt;

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8443";
const DEFAULT_NAMESPACE: &str = "default";
const DEFAULT_LEARNER_CONFIG_PATH: &str = "/etc/learner-config-json/learner-config.json";
const DEFAULT_STATIC_VOLUMES_PATH: &str = "/etc/static-volumes-v2/PVCs-v2.yaml";
const DEFAULT_HELPER_MILLI_CPU: i64 = 100;
const DEFAULT_HELPER_MEMORY_MB: i64 = 100;
const DEFAULT_COS_CACHE_GB_PER_GPU: u32 = 6;

/// Where the job monitor for a training job runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeploymentMode {
    /// Deploy the job monitor as a Deployment next to the learners
    Local,
    /// Deploy the job monitor as a Deployment, pulling its image from the hybrid registry
    Hybrid,
    /// The job monitor runs inside the lifecycle manager's host process; nothing is deployed
    InProcess,
}

impl FromStr for DeploymentMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "hybrid" => Ok(Self::Hybrid),
            "in-process" | "inprocess" => Ok(Self::InProcess),
            other => Err(anyhow::anyhow!("unknown deployment mode {}", other)),
        }
    }
}

/// The configuration needed for the lifecycle manager to run properly.
#[derive(Clone, Debug)]
pub struct Config {
    /// Namespace the learners, helpers and job monitors are created in
    pub learner_namespace: String,
    /// Namespace the lifecycle manager itself runs in
    pub pod_namespace: String,
    /// Where job monitors are launched
    pub deployment_mode: DeploymentMode,
    /// Image registries and tags
    pub registry: RegistryConfig,
    /// JSON document mapping frameworks and versions to learner image build tags
    pub learner_config_path: PathBuf,
    /// YAML list of pre-provisioned volume claims
    pub static_volumes_path: PathBuf,
    /// Shared and object-store volume tuning
    pub volumes: VolumeConfig,
    /// CPU and memory given to each helper container
    pub helpers: HelperResources,
    /// How to reach the coordination store
    pub coordination: CoordinationConfig,
    /// Address of the trainer service
    pub trainer_address: String,
    /// Address the gRPC server listens on
    pub listen_addr: SocketAddr,
    /// Environment name handed to job monitors
    pub env_name: String,
    /// Log level, also handed to job monitors
    pub log_level: String,
    /// Whether job monitors push metrics
    pub push_metrics: bool,
    /// Retry counts and polling intervals
    pub retry: RetryConfig,
}

/// Image registries and tags.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Registry holding learner, helper and job monitor images
    pub learner_registry: String,
    /// Registry used for job monitors in hybrid deployment mode
    pub hybrid_registry: String,
    /// Optional prefix prepended to helper image names
    pub image_prefix: String,
    /// Default learner image tag
    pub learner_tag: String,
    /// Tag of the controller and log collector images
    pub services_tag: String,
    /// Tag of the data broker images
    pub databroker_tag: String,
    /// Tag of the job monitor image
    pub jobmonitor_tag: String,
    /// Name of the secret used to pull learner images
    pub image_pull_secret: String,
}

/// Shared and object-store volume tuning.
#[derive(Clone, Debug)]
pub struct VolumeConfig {
    /// Storage class annotation set on dynamically provisioned claims
    pub storage_class: Option<String>,
    /// Claim size in bytes used when a job asks for storage but gives no amount
    pub default_volume_size: i64,
    /// Object-store mount cache per GPU, in GB
    pub cos_cache_gb_per_gpu: u32,
}

/// CPU and memory for one helper container.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HelperSpec {
    /// CPU in millicores
    pub milli_cpu: i64,
    /// Memory in MB
    pub memory_mb: i64,
}

impl Default for HelperSpec {
    fn default() -> Self {
        HelperSpec {
            milli_cpu: DEFAULT_HELPER_MILLI_CPU,
            memory_mb: DEFAULT_HELPER_MEMORY_MB,
        }
    }
}

/// Resources for every helper role.
#[derive(Clone, Debug, Default)]
pub struct HelperResources {
    /// The controller container
    pub controller: HelperSpec,
    /// The load-data container
    pub load_data: HelperSpec,
    /// The load-model container
    pub load_model: HelperSpec,
    /// The store-results and store-logs containers
    pub store_results: HelperSpec,
    /// The log-collector container
    pub log_collector: HelperSpec,
}

/// Connection settings for the coordination store.
#[derive(Clone, Debug, Default)]
pub struct CoordinationConfig {
    /// Store endpoints
    pub endpoints: Vec<String>,
    /// Prefix every job path is placed under
    pub prefix: String,
    /// User name
    pub username: String,
    /// Password
    pub password: String,
    /// CA certificate for TLS connections
    pub cert_path: Option<PathBuf>,
}

/// Exponential backoff used for cluster interactions.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffConfig {
    /// First pause
    pub initial: Duration,
    /// Longest single pause
    pub max_interval: Duration,
    /// Total time after which retrying stops
    pub max_elapsed: Duration,
}

/// Polling used while streaming logs.
#[derive(Clone, Copy, Debug)]
pub struct LogStreamConfig {
    /// Pause between readiness checks
    pub poll_interval: Duration,
    /// How often a waiting status message is sent
    pub status_interval: Duration,
    /// How many times to look for logging pods when following
    pub wait_attempts_follow: u32,
    /// How many readiness polls to make for the log container
    pub ready_polls: u32,
    /// How many times to try opening the log stream
    pub open_attempts: u32,
    /// How many times to re-attach to a restarting pod
    pub reattach_limit: u32,
    /// How many times to re-check a job that is storing results
    pub storing_polls: u32,
}

/// Retry counts and polling intervals.
#[derive(Clone, Copy, Debug)]
pub struct RetryConfig {
    /// Attempts made to push a status update to the trainer
    pub status_attempts: u32,
    /// Pause between status update attempts
    pub status_interval: Duration,
    /// Attempts made to list nodes and pods for the resource snapshot
    pub snapshot_attempts: u32,
    /// Pause between snapshot attempts
    pub snapshot_interval: Duration,
    /// Backoff used when creating cluster objects
    pub kube_backoff: BackoffConfig,
    /// Log stream polling
    pub log_stream: LogStreamConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            status_attempts: 10,
            status_interval: Duration::from_millis(100),
            snapshot_attempts: 5,
            snapshot_interval: Duration::from_secs(30),
            kube_backoff: BackoffConfig {
                initial: Duration::from_millis(500),
                max_interval: Duration::from_secs(60),
                max_elapsed: Duration::from_secs(180),
            },
            log_stream: LogStreamConfig {
                poll_interval: Duration::from_secs(2),
                status_interval: Duration::from_secs(5),
                wait_attempts_follow: 40,
                ready_polls: 64,
                open_attempts: 10,
                reattach_limit: 10,
                storing_polls: 10,
            },
        }
    }
}

impl Config {
    /// Returns a Config object set with all of the defaults.
    pub fn default_config() -> Self {
        Config {
            learner_namespace: DEFAULT_NAMESPACE.to_string(),
            pod_namespace: DEFAULT_NAMESPACE.to_string(),
            deployment_mode: DeploymentMode::Local,
            registry: RegistryConfig {
                learner_registry: "docker.io/ffdl".to_string(),
                hybrid_registry: "docker.io/ffdl".to_string(),
                image_prefix: String::new(),
                learner_tag: "latest".to_string(),
                services_tag: "latest".to_string(),
                databroker_tag: "latest".to_string(),
                jobmonitor_tag: "latest".to_string(),
                image_pull_secret: "regcred".to_string(),
            },
            learner_config_path: PathBuf::from(DEFAULT_LEARNER_CONFIG_PATH),
            static_volumes_path: PathBuf::from(DEFAULT_STATIC_VOLUMES_PATH),
            volumes: VolumeConfig {
                storage_class: None,
                default_volume_size: 0,
                cos_cache_gb_per_gpu: DEFAULT_COS_CACHE_GB_PER_GPU,
            },
            helpers: HelperResources::default(),
            coordination: CoordinationConfig::default(),
            trainer_address: "http://ffdl-trainer:80".to_string(),
            listen_addr: DEFAULT_LISTEN_ADDR
                .parse()
                .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8443))),
            env_name: "local".to_string(),
            log_level: "info".to_string(),
            push_metrics: true,
            retry: RetryConfig::default(),
        }
    }

    /// The registry the job monitor image is pulled from in the configured deployment mode.
    pub fn job_monitor_registry(&self) -> &str {
        match self.deployment_mode {
            DeploymentMode::Hybrid => &self.registry.hybrid_registry,
            _ => &self.registry.learner_registry,
        }
    }

    /// Parses all command line flags and environment variables and sets the proper defaults.
    /// The version of your application should be passed to set the proper version for the CLI.
    #[cfg(any(feature = "cli", feature = "docs"))]
    #[cfg_attr(feature = "docs", doc(cfg(feature = "cli")))]
    pub fn new_from_flags(version: &str) -> Self {
        let app = Opts::clap().version(version);
        let opts = Opts::from_clap(&app.get_matches());
        Config::from(opts)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}

#[cfg(any(feature = "cli", feature = "docs"))]
impl From<Opts> for Config {
    fn from(opts: Opts) -> Self {
        let defaults = RetryConfig::default();
        let helper = |milli_cpu, memory_mb| HelperSpec {
            milli_cpu,
            memory_mb,
        };
        Config {
            learner_namespace: opts.learner_namespace,
            pod_namespace: opts.pod_namespace,
            deployment_mode: opts.deployment_mode,
            registry: RegistryConfig {
                hybrid_registry: opts
                    .hybrid_registry
                    .unwrap_or_else(|| opts.learner_registry.clone()),
                learner_registry: opts.learner_registry,
                image_prefix: opts.image_prefix,
                learner_tag: opts.learner_tag,
                services_tag: opts.services_tag,
                databroker_tag: opts.databroker_tag,
                jobmonitor_tag: opts.jobmonitor_tag,
                image_pull_secret: opts.image_pull_secret,
            },
            learner_config_path: opts.learner_config_path,
            static_volumes_path: opts.static_volumes_path,
            volumes: VolumeConfig {
                storage_class: opts.storage_class.filter(|s| !s.is_empty()),
                default_volume_size: opts.default_volume_size,
                cos_cache_gb_per_gpu: opts.cos_cache_gb_per_gpu,
            },
            helpers: HelperResources {
                controller: helper(opts.controller_milli_cpu, opts.controller_mem_mb),
                load_data: helper(opts.load_data_milli_cpu, opts.load_data_mem_mb),
                load_model: helper(opts.load_model_milli_cpu, opts.load_model_mem_mb),
                store_results: helper(opts.store_results_milli_cpu, opts.store_results_mem_mb),
                log_collector: helper(opts.log_collector_milli_cpu, opts.log_collector_mem_mb),
            },
            coordination: CoordinationConfig {
                endpoints: opts
                    .etcd_endpoints
                    .into_iter()
                    .filter(|e| !e.is_empty())
                    .collect(),
                prefix: opts.etcd_prefix,
                username: opts.etcd_username,
                password: opts.etcd_password,
                cert_path: opts.etcd_cert_path,
            },
            trainer_address: opts.trainer_address,
            listen_addr: opts.listen_addr,
            env_name: opts.env_name,
            log_level: opts.log_level,
            push_metrics: opts.push_metrics,
            retry: RetryConfig {
                status_attempts: opts.status_attempts,
                snapshot_attempts: opts.snapshot_attempts,
                snapshot_interval: Duration::from_secs(opts.snapshot_interval_secs),
                ..defaults
            },
        }
    }
}

/// CLI options that can be configured for the lifecycle manager
///
/// These can be parsed from args using `Opts::from_args()`
#[derive(StructOpt, Clone, Debug)]
#[cfg(any(feature = "cli", feature = "docs"))]
#[cfg_attr(feature = "docs", doc(cfg(feature = "cli")))]
#[structopt(
    name = "lcm",
    about = "Deploys and tears down distributed training jobs on Kubernetes"
)]
pub struct Opts {
    #[structopt(
        long = "listen-addr",
        default_value = DEFAULT_LISTEN_ADDR,
        env = "LCM_ADDRESS",
        help = "The address the gRPC server should listen on"
    )]
    listen_addr: SocketAddr,

    #[structopt(
        long = "learner-namespace",
        default_value = DEFAULT_NAMESPACE,
        env = "DLAAS_LEARNER_KUBE_NAMESPACE",
        help = "The namespace learners, helpers and job monitors are created in"
    )]
    learner_namespace: String,

    #[structopt(
        long = "pod-namespace",
        default_value = DEFAULT_NAMESPACE,
        env = "DLAAS_POD_NAMESPACE",
        help = "The namespace the lifecycle manager runs in"
    )]
    pod_namespace: String,

    #[structopt(
        long = "deployment-mode",
        default_value = "local",
        env = "DLAAS_LCM_DEPLOYMENT",
        help = "Where job monitors run: local, hybrid or in-process"
    )]
    deployment_mode: DeploymentMode,

    #[structopt(
        long = "learner-registry",
        default_value = "docker.io/ffdl",
        env = "DLAAS_LEARNER_REGISTRY",
        help = "The registry learner and helper images are pulled from"
    )]
    learner_registry: String,

    #[structopt(
        long = "hybrid-registry",
        env = "DLAAS_HYBRID_REGISTRY",
        help = "The registry job monitor images are pulled from in hybrid mode. Defaults to the learner registry"
    )]
    hybrid_registry: Option<String>,

    #[structopt(
        long = "image-prefix",
        default_value = "",
        env = "DLAAS_IMAGE_PREFIX",
        help = "A prefix prepended to helper image names"
    )]
    image_prefix: String,

    #[structopt(
        long = "learner-tag",
        default_value = "latest",
        env = "DLAAS_LEARNER_TAG",
        help = "The default learner image tag"
    )]
    learner_tag: String,

    #[structopt(
        long = "services-tag",
        default_value = "latest",
        env = "DLAAS_SERVICES_TAG",
        help = "The tag of the controller and log collector images"
    )]
    services_tag: String,

    #[structopt(
        long = "databroker-tag",
        default_value = "latest",
        env = "DLAAS_DATABROKER_TAG",
        help = "The tag of the data broker images"
    )]
    databroker_tag: String,

    #[structopt(
        long = "jobmonitor-tag",
        default_value = "latest",
        env = "DLAAS_JOBMONITOR_TAG",
        help = "The tag of the job monitor image"
    )]
    jobmonitor_tag: String,

    #[structopt(
        long = "image-pull-secret",
        default_value = "regcred",
        env = "DLAAS_LEARNER_IMAGE_PULL_SECRET",
        help = "The secret used to pull learner images"
    )]
    image_pull_secret: String,

    #[structopt(
        long = "learner-config-path",
        default_value = DEFAULT_LEARNER_CONFIG_PATH,
        env = "DLAAS_LEARNER_CONFIG_PATH",
        help = "The framework metadata file mapping framework versions to image build tags"
    )]
    learner_config_path: PathBuf,

    #[structopt(
        long = "static-volumes-path",
        default_value = DEFAULT_STATIC_VOLUMES_PATH,
        env = "DLAAS_STATIC_VOLUMES_PATH",
        help = "The file listing pre-provisioned volume claims"
    )]
    static_volumes_path: PathBuf,

    #[structopt(
        long = "storage-class",
        env = "DLAAS_SHARED_VOLUME_STORAGE_CLASS",
        help = "The storage class set on dynamically provisioned shared volume claims"
    )]
    storage_class: Option<String>,

    #[structopt(
        long = "default-volume-size",
        default_value = "0",
        env = "DLAAS_DEFAULT_VOLUME_SIZE",
        help = "Default shared volume size in bytes"
    )]
    default_volume_size: i64,

    #[structopt(
        long = "cos-cache-gb-per-gpu",
        default_value = "6",
        env = "DLAAS_COS_CACHE_GB_PER_GPU",
        help = "Object store mount cache per GPU, in GB"
    )]
    cos_cache_gb_per_gpu: u32,

    #[structopt(long, default_value = "100", env = "controllerMilliCPU", help = "Controller CPU in millicores")]
    controller_milli_cpu: i64,

    #[structopt(long, default_value = "100", env = "controllerMemInMB", help = "Controller memory in MB")]
    controller_mem_mb: i64,

    #[structopt(long, default_value = "100", env = "loadTrainingDataMilliCPU", help = "Load-data CPU in millicores")]
    load_data_milli_cpu: i64,

    #[structopt(long, default_value = "100", env = "loadTrainingDataMemInMB", help = "Load-data memory in MB")]
    load_data_mem_mb: i64,

    #[structopt(long, default_value = "100", env = "loadModelMilliCPU", help = "Load-model CPU in millicores")]
    load_model_milli_cpu: i64,

    #[structopt(long, default_value = "100", env = "loadModelMemInMB", help = "Load-model memory in MB")]
    load_model_mem_mb: i64,

    #[structopt(long, default_value = "100", env = "storeResultsMilliCPU", help = "Store-results CPU in millicores")]
    store_results_milli_cpu: i64,

    #[structopt(long, default_value = "100", env = "storeResultsMemInMB", help = "Store-results memory in MB")]
    store_results_mem_mb: i64,

    #[structopt(long, default_value = "100", env = "logCollectorMilliCPU", help = "Log collector CPU in millicores")]
    log_collector_milli_cpu: i64,

    #[structopt(long, default_value = "100", env = "logCollectorMemInMB", help = "Log collector memory in MB")]
    log_collector_mem_mb: i64,

    #[structopt(
        long = "etcd-endpoints",
        env = "DLAAS_ETCD_ADDRESS",
        use_delimiter = true,
        help = "Coordination store endpoints, separated by ','"
    )]
    etcd_endpoints: Vec<String>,

    #[structopt(
        long = "etcd-prefix",
        default_value = "",
        env = "DLAAS_ETCD_PREFIX",
        help = "Prefix every job path is stored under"
    )]
    etcd_prefix: String,

    #[structopt(long = "etcd-username", default_value = "", env = "DLAAS_ETCD_USERNAME", help = "Coordination store user")]
    etcd_username: String,

    #[structopt(long = "etcd-password", default_value = "", env = "DLAAS_ETCD_PASSWORD", hide_env_values = true, help = "Coordination store password")]
    etcd_password: String,

    #[structopt(long = "etcd-cert-path", env = "DLAAS_ETCD_CERT_PATH", help = "CA certificate for the coordination store")]
    etcd_cert_path: Option<PathBuf>,

    #[structopt(
        long = "trainer-address",
        default_value = "http://ffdl-trainer:80",
        env = "DLAAS_TRAINER_ADDRESS",
        help = "The address of the trainer service"
    )]
    trainer_address: String,

    #[structopt(long = "env-name", default_value = "local", env = "DLAAS_ENV", help = "Environment name handed to job monitors")]
    env_name: String,

    #[structopt(long = "log-level", default_value = "info", env = "DLAAS_LOGLEVEL", help = "Log level")]
    log_level: String,

    #[structopt(
        long = "push-metrics",
        env = "DLAAS_PUSH_METRICS_ENABLED",
        parse(try_from_str),
        default_value = "true",
        help = "Whether job monitors push metrics"
    )]
    push_metrics: bool,

    #[structopt(long, default_value = "10", env = "LCM_STATUS_ATTEMPTS", help = "Attempts made to push a status update to the trainer")]
    status_attempts: u32,

    #[structopt(long, default_value = "5", env = "LCM_SNAPSHOT_ATTEMPTS", help = "Attempts made to read cluster capacity before giving up")]
    snapshot_attempts: u32,

    #[structopt(long, default_value = "30", env = "LCM_SNAPSHOT_INTERVAL_SECS", help = "Seconds between cluster capacity attempts")]
    snapshot_interval_secs: u64,
}
