//! Volumes attached to a job's pods.
//!
//! Two independent decisions are made here. Each data role (training data, results) is either
//! mounted directly into the learner or left to a helper container, depending on its
//! `*_STORE_TYPE`. Separately, the volume shared between the learner and its helpers is either a
//! network claim, which allows them to run in separate pods, or a pod-local directory, which
//! forces them into one pod.

use k8s_openapi::api::core::v1::{
    HostPathVolumeSource, KeyToPath, SecretVolumeSource, Volume, VolumeMount,
};

use crate::config::Config;
use crate::env::{MountedStores, StoreRole, LCM_SECRET};
use crate::job::JobDeploymentRequest;
use crate::naming;

pub mod cos;
pub mod shared;
pub mod static_volumes;

pub use self::shared::SharedVolume;
pub use self::static_volumes::StaticVolume;

/// Where mounted training data appears in the learner.
pub const DATA_MOUNT_PATH: &str = "/mnt/data";
/// Where a mounted results bucket appears in the learner.
pub const RESULTS_MOUNT_PATH: &str = "/mnt/results";

/// The volume carrying the coordination store's client certificate.
pub const ETCD_CERT_VOLUME: &str = "etcd-ssl-cert";
/// Where the coordination store's client certificate is mounted.
pub const ETCD_CERT_MOUNT_PATH: &str = "/etc/certs/";

const HOST_MOUNT_ROOT: &str = "/cosdata";

/// How data of one role reaches the learner.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreType {
    /// A bucket mounted through the s3fs flex volume driver
    MountCos,
    /// A directory on the host
    HostMount,
    /// A store only reachable through its API; a helper container moves the data
    Api(String),
}

impl StoreType {
    /// Reads the type from a `*_STORE_TYPE` value.
    pub fn from_type(kind: &str) -> Self {
        match kind {
            "mount_cos" => StoreType::MountCos,
            "host_mount" => StoreType::HostMount,
            other => StoreType::Api(other.to_string()),
        }
    }

    /// The type of the store a role reads from or writes to.
    pub fn for_role(request: &JobDeploymentRequest, role: StoreRole) -> Self {
        Self::from_type(request.env(&store_var(role, "TYPE")))
    }

    /// Whether the learner sees the data through a volume of its own.
    pub fn is_mounted(&self) -> bool {
        matches!(self, StoreType::MountCos | StoreType::HostMount)
    }
}

pub(crate) fn store_var(role: StoreRole, field: &str) -> String {
    let prefix = match role {
        StoreRole::TrainingData => "DATA_STORE_",
        StoreRole::Model => "MODEL_STORE_",
        StoreRole::Results => "RESULT_STORE_",
    };
    format!("{}{}", prefix, field)
}

/// One volume together with the way the learner mounts it.
#[derive(Clone, Debug, PartialEq)]
pub struct VolumeAndMount {
    /// The pod volume
    pub volume: Volume,
    /// The learner's mount of it
    pub mount: VolumeMount,
}

/// The data volumes of the learner.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LearnerVolumes {
    /// The mounted training data, when the data store is mountable
    pub training_data: Option<VolumeAndMount>,
    /// The mounted results bucket, when the results store is mountable
    pub results: Option<VolumeAndMount>,
}

impl LearnerVolumes {
    /// Plans the data volumes for a job.
    pub fn plan(config: &Config, request: &JobDeploymentRequest) -> Self {
        LearnerVolumes {
            training_data: role_volume(config, request, StoreRole::TrainingData),
            results: role_volume(config, request, StoreRole::Results),
        }
    }

    /// Which roles are mounted in the learner.
    pub fn mounted(&self) -> MountedStores {
        MountedStores {
            training_data: self.training_data.is_some(),
            results: self.results.is_some(),
        }
    }

    /// The pod volumes, training data first.
    pub fn volumes(&self) -> Vec<Volume> {
        self.iter().map(|v| v.volume.clone()).collect()
    }

    /// The learner's mounts, training data first.
    pub fn mounts(&self) -> Vec<VolumeMount> {
        self.iter().map(|v| v.mount.clone()).collect()
    }

    fn iter(&self) -> impl Iterator<Item = &VolumeAndMount> {
        self.training_data.iter().chain(self.results.iter())
    }
}

fn role_volume(
    config: &Config,
    request: &JobDeploymentRequest,
    role: StoreRole,
) -> Option<VolumeAndMount> {
    let (name, mount_path) = match role {
        StoreRole::TrainingData => (naming::data_mount_volume(&request.name), DATA_MOUNT_PATH),
        _ => (naming::results_mount_volume(&request.name), RESULTS_MOUNT_PATH),
    };
    let volume = match StoreType::for_role(request, role) {
        StoreType::MountCos => cos::volume(config, request, role, &name),
        StoreType::HostMount => host_volume(request, role, &name),
        StoreType::Api(_) => return None,
    };
    Some(VolumeAndMount {
        volume,
        mount: VolumeMount {
            name,
            mount_path: mount_path.to_string(),
            ..Default::default()
        },
    })
}

fn host_volume(request: &JobDeploymentRequest, role: StoreRole, name: &str) -> Volume {
    let explicit = request.env(&store_var(role, "HOSTPATH"));
    let path = if explicit.is_empty() {
        crate::env::join(HOST_MOUNT_ROOT, &cos::bucket(request, role))
    } else {
        explicit.to_string()
    };
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource { path, type_: None }),
        ..Default::default()
    }
}

/// The coordination store's certificate, projected from the `lcm-secrets` secret.
pub fn etcd_cert_volume(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(LCM_SECRET.to_string()),
            items: Some(vec![KeyToPath {
                key: "DLAAS_ETCD_CERT".to_string(),
                path: "etcd/etcd.cert".to_string(),
                mode: None,
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The read-only mount of [`etcd_cert_volume`].
pub fn etcd_cert_mount(name: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: ETCD_CERT_MOUNT_PATH.to_string(),
        read_only: Some(true),
        ..Default::default()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::job::ResourceRequirements;

    fn request(vars: &[(&str, &str)]) -> JobDeploymentRequest {
        JobDeploymentRequest {
            training_id: "training-1".into(),
            name: "job".into(),
            resources: ResourceRequirements {
                gpus: 2.0,
                ..Default::default()
            },
            env_vars: vars
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn api_stores_get_no_volume() {
        let req = request(&[
            ("DATA_STORE_TYPE", "s3_datastore"),
            ("RESULT_STORE_TYPE", "s3_datastore"),
        ]);
        let volumes = LearnerVolumes::plan(&Config::default(), &req);
        assert_eq!(volumes, LearnerVolumes::default());
        assert_eq!(volumes.mounted(), MountedStores::default());
    }

    #[test]
    fn mounted_stores_get_a_volume_each() {
        let req = request(&[
            ("DATA_STORE_TYPE", "mount_cos"),
            ("DATA_STORE_OBJECTID", "mnist"),
            ("RESULT_STORE_TYPE", "host_mount"),
            ("RESULT_STORE_OBJECTID", "results/training-1"),
        ]);
        let volumes = LearnerVolumes::plan(&Config::default(), &req);
        let mounts = volumes.mounts();
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].name, "cosinputmount-job");
        assert_eq!(mounts[0].mount_path, "/mnt/data");
        assert_eq!(mounts[1].name, "cosoutputmount-job");
        assert_eq!(mounts[1].mount_path, "/mnt/results");

        let vols = volumes.volumes();
        assert!(vols[0].flex_volume.is_some());
        assert_eq!(
            vols[1].host_path.as_ref().map(|h| h.path.as_str()),
            Some("/cosdata/results")
        );
        assert!(volumes.mounted().training_data && volumes.mounted().results);
    }

    #[test]
    fn explicit_host_path_wins() {
        let req = request(&[
            ("DATA_STORE_TYPE", "host_mount"),
            ("DATA_STORE_HOSTPATH", "/nfs/datasets"),
        ]);
        let volumes = LearnerVolumes::plan(&Config::default(), &req);
        let volume = volumes.training_data.unwrap().volume;
        assert_eq!(volume.host_path.unwrap().path, "/nfs/datasets");
    }

    #[test]
    fn etcd_certificate_is_projected_read_only() {
        let volume = etcd_cert_volume(ETCD_CERT_VOLUME);
        let secret = volume.secret.unwrap();
        assert_eq!(secret.secret_name.as_deref(), Some("lcm-secrets"));
        assert_eq!(secret.items.unwrap()[0].path, "etcd/etcd.cert");
        assert_eq!(etcd_cert_mount(ETCD_CERT_VOLUME).read_only, Some(true));
    }
}
