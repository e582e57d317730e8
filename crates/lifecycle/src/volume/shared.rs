//! The volume the learner and its helpers exchange files through.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    EmptyDirVolumeSource, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, ResourceRequirements, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use super::StaticVolume;
use crate::config::Config;
use crate::container::JOB_DIR;
use crate::job::JobDeploymentRequest;
use crate::naming;
use crate::sizing::to_bytes;

/// The name of the shared volume in every pod of a job.
pub const SHARED_VOLUME: &str = "jobdata";

const STORAGE_CLASS_ANNOTATION: &str = "volume.beta.kubernetes.io/storage-class";

const GI: i64 = 1024 * 1024 * 1024;
const TI: i64 = 1024 * GI;

/// Claim sizes the storage provider offers, smallest first.
pub const CLAIM_SIZES: [(i64, &str); 9] = [
    (20 * GI, "20Gi"),
    (40 * GI, "40Gi"),
    (80 * GI, "80Gi"),
    (100 * GI, "100Gi"),
    (250 * GI, "250Gi"),
    (500 * GI, "500Gi"),
    (TI, "1Ti"),
    (2 * TI, "2Ti"),
    (4 * TI, "4Ti"),
];

/// The smallest offered size that fits `bytes`, or the biggest one when nothing does.
pub fn claim_size(bytes: i64) -> (i64, &'static str) {
    CLAIM_SIZES
        .iter()
        .copied()
        .find(|(size, _)| *size >= bytes)
        .unwrap_or(CLAIM_SIZES[CLAIM_SIZES.len() - 1])
}

/// The shared volume size of a job in bytes: the requested storage, or the configured default
/// when none was requested.
pub fn storage_size(config: &Config, request: &JobDeploymentRequest) -> i64 {
    let r = &request.resources;
    if r.storage > 0.0 {
        to_bytes(r.storage, r.storage_unit)
    } else {
        config.volumes.default_volume_size
    }
}

/// Where the learner and helpers share files.
#[derive(Clone, Debug, PartialEq)]
pub enum SharedVolume {
    /// A pre-provisioned claim
    Static(String),
    /// A claim provisioned for this job
    Dynamic(PersistentVolumeClaim),
    /// A directory local to the pod
    Local,
}

impl SharedVolume {
    /// Picks the shared volume of a job. A static volume is preferred, then a dynamic claim when
    /// the job needs storage, and a pod-local directory otherwise.
    pub fn plan(
        config: &Config,
        request: &JobDeploymentRequest,
        static_volume: Option<StaticVolume>,
    ) -> Self {
        if let Some(v) = static_volume {
            return SharedVolume::Static(v.name);
        }
        let bytes = storage_size(config, request);
        if bytes > 0 {
            return SharedVolume::Dynamic(claim(config, request, bytes));
        }
        SharedVolume::Local
    }

    /// Whether the volume can be reached from more than one pod.
    pub fn is_network(&self) -> bool {
        !matches!(self, SharedVolume::Local)
    }

    /// The claim to create, for a dynamic volume.
    pub fn claim(&self) -> Option<&PersistentVolumeClaim> {
        match self {
            SharedVolume::Dynamic(pvc) => Some(pvc),
            _ => None,
        }
    }

    /// The pod volume.
    pub fn volume(&self) -> Volume {
        let claim_name = match self {
            SharedVolume::Static(name) => name.clone(),
            SharedVolume::Dynamic(pvc) => pvc.metadata.name.clone().unwrap_or_default(),
            SharedVolume::Local => {
                return Volume {
                    name: SHARED_VOLUME.to_string(),
                    empty_dir: Some(EmptyDirVolumeSource::default()),
                    ..Default::default()
                }
            }
        };
        Volume {
            name: SHARED_VOLUME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name,
                read_only: None,
            }),
            ..Default::default()
        }
    }

    /// The mount every container of the job uses, scoped to the training ID.
    pub fn mount(&self, training_id: &str) -> VolumeMount {
        VolumeMount {
            name: SHARED_VOLUME.to_string(),
            mount_path: JOB_DIR.to_string(),
            sub_path: Some(training_id.to_string()),
            ..Default::default()
        }
    }
}

fn claim(config: &Config, request: &JobDeploymentRequest, bytes: i64) -> PersistentVolumeClaim {
    let (size, label) = claim_size(bytes);
    tracing::debug!(
        training_id = %request.training_id,
        requested = bytes,
        size,
        "Sizing shared volume claim"
    );
    let annotations = config.volumes.storage_class.as_ref().map(|class| {
        let mut a = BTreeMap::new();
        a.insert(STORAGE_CLASS_ANNOTATION.to_string(), class.clone());
        a
    });
    let mut requests = BTreeMap::new();
    requests.insert("storage".to_string(), Quantity(label.to_string()));
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(naming::shared_volume_claim(&request.name)),
            namespace: Some(config.learner_namespace.clone()),
            labels: Some(request.training_labels()),
            annotations,
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteMany".to_string()]),
            resources: Some(ResourceRequirements {
                requests: Some(requests),
                limits: None,
            }),
            ..Default::default()
        }),
        status: None,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::job::ResourceRequirements as JobResources;
    use crate::sizing::SizeUnit;

    fn request(storage: f64, unit: SizeUnit) -> JobDeploymentRequest {
        JobDeploymentRequest {
            training_id: "training-1".into(),
            name: "job".into(),
            resources: JobResources {
                storage,
                storage_unit: unit,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn requested_storage(pvc: &PersistentVolumeClaim) -> String {
        pvc.spec.as_ref().unwrap().resources.as_ref().unwrap().requests.as_ref().unwrap()["storage"]
            .0
            .clone()
    }

    #[test]
    fn claim_sizes_round_up() {
        assert_eq!(claim_size(1).1, "20Gi");
        assert_eq!(claim_size(20 * GI).1, "20Gi");
        assert_eq!(claim_size(50 * GI).1, "80Gi");
        assert_eq!(claim_size(600 * GI).1, "1Ti");
        assert_eq!(claim_size(10 * TI).1, "4Ti");
    }

    #[test]
    fn requested_storage_gets_a_dynamic_claim() {
        let mut config = Config::default();
        config.volumes.storage_class = Some("ibmc-file-gold".into());
        let shared = SharedVolume::plan(&config, &request(50.0, SizeUnit::GiB), None);
        assert!(shared.is_network());
        let pvc = shared.claim().unwrap();
        assert_eq!(pvc.metadata.name.as_deref(), Some("learner-job-pvc"));
        assert_eq!(requested_storage(pvc), "80Gi");
        assert_eq!(
            pvc.metadata.annotations.as_ref().unwrap()[STORAGE_CLASS_ANNOTATION],
            "ibmc-file-gold"
        );
        assert_eq!(
            pvc.spec.as_ref().unwrap().access_modes,
            Some(vec!["ReadWriteMany".to_string()])
        );
        assert_eq!(
            shared.volume().persistent_volume_claim.unwrap().claim_name,
            "learner-job-pvc"
        );
    }

    #[test]
    fn static_volume_is_preferred() {
        let shared = SharedVolume::plan(
            &Config::default(),
            &request(50.0, SizeUnit::GiB),
            Some(StaticVolume {
                name: "static-pvc-1".into(),
                ..Default::default()
            }),
        );
        assert_eq!(shared, SharedVolume::Static("static-pvc-1".into()));
        assert!(shared.claim().is_none());
        assert!(shared.is_network());
    }

    #[test]
    fn no_storage_means_a_local_directory() {
        let shared = SharedVolume::plan(&Config::default(), &request(0.0, SizeUnit::MB), None);
        assert_eq!(shared, SharedVolume::Local);
        assert!(!shared.is_network());
        assert!(shared.volume().empty_dir.is_some());
        let mount = shared.mount("training-1");
        assert_eq!(mount.mount_path, "/job");
        assert_eq!(mount.sub_path.as_deref(), Some("training-1"));
    }

    #[test]
    fn default_volume_size_applies_without_a_request() {
        let mut config = Config::default();
        config.volumes.default_volume_size = 10 * GI;
        let shared = SharedVolume::plan(&config, &request(0.0, SizeUnit::MB), None);
        assert_eq!(requested_storage(shared.claim().unwrap()), "20Gi");
    }
}
