//! Object store buckets mounted through the s3fs flex volume driver.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{FlexVolumeSource, LocalObjectReference, Volume};

use super::store_var;
use crate::config::Config;
use crate::env::StoreRole;
use crate::job::JobDeploymentRequest;
use crate::naming;

/// The flex volume driver and the type of the secrets it reads credentials from.
pub const DRIVER: &str = "ibm/ibmc-s3fs";

const DEFAULT_REGION: &str = "us-standard";
const MAX_DISK_FREE_MB: u64 = 10000;

/// The bucket of a role. The results object ID may carry the training ID as a trailing path
/// segment; it is stripped since results are written below the bucket root.
pub fn bucket(request: &JobDeploymentRequest, role: StoreRole) -> String {
    let object = request.env(&store_var(role, "OBJECTID"));
    if role == StoreRole::Results {
        let suffix = format!("/{}", request.training_id);
        return object.strip_suffix(&suffix).unwrap_or(object).to_string();
    }
    object.to_string()
}

/// Cache size in GB and the disk space in MB the driver must leave free.
pub fn cache_sizing(config: &Config, request: &JobDeploymentRequest) -> (u64, u64) {
    let gpus = request.resources.gpus.max(0.0) as u64;
    let cache_gb = u64::from(config.volumes.cos_cache_gb_per_gpu) * gpus;
    let disk_free_mb = (cache_gb * 1024 / 3).min(MAX_DISK_FREE_MB);
    (cache_gb, disk_free_mb)
}

/// The flex volume of a mounted bucket. Training data is tuned for parallel reads and mounted
/// read-only; results are tuned for checkpoint and log writes.
pub fn volume(config: &Config, request: &JobDeploymentRequest, role: StoreRole, name: &str) -> Volume {
    let (cache_gb, disk_free_mb) = cache_sizing(config, request);
    let region = match request.env(&store_var(role, "REGION")) {
        "" => DEFAULT_REGION,
        r => r,
    };
    let (secret, parallel, kernel_cache, read_only) = match role {
        StoreRole::TrainingData => (naming::data_mount_secret(&request.name), "5", "true", true),
        _ => (naming::results_mount_secret(&request.name), "2", "false", false),
    };

    let options: BTreeMap<String, String> = vec![
        ("bucket", bucket(request, role)),
        ("endpoint", request.env(&store_var(role, "AUTHURL")).to_string()),
        ("region", region.to_string()),
        ("cache-size-gb", cache_gb.to_string()),
        ("chunk-size-mb", "52".to_string()),
        ("parallel-count", parallel.to_string()),
        ("ensure-disk-free", disk_free_mb.to_string()),
        ("tls-cipher-suite", "DEFAULT".to_string()),
        ("multireq-max", "20".to_string()),
        ("stat-cache-size", "100000".to_string()),
        ("kernel-cache", kernel_cache.to_string()),
        ("debug-level", "warn".to_string()),
        ("curl-debug", "false".to_string()),
        ("s3fs-fuse-retry-count", "30".to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();

    Volume {
        name: name.to_string(),
        flex_volume: Some(FlexVolumeSource {
            driver: DRIVER.to_string(),
            fs_type: None,
            options: Some(options),
            read_only: Some(read_only),
            secret_ref: Some(LocalObjectReference { name: Some(secret) }),
        }),
        ..Default::default()
    }
}
