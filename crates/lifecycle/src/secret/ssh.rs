//! The SSH keypair learners of MPI-style jobs log into each other with.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Secret, SecretVolumeSource, Volume, VolumeMount};
use rsa::pkcs1::{EncodeRsaPrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use ssh_key::public::KeyData;
use tracing::debug;

use super::string_secret;
use crate::config::Config;
use crate::job::JobDeploymentRequest;
use crate::naming;
use crate::{Error, Result};

const KEY_BITS: usize = 2048;
const SECRET_TYPE: &str = "generic";
/// Where learners find the keypair.
pub const MOUNT_PATH: &str = "/etc/ssh-certs";
const KEY_FILE_MODE: i32 = 0o400;

/// Whether a job's learners need a shared keypair: tensorflow builds for horovod or ddl.
pub fn needs_keypair(request: &JobDeploymentRequest) -> bool {
    request.framework.eq_ignore_ascii_case("tensorflow")
        && (request.version.ends_with("horovod") || request.version.ends_with("ddl"))
}

/// Generates the job's SSH secret when the job needs one. Key generation runs on the blocking
/// thread pool.
pub async fn generate(config: &Config, request: &JobDeploymentRequest) -> Result<Option<Secret>> {
    if !needs_keypair(request) {
        return Ok(None);
    }
    debug!(training_id = %request.training_id, "Generating ssh keypair");
    let data = tokio::task::spawn_blocking(keypair)
        .await
        .map_err(|e| Error::KeyGeneration(e.to_string()))??;
    Ok(Some(string_secret(
        config,
        request,
        naming::ssh_secret(&request.name),
        SECRET_TYPE,
        data,
    )))
}

/// A fresh RSA keypair as secret data: the PKCS#1 PEM and the `authorized_keys` line.
fn keypair() -> Result<BTreeMap<String, String>> {
    let key = RsaPrivateKey::new(&mut rand::thread_rng(), KEY_BITS)
        .map_err(|e| Error::KeyGeneration(e.to_string()))?;
    let private = key
        .to_pkcs1_pem(LineEnding::LF)
        .map_err(|e| Error::KeyGeneration(e.to_string()))?;

    let mut data = BTreeMap::new();
    data.insert("ssh-privatekey".to_string(), private.to_string());
    data.insert("ssh-publickey".to_string(), authorized_key(&key)?);
    Ok(data)
}

/// The public half in the `authorized_keys` format.
fn authorized_key(key: &RsaPrivateKey) -> Result<String> {
    let public = ssh_key::public::RsaPublicKey::try_from(key.to_public_key())
        .map_err(|e| Error::KeyGeneration(e.to_string()))?;
    let line = ssh_key::PublicKey::new(KeyData::Rsa(public), "")
        .to_openssh()
        .map_err(|e| Error::KeyGeneration(e.to_string()))?;
    Ok(format!("{}\n", line.trim_end()))
}

/// The volume projecting the keypair into learners.
pub fn volume(job_name: &str) -> Volume {
    Volume {
        name: naming::ssh_volume(job_name),
        secret: Some(SecretVolumeSource {
            secret_name: Some(naming::ssh_secret(job_name)),
            default_mode: Some(KEY_FILE_MODE),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The learner's mount of [`volume`].
pub fn mount(job_name: &str) -> VolumeMount {
    VolumeMount {
        name: naming::ssh_volume(job_name),
        mount_path: MOUNT_PATH.to_string(),
        ..Default::default()
    }
}
