//! Credentials the s3fs driver mounts buckets with.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;

use super::string_secret;
use crate::config::Config;
use crate::env::StoreRole;
use crate::job::JobDeploymentRequest;
use crate::naming;
use crate::volume::{cos::DRIVER, store_var, StoreType};

/// One secret per bucket mounted through the s3fs driver.
pub fn secrets(config: &Config, request: &JobDeploymentRequest) -> Vec<Secret> {
    [StoreRole::TrainingData, StoreRole::Results]
        .iter()
        .filter(|role| StoreType::for_role(request, **role) == StoreType::MountCos)
        .map(|role| {
            let name = match role {
                StoreRole::TrainingData => naming::data_mount_secret(&request.name),
                _ => naming::results_mount_secret(&request.name),
            };
            let mut data = BTreeMap::new();
            data.insert(
                "access-key".to_string(),
                request.env(&store_var(*role, "USERNAME")).to_string(),
            );
            data.insert(
                "secret-key".to_string(),
                request.env(&store_var(*role, "APIKEY")).to_string(),
            );
            string_secret(config, request, name, DRIVER, data)
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    fn request(data_type: &str, result_type: &str) -> JobDeploymentRequest {
        JobDeploymentRequest {
            training_id: "training-1".into(),
            name: "job".into(),
            env_vars: vec![
                ("DATA_STORE_TYPE", data_type),
                ("DATA_STORE_USERNAME", "reader"),
                ("DATA_STORE_APIKEY", "read-key"),
                ("RESULT_STORE_TYPE", result_type),
                ("RESULT_STORE_USERNAME", "writer"),
                ("RESULT_STORE_APIKEY", "write-key"),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn one_secret_per_mounted_bucket() {
        let secrets = secrets(&Config::default(), &request("mount_cos", "mount_cos"));
        assert_eq!(secrets.len(), 2);
        let data = &secrets[0];
        assert_eq!(data.metadata.name.as_deref(), Some("cossecretdata-job"));
        assert_eq!(data.type_.as_deref(), Some("ibm/ibmc-s3fs"));
        let string_data = data.string_data.as_ref().unwrap();
        assert_eq!(string_data["access-key"], "reader");
        assert_eq!(string_data["secret-key"], "read-key");
        assert_eq!(
            data.metadata.labels.as_ref().unwrap()["training_id"],
            "training-1"
        );
        assert_eq!(
            secrets[1].string_data.as_ref().unwrap()["secret-key"],
            "write-key"
        );
    }

    #[test]
    fn unmounted_and_host_stores_need_no_secret() {
        assert!(secrets(&Config::default(), &request("s3_datastore", "host_mount")).is_empty());
        let only_results = secrets(&Config::default(), &request("s3_datastore", "mount_cos"));
        assert_eq!(
            only_results[0].metadata.name.as_deref(),
            Some("cossecretresults-job")
        );
    }
}
