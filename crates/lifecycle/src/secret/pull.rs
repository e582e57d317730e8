//! Credentials for pulling the learner image.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use serde_json::json;

use super::string_secret;
use crate::config::Config;
use crate::job::JobDeploymentRequest;
use crate::naming;
use crate::{Error, Result};

const DOCKERCFG_TYPE: &str = "kubernetes.io/dockercfg";
const DEFAULT_EMAIL: &str = "none@none.com";
const TOKEN_USER: &str = "token";

/// The pull secret a learner pod references.
#[derive(Clone, Debug, PartialEq)]
pub enum PullSecret {
    /// A secret that exists already
    Existing(String),
    /// A secret that must be created for a custom image
    Custom(Box<Secret>),
}

impl PullSecret {
    /// Picks the configured pull secret for stock images and builds a dockercfg secret for a
    /// custom one. A custom image without an access token is rejected.
    pub fn resolve(config: &Config, request: &JobDeploymentRequest) -> Result<Self> {
        let location = match &request.image_location {
            Some(l) => l,
            None => {
                return Ok(PullSecret::Existing(
                    config.registry.image_pull_secret.clone(),
                ))
            }
        };
        if location.access_token.is_empty() {
            return Err(Error::MissingImageToken);
        }
        let email = if location.email.is_empty() {
            DEFAULT_EMAIL
        } else {
            location.email.as_str()
        };
        let auth = base64::encode(format!("{}:{}", TOKEN_USER, location.access_token));
        let dockercfg = json!({
            location.registry.as_str(): {
                "username": TOKEN_USER,
                "password": location.access_token,
                "email": email,
                "auth": auth,
            }
        });
        let mut data = BTreeMap::new();
        data.insert(".dockercfg".to_string(), serde_json::to_string(&dockercfg)?);
        Ok(PullSecret::Custom(Box::new(string_secret(
            config,
            request,
            naming::custom_image_secret(&request.name),
            DOCKERCFG_TYPE,
            data,
        ))))
    }

    /// The name pods refer to.
    pub fn name(&self) -> &str {
        match self {
            PullSecret::Existing(name) => name,
            PullSecret::Custom(secret) => secret.metadata.name.as_deref().unwrap_or_default(),
        }
    }

    /// The secret to create, if any.
    pub fn to_create(&self) -> Option<&Secret> {
        match self {
            PullSecret::Existing(_) => None,
            PullSecret::Custom(secret) => Some(secret),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::job::ImageLocation;

    fn request(location: Option<ImageLocation>) -> JobDeploymentRequest {
        JobDeploymentRequest {
            training_id: "training-1".into(),
            name: "job".into(),
            image_location: location,
            ..Default::default()
        }
    }

    #[test]
    fn stock_images_use_the_configured_secret() {
        let secret = PullSecret::resolve(&Config::default(), &request(None)).unwrap();
        assert_eq!(secret, PullSecret::Existing("regcred".into()));
        assert!(secret.to_create().is_none());
    }

    #[test]
    fn custom_image_without_token_is_rejected() {
        let location = ImageLocation {
            registry: "registry.example.com".into(),
            namespace: "team".into(),
            ..Default::default()
        };
        match PullSecret::resolve(&Config::default(), &request(Some(location))) {
            Err(e @ Error::MissingImageToken) => {
                assert_eq!(e.to_string(), "Custom image access token is missing")
            }
            other => panic!("expected MissingImageToken, got {:?}", other),
        }
    }

    #[test]
    fn custom_image_gets_a_dockercfg_secret() {
        let location = ImageLocation {
            registry: "registry.example.com".into(),
            namespace: "team".into(),
            access_token: "s3cret".into(),
            email: String::new(),
        };
        let secret = PullSecret::resolve(&Config::default(), &request(Some(location))).unwrap();
        assert_eq!(secret.name(), "customimage-job");
        let created = secret.to_create().unwrap();
        assert_eq!(created.type_.as_deref(), Some(DOCKERCFG_TYPE));
        let cfg: serde_json::Value =
            serde_json::from_str(&created.string_data.as_ref().unwrap()[".dockercfg"]).unwrap();
        let entry = &cfg["registry.example.com"];
        assert_eq!(entry["username"], "token");
        assert_eq!(entry["password"], "s3cret");
        assert_eq!(entry["email"], "none@none.com");
        assert_eq!(entry["auth"], base64::encode("token:s3cret"));
    }
}
