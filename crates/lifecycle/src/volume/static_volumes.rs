//! Pre-provisioned shared volume claims.

use std::path::Path;

use rand::seq::SliceRandom;
use serde::Deserialize;
use tracing::{debug, warn};

/// One pre-provisioned claim.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct StaticVolume {
    /// The claim name
    pub name: String,
    /// Free-form label
    #[serde(default)]
    pub label: String,
    /// Free-form status
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Default, Deserialize)]
struct StaticVolumeList {
    #[serde(rename = "static-volumes-v2", default)]
    volumes: Vec<StaticVolume>,
}

/// Parses the static volume list. Malformed documents yield an empty list.
pub fn parse(raw: &str) -> Vec<StaticVolume> {
    match serde_yaml::from_str::<StaticVolumeList>(raw) {
        Ok(list) => list.volumes,
        Err(e) => {
            warn!(error = %e, "Unable to parse static volume list");
            Vec::new()
        }
    }
}

/// Reads the static volume list and picks one entry at random. Any failure to read or parse
/// the file, or an empty list, means no static volume is available.
pub async fn pick(path: &Path) -> Option<StaticVolume> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Unable to load static volume list");
            return None;
        }
    };
    let picked = parse(&raw).choose(&mut rand::thread_rng()).cloned();
    debug!(volume = ?picked.as_ref().map(|v| &v.name), "Static volume for job");
    picked
}
