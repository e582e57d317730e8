//! Webhook endpoints registered against a job's events.
//!
//! Endpoints live in the coordination store under `<tid>/events/<type>/<endpoint id>`, with the
//! URL as the value.

use std::str::FromStr;

use tracing::{debug, info};

use crate::coord::Coordinator;
use crate::{Error, Result};

/// The events an endpoint can subscribe to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    /// Every event
    All,
    /// Status changes
    Status,
    /// Training metrics
    Metrics,
}

impl FromStr for EventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "all" => Ok(EventType::All),
            "status" => Ok(EventType::Status),
            "metrics" => Ok(EventType::Metrics),
            _ => Err(Error::InvalidEventType(s.to_string())),
        }
    }
}

impl AsRef<str> for EventType {
    fn as_ref(&self) -> &str {
        match self {
            EventType::All => "all",
            EventType::Status => "status",
            EventType::Metrics => "metrics",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

/// A registered endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    /// The caller-chosen endpoint ID
    pub id: String,
    /// Where events are delivered
    pub url: String,
}

fn type_path(training_id: &str, event_type: EventType) -> String {
    format!("{}/events/{}/", training_id, event_type)
}

fn endpoint_path(training_id: &str, event_type: EventType, endpoint_id: &str) -> String {
    format!("{}{}", type_path(training_id, event_type), endpoint_id)
}

/// Registers an endpoint. Registering the same ID twice fails with [`Error::EndpointExists`].
pub async fn create_endpoint(
    coordinator: &dyn Coordinator,
    training_id: &str,
    event_type: &str,
    endpoint_id: &str,
    url: &str,
) -> Result<()> {
    let event_type: EventType = event_type.parse()?;
    info!(training_id, %event_type, endpoint_id, "Registering event endpoint");
    let path = endpoint_path(training_id, event_type, endpoint_id);
    if !coordinator.put_if_key_missing(&path, url).await? {
        debug!(path = %path, "Endpoint already exists");
        return Err(Error::EndpointExists);
    }
    Ok(())
}

/// Removes an endpoint. Removing one that is not registered fails with
/// [`Error::EndpointNotFound`].
pub async fn delete_endpoint(
    coordinator: &dyn Coordinator,
    training_id: &str,
    event_type: &str,
    endpoint_id: &str,
) -> Result<()> {
    let event_type: EventType = event_type.parse()?;
    info!(training_id, %event_type, endpoint_id, "Deleting event endpoint");
    let path = endpoint_path(training_id, event_type, endpoint_id);
    if !coordinator.delete_key_if_exists(&path).await? {
        return Err(Error::EndpointNotFound);
    }
    Ok(())
}

/// The URL of one endpoint.
pub async fn get_endpoint(
    coordinator: &dyn Coordinator,
    training_id: &str,
    event_type: &str,
    endpoint_id: &str,
) -> Result<Endpoint> {
    let event_type: EventType = event_type.parse()?;
    let path = endpoint_path(training_id, event_type, endpoint_id);
    let entry = coordinator
        .get(&path, false)
        .await?
        .into_iter()
        .next()
        .ok_or(Error::EndpointNotFound)?;
    Ok(Endpoint {
        id: endpoint_id.to_string(),
        url: entry.value,
    })
}

/// Every endpoint registered for one event type. Entries without a URL are skipped.
pub async fn type_endpoints(
    coordinator: &dyn Coordinator,
    training_id: &str,
    event_type: &str,
) -> Result<Vec<Endpoint>> {
    let event_type: EventType = event_type.parse()?;
    let entries = coordinator
        .get(&type_path(training_id, event_type), true)
        .await?;
    Ok(entries
        .into_iter()
        .filter(|e| !e.value.is_empty())
        .map(|e| Endpoint {
            id: e.key.rsplit('/').next().unwrap_or_default().to_string(),
            url: e.value,
        })
        .collect())
}
