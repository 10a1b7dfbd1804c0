//! Cloud.dk server API
//!
//! The store is treated as a black box reached over HTTP/JSON. [`ServerApi`]
//! is the seam: production talks to it through [`HttpServerApi`], tests
//! through a mock or an in-memory fake. Errors at this level are raw
//! transport classifications; [`crate::store`] turns them into engine
//! errors.

mod http;

pub use http::HttpServerApi;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use dkcloud_common::retry::Transient;

use crate::types::{BackingInstance, InstanceState, NetworkInterface};

/// Raw outcome classification of a single API request
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApiError {
    /// HTTP 404
    #[error("not found")]
    NotFound,
    /// Any other non-success status
    #[error("HTTP {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body, possibly empty
        body: String,
    },
    /// The request never produced a response
    #[error("transport error: {0}")]
    Transport(String),
    /// The response body could not be decoded
    #[error("malformed response: {0}")]
    Decode(String),
}

impl Transient for ApiError {
    fn is_transient(&self) -> bool {
        match self {
            ApiError::Transport(_) => true,
            ApiError::Status { status, .. } => *status == 429 || *status >= 500,
            ApiError::NotFound | ApiError::Decode(_) => false,
        }
    }
}

/// Server operations the engine needs from the store
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServerApi: Send + Sync {
    /// List servers whose hostname matches `hostname` (the store may match loosely)
    async fn list_servers(&self, hostname: &str) -> Result<Vec<ServerBody>, ApiError>;

    /// Fetch one server by identifier
    async fn get_server(&self, id: &str) -> Result<ServerBody, ApiError>;

    /// Submit a create request
    async fn create_server(&self, body: &ServerCreateBody) -> Result<ServerBody, ApiError>;

    /// Delete a server by identifier
    async fn delete_server(&self, id: &str) -> Result<(), ApiError>;

    /// Job log of a server, newest first
    async fn list_server_logs(&self, id: &str) -> Result<Vec<LogBody>, ApiError>;
}

/// Create request payload
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ServerCreateBody {
    /// Hostname
    pub hostname: String,
    /// Display label (same as hostname)
    pub label: String,
    /// One-time root password
    pub initial_root_password: String,
    /// Package identifier
    pub package: String,
    /// OS template identifier
    pub template: String,
    /// Location identifier
    pub location: String,
}

/// Server as returned by the store
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServerBody {
    /// Store identifier
    pub identifier: String,
    /// Hostname
    pub hostname: String,
    /// Display label
    #[serde(default)]
    pub label: String,
    /// Whether the server has booted
    #[serde(default)]
    pub booted: bool,
    /// Network interfaces
    #[serde(default)]
    pub network_interfaces: Vec<NetworkInterfaceBody>,
    /// Package
    #[serde(default)]
    pub package: Option<ReferenceBody>,
    /// Location
    #[serde(default)]
    pub location: Option<ReferenceBody>,
}

/// Network interface as returned by the store
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct NetworkInterfaceBody {
    /// Assigned addresses
    #[serde(default)]
    pub ip_addresses: Vec<IpAddressBody>,
}

/// IP address as returned by the store
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct IpAddressBody {
    /// The address
    pub address: String,
}

/// One entry of a server's job log
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct LogBody {
    /// Job identifier
    #[serde(default)]
    pub id: u64,
    /// Job name, e.g. `start` or `reinstall`
    #[serde(default)]
    pub action: String,
    /// `pending`, `running`, `completed` or `failed`
    #[serde(default)]
    pub status: String,
}

impl LogBody {
    /// Whether the job is still queued or in progress
    pub fn is_active(&self) -> bool {
        matches!(self.status.as_str(), "pending" | "running")
    }
}

/// Reference to a package or location
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct ReferenceBody {
    /// Identifier
    pub identifier: String,
    /// Display name
    #[serde(default)]
    pub name: String,
}

impl From<ServerBody> for BackingInstance {
    fn from(body: ServerBody) -> Self {
        BackingInstance {
            id: body.identifier,
            hostname: body.hostname,
            state: if body.booted {
                InstanceState::Ready
            } else {
                InstanceState::Provisioning
            },
            network_interfaces: body
                .network_interfaces
                .into_iter()
                .map(|nic| NetworkInterface {
                    addresses: nic.ip_addresses.into_iter().map(|ip| ip.address).collect(),
                })
                .collect(),
            package_id: body.package.map(|p| p.identifier),
            location_id: body.location.map(|l| l.identifier),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ApiError::Transport("reset".into()).is_transient());
        assert!(ApiError::Status { status: 503, body: String::new() }.is_transient());
        assert!(ApiError::Status { status: 429, body: String::new() }.is_transient());
        assert!(!ApiError::Status { status: 422, body: String::new() }.is_transient());
        assert!(!ApiError::NotFound.is_transient());
        assert!(!ApiError::Decode("eof".into()).is_transient());
    }

    #[test]
    fn server_body_decodes_store_payload() {
        let json = r#"{
            "identifier": "a1b2c3",
            "hostname": "k8s-load-balancer-abc",
            "label": "k8s-load-balancer-abc",
            "booted": true,
            "cpus": 1,
            "network_interfaces": [
                {"identifier": "nic1", "ip_addresses": [{"address": "203.0.113.10", "network_mask": "255.255.255.0"}]}
            ],
            "package": {"identifier": "89833c1dfa7010", "name": "1 CPU"},
            "location": {"identifier": "dk1", "name": "Copenhagen"}
        }"#;
        let body: ServerBody = serde_json::from_str(json).unwrap();
        let instance = BackingInstance::from(body);

        assert_eq!(instance.id, "a1b2c3");
        assert_eq!(instance.state, InstanceState::Ready);
        assert_eq!(instance.addresses(), vec!["203.0.113.10"]);
        assert_eq!(instance.package_id.as_deref(), Some("89833c1dfa7010"));
        assert_eq!(instance.location_id.as_deref(), Some("dk1"));
    }

    #[test]
    fn server_body_tolerates_missing_optional_fields() {
        let body: ServerBody =
            serde_json::from_str(r#"{"identifier": "x", "hostname": "h"}"#).unwrap();
        let instance = BackingInstance::from(body);
        assert_eq!(instance.state, InstanceState::Provisioning);
        assert!(instance.network_interfaces.is_empty());
        assert!(instance.package_id.is_none());
    }

    #[test]
    fn create_body_uses_store_field_names() {
        let body = ServerCreateBody {
            hostname: "h".into(),
            label: "h".into(),
            initial_root_password: "p".into(),
            package: "89833c1dfa7010".into(),
            template: "ubuntu-18.04-x64".into(),
            location: "dk1".into(),
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["initial_root_password"], "p");
        assert_eq!(value["template"], "ubuntu-18.04-x64");
    }
}
