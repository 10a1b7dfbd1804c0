//! Node metadata served from the instance store.
//!
//! Cluster nodes are themselves Cloud.dk servers. These lookups answer the
//! questions a node controller asks: what are a node's addresses, which
//! server backs it, what size is it, where does it live, and does it still
//! exist.

use serde::Serialize;
use tracing::debug;

use dkcloud_common::{Error, Result, PROVIDER_ID_PREFIX};

use crate::store::{InstanceStore, SERVER_RESOURCE};
use crate::types::{BackingInstance, InstanceState, NodeAddress};

/// Failure domain and region of a node
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Zone {
    /// Failure domain (the location identifier)
    pub failure_domain: String,
    /// Region (also the location identifier)
    pub region: String,
}

/// Everything known about one node, for display
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct NodeInfo {
    /// Provider ID, including the `clouddk://` prefix
    pub provider_id: String,
    /// Package identifier
    pub instance_type: String,
    /// Addresses of the node
    pub addresses: Vec<NodeAddress>,
    /// Zone of the node
    pub zone: Zone,
}

/// Strip the `clouddk://` prefix from a provider ID
pub fn trim_provider_id(provider_id: &str) -> &str {
    provider_id
        .strip_prefix(PROVIDER_ID_PREFIX)
        .unwrap_or(provider_id)
}

/// Node metadata lookups
#[derive(Clone)]
pub struct NodeMetadata {
    store: InstanceStore,
}

impl NodeMetadata {
    /// Create lookups over the given store
    pub fn new(store: InstanceStore) -> Self {
        Self { store }
    }

    async fn by_hostname(&self, hostname: &str) -> Result<BackingInstance> {
        self.store
            .find_by_hostname(hostname)
            .await?
            .ok_or_else(|| Error::not_found(SERVER_RESOURCE, hostname))
    }

    async fn by_provider_id(&self, provider_id: &str) -> Result<BackingInstance> {
        self.store.find_by_id(trim_provider_id(provider_id)).await
    }

    /// Addresses of the node with this hostname
    pub async fn node_addresses(&self, hostname: &str) -> Result<Vec<NodeAddress>> {
        Ok(addresses_of(&self.by_hostname(hostname).await?))
    }

    /// Addresses of the node with this provider ID
    pub async fn node_addresses_by_provider_id(&self, provider_id: &str) -> Result<Vec<NodeAddress>> {
        Ok(addresses_of(&self.by_provider_id(provider_id).await?))
    }

    /// Store identifier of the node with this hostname
    pub async fn instance_id(&self, hostname: &str) -> Result<String> {
        Ok(self.by_hostname(hostname).await?.id)
    }

    /// Package identifier of the node with this hostname
    pub async fn instance_type(&self, hostname: &str) -> Result<String> {
        package_of(self.by_hostname(hostname).await?)
    }

    /// Package identifier of the node with this provider ID
    pub async fn instance_type_by_provider_id(&self, provider_id: &str) -> Result<String> {
        package_of(self.by_provider_id(provider_id).await?)
    }

    /// Zone of the node with this hostname
    pub async fn zone_by_hostname(&self, hostname: &str) -> Result<Zone> {
        zone_of(self.by_hostname(hostname).await?)
    }

    /// Zone of the node with this provider ID
    pub async fn zone_by_provider_id(&self, provider_id: &str) -> Result<Zone> {
        zone_of(self.by_provider_id(provider_id).await?)
    }

    /// Whether a server with this provider ID still exists
    pub async fn instance_exists_by_provider_id(&self, provider_id: &str) -> Result<bool> {
        match self.by_provider_id(provider_id).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Whether the server with this provider ID is shut down.
    ///
    /// A server that is not booted counts as shut down unless a job on it
    /// is still pending or running, since it may be starting.
    pub async fn instance_shutdown_by_provider_id(&self, provider_id: &str) -> Result<bool> {
        let instance = self.by_provider_id(provider_id).await?;
        let jobs = self.store.job_log(&instance.id).await?;
        if let Some(job) = jobs.iter().find(|job| job.is_active()) {
            debug!(id = %instance.id, action = %job.action, status = %job.status, "Server has an active job");
            return Ok(false);
        }
        Ok(instance.state != InstanceState::Ready)
    }

    /// All metadata for the node with this hostname
    pub async fn describe(&self, hostname: &str) -> Result<NodeInfo> {
        let instance = self.by_hostname(hostname).await?;
        Ok(NodeInfo {
            provider_id: format!("{PROVIDER_ID_PREFIX}{}", instance.id),
            addresses: addresses_of(&instance),
            instance_type: package_of(instance.clone())?,
            zone: zone_of(instance)?,
        })
    }
}

fn addresses_of(instance: &BackingInstance) -> Vec<NodeAddress> {
    instance
        .addresses()
        .into_iter()
        .map(NodeAddress::external)
        .collect()
}

fn package_of(instance: BackingInstance) -> Result<String> {
    instance
        .package_id
        .ok_or_else(|| Error::inconsistent_state(&instance.hostname, "server has no package"))
}

fn zone_of(instance: BackingInstance) -> Result<Zone> {
    match instance.location_id {
        Some(location) if !location.is_empty() => Ok(Zone {
            failure_domain: location.clone(),
            region: location,
        }),
        _ => Err(Error::inconsistent_state(
            &instance.hostname,
            "failed to determine the zone",
        )),
    }
}
