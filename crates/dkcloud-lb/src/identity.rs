//! Stable naming of backing instances.
//!
//! The hostname of a balancer's backing instance is the only link between a
//! Service and the server that serves it, so it must be a pure function of
//! the cluster name and the Service's UID.

use md5::{Digest, Md5};

/// Prefix of every backing-instance hostname
pub const HOSTNAME_PREFIX: &str = "k8s-load-balancer-";

const MAX_NAME_LEN: usize = 32;

/// Who a balancer belongs to
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BalancerIdentity {
    cluster_name: String,
    name: String,
}

impl BalancerIdentity {
    /// Identity for a balancer named directly
    pub fn new(cluster_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            name: name.into(),
        }
    }

    /// Identity derived from a resource UID: dashes removed, at most 32 characters
    pub fn from_uid(cluster_name: impl Into<String>, uid: &str) -> Self {
        let name: String = uid.chars().filter(|c| *c != '-').take(MAX_NAME_LEN).collect();
        Self::new(cluster_name, name)
    }

    /// Cluster the balancer lives in
    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    /// Balancer name within the cluster
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hostname of the backing instance
    pub fn hostname(&self) -> String {
        derive_hostname(&self.cluster_name, &self.name)
    }
}

/// `k8s-load-balancer-` followed by the hex MD5 of cluster name and balancer name
pub fn derive_hostname(cluster_name: &str, name: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(cluster_name.as_bytes());
    hasher.update(name.as_bytes());
    format!("{HOSTNAME_PREFIX}{:x}", hasher.finalize())
}
