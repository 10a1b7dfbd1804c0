//! Load balancers for Kubernetes Services, backed by Cloud.dk servers
//! running HAProxy.
//!
//! The entry point is [`LoadBalancerController`], which reconciles a
//! [`BalancerRequest`] against the remote instance store:
//!
//! - [`options`] resolves Service annotations into typed policy
//! - [`identity`] derives the backing instance's hostname
//! - [`store`] finds, creates and destroys backing instances
//! - [`provision`] reaches instances over SSH/SFTP
//! - [`render`] produces the HAProxy configuration
//! - [`instances`] serves node metadata from the same store

#![deny(missing_docs)]

pub mod api;
pub mod controller;
pub mod identity;
pub mod instances;
pub mod options;
pub mod provision;
pub mod render;
pub mod store;
pub mod types;

pub use controller::LoadBalancerController;
pub use identity::BalancerIdentity;
pub use options::ConfigurationOptions;
pub use types::{BalancerRequest, LoadBalancerStatus, NodeAddress, PortBinding, PortProtocol};
