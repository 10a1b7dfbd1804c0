//! dkcloud operator - Kubernetes controller for Cloud.dk load balancers

#![deny(missing_docs)]

pub mod controller_runner;
pub mod service_controller;

pub use service_controller::{
    error_policy, reconcile, Balancers, Context, KubeServiceClient, ReconcileError,
    ServiceClient, FINALIZER,
};
