//! Service reconciliation controller
//!
//! Watches `core/v1` Services and keeps a Cloud.dk load balancer in step with
//! every Service of type `LoadBalancer`.
//!
//! ## Lifecycle
//!
//! 1. A `LoadBalancer` Service gets the cleanup finalizer, then Ensure is
//!    called with its ports, annotations and the cluster's node addresses.
//!    The balancer's addresses are written to `status.loadBalancer.ingress`.
//! 2. When the Service is deleted, or its type changes away from
//!    `LoadBalancer`, Delete is called and the finalizer is removed.
//!
//! Kubernetes access sits behind [`ServiceClient`] and the engine behind
//! [`Balancers`] so the reconcile logic can be tested without a cluster.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, Service};
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use dkcloud_lb::types::AddressKind;
use dkcloud_lb::{
    BalancerIdentity, BalancerRequest, LoadBalancerController, LoadBalancerStatus, NodeAddress,
    PortBinding, PortProtocol,
};

/// Finalizer guarding the backing instance of a LoadBalancer Service
pub const FINALIZER: &str = "kubernetes.cloud.dk/load-balancer-cleanup";

/// Field manager used for patches
const FIELD_MANAGER: &str = "dkcloud-operator";

/// Periodic re-validation interval for healthy balancers
const REQUEUE_INTERVAL: Duration = Duration::from_secs(300);

/// Retry interval after a transient failure
const RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Retry interval after a failure that needs a change to the Service
const INVALID_RETRY_INTERVAL: Duration = Duration::from_secs(300);

const LOAD_BALANCER_TYPE: &str = "LoadBalancer";

/// Errors surfaced by the Service reconciler
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Kubernetes API failure
    #[error("kubernetes error: {0}")]
    Kube(String),

    /// Load-balancer engine failure
    #[error(transparent)]
    Engine(#[from] dkcloud_common::Error),

    /// Adding or removing the finalizer failed
    #[error("finalizer error: {0}")]
    Finalizer(String),
}

impl From<kube::Error> for ReconcileError {
    fn from(e: kube::Error) -> Self {
        ReconcileError::Kube(e.to_string())
    }
}

impl ReconcileError {
    /// Whether trying again later, without changes, may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            ReconcileError::Kube(_) | ReconcileError::Finalizer(_) => true,
            ReconcileError::Engine(e) => e.is_retryable(),
        }
    }
}

/// Kubernetes operations the reconciler needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServiceClient: Send + Sync {
    /// Addresses of every node in the cluster
    async fn node_addresses(&self) -> Result<Vec<NodeAddress>, ReconcileError>;

    /// Add the cleanup finalizer to a Service
    async fn add_finalizer(&self, namespace: &str, name: &str) -> Result<(), ReconcileError>;

    /// Remove the cleanup finalizer from a Service
    async fn remove_finalizer(&self, namespace: &str, name: &str) -> Result<(), ReconcileError>;

    /// Replace `status.loadBalancer.ingress`; an empty list clears it
    async fn patch_ingress(
        &self,
        namespace: &str,
        name: &str,
        ingress: &[String],
    ) -> Result<(), ReconcileError>;
}

/// Engine operations the reconciler needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Balancers: Send + Sync {
    /// Create or update the balancer
    async fn ensure(&self, request: &BalancerRequest)
        -> dkcloud_common::Result<LoadBalancerStatus>;

    /// Destroy the balancer
    async fn delete(&self, identity: &BalancerIdentity) -> dkcloud_common::Result<()>;
}

#[async_trait]
impl Balancers for LoadBalancerController {
    async fn ensure(
        &self,
        request: &BalancerRequest,
    ) -> dkcloud_common::Result<LoadBalancerStatus> {
        LoadBalancerController::ensure(self, request).await
    }

    async fn delete(&self, identity: &BalancerIdentity) -> dkcloud_common::Result<()> {
        LoadBalancerController::delete(self, identity).await
    }
}

/// Real Kubernetes client implementation
pub struct KubeServiceClient {
    client: Client,
}

impl KubeServiceClient {
    /// Wrap a Kubernetes client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn patch_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), ReconcileError> {
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        self.services(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| ReconcileError::Finalizer(format!("{namespace}/{name}: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl ServiceClient for KubeServiceClient {
    async fn node_addresses(&self) -> Result<Vec<NodeAddress>, ReconcileError> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let list = nodes.list(&ListParams::default()).await?;
        Ok(node_addresses_of(&list.items))
    }

    async fn add_finalizer(&self, namespace: &str, name: &str) -> Result<(), ReconcileError> {
        let service = self.services(namespace).get(name).await?;
        let mut finalizers = service.metadata.finalizers.unwrap_or_default();
        if finalizers.iter().any(|f| f == FINALIZER) {
            return Ok(());
        }
        finalizers.push(FINALIZER.to_string());
        self.patch_finalizers(namespace, name, finalizers).await
    }

    async fn remove_finalizer(&self, namespace: &str, name: &str) -> Result<(), ReconcileError> {
        let service = self.services(namespace).get(name).await?;
        let finalizers: Vec<String> = service
            .metadata
            .finalizers
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != FINALIZER)
            .collect();
        self.patch_finalizers(namespace, name, finalizers).await
    }

    async fn patch_ingress(
        &self,
        namespace: &str,
        name: &str,
        ingress: &[String],
    ) -> Result<(), ReconcileError> {
        let entries: Vec<serde_json::Value> = ingress
            .iter()
            .map(|ip| serde_json::json!({ "ip": ip }))
            .collect();
        let patch = serde_json::json!({
            "status": {
                "loadBalancer": {
                    "ingress": entries
                }
            }
        });
        self.services(namespace)
            .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Flatten node status addresses
pub fn node_addresses_of(nodes: &[Node]) -> Vec<NodeAddress> {
    nodes
        .iter()
        .filter_map(|node| node.status.as_ref()?.addresses.as_ref())
        .flatten()
        .map(|a| NodeAddress {
            kind: AddressKind::parse(&a.type_),
            address: a.address.clone(),
        })
        .collect()
}

/// Shared controller state
pub struct Context {
    /// Kubernetes access
    pub kube: Arc<dyn ServiceClient>,
    /// Load-balancer engine
    pub balancers: Arc<dyn Balancers>,
    /// Cluster name mixed into balancer hostnames
    pub cluster_name: String,
}

impl Context {
    /// Assemble a context
    pub fn new(
        kube: Arc<dyn ServiceClient>,
        balancers: Arc<dyn Balancers>,
        cluster_name: impl Into<String>,
    ) -> Self {
        Self {
            kube,
            balancers,
            cluster_name: cluster_name.into(),
        }
    }
}

/// Whether a Service asks for a load balancer
pub fn is_load_balancer(service: &Service) -> bool {
    service
        .spec
        .as_ref()
        .and_then(|s| s.type_.as_deref())
        .is_some_and(|t| t == LOAD_BALANCER_TYPE)
}

fn has_finalizer(service: &Service) -> bool {
    service.finalizers().iter().any(|f| f == FINALIZER)
}

fn identity_of(service: &Service, cluster_name: &str) -> Result<BalancerIdentity, ReconcileError> {
    let uid = service
        .uid()
        .ok_or_else(|| ReconcileError::Kube(format!("service {} has no uid", service.name_any())))?;
    Ok(BalancerIdentity::from_uid(cluster_name, &uid))
}

/// Port bindings of a Service, or `None` while a node port is still unallocated
fn ports_of(service: &Service, hostname: &str) -> Result<Option<Vec<PortBinding>>, ReconcileError> {
    let ports = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .map(Vec::as_slice)
        .unwrap_or_default();

    let mut bindings = Vec::with_capacity(ports.len());
    for port in ports {
        let Some(node_port) = port.node_port else {
            return Ok(None);
        };
        let protocol = PortProtocol::from_kubernetes(port.protocol.as_deref()).ok_or_else(|| {
            dkcloud_common::Error::validation_for(
                hostname,
                format!("unsupported protocol {:?}", port.protocol),
            )
        })?;
        let (Ok(listen_port), Ok(target_port)) = (u16::try_from(port.port), u16::try_from(node_port))
        else {
            return Err(dkcloud_common::Error::validation_for(
                hostname,
                format!("port {} -> {} is out of range", port.port, node_port),
            )
            .into());
        };
        bindings.push(PortBinding {
            listen_port,
            target_port,
            protocol,
        });
    }
    Ok(Some(bindings))
}

fn current_ingress(service: &Service) -> Vec<String> {
    service
        .status
        .as_ref()
        .and_then(|s| s.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .map(|ingress| ingress.iter().filter_map(|i| i.ip.clone()).collect())
        .unwrap_or_default()
}

/// Reconcile a Service
#[instrument(skip(service, ctx), fields(service = %service.name_any()))]
pub async fn reconcile(service: Arc<Service>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let name = service.name_any();
    let namespace = service.namespace().unwrap_or_default();
    let deleting = service.metadata.deletion_timestamp.is_some();
    let wants_balancer = is_load_balancer(&service);

    if deleting || !wants_balancer {
        if !has_finalizer(&service) {
            debug!("No load balancer to manage");
            return Ok(Action::await_change());
        }
        return cleanup(&service, &ctx, &namespace, &name, deleting).await;
    }

    let identity = identity_of(&service, &ctx.cluster_name)?;
    let hostname = identity.hostname();

    if !has_finalizer(&service) {
        info!("Adding cleanup finalizer");
        ctx.kube.add_finalizer(&namespace, &name).await?;
    }

    let Some(ports) = ports_of(&service, &hostname)? else {
        info!("Waiting for node ports to be allocated");
        return Ok(Action::requeue(RETRY_INTERVAL));
    };

    let request = BalancerRequest {
        identity,
        annotations: service.annotations().clone(),
        ports,
        node_addresses: ctx.kube.node_addresses().await?,
    };

    info!(balancer = %hostname, ports = request.ports.len(), "Ensuring load balancer");
    let status = ctx.balancers.ensure(&request).await?;

    if current_ingress(&service) != status.ingress {
        info!(ingress = ?status.ingress, "Publishing load balancer addresses");
        ctx.kube
            .patch_ingress(&namespace, &name, &status.ingress)
            .await?;
    }

    Ok(Action::requeue(REQUEUE_INTERVAL))
}

async fn cleanup(
    service: &Service,
    ctx: &Context,
    namespace: &str,
    name: &str,
    deleting: bool,
) -> Result<Action, ReconcileError> {
    let identity = identity_of(service, &ctx.cluster_name)?;
    info!(balancer = %identity.hostname(), deleting, "Removing load balancer");
    ctx.balancers.delete(&identity).await?;

    if !deleting {
        ctx.kube.patch_ingress(namespace, name, &[]).await?;
    }
    ctx.kube.remove_finalizer(namespace, name).await?;
    Ok(Action::await_change())
}

/// Requeue policy after a failed reconcile
pub fn error_policy(service: Arc<Service>, error: &ReconcileError, _ctx: Arc<Context>) -> Action {
    if error.is_retryable() {
        warn!(?error, service = %service.name_any(), "Reconciliation failed, retrying");
        Action::requeue(RETRY_INTERVAL)
    } else {
        error!(?error, service = %service.name_any(), "Reconciliation failed, Service needs a change");
        Action::requeue(INVALID_RETRY_INTERVAL)
    }
}
