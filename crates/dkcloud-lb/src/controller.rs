//! Load-balancer reconciliation engine
//!
//! Composes option resolution, naming, the instance store, provisioning and
//! rendering into the four operations the outer reconcile loop calls:
//! [`LoadBalancerController::exists`], [`LoadBalancerController::ensure`],
//! [`LoadBalancerController::update`] and [`LoadBalancerController::delete`].
//! Every operation is idempotent; the store is the system of record and
//! nothing is cached between calls.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{info, instrument, warn};

use dkcloud_common::events::{reasons, EngineEvent, EventSink};
use dkcloud_common::{Error, ProviderConfig, Result};

use crate::identity::BalancerIdentity;
use crate::options::{self, ConfigurationOptions};
use crate::provision::Provisioner;
use crate::render::render;
use crate::store::InstanceStore;
use crate::types::{
    BackingInstance, BalancerRequest, CapacityTier, LoadBalancerStatus, PortBinding, PortProtocol,
};

/// Desired state after validation
#[derive(Clone, Debug, PartialEq, Eq)]
struct DesiredState {
    options: ConfigurationOptions,
    ports: Vec<PortBinding>,
    backends: Vec<String>,
}

/// The reconciliation engine
#[derive(Clone)]
pub struct LoadBalancerController {
    store: InstanceStore,
    provisioner: Provisioner,
    events: Arc<dyn EventSink>,
    location: String,
}

impl LoadBalancerController {
    /// Assemble an engine from its collaborators
    pub fn new(
        store: InstanceStore,
        provisioner: Provisioner,
        events: Arc<dyn EventSink>,
        config: &ProviderConfig,
    ) -> Self {
        Self {
            store,
            provisioner,
            events,
            location: config.location().to_string(),
        }
    }

    /// Report the balancer's addresses, or `None` if it has no backing instance
    #[instrument(skip_all, fields(balancer = %identity.hostname()))]
    pub async fn exists(&self, identity: &BalancerIdentity) -> Result<Option<LoadBalancerStatus>> {
        let hostname = identity.hostname();
        match self.store.find_by_hostname(&hostname).await? {
            None => Ok(None),
            Some(instance) => status_of(&instance).map(Some),
        }
    }

    /// Make sure a backing instance exists and serves the desired state
    #[instrument(skip_all, fields(balancer = %request.identity.hostname()))]
    pub async fn ensure(&self, request: &BalancerRequest) -> Result<LoadBalancerStatus> {
        let hostname = request.identity.hostname();
        let desired = self.desired_state(&hostname, request)?;

        let instance = match self.store.find_by_hostname(&hostname).await? {
            Some(instance) => instance,
            None => self.create_and_provision(&hostname, &desired).await?,
        };

        self.apply(&instance, &desired).await?;
        status_of(&instance)
    }

    /// Push the desired state to an existing backing instance.
    ///
    /// Fails with `NotFound` if there is no instance. A failed reload leaves
    /// the new configuration on disk.
    #[instrument(skip_all, fields(balancer = %request.identity.hostname()))]
    pub async fn update(&self, request: &BalancerRequest) -> Result<()> {
        let hostname = request.identity.hostname();
        let desired = self.desired_state(&hostname, request)?;

        let instance = self
            .store
            .find_by_hostname(&hostname)
            .await?
            .ok_or_else(|| Error::not_found(crate::store::SERVER_RESOURCE, &hostname))?;

        self.apply(&instance, &desired).await
    }

    /// Destroy the backing instance; a missing instance counts as deleted
    #[instrument(skip_all, fields(balancer = %identity.hostname()))]
    pub async fn delete(&self, identity: &BalancerIdentity) -> Result<()> {
        let hostname = identity.hostname();
        let Some(instance) = self.store.find_by_hostname(&hostname).await? else {
            info!("No backing instance, nothing to delete");
            return Ok(());
        };

        self.store.destroy(&instance.id).await?;
        self.events.emit(EngineEvent::normal(
            &hostname,
            reasons::INSTANCE_DESTROYED,
            format!("Destroyed cloud server {}", instance.id),
        ));
        Ok(())
    }

    fn desired_state(&self, hostname: &str, request: &BalancerRequest) -> Result<DesiredState> {
        let resolved = options::resolve(&request.annotations).and_then(|options| {
            validate_ports(hostname, &request.ports)?;
            Ok(options)
        });
        let options = match resolved {
            Ok(options) => options,
            Err(e) => {
                self.events.emit(EngineEvent::warning(
                    hostname,
                    reasons::INVALID_OPTIONS,
                    e.to_string(),
                ));
                return Err(e);
            }
        };

        Ok(DesiredState {
            options,
            ports: request.ports.clone(),
            backends: request.backends(),
        })
    }

    async fn create_and_provision(
        &self,
        hostname: &str,
        desired: &DesiredState,
    ) -> Result<BackingInstance> {
        let tier = CapacityTier::for_connection_limit(desired.options.connection_limit);
        self.events.emit(EngineEvent::normal(
            hostname,
            reasons::INSTANCE_CREATING,
            format!(
                "Creating cloud server with package {} in {}",
                tier.package_id(),
                self.location
            ),
        ));

        let guard = match self.store.create(&self.location, tier, hostname).await {
            Ok(guard) => guard,
            Err(e) => {
                self.events.emit(EngineEvent::warning(
                    hostname,
                    reasons::PROVISIONING_FAILED,
                    e.to_string(),
                ));
                return Err(e);
            }
        };
        self.events.emit(EngineEvent::normal(
            hostname,
            reasons::INSTANCE_CREATED,
            format!("Created cloud server {}", guard.instance().id),
        ));

        let provisioned = async {
            self.provisioner
                .prepare_host(guard.instance(), guard.root_password())
                .await?;
            self.events.emit(EngineEvent::normal(
                hostname,
                reasons::HOST_PREPARED,
                "Operating system upgraded and configured",
            ));
            self.provisioner.install_balancer(guard.instance()).await?;
            self.events.emit(EngineEvent::normal(
                hostname,
                reasons::BALANCER_INSTALLED,
                "HAProxy installed",
            ));
            Ok::<(), Error>(())
        }
        .await;

        if let Err(e) = provisioned {
            self.events.emit(EngineEvent::warning(
                hostname,
                reasons::PROVISIONING_FAILED,
                e.to_string(),
            ));
            let id = guard.instance().id.clone();
            match guard.abort().await {
                Ok(()) => self.events.emit(EngineEvent::normal(
                    hostname,
                    reasons::INSTANCE_DESTROYED,
                    format!("Destroyed cloud server {id} after failed provisioning"),
                )),
                Err(destroy_err) => warn!(
                    id = %id,
                    error = %destroy_err,
                    "Failed to destroy partially provisioned instance"
                ),
            }
            return Err(e);
        }

        Ok(guard.commit())
    }

    async fn apply(&self, instance: &BackingInstance, desired: &DesiredState) -> Result<()> {
        if instance.network_interfaces.is_empty() || instance.primary_address().is_none() {
            return Err(Error::inconsistent_state(
                &instance.hostname,
                "cannot update a load balancer without IP addresses",
            ));
        }

        let config = render(&desired.options, &desired.ports, &desired.backends);
        match self.provisioner.apply_config(instance, &config).await {
            Ok(()) => {
                self.events.emit(EngineEvent::normal(
                    &instance.hostname,
                    reasons::CONFIG_APPLIED,
                    format!(
                        "Applied configuration for {} port(s) and {} backend(s)",
                        desired.ports.len(),
                        desired.backends.len()
                    ),
                ));
                Ok(())
            }
            Err(e) => {
                if matches!(e, Error::ReloadFailed { .. }) {
                    self.events.emit(EngineEvent::warning(
                        &instance.hostname,
                        reasons::RELOAD_FAILED,
                        e.to_string(),
                    ));
                }
                Err(e)
            }
        }
    }
}

fn validate_ports(hostname: &str, ports: &[PortBinding]) -> Result<()> {
    let mut seen = HashSet::new();
    for port in ports {
        if port.protocol != PortProtocol::Tcp {
            return Err(Error::validation_for(
                hostname,
                format!(
                    "port {} uses {}, only TCP can be load balanced",
                    port.listen_port, port.protocol
                ),
            ));
        }
        if !seen.insert(port.listen_port) {
            return Err(Error::validation_for(
                hostname,
                format!("port {} is exposed more than once", port.listen_port),
            ));
        }
    }
    Ok(())
}

fn status_of(instance: &BackingInstance) -> Result<LoadBalancerStatus> {
    let ingress = instance.addresses();
    if ingress.is_empty() {
        return Err(Error::inconsistent_state(
            &instance.hostname,
            "no IP addresses available for load balancer",
        ));
    }
    Ok(LoadBalancerStatus { ingress })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiError, IpAddressBody, MockServerApi, NetworkInterfaceBody, ServerBody};
    use crate::options::ANNO_CONNECTION_LIMIT;
    use crate::provision::{CommandOutput, MockShellConnector, MockShellSession, ShellSession};
    use dkcloud_common::events::RecordingEventSink;

    fn config() -> ProviderConfig {
        ProviderConfig::new("", "key", "cHJpdg==", "cHVi").unwrap()
    }

    fn identity() -> BalancerIdentity {
        BalancerIdentity::new("demo", "svc-123")
    }

    fn server(id: &str, hostname: &str, addresses: &[&str]) -> ServerBody {
        ServerBody {
            identifier: id.to_string(),
            hostname: hostname.to_string(),
            booted: true,
            network_interfaces: vec![NetworkInterfaceBody {
                ip_addresses: addresses
                    .iter()
                    .map(|a| IpAddressBody {
                        address: a.to_string(),
                    })
                    .collect(),
            }],
            ..Default::default()
        }
    }

    fn accepting_connector() -> MockShellConnector {
        let mut connector = MockShellConnector::new();
        connector.expect_connect().returning(|_, _, _| {
            let mut session = MockShellSession::new();
            session.expect_upload().returning(|_, _| Ok(()));
            session
                .expect_exec()
                .returning(|_| Ok(CommandOutput::default()));
            session.expect_close().returning(|| Ok(()));
            Ok(Box::new(session) as Box<dyn ShellSession>)
        });
        connector
    }

    fn engine(
        api: MockServerApi,
        connector: MockShellConnector,
    ) -> (LoadBalancerController, Arc<RecordingEventSink>) {
        let config = config();
        let events = Arc::new(RecordingEventSink::new());
        let engine = LoadBalancerController::new(
            InstanceStore::new(Arc::new(api), &config),
            Provisioner::new(Arc::new(connector), &config),
            events.clone(),
            &config,
        );
        (engine, events)
    }

    // ==========================================================================
    // Story Tests: Validation happens before any store traffic
    // ==========================================================================

    /// Story: A Service asks for 25000 connections. Ensure refuses before a
    /// single store request is made, and says why.
    #[tokio::test]
    async fn story_invalid_options_fail_before_touching_store() {
        // No expectations: any store or shell call panics
        let (engine, events) = engine(MockServerApi::new(), MockShellConnector::new());
        let request = BalancerRequest::new(identity())
            .with_port(PortBinding::tcp(80, 30080))
            .with_annotation(ANNO_CONNECTION_LIMIT, "25000");

        let err = engine.ensure(&request).await.unwrap_err();
        assert!(matches!(err, Error::InvalidOption { .. }));
        assert_eq!(events.reasons(), vec![reasons::INVALID_OPTIONS]);
    }

    /// Story: UDP ports cannot be served by a TCP proxy
    #[tokio::test]
    async fn story_udp_ports_are_rejected() {
        let (engine, _) = engine(MockServerApi::new(), MockShellConnector::new());
        let request = BalancerRequest::new(identity()).with_port(PortBinding {
            listen_port: 53,
            target_port: 30053,
            protocol: PortProtocol::Udp,
        });

        let err = engine.ensure(&request).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(!err.is_retryable());
    }

    // ==========================================================================
    // Story Tests: Existing instances
    // ==========================================================================

    /// Story: The balancer already exists; Ensure only re-delivers the config
    #[tokio::test]
    async fn story_ensure_on_existing_instance_only_updates() {
        let hostname = identity().hostname();
        let mut api = MockServerApi::new();
        api.expect_list_servers()
            .returning(move |h| Ok(vec![server("id-1", h, &["203.0.113.10"])]));
        api.expect_create_server().never();

        let (engine, events) = engine(api, accepting_connector());
        let request = BalancerRequest::new(identity())
            .with_port(PortBinding::tcp(80, 30080))
            .with_node("10.0.0.5");

        let status = engine.ensure(&request).await.unwrap();
        assert_eq!(status.ingress, vec!["203.0.113.10"]);
        assert_eq!(events.reasons(), vec![reasons::CONFIG_APPLIED]);
        assert_eq!(events.events()[0].balancer, hostname);
    }

    /// Story: Update on a missing balancer is a NotFound signal
    #[tokio::test]
    async fn story_update_missing_instance_is_not_found() {
        let mut api = MockServerApi::new();
        api.expect_list_servers().returning(|_| Ok(vec![]));
        let (engine, _) = engine(api, MockShellConnector::new());

        let err = engine
            .update(&BalancerRequest::new(identity()))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    /// Story: The store reports the instance without interfaces
    #[tokio::test]
    async fn story_instance_without_addresses_is_inconsistent() {
        let mut api = MockServerApi::new();
        api.expect_list_servers().returning(|h| {
            Ok(vec![ServerBody {
                identifier: "id-1".to_string(),
                hostname: h.to_string(),
                ..Default::default()
            }])
        });
        let (engine, _) = engine(api, MockShellConnector::new());

        let err = engine
            .update(&BalancerRequest::new(identity()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InconsistentState { .. }));

        let err = engine.exists(&identity()).await.unwrap_err();
        assert!(matches!(err, Error::InconsistentState { .. }));
    }

    /// Story: A reload failure is reported but the instance is left alone
    #[tokio::test]
    async fn story_reload_failure_is_reported() {
        let mut api = MockServerApi::new();
        api.expect_list_servers()
            .returning(|h| Ok(vec![server("id-1", h, &["203.0.113.10"])]));
        api.expect_delete_server().never();

        let mut connector = MockShellConnector::new();
        connector.expect_connect().returning(|_, _, _| {
            let mut session = MockShellSession::new();
            session.expect_upload().returning(|_, _| Ok(()));
            session.expect_exec().returning(|_| {
                Ok(CommandOutput {
                    exit_status: 1,
                    output: "[ALERT] parsing error".into(),
                })
            });
            session.expect_close().returning(|| Ok(()));
            Ok(Box::new(session) as Box<dyn ShellSession>)
        });

        let (engine, events) = engine(api, connector);
        let err = engine
            .update(&BalancerRequest::new(identity()).with_port(PortBinding::tcp(80, 30080)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReloadFailed { .. }));
        assert!(err.is_retryable());
        assert_eq!(events.reasons(), vec![reasons::RELOAD_FAILED]);
    }

    // ==========================================================================
    // Story Tests: Delete
    // ==========================================================================

    #[tokio::test]
    async fn delete_missing_instance_succeeds() {
        let mut api = MockServerApi::new();
        api.expect_list_servers().returning(|_| Ok(vec![]));
        api.expect_delete_server().never();
        let (engine, events) = engine(api, MockShellConnector::new());

        engine.delete(&identity()).await.unwrap();
        assert!(events.events().is_empty());
    }

    #[tokio::test]
    async fn delete_propagates_destroy_failure() {
        let mut api = MockServerApi::new();
        api.expect_list_servers()
            .returning(|h| Ok(vec![server("id-1", h, &["203.0.113.10"])]));
        api.expect_delete_server().times(1).returning(|_| {
            Err(ApiError::Status {
                status: 403,
                body: "forbidden".into(),
            })
        });
        let (engine, events) = engine(api, MockShellConnector::new());

        let err = engine.delete(&identity()).await.unwrap_err();
        assert!(matches!(err, Error::StoreRejected { status: 403, .. }));
        assert!(!events.saw(reasons::INSTANCE_DESTROYED));
    }
}
