//! Controller runner - builds the Service controller future
//!
//! Returns a boxed future the binary drives to completion. Node changes
//! re-trigger every LoadBalancer Service so balancer backends follow cluster
//! membership. Only node additions, deletions and address changes count;
//! kubelet status heartbeats are filtered out before they reach the queue.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, Service};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::{self, Config as WatcherConfig, Event};
use kube::runtime::{Controller, WatchStreamExt};
use kube::{Api, Client, ResourceExt};

use dkcloud_lb::NodeAddress;

use crate::service_controller::{
    error_policy, is_load_balancer, node_addresses_of, reconcile, Context,
};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Last seen addresses per node
#[derive(Debug, Default)]
pub struct NodeAddressTracker {
    known: HashMap<String, Vec<NodeAddress>>,
}

impl NodeAddressTracker {
    /// Record a node and report whether it is new or its addresses changed
    pub fn observe(&mut self, node: &Node) -> bool {
        let addresses = node_addresses_of(std::slice::from_ref(node));
        match self.known.get(&node.name_any()) {
            Some(previous) if *previous == addresses => false,
            _ => {
                self.known.insert(node.name_any(), addresses);
                true
            }
        }
    }

    /// Drop a deleted node
    pub fn forget(&mut self, node: &Node) {
        self.known.remove(&node.name_any());
    }

    /// Whether a watch event can change any balancer's backends
    pub fn is_relevant(&mut self, event: &Event<Node>) -> bool {
        match event {
            Event::Apply(node) | Event::InitApply(node) => self.observe(node),
            Event::Delete(node) => {
                self.forget(node);
                true
            }
            Event::Init | Event::InitDone => false,
        }
    }
}

/// Node events that can change any balancer's backends
fn node_changes(
    nodes: Api<Node>,
) -> impl futures::Stream<Item = Result<Node, watcher::Error>> + Send + 'static {
    let mut tracker = NodeAddressTracker::default();
    watcher::watcher(nodes, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .default_backoff()
        .filter_map(move |event| {
            let change = match event {
                Ok(event) if tracker.is_relevant(&event) => match event {
                    Event::Apply(node) | Event::InitApply(node) | Event::Delete(node) => {
                        Some(Ok(node))
                    }
                    Event::Init | Event::InitDone => None,
                },
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            };
            std::future::ready(change)
        })
}

/// Build the Service controller future
pub fn build_service_controller(
    client: Client,
    ctx: Arc<Context>,
) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    let services: Api<Service> = Api::all(client.clone());
    let nodes: Api<Node> = Api::all(client);

    let controller = Controller::new(
        services,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    );
    let store = controller.store();

    tracing::info!("- Service controller");

    Box::pin(
        controller
            .watches_stream(node_changes(nodes), move |node: Node| {
                let affected: Vec<ObjectRef<Service>> = store
                    .state()
                    .iter()
                    .filter(|service| is_load_balancer(service))
                    .map(|service| ObjectRef::from_obj(service.as_ref()))
                    .collect();
                tracing::debug!(
                    node = %node.name_any(),
                    affected_count = affected.len(),
                    "Node membership changed, re-reconciling load balancers"
                );
                affected
            })
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("Service")),
    )
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{NodeAddress as K8sNodeAddress, NodeCondition, NodeStatus};
    use kube::api::ObjectMeta;

    fn node(name: &str, addresses: &[(&str, &str)]) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            status: Some(NodeStatus {
                addresses: Some(
                    addresses
                        .iter()
                        .map(|(kind, address)| K8sNodeAddress {
                            type_: kind.to_string(),
                            address: address.to_string(),
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Story: Kubelet heartbeats rewrite node status every few seconds. Only
    /// the first sighting and real address changes reach the balancers.
    #[test]
    fn story_heartbeats_do_not_retrigger_balancers() {
        let mut tracker = NodeAddressTracker::default();
        let worker = node("worker-1", &[("InternalIP", "10.0.0.5")]);

        assert!(tracker.is_relevant(&Event::InitApply(worker.clone())));

        let mut heartbeat = worker.clone();
        if let Some(status) = heartbeat.status.as_mut() {
            status.conditions = Some(vec![NodeCondition {
                type_: "Ready".to_string(),
                status: "True".to_string(),
                ..Default::default()
            }]);
        }
        assert!(!tracker.is_relevant(&Event::Apply(heartbeat)));

        let moved = node("worker-1", &[("InternalIP", "10.0.0.9")]);
        assert!(tracker.is_relevant(&Event::Apply(moved)));
    }

    #[test]
    fn new_and_deleted_nodes_are_relevant() {
        let mut tracker = NodeAddressTracker::default();
        let worker = node("worker-2", &[("InternalIP", "10.0.0.6")]);

        assert!(tracker.is_relevant(&Event::Apply(worker.clone())));
        assert!(tracker.is_relevant(&Event::Delete(worker.clone())));
        // A node that comes back after deletion is new again
        assert!(tracker.is_relevant(&Event::Apply(worker)));
    }

    #[test]
    fn relist_markers_are_ignored() {
        let mut tracker = NodeAddressTracker::default();
        assert!(!tracker.is_relevant(&Event::Init));
        assert!(!tracker.is_relevant(&Event::InitDone));
    }
}
