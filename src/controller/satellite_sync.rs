//! Satellite synchronization
//!
//! Pushes resource state to the satellites over per-node channels and
//! merges their acknowledgements into one structured result.

use super::core_objects::CoreObjects;
use crate::domain::api_rc::codes;
use crate::domain::{
    ApiCallRc, NodeFilter, NodeName, NodeResponse, RcEntry, Resource, ResourceDefinition,
    ResourceName, SatelliteMessage, SatelliteUpdater, Snapshot,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::{BoxStream, FuturesUnordered, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Satellite updater delivering messages over in-process channels
pub struct PeerSatelliteUpdater {
    core: Arc<CoreObjects>,
    peers: DashMap<NodeName, mpsc::Sender<SatelliteMessage>>,
    response_timeout: Duration,
}

impl PeerSatelliteUpdater {
    pub fn new(core: Arc<CoreObjects>, response_timeout: Duration) -> Self {
        Self {
            core,
            peers: DashMap::new(),
            response_timeout,
        }
    }

    /// Attach the channel of a satellite
    pub fn register_peer(&self, node: NodeName, sender: mpsc::Sender<SatelliteMessage>) {
        debug!(node = %node, "Registered satellite peer");
        self.peers.insert(node, sender);
    }

    pub fn unregister_peer(&self, node: &NodeName) -> bool {
        self.peers.remove(node).is_some()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    fn peer(&self, node: &NodeName) -> Option<mpsc::Sender<SatelliteMessage>> {
        self.peers.get(node).map(|entry| entry.value().clone())
    }

    /// Send the complete state assigned to `node`, completing its full
    /// sync handshake.
    pub async fn full_sync(&self, node: &NodeName) -> Result<ApiCallRc> {
        let (resources, snapshots) = {
            let dfns = self.core.read_rsc_dfns().await;
            let resources: Vec<Resource> = dfns
                .values()
                .filter_map(|dfn| dfn.resource(node).cloned())
                .collect();
            let snapshots: Vec<Snapshot> = dfns
                .values()
                .flat_map(|dfn| dfn.snapshots.values())
                .filter(|snap| &snap.node_name == node)
                .cloned()
                .collect();
            (resources, snapshots)
        };
        let peer = self.peer(node).ok_or_else(|| Error::SatelliteNotConnected {
            node: node.to_string(),
        })?;

        debug!(node = %node, resources = resources.len(), "Sending full sync");
        let (reply, rx) = oneshot::channel();
        let msg = SatelliteMessage::FullSync {
            resources,
            snapshots,
            reply,
        };
        send_and_wait(node, peer, msg, rx, self.response_timeout).await
    }
}

async fn send_and_wait(
    node: &NodeName,
    peer: mpsc::Sender<SatelliteMessage>,
    msg: SatelliteMessage,
    rx: oneshot::Receiver<ApiCallRc>,
    timeout: Duration,
) -> Result<ApiCallRc> {
    let not_connected = || Error::SatelliteNotConnected {
        node: node.to_string(),
    };
    peer.send(msg).await.map_err(|_| not_connected())?;
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(responses)) => Ok(responses),
        Ok(Err(_)) => Err(not_connected()),
        Err(_) => Err(Error::SatelliteTimeout {
            node: node.to_string(),
            timeout,
        }),
    }
}

async fn apply_on_peer(
    node: NodeName,
    peer: Option<mpsc::Sender<SatelliteMessage>>,
    resources: Vec<Resource>,
    snapshots: Vec<Snapshot>,
    timeout: Duration,
) -> NodeResponse {
    let result = match peer {
        Some(peer) => {
            let (reply, rx) = oneshot::channel();
            let msg = SatelliteMessage::ApplyResources {
                resources,
                snapshots,
                reply,
            };
            send_and_wait(&node, peer, msg, rx, timeout).await
        }
        None => Err(Error::SatelliteNotConnected {
            node: node.to_string(),
        }),
    };
    NodeResponse {
        node_name: node,
        result,
    }
}

#[async_trait]
impl SatelliteUpdater for PeerSatelliteUpdater {
    async fn update_satellites(
        &self,
        rsc_dfn: &ResourceDefinition,
        node_filter: NodeFilter,
    ) -> Result<BoxStream<'static, NodeResponse>> {
        let connected: HashSet<NodeName> = self
            .core
            .node_map
            .read()
            .await
            .values()
            .filter(|node| node.is_connected())
            .map(|node| node.name.clone())
            .collect();

        let mut pending = FuturesUnordered::new();
        for rsc in rsc_dfn.resources() {
            let node = rsc.node_name.clone();
            if !node_filter(&node) {
                continue;
            }
            let snapshots: Vec<Snapshot> = rsc_dfn
                .snapshots
                .values()
                .filter(|snap| snap.node_name == node)
                .cloned()
                .collect();
            let peer = if connected.contains(&node) {
                self.peer(&node)
            } else {
                None
            };
            pending.push(apply_on_peer(
                node,
                peer,
                vec![rsc.clone()],
                snapshots,
                self.response_timeout,
            ));
        }
        Ok(pending.boxed())
    }
}

fn format_template(template: &str, node: &NodeName, rsc_name: &ResourceName) -> String {
    template
        .replace("{0}", node.display_value())
        .replace("{1}", rsc_name.display_value())
}

/// Merge a per-node acknowledgement stream into one result.
///
/// Templates use `{0}` for the node and `{1}` for the resource name.
/// Nodes listed in `node_names` are reported with `listed_format`, all
/// others with `other_format`. Unreachable satellites become warnings.
pub async fn combine_responses(
    mut responses: BoxStream<'static, NodeResponse>,
    rsc_name: &ResourceName,
    node_names: &[NodeName],
    listed_format: &str,
    other_format: &str,
) -> ApiCallRc {
    let mut combined = ApiCallRc::new();
    while let Some(response) = responses.next().await {
        let node = response.node_name;
        match response.result {
            Ok(satellite_rc) => {
                combined.add_entries(satellite_rc);
                let format = if node_names.contains(&node) {
                    listed_format
                } else {
                    other_format
                };
                combined.add_entry(
                    RcEntry::new(
                        codes::MASK_RSC | codes::MODIFIED,
                        format_template(format, &node, rsc_name),
                    )
                    .with_obj_ref("Node", node.display_value())
                    .with_obj_ref("RscDfn", rsc_name.display_value()),
                );
            }
            Err(Error::SatelliteNotConnected { .. }) => {
                combined.add_entry(
                    RcEntry::new(
                        codes::WARN_NOT_CONNECTED,
                        format!("No connection to satellite '{}'", node),
                    )
                    .with_details(Some(format!(
                        "The changes for resource '{}' will be applied when the satellite reconnects",
                        rsc_name
                    )))
                    .with_obj_ref("Node", node.display_value()),
                );
            }
            Err(err) => {
                warn!(node = %node, rsc = %rsc_name, error = %err, "Satellite update failed");
                combined.add_entry(err.to_rc_entry().with_obj_ref("Node", node.display_value()));
            }
        }
    }
    combined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        all_nodes, ConnectionStatus, DeviceLayerKind, Node, ResourceFlags, ResourceGroupName,
    };
    use crate::persistence::MemoryDbEngine;

    fn name(s: &str) -> NodeName {
        NodeName::new(s).unwrap()
    }

    async fn setup() -> (Arc<CoreObjects>, ResourceDefinition) {
        let core = Arc::new(CoreObjects::new(Arc::new(MemoryDbEngine::new())));
        for node in ["alpha", "bravo"] {
            let mut n = Node::new(name(node));
            n.connection_status = ConnectionStatus::Connected;
            core.create_node(n).await.unwrap();
        }
        core.create_node(Node::new(name("charlie"))).await.unwrap();

        let rsc_name = ResourceName::new("r0").unwrap();
        let mut dfn = ResourceDefinition::new(rsc_name.clone(), ResourceGroupName::new("dflt").unwrap());
        for node in ["alpha", "bravo", "charlie"] {
            dfn.add_resource(Resource::new(
                rsc_name.clone(),
                name(node),
                vec![DeviceLayerKind::Drbd, DeviceLayerKind::Storage],
            ))
            .unwrap();
        }
        (core, dfn)
    }

    fn spawn_satellite(mut rx: mpsc::Receiver<SatelliteMessage>, answer: bool) {
        tokio::spawn(async move {
            let mut unanswered = Vec::new();
            while let Some(msg) = rx.recv().await {
                if let SatelliteMessage::ApplyResources { resources, reply, .. } = msg {
                    if answer {
                        let mut rc = ApiCallRc::new();
                        for rsc in resources {
                            let code = if rsc.flags.contains(ResourceFlags::DELETE) {
                                codes::DELETED
                            } else {
                                codes::MODIFIED
                            };
                            rc.add_entry(RcEntry::new(code, format!("applied {}", rsc.rsc_name)));
                        }
                        let _ = reply.send(rc);
                    } else {
                        unanswered.push(reply);
                    }
                }
            }
        });
    }

    #[tokio::test]
    async fn test_update_and_combine() {
        let (core, dfn) = setup().await;
        let updater = PeerSatelliteUpdater::new(core, Duration::from_secs(5));
        for node in ["alpha", "bravo"] {
            let (tx, rx) = mpsc::channel(8);
            updater.register_peer(name(node), tx);
            spawn_satellite(rx, true);
        }

        let stream = updater.update_satellites(&dfn, all_nodes()).await.unwrap();
        let rc = combine_responses(
            stream,
            &dfn.name,
            &[name("charlie")],
            "Resource {1} was evicted from {0}",
            "Notified {0} about evicting resource {1}",
        )
        .await;

        let messages: Vec<&str> = rc.iter().map(|e| e.message.as_str()).collect();
        assert!(messages.contains(&"Notified alpha about evicting resource r0"));
        assert!(messages.contains(&"Notified bravo about evicting resource r0"));
        assert!(rc
            .iter()
            .any(|e| e.return_code == codes::WARN_NOT_CONNECTED && e.message.contains("charlie")));
        assert!(!rc.has_errors());
    }

    #[tokio::test]
    async fn test_node_filter_and_timeout() {
        let (core, dfn) = setup().await;
        let updater = PeerSatelliteUpdater::new(core, Duration::from_millis(50));
        let (tx, rx) = mpsc::channel(8);
        updater.register_peer(name("alpha"), tx);
        spawn_satellite(rx, false);

        let only_alpha: NodeFilter = Arc::new(|node: &NodeName| node.value() == "ALPHA");
        let mut stream = updater.update_satellites(&dfn, only_alpha).await.unwrap();
        let response = stream.next().await.unwrap();
        assert_eq!(response.node_name, name("alpha"));
        assert!(matches!(response.result, Err(Error::SatelliteTimeout { .. })));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_full_sync_requires_peer() {
        let (core, _) = setup().await;
        let updater = PeerSatelliteUpdater::new(core, Duration::from_secs(1));
        assert!(matches!(
            updater.full_sync(&name("alpha")).await,
            Err(Error::SatelliteNotConnected { .. })
        ));
    }
}
