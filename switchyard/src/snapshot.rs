//! The immutable routing snapshot and its diff/rebuild operations.
//!
//! A snapshot is the whole routing world at a point in time: the router
//! table per message type, plus one live [`Sender`] per known remote node.
//! Snapshots are never mutated; the reconciler computes a successor with
//! [`RoutingSnapshot::apply`] and swaps it in atomically. Senders for
//! unchanged nodes carry over *by identity*, so an in-flight connection
//! never churns because an unrelated node joined.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use switchyard_core::{ContainerAddress, KeyedMessage, NodeAddress, NodeInformation};
use switchyard_transport::{Sender, SenderError, SenderPool};

use crate::strategy::{ClusterRouter, RoutingStrategyManager};

/// Diff between the directory's node set and the current snapshot.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SnapshotUpdate {
    /// Guids present in the directory but not the snapshot.
    pub added: BTreeSet<String>,
    /// Guids present in the snapshot but gone from the directory.
    pub removed: BTreeSet<String>,
    /// Guids present in both whose published information differs.
    pub changed: BTreeSet<String>,
}

impl SnapshotUpdate {
    /// True when applying this update would change anything.
    pub fn is_change(&self) -> bool {
        !(self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty())
    }
}

/// Immutable routing state: routers by message type plus live senders.
pub struct RoutingSnapshot {
    outbounds_by_message_type: HashMap<String, Vec<Arc<dyn ClusterRouter>>>,
    senders: HashMap<String, Arc<Sender>>,
    nodes: BTreeMap<String, NodeInformation>,
}

impl RoutingSnapshot {
    /// A snapshot that routes nothing. Installed at startup so dispatchers
    /// have something to read before the first reconcile pass lands.
    pub fn empty() -> Self {
        Self {
            outbounds_by_message_type: HashMap::new(),
            senders: HashMap::new(),
            nodes: BTreeMap::new(),
        }
    }

    /// Routers for one message type, in stable cluster order.
    pub fn routers_for(&self, message_type: &str) -> Option<&[Arc<dyn ClusterRouter>]> {
        self.outbounds_by_message_type
            .get(message_type)
            .map(Vec::as_slice)
    }

    /// The live sender for a remote node, if the snapshot knows it.
    pub fn sender_for(&self, node: &NodeAddress) -> Option<Arc<Sender>> {
        self.senders.get(node.guid()).map(Arc::clone)
    }

    /// The node set this snapshot was built from, keyed by guid.
    pub fn nodes(&self) -> &BTreeMap<String, NodeInformation> {
        &self.nodes
    }

    /// Whether some router for `cluster` would accept `message` right now.
    pub fn can_reach(&self, cluster: &str, message: &KeyedMessage) -> bool {
        message.message_types.iter().any(|mt| {
            self.routers_for(mt)
                .map(|routers| {
                    routers.iter().any(|r| {
                        r.cluster_id().cluster() == cluster
                            && r.select_destination(message).is_some()
                    })
                })
                .unwrap_or(false)
        })
    }

    /// Every destination currently reachable in `cluster`.
    pub fn all_reachable(&self, cluster: &str) -> Vec<ContainerAddress> {
        let mut seen = BTreeSet::new();
        let mut destinations = Vec::new();
        for routers in self.outbounds_by_message_type.values() {
            for router in routers {
                if router.cluster_id().cluster() != cluster {
                    continue;
                }
                for destination in router.all_destinations() {
                    let key = (destination.node.guid().to_string(), destination.clusters.clone());
                    if seen.insert(key) {
                        destinations.push(destination);
                    }
                }
            }
        }
        destinations
    }

    /// Diff the deduplicated directory view against this snapshot.
    pub fn update(&self, seen: &[NodeInformation]) -> SnapshotUpdate {
        let mut update = SnapshotUpdate::default();

        for info in seen {
            let guid = info.node_address.guid();
            match self.nodes.get(guid) {
                None => {
                    update.added.insert(guid.to_string());
                }
                Some(current) if current != info => {
                    update.changed.insert(guid.to_string());
                }
                Some(_) => {}
            }
        }
        for guid in self.nodes.keys() {
            if !seen
                .iter()
                .any(|info| info.node_address.guid() == guid.as_str())
            {
                update.removed.insert(guid.clone());
            }
        }
        update
    }

    /// Build the successor snapshot.
    ///
    /// Senders for surviving nodes are carried over by identity; senders
    /// are opened for added nodes and stopped for removed ones; the router
    /// table is rebuilt from `seen`. The local node never gets a sender —
    /// loopback delivery bypasses the wire.
    ///
    /// # Errors
    ///
    /// Propagates [`SenderError`] so the caller can restore the previous
    /// snapshot; partial sender churn is safe because opening is
    /// get-or-create and stops are processed before this returns.
    pub async fn apply(
        &self,
        update: &SnapshotUpdate,
        seen: &[NodeInformation],
        this_node: &NodeAddress,
        pool: &SenderPool,
        strategy: &dyn RoutingStrategyManager,
    ) -> Result<RoutingSnapshot, SenderError> {
        let mut senders = HashMap::new();
        for info in seen {
            let guid = info.node_address.guid();
            if guid == this_node.guid() {
                continue;
            }
            let sender = match self.senders.get(guid) {
                Some(existing) => Arc::clone(existing),
                None => pool.open(Arc::new(info.node_address.clone()))?,
            };
            senders.insert(guid.to_string(), sender);
        }

        for guid in &update.removed {
            if let Some(info) = self.nodes.get(guid) {
                pool.stop(&info.node_address).await;
            }
        }

        let outbounds_by_message_type = strategy.build_routers(seen);

        Ok(RoutingSnapshot {
            outbounds_by_message_type,
            senders,
            nodes: seen
                .iter()
                .map(|info| (info.node_address.guid().to_string(), info.clone()))
                .collect(),
        })
    }
}

impl std::fmt::Debug for RoutingSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingSnapshot")
            .field("message_types", &self.outbounds_by_message_type.len())
            .field("senders", &self.senders.len())
            .field("nodes", &self.nodes.len())
            .finish()
    }
}
