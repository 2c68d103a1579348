//! Per-node metadata published through the coordination directory.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ClusterId, NodeAddress};

/// What one hosted cluster looks like to the rest of the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInformation {
    /// Index of this cluster's container on its node. Wire messages address
    /// containers by this index.
    pub container_index: u32,
    /// Message types the cluster's processors consume.
    pub message_types: Vec<String>,
    /// Opaque routing-strategy metadata. The reconciler never interprets
    /// this; it is passed through to the strategy manager.
    #[serde(default)]
    pub strategy_data: Value,
}

/// The directory record a node publishes about itself.
///
/// Consumed by every peer's reconciler to rebuild the routing table. A node
/// with an empty cluster map is a pure message source and is skipped during
/// routing-table construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInformation {
    /// The publishing node's address.
    pub node_address: NodeAddress,
    /// Clusters hosted on the node, keyed by cluster id.
    pub clusters: BTreeMap<ClusterId, ClusterInformation>,
}

impl NodeInformation {
    /// Build the record for a node hosting the given clusters, assigning
    /// container indexes in iteration order.
    pub fn new(
        node_address: NodeAddress,
        clusters: impl IntoIterator<Item = (ClusterId, Vec<String>)>,
    ) -> Self {
        let clusters = clusters
            .into_iter()
            .enumerate()
            .map(|(i, (id, message_types))| {
                (
                    id,
                    ClusterInformation {
                        container_index: i as u32,
                        message_types,
                        strategy_data: Value::Null,
                    },
                )
            })
            .collect();
        Self {
            node_address,
            clusters,
        }
    }

    /// True when the node hosts no clusters and only injects messages.
    pub fn is_source_only(&self) -> bool {
        self.clusters.is_empty()
    }
}
