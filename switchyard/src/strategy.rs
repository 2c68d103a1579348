//! Routing strategy contracts and the bundled key-hash strategy.
//!
//! A [`ClusterRouter`] answers one question: given a keyed message, which
//! container address in *its* downstream cluster should receive it — or
//! none, when no placement is currently available. The
//! [`RoutingStrategyManager`] rebuilds the full router set whenever the
//! reconciler observes a topology change.
//!
//! The bundled [`KeyHashStrategy`] spreads keys over a cluster's nodes with
//! a stable hash; deployments with stickier placement needs plug in their
//! own manager.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use switchyard_core::{ClusterId, ContainerAddress, KeyedMessage, NodeAddress, NodeInformation};

/// Per-downstream-cluster message placement.
pub trait ClusterRouter: Send + Sync {
    /// The downstream cluster this router places messages for.
    fn cluster_id(&self) -> &ClusterId;

    /// Choose the destination for `message`, or `None` when the cluster has
    /// no usable placement right now.
    fn select_destination(&self, message: &KeyedMessage) -> Option<ContainerAddress>;

    /// Every destination this router could currently choose.
    fn all_destinations(&self) -> Vec<ContainerAddress>;
}

/// Rebuilds the router table from live node information.
pub trait RoutingStrategyManager: Send + Sync {
    /// Map each message type to the routers of the clusters consuming it,
    /// in a stable cluster order.
    fn build_routers(
        &self,
        nodes: &[NodeInformation],
    ) -> HashMap<String, Vec<Arc<dyn ClusterRouter>>>;
}

/// Stable FNV-1a over the key bytes.
fn key_hash(key: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in key {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Hash-partitioned placement: `hash(key) % placements`.
pub struct KeyHashStrategy;

struct KeyHashRouter {
    cluster: ClusterId,
    /// Candidate containers sorted by node guid so every node computes the
    /// same placement for the same key.
    placements: Vec<(Arc<NodeAddress>, u32)>,
}

impl ClusterRouter for KeyHashRouter {
    fn cluster_id(&self) -> &ClusterId {
        &self.cluster
    }

    fn select_destination(&self, message: &KeyedMessage) -> Option<ContainerAddress> {
        if self.placements.is_empty() {
            return None;
        }
        let index = (key_hash(&message.key) % self.placements.len() as u64) as usize;
        let (node, container_index) = &self.placements[index];
        Some(ContainerAddress::single(Arc::clone(node), *container_index))
    }

    fn all_destinations(&self) -> Vec<ContainerAddress> {
        self.placements
            .iter()
            .map(|(node, index)| ContainerAddress::single(Arc::clone(node), *index))
            .collect()
    }
}

impl RoutingStrategyManager for KeyHashStrategy {
    fn build_routers(
        &self,
        nodes: &[NodeInformation],
    ) -> HashMap<String, Vec<Arc<dyn ClusterRouter>>> {
        // cluster id → (message types, placements)
        let mut clusters: BTreeMap<ClusterId, (Vec<String>, Vec<(Arc<NodeAddress>, u32)>)> =
            BTreeMap::new();

        for info in nodes {
            let node = Arc::new(info.node_address.clone());
            for (cluster_id, cluster_info) in &info.clusters {
                let entry = clusters.entry(cluster_id.clone()).or_default();
                for message_type in &cluster_info.message_types {
                    if !entry.0.contains(message_type) {
                        entry.0.push(message_type.clone());
                    }
                }
                entry.1.push((Arc::clone(&node), cluster_info.container_index));
            }
        }

        let mut outbounds: HashMap<String, Vec<Arc<dyn ClusterRouter>>> = HashMap::new();
        for (cluster, (message_types, mut placements)) in clusters {
            placements.sort_by(|a, b| a.0.guid().cmp(b.0.guid()));
            let router: Arc<dyn ClusterRouter> = Arc::new(KeyHashRouter {
                cluster,
                placements,
            });
            for message_type in message_types {
                outbounds
                    .entry(message_type)
                    .or_default()
                    .push(Arc::clone(&router));
            }
        }
        outbounds
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    fn node_info(port: u16, clusters: Vec<(&str, Vec<&str>)>) -> NodeInformation {
        let addr = NodeAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port, "json", 1024, 1024);
        NodeInformation::new(
            addr,
            clusters.into_iter().map(|(c, mts)| {
                (
                    ClusterId::new("app", c),
                    mts.into_iter().map(String::from).collect::<Vec<_>>(),
                )
            }),
        )
    }

    #[test]
    fn test_key_hash_is_stable() {
        assert_eq!(key_hash(b"alpha"), key_hash(b"alpha"));
        assert_ne!(key_hash(b"alpha"), key_hash(b"beta"));
    }

    #[test]
    fn test_build_routers_groups_by_message_type() {
        let nodes = vec![
            node_info(4500, vec![("upper", vec!["word"])]),
            node_info(4501, vec![("lower", vec!["word"]), ("count", vec!["total"])]),
        ];
        let outbounds = KeyHashStrategy.build_routers(&nodes);

        // "word" feeds two clusters, in cluster order
        let word_routers = outbounds.get("word").expect("word routers");
        assert_eq!(word_routers.len(), 2);
        assert_eq!(word_routers[0].cluster_id().cluster(), "lower");
        assert_eq!(word_routers[1].cluster_id().cluster(), "upper");
        assert_eq!(outbounds.get("total").expect("total routers").len(), 1);
    }

    #[test]
    fn test_same_key_same_destination() {
        let nodes = vec![
            node_info(4500, vec![("c", vec!["t"])]),
            node_info(4501, vec![("c", vec!["t"])]),
        ];
        let outbounds = KeyHashStrategy.build_routers(&nodes);
        let router = &outbounds.get("t").expect("routers")[0];

        let message = KeyedMessage::new(b"stable-key".to_vec(), b"p".to_vec(), "t");
        let first = router
            .select_destination(&message)
            .expect("placement exists");
        for _ in 0..10 {
            let again = router
                .select_destination(&message)
                .expect("placement exists");
            assert_eq!(first, again);
        }
    }

    #[test]
    fn test_keys_spread_over_nodes() {
        let nodes = vec![
            node_info(4500, vec![("c", vec!["t"])]),
            node_info(4501, vec![("c", vec!["t"])]),
        ];
        let outbounds = KeyHashStrategy.build_routers(&nodes);
        let router = &outbounds.get("t").expect("routers")[0];

        let mut seen_nodes = std::collections::HashSet::new();
        for i in 0..64u32 {
            let message =
                KeyedMessage::new(i.to_be_bytes().to_vec(), b"p".to_vec(), "t");
            let dest = router
                .select_destination(&message)
                .expect("placement exists");
            seen_nodes.insert(dest.node.guid().to_string());
        }
        assert_eq!(seen_nodes.len(), 2, "both nodes should receive keys");
    }

    #[test]
    fn test_empty_cluster_has_no_destination() {
        let router = KeyHashRouter {
            cluster: ClusterId::new("app", "empty"),
            placements: Vec::new(),
        };
        let message = KeyedMessage::new(b"k".to_vec(), b"p".to_vec(), "t");
        assert!(router.select_destination(&message).is_none());
        assert!(router.all_destinations().is_empty());
    }

    #[test]
    fn test_all_destinations_lists_every_placement() {
        let nodes = vec![
            node_info(4500, vec![("c", vec!["t"])]),
            node_info(4501, vec![("c", vec!["t"])]),
            node_info(4502, vec![("c", vec!["t"])]),
        ];
        let outbounds = KeyHashStrategy.build_routers(&nodes);
        let router = &outbounds.get("t").expect("routers")[0];
        assert_eq!(router.all_destinations().len(), 3);
    }
}
