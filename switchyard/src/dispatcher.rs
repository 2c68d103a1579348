//! The outgoing dispatcher: application messages in, routed frames out.
//!
//! `dispatch` resolves destinations from the current routing snapshot,
//! coalesces co-hosted clusters into one network hop per node, and hands
//! each resulting [`RoutedMessage`] to a sender — or the local feedback
//! loop. Routing misses are not errors: the dispatcher drops, logs, and
//! counts. The one hard failure is dispatching before the routing table was
//! ever ready.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

use switchyard_core::{ContainerAddress, KeyedMessage, NodeAddress, RoutedMessage, StatsCollector};

use crate::node::NodeReceiver;
use crate::reconciler::SharedRoutingState;
use crate::snapshot::RoutingSnapshot;

/// Errors surfaced by [`OutgoingDispatcher::dispatch`].
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Dispatch was used before the routing table ever became ready.
    #[error("dispatch used before the routing table is ready")]
    NotReady,
}

/// Front door for application code sending keyed messages.
pub struct OutgoingDispatcher {
    state_rx: SharedRoutingState,
    running: Arc<AtomicBool>,
    ready: Arc<AtomicBool>,
    this_node: Arc<NodeAddress>,
    node_receiver: Arc<NodeReceiver>,
    stats: Arc<dyn StatsCollector>,
}

impl OutgoingDispatcher {
    /// Wire a dispatcher to a routing-state slot. Most callers get one from
    /// [`RoutingTableReconciler::dispatcher`](crate::RoutingTableReconciler::dispatcher).
    pub fn new(
        state_rx: watch::Receiver<Option<Arc<RoutingSnapshot>>>,
        running: Arc<AtomicBool>,
        ready: Arc<AtomicBool>,
        this_node: Arc<NodeAddress>,
        node_receiver: Arc<NodeReceiver>,
        stats: Arc<dyn StatsCollector>,
    ) -> Self {
        Self {
            state_rx,
            running,
            ready,
            this_node,
            node_receiver,
            stats,
        }
    }

    /// Route one message to every cluster consuming its types.
    ///
    /// Never retries and never fails on a routing miss; a message nothing
    /// accepted is counted against `message_not_sent`. May wait briefly
    /// while the reconciler swaps snapshots.
    ///
    /// # Errors
    ///
    /// [`DispatchError::NotReady`] when no routing snapshot was ever
    /// published.
    pub async fn dispatch(&self, message: KeyedMessage) -> Result<(), DispatchError> {
        let mut sent_somewhere = false;
        let result = self.route(message, &mut sent_somewhere).await;
        if !sent_somewhere {
            self.stats.message_not_sent();
        }
        result
    }

    async fn route(
        &self,
        message: KeyedMessage,
        sent_somewhere: &mut bool,
    ) -> Result<(), DispatchError> {
        let Some(snapshot) = self.current_snapshot().await? else {
            return Ok(()); // stopped
        };

        // For each message type, ask every consuming cluster's router for a
        // destination, folding co-hosted clusters into one address per node.
        let mut destination_by_node: HashMap<String, ContainerAddress> = HashMap::new();
        for message_type in &message.message_types {
            let Some(routers) = snapshot.routers_for(message_type) else {
                tracing::trace!(message_type, "no cluster handles this message type");
                continue;
            };
            for router in routers {
                match router.select_destination(&message) {
                    None => {
                        tracing::debug!(
                            cluster = %router.cluster_id(),
                            "no destination for the message at the moment"
                        );
                    }
                    Some(destination) => coalesce(&mut destination_by_node, destination),
                }
            }
        }

        if destination_by_node.is_empty() {
            tracing::trace!("no valid destination addresses for the message");
        }

        for destination in destination_by_node.into_values() {
            let routed = RoutedMessage {
                containers: destination.clusters.clone(),
                key: message.key.clone(),
                payload: message.payload.clone(),
            };

            if destination.node.guid() == self.this_node.guid() {
                self.node_receiver.feedback_loop(routed);
                *sent_somewhere = true;
                continue;
            }

            match snapshot.sender_for(&destination.node) {
                None => {
                    // snapshot briefly behind the strategy after a change
                    if self.running.load(Ordering::Acquire) {
                        tracing::error!(
                            node = %destination.node,
                            "no sender for destination node, dropping message"
                        );
                    }
                }
                Some(sender) => match sender.send(routed) {
                    Ok(()) => {
                        *sent_somewhere = true;
                        self.stats.message_sent();
                    }
                    Err(err) => {
                        tracing::debug!(node = %destination.node, %err, "send failed");
                    }
                },
            }
        }
        Ok(())
    }

    /// Load the current snapshot, waiting out a reconciler swap. `Ok(None)`
    /// means the dispatcher is stopped and the message should be silently
    /// dropped.
    async fn current_snapshot(&self) -> Result<Option<Arc<RoutingSnapshot>>, DispatchError> {
        let mut state_rx = self.state_rx.clone();
        loop {
            if let Some(snapshot) = state_rx.borrow_and_update().clone() {
                return Ok(Some(snapshot));
            }
            if !self.running.load(Ordering::Acquire) {
                tracing::debug!("dispatch called while stopped");
                return Ok(None);
            }
            if !self.ready.load(Ordering::Acquire) {
                return Err(DispatchError::NotReady);
            }
            if state_rx.changed().await.is_err() {
                // publisher dropped: shutting down
                return Ok(None);
            }
        }
    }

    /// Whether `cluster` currently accepts `message` (test support).
    pub fn can_reach(&self, cluster: &str, message: &KeyedMessage) -> bool {
        self.state_rx
            .borrow()
            .as_ref()
            .map(|snapshot| snapshot.can_reach(cluster, message))
            .unwrap_or(false)
    }

    /// Every destination currently reachable in `cluster` (test support).
    pub fn all_reachable(&self, cluster: &str) -> Vec<ContainerAddress> {
        self.state_rx
            .borrow()
            .as_ref()
            .map(|snapshot| snapshot.all_reachable(cluster))
            .unwrap_or_default()
    }
}

/// Merge `destination` into the per-node map: two clusters hosted on the
/// same node share one hop, their container indexes concatenated in router
/// order. Duplicates are kept; containers are idempotent about them.
fn coalesce(destination_by_node: &mut HashMap<String, ContainerAddress>, destination: ContainerAddress) {
    match destination_by_node.entry(destination.node.guid().to_string()) {
        std::collections::hash_map::Entry::Occupied(mut entry) => {
            entry
                .get_mut()
                .clusters
                .extend_from_slice(&destination.clusters);
        }
        std::collections::hash_map::Entry::Vacant(entry) => {
            entry.insert(destination);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    fn test_node(port: u16) -> Arc<NodeAddress> {
        Arc::new(NodeAddress::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
            "json",
            1024,
            1024,
        ))
    }

    #[test]
    fn test_coalesce_merges_same_node() {
        let node = test_node(4500);
        let mut by_node = HashMap::new();

        coalesce(&mut by_node, ContainerAddress::single(Arc::clone(&node), 7));
        coalesce(&mut by_node, ContainerAddress::single(Arc::clone(&node), 9));

        assert_eq!(by_node.len(), 1);
        let merged = by_node.get(node.guid()).expect("merged destination");
        assert_eq!(merged.clusters, vec![7, 9]);
    }

    #[test]
    fn test_coalesce_keeps_distinct_nodes_apart() {
        let n1 = test_node(4500);
        let n2 = test_node(4501);
        let mut by_node = HashMap::new();

        coalesce(&mut by_node, ContainerAddress::single(n1, 1));
        coalesce(&mut by_node, ContainerAddress::single(n2, 2));

        assert_eq!(by_node.len(), 2);
    }

    #[test]
    fn test_coalesce_preserves_order_and_duplicates() {
        let node = test_node(4500);
        let mut by_node = HashMap::new();

        coalesce(&mut by_node, ContainerAddress::single(Arc::clone(&node), 3));
        coalesce(&mut by_node, ContainerAddress::single(Arc::clone(&node), 1));
        coalesce(&mut by_node, ContainerAddress::single(Arc::clone(&node), 3));

        let merged = by_node.get(node.guid()).expect("merged destination");
        assert_eq!(merged.clusters, vec![3, 1, 3]);
    }
}
