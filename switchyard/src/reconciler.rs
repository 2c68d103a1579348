//! Keeps the routing snapshot reconciled against the coordination directory.
//!
//! The reconciler runs as a [`PersistentTask`]: one pass lists the nodes
//! directory (re-registering its watch), diffs the observed fleet against
//! the current [`RoutingSnapshot`], and — only when something changed —
//! swaps in a successor. The swap follows the take-and-clear pattern: the
//! published slot briefly holds `None` while the successor is built, and on
//! failure the previous snapshot is restored verbatim. Directory errors
//! leave the last-good snapshot installed and retry after
//! [`RETRY_TIMEOUT`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use switchyard_core::{
    CoordinationSession, DirMode, NodeAddress, NodeInformation, RootPaths, StatsCollector, Watch,
};
use switchyard_transport::SenderPool;

use crate::dispatcher::OutgoingDispatcher;
use crate::node::NodeReceiver;
use crate::persistent::PersistentTask;
use crate::snapshot::RoutingSnapshot;
use crate::strategy::RoutingStrategyManager;

/// Delay before retrying a failed reconcile pass.
pub const RETRY_TIMEOUT: Duration = Duration::from_millis(500);

/// The shared routing-state slot dispatchers read.
pub type SharedRoutingState = watch::Receiver<Option<Arc<RoutingSnapshot>>>;

/// Watches the directory and republishes the routing snapshot.
pub struct RoutingTableReconciler {
    state_tx: Arc<watch::Sender<Option<Arc<RoutingSnapshot>>>>,
    ready: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    task: PersistentTask,
    pool: Arc<SenderPool>,
}

impl RoutingTableReconciler {
    /// Start reconciling immediately. An empty snapshot is published right
    /// away so dispatchers have something to read; `is_ready` flips after
    /// the first pass that observed the directory.
    pub fn start(
        session: Arc<dyn CoordinationSession>,
        paths: RootPaths,
        this_node: Arc<NodeAddress>,
        pool: Arc<SenderPool>,
        strategy: Arc<dyn RoutingStrategyManager>,
    ) -> Self {
        let (state_tx, _) = watch::channel(Some(Arc::new(RoutingSnapshot::empty())));
        let state_tx = Arc::new(state_tx);
        let ready = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(true));

        let pass_state_tx = Arc::clone(&state_tx);
        let pass_ready = Arc::clone(&ready);
        let pass_pool = Arc::clone(&pool);
        let task = PersistentTask::spawn("reconcile routing table", RETRY_TIMEOUT, move |trigger| {
            let session = Arc::clone(&session);
            let paths = paths.clone();
            let this_node = Arc::clone(&this_node);
            let pool = Arc::clone(&pass_pool);
            let strategy = Arc::clone(&strategy);
            let state_tx = Arc::clone(&pass_state_tx);
            let ready = Arc::clone(&pass_ready);
            async move {
                reconcile_pass(
                    &session, &paths, &this_node, &pool, strategy.as_ref(), &state_tx, &ready,
                    trigger,
                )
                .await
            }
        });

        Self {
            state_tx,
            ready,
            running,
            task,
            pool,
        }
    }

    /// A fresh subscription to the routing-state slot.
    pub fn state(&self) -> SharedRoutingState {
        self.state_tx.subscribe()
    }

    /// True once a reconcile pass has observed the directory.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Schedule an extra pass now (tests, manual nudges).
    pub fn poke(&self) {
        self.task.poke();
    }

    /// Build a dispatcher wired to this reconciler's state.
    pub fn dispatcher(
        &self,
        this_node: Arc<NodeAddress>,
        node_receiver: Arc<NodeReceiver>,
        stats: Arc<dyn StatsCollector>,
    ) -> OutgoingDispatcher {
        OutgoingDispatcher::new(
            self.state_tx.subscribe(),
            Arc::clone(&self.running),
            Arc::clone(&self.ready),
            this_node,
            node_receiver,
            stats,
        )
    }

    /// Stop reconciling, clear the snapshot, and stop every sender.
    pub async fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.task.stop().await;
        self.state_tx.send_replace(None);
        self.pool.shutdown().await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn reconcile_pass(
    session: &Arc<dyn CoordinationSession>,
    paths: &RootPaths,
    this_node: &NodeAddress,
    pool: &SenderPool,
    strategy: &dyn RoutingStrategyManager,
    state_tx: &watch::Sender<Option<Arc<RoutingSnapshot>>>,
    ready: &AtomicBool,
    trigger: mpsc::UnboundedSender<()>,
) -> bool {
    let nodes_dir = paths.nodes_dir();

    let listing = async {
        session
            .mkdir_recursive(&nodes_dir, DirMode::Persistent)
            .await?;
        session
            .get_subdirs(&nodes_dir, Some(Watch::new(trigger)))
            .await
    }
    .await;
    let subdirs = match listing {
        Ok(subdirs) => subdirs,
        Err(err) => {
            tracing::debug!(%err, "failed to list the node directory, will retry shortly");
            return false;
        }
    };

    let mut seen: Vec<NodeInformation> = Vec::new();
    let mut guids: HashSet<String> = HashSet::new();
    for subdir in subdirs {
        let path = format!("{nodes_dir}/{subdir}");
        let blob = match session.get_data(&path, None).await {
            Ok(blob) => blob,
            Err(err) => {
                tracing::debug!(%err, path, "failed to read a node entry, will retry shortly");
                return false;
            }
        };
        if blob.is_empty() {
            tracing::warn!(path, "node directory entry is empty");
            return false;
        }
        let info: NodeInformation = match serde_json::from_slice(&blob) {
            Ok(info) => info,
            Err(err) => {
                tracing::warn!(%err, path, "undecodable node entry, will retry shortly");
                return false;
            }
        };

        if !guids.insert(info.node_address.guid().to_string()) {
            tracing::warn!(node = %info.node_address, "node seems to be registered more than once");
            continue;
        }
        if info.is_source_only() {
            tracing::trace!(node = %info.node_address, "skipping source-only node");
            continue;
        }
        seen.push(info);
    }

    let current = state_tx
        .borrow()
        .clone()
        .unwrap_or_else(|| Arc::new(RoutingSnapshot::empty()));

    let update = current.update(&seen);
    if !update.is_change() {
        ready.store(true, Ordering::Release);
        return true;
    }
    tracing::debug!(
        added = update.added.len(),
        removed = update.removed.len(),
        changed = update.changed.len(),
        "applying topology update"
    );

    // take-and-clear: readers wait out the swap on the watch channel
    state_tx.send_replace(None);
    match current
        .apply(&update, &seen, this_node, pool, strategy)
        .await
    {
        Ok(next) => {
            state_tx.send_replace(Some(Arc::new(next)));
            ready.store(true, Ordering::Release);
            true
        }
        Err(err) => {
            tracing::warn!(%err, "unexpected failure applying a topology update, restoring previous state");
            state_tx.send_replace(Some(current));
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    use switchyard_core::{
        ClusterId, CountingStatsCollector, JsonCodec, LocalSession, SharedWireCodec,
    };
    use switchyard_transport::SenderConfig;

    use super::*;
    use crate::node::NodeRegistration;
    use crate::strategy::KeyHashStrategy;

    fn test_pool() -> Arc<SenderPool> {
        let codec: SharedWireCodec = Arc::new(JsonCodec);
        let stats: Arc<dyn StatsCollector> = Arc::new(CountingStatsCollector::new());
        Arc::new(SenderPool::new(codec, SenderConfig::local_network(), stats))
    }

    fn node_info(port: u16) -> NodeInformation {
        let addr = NodeAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port, "json", 1024, 1024);
        NodeInformation::new(
            addr,
            vec![(ClusterId::new("app", "c"), vec!["t".to_string()])],
        )
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached in time"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_reconciler_becomes_ready_on_empty_directory() {
        let session = Arc::new(LocalSession::new());
        let this_node = Arc::new(NodeAddress::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            1,
            "json",
            1024,
            1024,
        ));
        let reconciler = RoutingTableReconciler::start(
            session,
            RootPaths::new("app"),
            this_node,
            test_pool(),
            Arc::new(KeyHashStrategy),
        );

        wait_until(|| reconciler.is_ready()).await;
        reconciler.stop().await;
    }

    #[tokio::test]
    async fn test_watch_driven_pickup_of_new_node() {
        let session = Arc::new(LocalSession::new());
        let paths = RootPaths::new("app");
        let this_node = Arc::new(NodeAddress::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            1,
            "json",
            1024,
            1024,
        ));
        let reconciler = RoutingTableReconciler::start(
            Arc::clone(&session) as Arc<dyn CoordinationSession>,
            paths.clone(),
            this_node,
            test_pool(),
            Arc::new(KeyHashStrategy),
        );
        wait_until(|| reconciler.is_ready()).await;

        // registering a node fires the directory watch; no poke needed
        let registration = NodeRegistration::new(
            Arc::clone(&session) as Arc<dyn CoordinationSession>,
            paths,
        );
        let info = node_info(4500);
        registration.register(&info).await.expect("register should succeed");

        let mut state = reconciler.state();
        wait_until(|| {
            state
                .borrow_and_update()
                .as_ref()
                .is_some_and(|s| s.nodes().contains_key(info.node_address.guid()))
        })
        .await;

        reconciler.stop().await;
    }

    #[tokio::test]
    async fn test_no_change_keeps_snapshot_identity() {
        let session = Arc::new(LocalSession::new());
        let paths = RootPaths::new("app");
        let this_node = Arc::new(NodeAddress::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            1,
            "json",
            1024,
            1024,
        ));

        let registration = NodeRegistration::new(
            Arc::clone(&session) as Arc<dyn CoordinationSession>,
            paths.clone(),
        );
        registration
            .register(&node_info(4500))
            .await
            .expect("register should succeed");

        let reconciler = RoutingTableReconciler::start(
            Arc::clone(&session) as Arc<dyn CoordinationSession>,
            paths,
            this_node,
            test_pool(),
            Arc::new(KeyHashStrategy),
        );
        let mut state = reconciler.state();
        wait_until(|| {
            state
                .borrow_and_update()
                .as_ref()
                .is_some_and(|s| !s.nodes().is_empty())
        })
        .await;

        let before = state.borrow().clone().expect("snapshot installed");
        reconciler.poke();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let after = state.borrow().clone().expect("snapshot installed");

        assert!(
            Arc::ptr_eq(&before, &after),
            "a no-change pass must not republish"
        );

        reconciler.stop().await;
    }

    #[tokio::test]
    async fn test_stop_clears_snapshot() {
        let session = Arc::new(LocalSession::new());
        let this_node = Arc::new(NodeAddress::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            1,
            "json",
            1024,
            1024,
        ));
        let reconciler = RoutingTableReconciler::start(
            session,
            RootPaths::new("app"),
            this_node,
            test_pool(),
            Arc::new(KeyHashStrategy),
        );
        wait_until(|| reconciler.is_ready()).await;

        let state = reconciler.state();
        reconciler.stop().await;
        assert!(state.borrow().is_none(), "stop must clear the snapshot");
    }
}
