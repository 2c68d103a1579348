//! Coordination-directory contract and an in-process implementation.
//!
//! The message plane consumes a hierarchical namespace with one-shot watches:
//! a watch fires at most once and is re-registered by the consumer after
//! each fire. Production deployments back this with a real directory
//! service; [`LocalSession`] provides the same semantics in-process and is
//! what the integration tests run against.
//!
//! # Standard paths
//!
//! `<root>/nodes/<guid>` holds each node's serialized
//! [`NodeInformation`](crate::NodeInformation) blob.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Lifetime mode of a directory node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirMode {
    /// Survives until explicitly removed.
    Persistent,
    /// Removed when the owning session closes.
    Ephemeral,
}

/// One-shot notification handle registered alongside a read.
///
/// Cloning is cheap; each registered clone fires at most once and is then
/// discarded by the session.
#[derive(Debug, Clone)]
pub struct Watch {
    tx: mpsc::UnboundedSender<()>,
}

impl Watch {
    /// Wrap a trigger channel as a watch.
    pub fn new(tx: mpsc::UnboundedSender<()>) -> Self {
        Self { tx }
    }

    /// Fire the watch. Dropped receivers are ignored.
    pub fn fire(&self) {
        let _ = self.tx.send(());
    }
}

/// Errors from directory operations.
#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    /// The path does not exist.
    #[error("no node at {path}")]
    NoNode {
        /// The missing path.
        path: String,
    },

    /// The backend failed; the caller should retry later.
    #[error("directory backend error: {0}")]
    Backend(String),
}

/// Directory-service session used by the reconciler and node registration.
#[async_trait]
pub trait CoordinationSession: Send + Sync {
    /// Create `path` and any missing parents. Parents are created
    /// persistent; the final component gets `mode`. Existing nodes are left
    /// untouched.
    async fn mkdir_recursive(&self, path: &str, mode: DirMode) -> Result<(), CoordinationError>;

    /// List the immediate children of `path`, optionally registering a
    /// watch that fires when the child set changes.
    async fn get_subdirs(
        &self,
        path: &str,
        watch: Option<Watch>,
    ) -> Result<Vec<String>, CoordinationError>;

    /// Read the data at `path`, optionally registering a watch that fires
    /// when the data changes or the node is removed.
    async fn get_data(
        &self,
        path: &str,
        watch: Option<Watch>,
    ) -> Result<Vec<u8>, CoordinationError>;

    /// Replace the data at `path`.
    async fn set_data(&self, path: &str, data: &[u8]) -> Result<(), CoordinationError>;

    /// Remove `path` and everything below it.
    async fn rmdir(&self, path: &str) -> Result<(), CoordinationError>;
}

#[derive(Debug, Default)]
struct DirNode {
    data: Vec<u8>,
    #[allow(dead_code)]
    mode: Option<DirMode>,
    data_watches: Vec<Watch>,
    child_watches: Vec<Watch>,
}

/// In-process directory with full watch semantics.
///
/// All sessions sharing one `LocalSession` (via `Arc`) observe the same
/// namespace, which is how multi-node tests coordinate inside a single
/// process.
#[derive(Debug, Default)]
pub struct LocalSession {
    nodes: Mutex<BTreeMap<String, DirNode>>,
}

impl LocalSession {
    /// Create an empty namespace.
    pub fn new() -> Self {
        Self::default()
    }

    fn normalize(path: &str) -> String {
        let trimmed = path.trim_end_matches('/');
        if trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("/{trimmed}")
        }
    }

    fn parent(path: &str) -> Option<String> {
        path.rfind('/').map(|i| {
            if i == 0 {
                "/".to_string()
            } else {
                path[..i].to_string()
            }
        })
    }

    fn fire_child_watches(nodes: &mut BTreeMap<String, DirNode>, parent: &str) {
        if let Some(node) = nodes.get_mut(parent) {
            for watch in node.child_watches.drain(..) {
                watch.fire();
            }
        }
    }
}

#[async_trait]
impl CoordinationSession for LocalSession {
    async fn mkdir_recursive(&self, path: &str, mode: DirMode) -> Result<(), CoordinationError> {
        let path = Self::normalize(path);
        let mut nodes = self.nodes.lock().expect("coordination lock poisoned");

        let mut accumulated = String::new();
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        for (i, component) in components.iter().enumerate() {
            accumulated.push('/');
            accumulated.push_str(component);
            if !nodes.contains_key(&accumulated) {
                let node_mode = if i + 1 == components.len() {
                    mode
                } else {
                    DirMode::Persistent
                };
                nodes.insert(
                    accumulated.clone(),
                    DirNode {
                        mode: Some(node_mode),
                        ..DirNode::default()
                    },
                );
                if let Some(parent) = Self::parent(&accumulated) {
                    Self::fire_child_watches(&mut nodes, &parent);
                }
            }
        }
        Ok(())
    }

    async fn get_subdirs(
        &self,
        path: &str,
        watch: Option<Watch>,
    ) -> Result<Vec<String>, CoordinationError> {
        let path = Self::normalize(path);
        let mut nodes = self.nodes.lock().expect("coordination lock poisoned");

        if !nodes.contains_key(&path) {
            return Err(CoordinationError::NoNode { path });
        }

        let prefix = format!("{path}/");
        let children = nodes
            .keys()
            .filter_map(|k| {
                k.strip_prefix(&prefix)
                    .filter(|rest| !rest.contains('/'))
                    .map(String::from)
            })
            .collect();

        if let Some(watch) = watch {
            if let Some(node) = nodes.get_mut(&path) {
                node.child_watches.push(watch);
            }
        }
        Ok(children)
    }

    async fn get_data(
        &self,
        path: &str,
        watch: Option<Watch>,
    ) -> Result<Vec<u8>, CoordinationError> {
        let path = Self::normalize(path);
        let mut nodes = self.nodes.lock().expect("coordination lock poisoned");

        let node = nodes
            .get_mut(&path)
            .ok_or(CoordinationError::NoNode { path })?;
        if let Some(watch) = watch {
            node.data_watches.push(watch);
        }
        Ok(node.data.clone())
    }

    async fn set_data(&self, path: &str, data: &[u8]) -> Result<(), CoordinationError> {
        let path = Self::normalize(path);
        let mut nodes = self.nodes.lock().expect("coordination lock poisoned");

        let node = nodes
            .get_mut(&path)
            .ok_or(CoordinationError::NoNode { path })?;
        node.data = data.to_vec();
        for watch in node.data_watches.drain(..) {
            watch.fire();
        }
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> Result<(), CoordinationError> {
        let path = Self::normalize(path);
        let mut nodes = self.nodes.lock().expect("coordination lock poisoned");

        if !nodes.contains_key(&path) {
            return Err(CoordinationError::NoNode { path });
        }

        let prefix = format!("{path}/");
        let doomed: Vec<String> = nodes
            .keys()
            .filter(|k| **k == path || k.starts_with(&prefix))
            .cloned()
            .collect();
        for key in doomed {
            if let Some(node) = nodes.remove(&key) {
                for watch in node.data_watches {
                    watch.fire();
                }
                for watch in node.child_watches {
                    watch.fire();
                }
            }
        }
        if let Some(parent) = Self::parent(&path) {
            Self::fire_child_watches(&mut nodes, &parent);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mkdir_and_list() {
        let session = LocalSession::new();
        session
            .mkdir_recursive("/app/nodes/n1", DirMode::Ephemeral)
            .await
            .expect("mkdir should succeed");
        session
            .mkdir_recursive("/app/nodes/n2", DirMode::Ephemeral)
            .await
            .expect("mkdir should succeed");

        let subdirs = session
            .get_subdirs("/app/nodes", None)
            .await
            .expect("list should succeed");
        assert_eq!(subdirs, vec!["n1".to_string(), "n2".to_string()]);
    }

    #[tokio::test]
    async fn test_get_data_missing_node() {
        let session = LocalSession::new();
        let err = session
            .get_data("/nope", None)
            .await
            .expect_err("should fail");
        assert!(matches!(err, CoordinationError::NoNode { .. }));
    }

    #[tokio::test]
    async fn test_set_data_roundtrip() {
        let session = LocalSession::new();
        session
            .mkdir_recursive("/a/b", DirMode::Persistent)
            .await
            .expect("mkdir should succeed");
        session
            .set_data("/a/b", b"payload")
            .await
            .expect("set should succeed");

        let data = session
            .get_data("/a/b", None)
            .await
            .expect("get should succeed");
        assert_eq!(data, b"payload");
    }

    #[tokio::test]
    async fn test_child_watch_fires_on_new_node() {
        let session = LocalSession::new();
        session
            .mkdir_recursive("/app/nodes", DirMode::Persistent)
            .await
            .expect("mkdir should succeed");

        let (tx, mut rx) = mpsc::unbounded_channel();
        session
            .get_subdirs("/app/nodes", Some(Watch::new(tx)))
            .await
            .expect("list should succeed");

        session
            .mkdir_recursive("/app/nodes/n1", DirMode::Ephemeral)
            .await
            .expect("mkdir should succeed");

        rx.recv().await.expect("watch should fire");
    }

    #[tokio::test]
    async fn test_watch_is_one_shot() {
        let session = LocalSession::new();
        session
            .mkdir_recursive("/app/nodes", DirMode::Persistent)
            .await
            .expect("mkdir should succeed");

        let (tx, mut rx) = mpsc::unbounded_channel();
        session
            .get_subdirs("/app/nodes", Some(Watch::new(tx)))
            .await
            .expect("list should succeed");

        session
            .mkdir_recursive("/app/nodes/n1", DirMode::Ephemeral)
            .await
            .expect("mkdir should succeed");
        session
            .mkdir_recursive("/app/nodes/n2", DirMode::Ephemeral)
            .await
            .expect("mkdir should succeed");

        rx.recv().await.expect("watch should fire once");
        assert!(rx.try_recv().is_err(), "watch must not fire twice");
    }

    #[tokio::test]
    async fn test_data_watch_fires_on_set() {
        let session = LocalSession::new();
        session
            .mkdir_recursive("/n", DirMode::Persistent)
            .await
            .expect("mkdir should succeed");

        let (tx, mut rx) = mpsc::unbounded_channel();
        session
            .get_data("/n", Some(Watch::new(tx)))
            .await
            .expect("get should succeed");
        session
            .set_data("/n", b"x")
            .await
            .expect("set should succeed");

        rx.recv().await.expect("watch should fire");
    }

    #[tokio::test]
    async fn test_rmdir_removes_subtree_and_fires_parent() {
        let session = LocalSession::new();
        session
            .mkdir_recursive("/app/nodes/n1/sub", DirMode::Persistent)
            .await
            .expect("mkdir should succeed");

        let (tx, mut rx) = mpsc::unbounded_channel();
        session
            .get_subdirs("/app/nodes", Some(Watch::new(tx)))
            .await
            .expect("list should succeed");

        session
            .rmdir("/app/nodes/n1")
            .await
            .expect("rmdir should succeed");
        rx.recv().await.expect("parent child-watch should fire");

        let err = session
            .get_data("/app/nodes/n1/sub", None)
            .await
            .expect_err("subtree should be gone");
        assert!(matches!(err, CoordinationError::NoNode { .. }));
    }
}
