//! Addressing types for nodes, clusters, and destination containers.
//!
//! A [`NodeAddress`] identifies a single process in the fleet. Two addresses
//! are equal iff their guids are equal; the remaining fields describe how to
//! reach the node and what it can accept. A [`ClusterId`] names a logical
//! group of message processors, and a [`ContainerAddress`] pins a message to
//! one or more containers co-hosted on a single node.

use std::net::IpAddr;
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Identity of a peer node.
///
/// The `guid` is the sole identity; everything else is advertisement. A node
/// that restarts gets a fresh guid even when it binds the same ip:port, so
/// stale directory entries never alias a live node.
///
/// # Examples
///
/// ```
/// use std::net::{IpAddr, Ipv4Addr};
/// use switchyard_core::NodeAddress;
///
/// let addr = NodeAddress::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 4500, "json", 65536, 16 << 20);
/// assert!(addr.guid().starts_with("127.0.0.1:4500-"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeAddress {
    guid: String,
    ip: IpAddr,
    port: u16,
    serializer_id: String,
    recv_buffer_size: usize,
    message_size_limit: usize,
}

impl NodeAddress {
    /// Create an address with a freshly generated guid.
    pub fn new(
        ip: IpAddr,
        port: u16,
        serializer_id: impl Into<String>,
        recv_buffer_size: usize,
        message_size_limit: usize,
    ) -> Self {
        let nonce: u128 = rand::thread_rng().gen();
        Self {
            guid: format!("{}:{}-{:032x}", ip, port, nonce),
            ip,
            port,
            serializer_id: serializer_id.into(),
            recv_buffer_size,
            message_size_limit,
        }
    }

    /// The stable identity of this node.
    pub fn guid(&self) -> &str {
        &self.guid
    }

    /// IP the node's receiver is bound to.
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Port the node's receiver is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// `ip:port` in the form accepted by a connector.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Id of the codec the node deserializes inbound payloads with.
    pub fn serializer_id(&self) -> &str {
        &self.serializer_id
    }

    /// Advertised receive-buffer size, in bytes.
    pub fn recv_buffer_size(&self) -> usize {
        self.recv_buffer_size
    }

    /// Largest frame the node's receiver will accept, in bytes.
    pub fn message_size_limit(&self) -> usize {
        self.message_size_limit
    }
}

impl PartialEq for NodeAddress {
    fn eq(&self, other: &Self) -> bool {
        self.guid == other.guid
    }
}

impl Eq for NodeAddress {}

impl std::hash::Hash for NodeAddress {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.guid.hash(state);
    }
}

impl std::fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.guid)
    }
}

/// Name of a logical cluster: `(application, cluster)`.
///
/// Total-ordered lexicographically so router lists have a stable order
/// regardless of which node computed them.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClusterId {
    application: String,
    cluster: String,
}

impl ClusterId {
    /// Create a cluster id.
    pub fn new(application: impl Into<String>, cluster: impl Into<String>) -> Self {
        Self {
            application: application.into(),
            cluster: cluster.into(),
        }
    }

    /// The application this cluster belongs to.
    pub fn application(&self) -> &str {
        &self.application
    }

    /// The cluster name within the application.
    pub fn cluster(&self) -> &str {
        &self.cluster
    }
}

impl std::fmt::Display for ClusterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.application, self.cluster)
    }
}

/// One network destination: a node plus the container indexes on that node
/// that should see the message.
///
/// Carrying several indexes lets co-hosted clusters share one network hop:
/// the sender transmits a single frame and the receiving node fans it out
/// locally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerAddress {
    /// The node hosting the containers.
    pub node: Arc<NodeAddress>,
    /// Non-empty list of container indexes on `node`.
    pub clusters: Vec<u32>,
}

impl ContainerAddress {
    /// Create a destination for a single container.
    pub fn single(node: Arc<NodeAddress>, cluster_index: u32) -> Self {
        Self {
            node,
            clusters: vec![cluster_index],
        }
    }
}
