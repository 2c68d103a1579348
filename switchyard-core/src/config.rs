//! String-keyed node configuration and directory path layout.
//!
//! Components pull their typed settings out of a [`NodeConfiguration`] at
//! construction time. Unparseable values fall back to the documented default
//! with a warning rather than failing node bring-up.

use std::collections::HashMap;

/// Interface whose address the receiver binds. Accepts an IP literal or a
/// resolvable host name; the first non-loopback IPv4 result is used.
pub const RECEIVER_NETWORK_IF: &str = "receiver.network.if";

/// Soft cap on outstanding limited jobs in the threading model.
pub const THREADING_MAX_PENDING: &str = "threading.max_pending";

/// When true, threading-model shutdown does not wait for queue drain.
pub const THREADING_HARD_SHUTDOWN: &str = "threading.hard_shutdown";

/// Parallelism of the deserialization pool.
pub const THREADING_DESERIALIZATION_THREADS: &str = "threading.deserialization_threads";

/// Number of receiver reader tasks.
pub const RECEIVER_NUM_HANDLERS: &str = "receiver.num_handlers";

/// Largest frame the receiver accepts, in bytes.
pub const RECEIVER_MAX_MESSAGE_SIZE: &str = "receiver.max_message_size";

/// Default for [`THREADING_MAX_PENDING`].
pub const DEFAULT_MAX_PENDING: i64 = 100_000;

/// Default for [`THREADING_HARD_SHUTDOWN`].
pub const DEFAULT_HARD_SHUTDOWN: bool = true;

/// Default for [`THREADING_DESERIALIZATION_THREADS`].
pub const DEFAULT_DESERIALIZATION_THREADS: usize = 2;

/// Default for [`RECEIVER_NUM_HANDLERS`].
pub const DEFAULT_NUM_HANDLERS: usize = 2;

/// Default for [`RECEIVER_MAX_MESSAGE_SIZE`] (16 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 << 20;

/// Free-form configuration map with typed accessors.
#[derive(Debug, Clone, Default)]
pub struct NodeConfiguration {
    values: HashMap<String, String>,
}

impl NodeConfiguration {
    /// Empty configuration; every lookup yields its default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a key, replacing any previous value.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Raw string lookup.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Integer lookup with fallback on absent or malformed values.
    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.parse_or(key, default)
    }

    /// Unsigned lookup with fallback on absent or malformed values.
    pub fn get_usize(&self, key: &str, default: usize) -> usize {
        self.parse_or(key, default)
    }

    /// Boolean lookup with fallback on absent or malformed values.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.parse_or(key, default)
    }

    fn parse_or<T: std::str::FromStr + Copy>(&self, key: &str, default: T) -> T {
        match self.values.get(key) {
            None => default,
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                tracing::warn!(key, value = %raw, "unparseable configuration value, using default");
                default
            }),
        }
    }
}

/// Layout of the coordination namespace for one application root.
#[derive(Debug, Clone)]
pub struct RootPaths {
    root: String,
}

impl RootPaths {
    /// Paths under `/ <application> `.
    pub fn new(application: &str) -> Self {
        Self {
            root: format!("/{}", application.trim_matches('/')),
        }
    }

    /// The application root.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Directory holding one entry per registered node.
    pub fn nodes_dir(&self) -> String {
        format!("{}/nodes", self.root)
    }

    /// The directory entry for a node guid.
    pub fn node_dir(&self, guid: &str) -> String {
        format!("{}/nodes/{}", self.root, guid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_for_missing_keys() {
        let config = NodeConfiguration::new();
        assert_eq!(
            config.get_i64(THREADING_MAX_PENDING, DEFAULT_MAX_PENDING),
            DEFAULT_MAX_PENDING
        );
        assert!(config.get_bool(THREADING_HARD_SHUTDOWN, DEFAULT_HARD_SHUTDOWN));
    }

    #[test]
    fn test_set_and_typed_get() {
        let config = NodeConfiguration::new()
            .set(RECEIVER_NUM_HANDLERS, "4")
            .set(THREADING_HARD_SHUTDOWN, "false");
        assert_eq!(config.get_usize(RECEIVER_NUM_HANDLERS, 2), 4);
        assert!(!config.get_bool(THREADING_HARD_SHUTDOWN, true));
    }

    #[test]
    fn test_malformed_value_falls_back() {
        let config = NodeConfiguration::new().set(RECEIVER_NUM_HANDLERS, "lots");
        assert_eq!(config.get_usize(RECEIVER_NUM_HANDLERS, 2), 2);
    }

    #[test]
    fn test_root_paths_layout() {
        let paths = RootPaths::new("trading");
        assert_eq!(paths.root(), "/trading");
        assert_eq!(paths.nodes_dir(), "/trading/nodes");
        assert_eq!(paths.node_dir("abc"), "/trading/nodes/abc");
    }
}
