//! Node registry: registration, lookup, and heartbeat-derived liveness.
//!
//! The registry owns the online/offline side of a node's mode; transitions
//! into and out of covert/resuming belong to the blackout coordinator.

use crate::broadcast::Broadcaster;
use crate::db::{DbError, Node, NodeMode, Store};

use chrono::Utc;
use regex::Regex;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Registry error types.
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("node not found: {0}")]
    NodeNotFound(String),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(DbError),
}

/// Check that a node identifier is an opaque slug we accept.
pub fn is_valid_node_id(node_id: &str) -> bool {
    static NODE_ID_RE: OnceLock<Regex> = OnceLock::new();
    let re = NODE_ID_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").unwrap());
    re.is_match(node_id)
}

/// Tracks known sensor nodes and their heartbeat-derived liveness.
pub struct Registry {
    store: Arc<Store>,
    broadcaster: Arc<Broadcaster>,
}

impl Registry {
    pub fn new(store: Arc<Store>, broadcaster: Arc<Broadcaster>) -> Self {
        Self { store, broadcaster }
    }

    /// Register a node. Idempotent: re-registering an existing id returns
    /// the existing record unchanged.
    pub fn register(&self, node_id: &str) -> Result<Node, RegistryError> {
        self.store
            .register_node(node_id)
            .map_err(|e| storage_err(node_id, e))
    }

    /// Look up a node by its opaque identifier.
    pub fn get(&self, node_id: &str) -> Result<Node, RegistryError> {
        self.store.get_node(node_id).map_err(|e| storage_err(node_id, e))
    }

    /// All known nodes.
    pub fn list(&self) -> Result<Vec<Node>, RegistryError> {
        self.store
            .get_nodes()
            .map_err(RegistryError::StorageUnavailable)
    }

    /// Record a heartbeat. An `offline` node comes back `online`, which is
    /// announced to observers; covert/resuming nodes are left alone.
    pub fn heartbeat(&self, node_id: &str) -> Result<Node, RegistryError> {
        let (node, came_online) = self
            .store
            .touch_heartbeat(node_id, Utc::now())
            .map_err(|e| storage_err(node_id, e))?;
        if came_online {
            tracing::info!("Node {} back online after heartbeat", node_id);
            self.broadcaster.node_status(node_id, NodeMode::Online);
        }
        Ok(node)
    }

    /// Flip online nodes with stale heartbeats to offline.
    pub fn sweep_stale(&self, staleness: Duration) -> Result<Vec<String>, RegistryError> {
        let cutoff = Utc::now() - chrono::Duration::milliseconds(staleness.as_millis() as i64);
        let flipped = self
            .store
            .mark_stale_offline(cutoff)
            .map_err(RegistryError::StorageUnavailable)?;
        for node_id in &flipped {
            tracing::warn!("Node {} missed heartbeats, marking offline", node_id);
            self.broadcaster.node_status(node_id, NodeMode::Offline);
        }
        Ok(flipped)
    }
}

fn storage_err(node_id: &str, e: DbError) -> RegistryError {
    match e {
        DbError::NotFound => RegistryError::NodeNotFound(node_id.to_string()),
        other => RegistryError::StorageUnavailable(other),
    }
}

/// Periodically marks nodes with stale heartbeats offline.
pub struct HeartbeatMonitor {
    registry: Arc<Registry>,
    staleness: Duration,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl HeartbeatMonitor {
    pub fn new(registry: Arc<Registry>, staleness: Duration) -> Self {
        Self {
            registry,
            staleness,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the monitor background task.
    pub fn start(&self) {
        let registry = self.registry.clone();
        let staleness = self.staleness;
        let stop = self.stop.clone();

        tokio::spawn(async move {
            let (tx, _) = tokio::sync::broadcast::channel(1);
            {
                let mut stop_guard = stop.lock().await;
                *stop_guard = Some(tx.clone());
            }

            let mut rx = tx.subscribe();
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        if let Err(e) = registry.sweep_stale(staleness) {
                            tracing::error!("HeartbeatMonitor: Sweep failed: {}", e);
                        }
                    }
                }
            }
        });
    }

    /// Stop the monitor.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn setup() -> (Registry, NamedTempFile) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let registry = Registry::new(store, Arc::new(Broadcaster::new()));
        (registry, tmp)
    }

    #[test]
    fn test_node_id_validation() {
        assert!(is_valid_node_id("sentry-01"));
        assert!(is_valid_node_id("A1"));
        assert!(is_valid_node_id("edge_cam_9"));
        assert!(!is_valid_node_id(""));
        assert!(!is_valid_node_id("-leading-dash"));
        assert!(!is_valid_node_id("has space"));
        assert!(!is_valid_node_id(&"x".repeat(100)));
    }

    #[test]
    fn test_register_then_heartbeat() {
        let (registry, _tmp) = setup();

        let node = registry.register("sentry-01").unwrap();
        assert_eq!(node.mode, NodeMode::Online);

        let before = node.last_heartbeat;
        let node = registry.heartbeat("sentry-01").unwrap();
        assert!(node.last_heartbeat >= before);

        let err = registry.heartbeat("ghost").unwrap_err();
        assert!(matches!(err, RegistryError::NodeNotFound(_)));
    }
}
