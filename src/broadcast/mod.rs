//! Live-update fan-out to observer connections.
//!
//! Best-effort only: no delivery guarantee is made to observers. The durable
//! stores remain the source of truth, and reconnecting clients re-fetch.

use crate::db::NodeMode;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::mpsc::UnboundedSender;

/// A change notification pushed to every registered observer.
///
/// Serializes as `{"type": "detection"|"node_status", "data": {...}}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    Detection {
        node_id: String,
        detection_id: i64,
        timestamp: DateTime<Utc>,
        detection_count: i64,
        latitude: f64,
        longitude: f64,
    },
    NodeStatus {
        node_id: String,
        status: NodeMode,
    },
}

/// Registry of open observer connections, keyed by opaque connection id.
pub struct Broadcaster {
    connections: RwLock<HashMap<String, UnboundedSender<String>>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Register an observer channel. A reconnect under the same id replaces
    /// the previous channel.
    pub fn register(&self, connection_id: &str, tx: UnboundedSender<String>) {
        let mut connections = self.connections.write().unwrap();
        connections.insert(connection_id.to_string(), tx);
        tracing::info!(
            "Observer {} connected, {} total",
            connection_id,
            connections.len()
        );
    }

    /// Remove an observer channel.
    pub fn unregister(&self, connection_id: &str) {
        let mut connections = self.connections.write().unwrap();
        if connections.remove(connection_id).is_some() {
            tracing::info!(
                "Observer {} disconnected, {} total",
                connection_id,
                connections.len()
            );
        }
    }

    /// Remove an observer only if `tx` is still its registered channel.
    /// Socket teardown uses this so a reconnect under the same id is not
    /// torn down by the stale task.
    pub fn unregister_channel(&self, connection_id: &str, tx: &UnboundedSender<String>) {
        let mut connections = self.connections.write().unwrap();
        let matches = connections
            .get(connection_id)
            .is_some_and(|current| current.same_channel(tx));
        if matches {
            connections.remove(connection_id);
            tracing::info!(
                "Observer {} disconnected, {} total",
                connection_id,
                connections.len()
            );
        }
    }

    /// Number of currently registered observers.
    pub fn connection_count(&self) -> usize {
        self.connections.read().unwrap().len()
    }

    /// Push an event to every registered observer. A failed send unregisters
    /// that observer and never affects delivery to the others.
    pub fn broadcast(&self, event: &Event) {
        let message = match serde_json::to_string(event) {
            Ok(m) => m,
            Err(e) => {
                tracing::error!("Failed to serialize broadcast event: {}", e);
                return;
            }
        };

        // Snapshot under the read lock, send outside it.
        let snapshot: Vec<(String, UnboundedSender<String>)> = {
            let connections = self.connections.read().unwrap();
            connections
                .iter()
                .map(|(id, tx)| (id.clone(), tx.clone()))
                .collect()
        };

        let mut dead = Vec::new();
        for (id, tx) in snapshot {
            if tx.send(message.clone()).is_err() {
                tracing::warn!("Failed to send to observer {}, dropping connection", id);
                dead.push((id, tx));
            }
        }

        for (id, tx) in dead {
            self.unregister_channel(&id, &tx);
        }
    }

    /// Convenience wrapper for mode-change notifications.
    pub fn node_status(&self, node_id: &str, status: NodeMode) {
        self.broadcast(&Event::NodeStatus {
            node_id: node_id.to_string(),
            status,
        });
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_broadcast_reaches_all_observers() {
        let broadcaster = Broadcaster::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        broadcaster.register("obs-a", tx_a);
        broadcaster.register("obs-b", tx_b);

        broadcaster.node_status("sentry-01", NodeMode::Covert);

        let msg_a = rx_a.try_recv().unwrap();
        let msg_b = rx_b.try_recv().unwrap();
        assert_eq!(msg_a, msg_b);

        let value: serde_json::Value = serde_json::from_str(&msg_a).unwrap();
        assert_eq!(value["type"], "node_status");
        assert_eq!(value["data"]["node_id"], "sentry-01");
        assert_eq!(value["data"]["status"], "covert");
    }

    #[test]
    fn test_dead_observer_is_unregistered() {
        let broadcaster = Broadcaster::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        broadcaster.register("obs-a", tx_a);
        broadcaster.register("obs-b", tx_b);
        drop(rx_b);

        broadcaster.node_status("sentry-01", NodeMode::Online);

        assert!(rx_a.try_recv().is_ok());
        assert_eq!(broadcaster.connection_count(), 1);
    }

    #[test]
    fn test_reconnect_replaces_channel() {
        let broadcaster = Broadcaster::new();
        let (tx_old, _rx_old) = mpsc::unbounded_channel();
        broadcaster.register("obs-a", tx_old.clone());
        let (tx_new, mut rx_new) = mpsc::unbounded_channel();
        broadcaster.register("obs-a", tx_new);

        // The stale task's teardown must not remove the replacement.
        broadcaster.unregister_channel("obs-a", &tx_old);
        assert_eq!(broadcaster.connection_count(), 1);

        broadcaster.node_status("sentry-01", NodeMode::Online);
        assert!(rx_new.try_recv().is_ok());
    }

    #[test]
    fn test_detection_event_wire_format() {
        let event = Event::Detection {
            node_id: "sentry-01".to_string(),
            detection_id: 7,
            timestamp: Utc::now(),
            detection_count: 2,
            latitude: 59.33,
            longitude: 18.06,
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "detection");
        assert_eq!(value["data"]["detection_id"], 7);
        assert_eq!(value["data"]["detection_count"], 2);
    }
}
