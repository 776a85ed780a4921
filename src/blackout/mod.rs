//! Blackout coordination: the covert/resuming state machine and its audit log.
//!
//! A node in blackout keeps capturing but suppresses transmission; detections
//! accumulate for bulk delivery after deactivation. Deactivation exposes an
//! intermediate `resuming` mode so observers are not told the node is fully
//! back online before the backlog has actually arrived.

mod watchdog;

pub use watchdog::*;

use crate::broadcast::Broadcaster;
use crate::db::{
    ActivationOutcome, BlackoutEvent, CloseOutcome, CompleteOutcome, DbError, NodeMode,
    RecoveredNode, Store,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Blackout error types.
#[derive(Error, Debug)]
pub enum BlackoutError {
    #[error("node not found: {0}")]
    NodeNotFound(String),
    #[error("invalid state transition for node {node}: {mode} -> {requested}")]
    InvalidStateTransition {
        node: String,
        mode: NodeMode,
        requested: NodeMode,
    },
    #[error("no open blackout event for node: {0}")]
    NoOpenBlackoutEvent(String),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(DbError),
}

/// Summary returned on deactivation.
#[derive(Debug, Clone, Serialize)]
pub struct BlackoutSummary {
    pub node_id: String,
    pub blackout_id: i64,
    pub activated_at: DateTime<Utc>,
    pub deactivated_at: DateTime<Utc>,
    pub duration_seconds: i64,
    pub detections_queued: i64,
}

/// Current blackout status for a node.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BlackoutStatus {
    Inactive {
        node_mode: NodeMode,
    },
    Active {
        blackout_id: i64,
        activated_at: DateTime<Utc>,
        duration_seconds: i64,
        detections_queued: i64,
        activated_by: Option<String>,
        reason: Option<String>,
    },
}

/// Owns every mode transition into and out of covert/resuming.
pub struct BlackoutCoordinator {
    store: Arc<Store>,
    broadcaster: Arc<Broadcaster>,
}

impl BlackoutCoordinator {
    pub fn new(store: Arc<Store>, broadcaster: Arc<Broadcaster>) -> Self {
        Self { store, broadcaster }
    }

    /// Activate blackout for an `online` node, opening an audit event.
    pub fn activate(
        &self,
        node_id: &str,
        operator_id: Option<&str>,
        reason: Option<&str>,
    ) -> Result<BlackoutEvent, BlackoutError> {
        let outcome = self
            .store
            .begin_blackout(node_id, operator_id, reason, Utc::now())
            .map_err(|e| storage_err(node_id, e))?;

        match outcome {
            ActivationOutcome::Activated(event) => {
                tracing::info!("Blackout activated for node {}", node_id);
                self.broadcaster.node_status(node_id, NodeMode::Covert);
                Ok(event)
            }
            ActivationOutcome::WrongMode(mode) => Err(BlackoutError::InvalidStateTransition {
                node: node_id.to_string(),
                mode,
                requested: NodeMode::Covert,
            }),
        }
    }

    /// Deactivate blackout for a `covert` node. Closes the audit event and
    /// leaves the node `resuming` until the backlog replay completes.
    pub fn deactivate(&self, node_id: &str) -> Result<BlackoutSummary, BlackoutError> {
        let outcome = self
            .store
            .close_blackout(node_id, Utc::now())
            .map_err(|e| storage_err(node_id, e))?;

        match outcome {
            CloseOutcome::Closed(event) => {
                tracing::info!(
                    "Blackout deactivated for node {} after {}s, {} detections queued",
                    node_id,
                    event.duration_seconds.unwrap_or(0),
                    event.detections_queued
                );
                self.broadcaster.node_status(node_id, NodeMode::Resuming);
                Ok(BlackoutSummary {
                    node_id: node_id.to_string(),
                    blackout_id: event.id,
                    activated_at: event.activated_at,
                    deactivated_at: event.deactivated_at.unwrap_or(event.activated_at),
                    duration_seconds: event.duration_seconds.unwrap_or(0),
                    detections_queued: event.detections_queued,
                })
            }
            CloseOutcome::WrongMode(mode) => Err(BlackoutError::InvalidStateTransition {
                node: node_id.to_string(),
                mode,
                requested: NodeMode::Resuming,
            }),
            CloseOutcome::NoOpenEvent => {
                Err(BlackoutError::NoOpenBlackoutEvent(node_id.to_string()))
            }
        }
    }

    /// Best-effort progress update on the open event. No-op unless the node
    /// is currently `covert`.
    pub fn update_queued_count(&self, node_id: &str, count: i64) -> Result<(), BlackoutError> {
        self.store
            .set_queued_count(node_id, count)
            .map_err(|e| storage_err(node_id, e))
    }

    /// Record the transmitted count on the most recently closed event and
    /// bring the node from `resuming` back to `online`.
    pub fn complete_resumption(
        &self,
        node_id: &str,
        transmitted: i64,
    ) -> Result<BlackoutEvent, BlackoutError> {
        let outcome = self
            .store
            .finish_resumption(node_id, transmitted)
            .map_err(|e| storage_err(node_id, e))?;

        match outcome {
            CompleteOutcome::Completed(event) => {
                tracing::info!(
                    "Node {} back online, {} detections transmitted",
                    node_id,
                    transmitted
                );
                self.broadcaster.node_status(node_id, NodeMode::Online);
                Ok(event)
            }
            CompleteOutcome::WrongMode(mode) => Err(BlackoutError::InvalidStateTransition {
                node: node_id.to_string(),
                mode,
                requested: NodeMode::Online,
            }),
            CompleteOutcome::NoClosedEvent => {
                Err(BlackoutError::NoOpenBlackoutEvent(node_id.to_string()))
            }
        }
    }

    /// Current blackout status for a node.
    pub fn status(&self, node_id: &str) -> Result<BlackoutStatus, BlackoutError> {
        let node = self
            .store
            .get_node(node_id)
            .map_err(|e| storage_err(node_id, e))?;

        if node.mode != NodeMode::Covert {
            return Ok(BlackoutStatus::Inactive {
                node_mode: node.mode,
            });
        }

        let event = self
            .store
            .open_event(node.id)
            .map_err(|e| storage_err(node_id, e))?
            .ok_or_else(|| BlackoutError::NoOpenBlackoutEvent(node_id.to_string()))?;

        Ok(BlackoutStatus::Active {
            blackout_id: event.id,
            activated_at: event.activated_at,
            duration_seconds: (Utc::now() - event.activated_at).num_seconds(),
            detections_queued: event.detections_queued,
            activated_by: event.activated_by,
            reason: event.reason,
        })
    }

    /// Force nodes stuck in `resuming` past the threshold back to `online`.
    /// Logged as an exceptional recovery and flagged in the audit log so it
    /// is distinguishable from a normal completion.
    pub fn recover_stuck_resuming(
        &self,
        threshold: Duration,
    ) -> Result<Vec<RecoveredNode>, BlackoutError> {
        let now = Utc::now();
        let cutoff = now - chrono::Duration::milliseconds(threshold.as_millis() as i64);
        let recovered = self
            .store
            .recover_stuck_resuming(cutoff, now)
            .map_err(BlackoutError::StorageUnavailable)?;

        for node in &recovered {
            tracing::warn!(
                "Node {} stuck in resuming for {}s (blackout {}), forcing online",
                node.node_id,
                node.stuck_seconds,
                node.event_id
            );
            self.broadcaster.node_status(&node.node_id, NodeMode::Online);
        }

        Ok(recovered)
    }
}

fn storage_err(node_id: &str, e: DbError) -> BlackoutError {
    match e {
        DbError::NotFound => BlackoutError::NodeNotFound(node_id.to_string()),
        other => BlackoutError::StorageUnavailable(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DetectionQuery;
    use crate::queue::{DetectionSink, QueuedDetection, RetryQueue};
    use tempfile::NamedTempFile;

    fn setup() -> (Arc<Store>, Arc<Broadcaster>, BlackoutCoordinator, NamedTempFile) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let broadcaster = Arc::new(Broadcaster::new());
        let coordinator = BlackoutCoordinator::new(store.clone(), broadcaster.clone());
        (store, broadcaster, coordinator, tmp)
    }

    fn queued_detection(timestamp: DateTime<Utc>) -> String {
        serde_json::to_string(&QueuedDetection {
            timestamp,
            latitude: 59.33,
            longitude: 18.06,
            altitude_m: None,
            accuracy_m: None,
            detections: serde_json::json!([{"class": "person", "confidence": 0.9}]),
            detection_count: 1,
            inference_time_ms: Some(38.0),
            model: Some("yolo".to_string()),
        })
        .unwrap()
    }

    #[test]
    fn test_activate_requires_online() {
        let (_store, _bc, coordinator, _tmp) = setup();

        let err = coordinator.activate("ghost", None, None).unwrap_err();
        assert!(matches!(err, BlackoutError::NodeNotFound(_)));
    }

    #[test]
    fn test_double_activation_rejected_without_side_effect() {
        let (store, _bc, coordinator, _tmp) = setup();
        store.register_node("sentry-01").unwrap();

        coordinator.activate("sentry-01", None, None).unwrap();
        let err = coordinator.activate("sentry-01", None, None).unwrap_err();
        assert!(matches!(
            err,
            BlackoutError::InvalidStateTransition {
                mode: NodeMode::Covert,
                ..
            }
        ));

        // Still exactly one open event, node still covert.
        let node = store.get_node("sentry-01").unwrap();
        assert_eq!(node.mode, NodeMode::Covert);
        assert!(store.open_event(node.id).unwrap().is_some());
    }

    #[test]
    fn test_deactivate_requires_covert() {
        let (store, _bc, coordinator, _tmp) = setup();
        store.register_node("sentry-01").unwrap();

        let err = coordinator.deactivate("sentry-01").unwrap_err();
        assert!(matches!(
            err,
            BlackoutError::InvalidStateTransition {
                mode: NodeMode::Online,
                ..
            }
        ));
        assert_eq!(store.get_node("sentry-01").unwrap().mode, NodeMode::Online);
    }

    #[test]
    fn test_concurrent_activations_single_winner() {
        let (store, _bc, coordinator, _tmp) = setup();
        store.register_node("sentry-01").unwrap();
        let coordinator = Arc::new(coordinator);

        let mut handles = Vec::new();
        for _ in 0..2 {
            let coordinator = coordinator.clone();
            handles.push(std::thread::spawn(move || {
                coordinator.activate("sentry-01", Some("op-1"), None)
            }));
        }

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let wins = results.iter().filter(|r| r.is_ok()).count();
        let losses = results
            .iter()
            .filter(|r| {
                matches!(r, Err(BlackoutError::InvalidStateTransition { .. }))
            })
            .count();
        assert_eq!(wins, 1);
        assert_eq!(losses, 1);
    }

    #[test]
    fn test_full_blackout_cycle() {
        let (store, _bc, coordinator, _tmp) = setup();
        let node = store.register_node("sentry-01").unwrap();
        let sink = Arc::new(DetectionSink::new(store.clone()));
        let queue = RetryQueue::new(store.clone(), sink, 5, std::time::Duration::ZERO);

        coordinator
            .activate("sentry-01", Some("op-1"), Some("test"))
            .unwrap();
        assert_eq!(store.get_node("sentry-01").unwrap().mode, NodeMode::Covert);

        // Three detections arrive while covert, with capture times well in
        // the past. They are queued, not stored.
        let base = Utc::now() - chrono::Duration::hours(6);
        let captured: Vec<DateTime<Utc>> = (0..3)
            .map(|i| base + chrono::Duration::minutes(i * 10))
            .collect();
        for ts in &captured {
            queue.enqueue(node.id, &queued_detection(*ts)).unwrap();
        }
        coordinator.update_queued_count("sentry-01", 3).unwrap();

        match coordinator.status("sentry-01").unwrap() {
            BlackoutStatus::Active {
                detections_queued,
                reason,
                ..
            } => {
                assert_eq!(detections_queued, 3);
                assert_eq!(reason.as_deref(), Some("test"));
            }
            other => panic!("expected active status, got {:?}", other),
        }

        let summary = coordinator.deactivate("sentry-01").unwrap();
        assert_eq!(summary.detections_queued, 3);
        assert!(summary.duration_seconds >= 0);
        assert_eq!(
            store.get_node("sentry-01").unwrap().mode,
            NodeMode::Resuming
        );

        // Burst replay: the queue sweep delivers the backlog now that the
        // node is no longer covert.
        let outcome = queue.process_eligible(node.id).unwrap();
        assert_eq!(outcome.delivered, 3);

        let event = coordinator.complete_resumption("sentry-01", 3).unwrap();
        assert_eq!(event.detections_transmitted, Some(3));
        assert!(!event.auto_recovered);
        assert_eq!(store.get_node("sentry-01").unwrap().mode, NodeMode::Online);

        // Original capture timestamps survived the whole cycle.
        let stored = store
            .get_detections(&DetectionQuery {
                node_id: Some(node.id),
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(stored.len(), 3);
        let mut stored_times: Vec<DateTime<Utc>> = stored.iter().map(|d| d.timestamp).collect();
        stored_times.sort();
        assert_eq!(stored_times, captured);
    }

    #[test]
    fn test_update_queued_count_noop_when_not_covert() {
        let (store, _bc, coordinator, _tmp) = setup();
        let node = store.register_node("sentry-01").unwrap();

        coordinator.update_queued_count("sentry-01", 7).unwrap();
        assert!(store.open_event(node.id).unwrap().is_none());
    }

    #[test]
    fn test_stuck_resuming_recovered_exactly_once() {
        let (store, _bc, coordinator, _tmp) = setup();
        let node = store.register_node("sentry-01").unwrap();

        coordinator.activate("sentry-01", None, None).unwrap();
        coordinator.deactivate("sentry-01").unwrap();
        assert_eq!(
            store.get_node("sentry-01").unwrap().mode,
            NodeMode::Resuming
        );

        // Zero threshold makes the node immediately eligible.
        let recovered = coordinator
            .recover_stuck_resuming(Duration::ZERO)
            .unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].node_id, "sentry-01");
        assert_eq!(store.get_node("sentry-01").unwrap().mode, NodeMode::Online);

        // The audit log distinguishes the forced recovery from a normal
        // completion.
        let event = store.latest_closed_event(node.id).unwrap().unwrap();
        assert!(event.auto_recovered);
        assert_eq!(event.detections_transmitted, None);

        // A second sweep finds nothing.
        let again = coordinator
            .recover_stuck_resuming(Duration::ZERO)
            .unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_complete_resumption_requires_resuming() {
        let (store, _bc, coordinator, _tmp) = setup();
        store.register_node("sentry-01").unwrap();

        let err = coordinator
            .complete_resumption("sentry-01", 0)
            .unwrap_err();
        assert!(matches!(
            err,
            BlackoutError::InvalidStateTransition {
                mode: NodeMode::Online,
                ..
            }
        ));
    }

    #[test]
    fn test_status_inactive() {
        let (store, _bc, coordinator, _tmp) = setup();
        store.register_node("sentry-01").unwrap();

        match coordinator.status("sentry-01").unwrap() {
            BlackoutStatus::Inactive { node_mode } => assert_eq!(node_mode, NodeMode::Online),
            other => panic!("expected inactive status, got {:?}", other),
        }
    }
}
