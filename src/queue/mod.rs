//! Persistent retry queue with bounded exponential backoff.
//!
//! Items survive restarts in the queue_items table. A delivery failure is
//! recovered locally by backing off and retrying; only exhaustion of the
//! retry ceiling is externally observable, via status queries.

mod worker;

pub use worker::*;

use crate::db::{DbError, NewDetection, QueueItem, QueueStats, Store};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Queue error types surfaced to callers.
#[derive(Error, Debug)]
pub enum QueueError {
    /// The durable store could not be reached; the caller must not assume
    /// the item was queued.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] DbError),
}

/// A failed delivery attempt. Recovered internally by the retry mechanism
/// and never propagated past `process_eligible`.
#[derive(Error, Debug)]
#[error("delivery failed: {0}")]
pub struct DeliveryFailed(pub String);

/// Destination for queued payloads.
pub trait Delivery: Send + Sync {
    fn deliver(&self, node_id: i64, payload: &str) -> Result<(), DeliveryFailed>;
}

/// Wire format of a detection held in the queue while its node is covert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedDetection {
    /// Original capture time, preserved through replay.
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub altitude_m: Option<f64>,
    #[serde(default)]
    pub accuracy_m: Option<f64>,
    pub detections: serde_json::Value,
    pub detection_count: i64,
    #[serde(default)]
    pub inference_time_ms: Option<f64>,
    #[serde(default)]
    pub model: Option<String>,
}

impl QueuedDetection {
    pub fn into_new_detection(self, node_id: i64) -> NewDetection {
        NewDetection {
            node_id,
            timestamp: self.timestamp,
            latitude: self.latitude,
            longitude: self.longitude,
            altitude_m: self.altitude_m,
            accuracy_m: self.accuracy_m,
            payload: self.detections.to_string(),
            detection_count: self.detection_count,
            inference_time_ms: self.inference_time_ms,
            model: self.model,
        }
    }
}

/// Delivery target that writes queued detections into the detection store,
/// keeping their original capture timestamps.
pub struct DetectionSink {
    store: Arc<Store>,
}

impl DetectionSink {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

impl Delivery for DetectionSink {
    fn deliver(&self, node_id: i64, payload: &str) -> Result<(), DeliveryFailed> {
        let queued: QueuedDetection = serde_json::from_str(payload)
            .map_err(|e| DeliveryFailed(format!("malformed payload: {}", e)))?;
        self.store
            .add_detection(&queued.into_new_detection(node_id))
            .map_err(|e| DeliveryFailed(e.to_string()))?;
        Ok(())
    }
}

/// Deterministic backoff: `base * 2^retry_count`, saturating.
pub fn backoff_delay(retry_count: u32, base: Duration) -> Duration {
    let factor = 2u32.saturating_pow(retry_count.min(20));
    base.saturating_mul(factor)
}

/// Result of one `process_eligible` sweep.
#[derive(Debug, Clone, Copy, Default)]
pub struct SweepOutcome {
    pub attempted: usize,
    pub delivered: usize,
    pub exhausted: usize,
}

/// Per-node FIFO of payloads awaiting delivery.
pub struct RetryQueue {
    store: Arc<Store>,
    delivery: Arc<dyn Delivery>,
    max_retries: i64,
    base_delay: Duration,
}

impl RetryQueue {
    pub fn new(
        store: Arc<Store>,
        delivery: Arc<dyn Delivery>,
        max_retries: i64,
        base_delay: Duration,
    ) -> Self {
        Self {
            store,
            delivery,
            max_retries,
            base_delay,
        }
    }

    /// Durably enqueue a payload for a node.
    pub fn enqueue(&self, node_id: i64, payload: &str) -> Result<i64, QueueError> {
        let id = self.store.enqueue_item(node_id, payload, Utc::now())?;
        tracing::debug!("Enqueued item {} for node {}", id, node_id);
        Ok(id)
    }

    /// Pending items for a node, oldest first.
    pub fn pending_items(&self, node_id: i64) -> Result<Vec<QueueItem>, QueueError> {
        Ok(self.store.pending_items(node_id)?)
    }

    /// Count of pending items for a node.
    pub fn pending_count(&self, node_id: i64) -> Result<i64, QueueError> {
        Ok(self.store.pending_count(node_id)?)
    }

    /// Queue item counts grouped by status.
    pub fn stats(&self) -> Result<QueueStats, QueueError> {
        Ok(self.store.queue_stats()?)
    }

    /// Mark an item completed. No-op for already-terminal items.
    pub fn mark_completed(&self, item_id: i64) -> Result<(), QueueError> {
        let item = self.store.get_queue_item(item_id)?;
        if item.status.is_terminal() {
            return Ok(());
        }
        self.store.complete_item(item_id, Utc::now())?;
        Ok(())
    }

    /// Record a failed delivery: bump the retry counter and either reschedule
    /// or mark the item failed at the ceiling. No-op for terminal items.
    pub fn mark_failed(&self, item_id: i64) -> Result<(), QueueError> {
        let item = self.store.get_queue_item(item_id)?;
        if item.status.is_terminal() {
            return Ok(());
        }
        self.record_failure(item_id, item.retry_count)?;
        Ok(())
    }

    /// Attempt delivery of every due pending item for a node. Items are
    /// claimed (pending -> processing) before delivery so a concurrent sweep
    /// cannot double-deliver. Delivery errors never escape this method.
    pub fn process_eligible(&self, node_id: i64) -> Result<SweepOutcome, QueueError> {
        let items = self.store.eligible_items(node_id, Utc::now())?;
        let mut outcome = SweepOutcome::default();

        for item in items {
            if !self.store.claim_item(item.id)? {
                continue;
            }
            outcome.attempted += 1;

            match self.delivery.deliver(item.node_id, &item.payload) {
                Ok(()) => {
                    self.store.complete_item(item.id, Utc::now())?;
                    outcome.delivered += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        "Delivery of item {} failed (attempt {}): {}",
                        item.id,
                        item.retry_count + 1,
                        e
                    );
                    if self.record_failure(item.id, item.retry_count)? {
                        outcome.exhausted += 1;
                    }
                }
            }
        }

        Ok(outcome)
    }

    /// Returns true when the item hit the retry ceiling and was failed.
    fn record_failure(&self, item_id: i64, prior_retries: i64) -> Result<bool, QueueError> {
        let retry_count = prior_retries + 1;
        if retry_count >= self.max_retries {
            self.store.fail_item(item_id, retry_count, Utc::now())?;
            tracing::error!(
                "Item {} exhausted {} delivery attempts, marking failed",
                item_id,
                retry_count
            );
            Ok(true)
        } else {
            let delay = backoff_delay(retry_count as u32, self.base_delay);
            let next_attempt = Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
            self.store.requeue_item(item_id, retry_count, next_attempt)?;
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DetectionQuery, QueueStatus};
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    struct FailSink;

    impl Delivery for FailSink {
        fn deliver(&self, _node_id: i64, _payload: &str) -> Result<(), DeliveryFailed> {
            Err(DeliveryFailed("unreachable".to_string()))
        }
    }

    struct RecordingSink {
        delivered: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self {
                delivered: Mutex::new(Vec::new()),
            }
        }
    }

    impl Delivery for RecordingSink {
        fn deliver(&self, _node_id: i64, payload: &str) -> Result<(), DeliveryFailed> {
            self.delivered.lock().unwrap().push(payload.to_string());
            Ok(())
        }
    }

    fn setup(delivery: Arc<dyn Delivery>) -> (Arc<Store>, RetryQueue, i64, NamedTempFile) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let node = store.register_node("sentry-01").unwrap();
        let queue = RetryQueue::new(store.clone(), delivery, 5, Duration::ZERO);
        (store, queue, node.id, tmp)
    }

    #[test]
    fn test_backoff_delay_is_deterministic() {
        let base = Duration::from_secs(1);
        assert_eq!(backoff_delay(0, base), Duration::from_secs(1));
        assert_eq!(backoff_delay(1, base), Duration::from_secs(2));
        assert_eq!(backoff_delay(3, base), Duration::from_secs(8));
        assert_eq!(backoff_delay(5, base), Duration::from_secs(32));
        // Large counts saturate instead of overflowing.
        assert!(backoff_delay(200, base) >= backoff_delay(20, base));
    }

    #[test]
    fn test_exhaustion_after_exactly_max_retries() {
        let (store, queue, node_id, _tmp) = setup(Arc::new(FailSink));
        let item_id = queue.enqueue(node_id, "{}").unwrap();

        for _ in 0..5 {
            queue.process_eligible(node_id).unwrap();
        }

        let item = store.get_queue_item(item_id).unwrap();
        assert_eq!(item.status, QueueStatus::Failed);
        assert_eq!(item.retry_count, 5);

        // Exhausted items are excluded from further sweeps.
        let outcome = queue.process_eligible(node_id).unwrap();
        assert_eq!(outcome.attempted, 0);
        let item = store.get_queue_item(item_id).unwrap();
        assert_eq!(item.retry_count, 5);
    }

    #[test]
    fn test_backoff_defers_next_attempt() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let node = store.register_node("sentry-01").unwrap();
        let queue = RetryQueue::new(
            store.clone(),
            Arc::new(FailSink),
            5,
            Duration::from_secs(3600),
        );

        queue.enqueue(node.id, "{}").unwrap();
        let first = queue.process_eligible(node.id).unwrap();
        assert_eq!(first.attempted, 1);

        // The failed item is rescheduled an hour out, so nothing is due.
        let second = queue.process_eligible(node.id).unwrap();
        assert_eq!(second.attempted, 0);
    }

    #[test]
    fn test_terminal_marks_are_idempotent() {
        let (store, queue, node_id, _tmp) = setup(Arc::new(RecordingSink::new()));
        let item_id = queue.enqueue(node_id, "{}").unwrap();

        queue.mark_completed(item_id).unwrap();
        queue.mark_completed(item_id).unwrap();
        queue.mark_failed(item_id).unwrap();

        let item = store.get_queue_item(item_id).unwrap();
        assert_eq!(item.status, QueueStatus::Completed);
        assert_eq!(item.retry_count, 0);
    }

    #[test]
    fn test_delivery_preserves_fifo_order() {
        let sink = Arc::new(RecordingSink::new());
        let (_store, queue, node_id, _tmp) = setup(sink.clone());

        queue.enqueue(node_id, "first").unwrap();
        queue.enqueue(node_id, "second").unwrap();
        queue.enqueue(node_id, "third").unwrap();

        let outcome = queue.process_eligible(node_id).unwrap();
        assert_eq!(outcome.delivered, 3);
        assert_eq!(
            *sink.delivered.lock().unwrap(),
            vec!["first", "second", "third"]
        );
    }

    #[test]
    fn test_detection_sink_preserves_capture_time() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());
        let node = store.register_node("sentry-01").unwrap();
        let sink = DetectionSink::new(store.clone());

        let captured = Utc::now() - chrono::Duration::days(2);
        let queued = QueuedDetection {
            timestamp: captured,
            latitude: 1.0,
            longitude: 2.0,
            altitude_m: None,
            accuracy_m: None,
            detections: serde_json::json!([{"class": "vehicle"}]),
            detection_count: 1,
            inference_time_ms: None,
            model: None,
        };
        let payload = serde_json::to_string(&queued).unwrap();

        sink.deliver(node.id, &payload).unwrap();

        let stored = store
            .get_detections(&DetectionQuery {
                node_id: Some(node.id),
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].timestamp, captured);
    }

    #[test]
    fn test_queue_stats_by_status() {
        let (_store, queue, node_id, _tmp) = setup(Arc::new(FailSink));

        queue.enqueue(node_id, "a").unwrap();
        queue.enqueue(node_id, "b").unwrap();
        let completed = queue.enqueue(node_id, "c").unwrap();
        queue.mark_completed(completed).unwrap();

        let stats = queue.stats().unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 0);
    }
}
