//! Background sweep over nodes with pending queue items.

use super::RetryQueue;
use crate::db::{NodeMode, Store};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Periodically retries pending deliveries for every node.
pub struct QueueWorker {
    store: Arc<Store>,
    queue: Arc<RetryQueue>,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl QueueWorker {
    pub fn new(store: Arc<Store>, queue: Arc<RetryQueue>) -> Self {
        Self {
            store,
            queue,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the background sweep task.
    pub fn start(&self) {
        let store = self.store.clone();
        let queue = self.queue.clone();
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
                        sweep_pending(&store, &queue);
                    }
                }
            }
        });
    }

    /// Stop the background sweep task.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }
}

fn sweep_pending(store: &Store, queue: &RetryQueue) {
    let node_pks = match store.nodes_with_pending() {
        Ok(ids) => ids,
        Err(e) => {
            tracing::error!("QueueWorker: Failed to list nodes with pending items: {}", e);
            return;
        }
    };

    for node_pk in node_pks {
        let node = match store.get_node_by_pk(node_pk) {
            Ok(n) => n,
            Err(e) => {
                tracing::error!("QueueWorker: Failed to load node {}: {}", node_pk, e);
                continue;
            }
        };

        // Items for covert nodes stay queued until blackout deactivation.
        if node.mode == NodeMode::Covert {
            continue;
        }

        match queue.process_eligible(node_pk) {
            Ok(outcome) if outcome.attempted > 0 => {
                tracing::debug!(
                    "QueueWorker: Node {}: {} attempted, {} delivered, {} exhausted",
                    node.node_id,
                    outcome.attempted,
                    outcome.delivered,
                    outcome.exhausted
                );
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!("QueueWorker: Sweep failed for node {}: {}", node.node_id, e);
            }
        }
    }
}
