//! Watchdog for nodes stuck in the `resuming` state.
//!
//! A crashed replay step would otherwise leave a node `resuming` forever;
//! this sweep is the liveness safeguard.

use super::BlackoutCoordinator;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Periodically forces nodes stuck in `resuming` back to `online`.
pub struct ResumeWatchdog {
    coordinator: Arc<BlackoutCoordinator>,
    threshold: Duration,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl ResumeWatchdog {
    pub fn new(coordinator: Arc<BlackoutCoordinator>, threshold: Duration) -> Self {
        Self {
            coordinator,
            threshold,
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the watchdog background task.
    pub fn start(&self) {
        let coordinator = self.coordinator.clone();
        let threshold = self.threshold;
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
                        match coordinator.recover_stuck_resuming(threshold) {
                            Ok(recovered) if !recovered.is_empty() => {
                                tracing::warn!(
                                    "ResumeWatchdog: Recovered {} stuck node(s)",
                                    recovered.len()
                                );
                            }
                            Ok(_) => {}
                            Err(e) => {
                                tracing::error!("ResumeWatchdog: Sweep failed: {}", e);
                            }
                        }
                    }
                }
            }
        });
    }

    /// Stop the watchdog.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }
}
