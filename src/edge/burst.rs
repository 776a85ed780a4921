//! Burst transmitter: replays a drained buffer to the backend.
//!
//! Detections are posted in batches to keep a long backlog from overwhelming
//! the ingestion endpoint, then the blackout resumption is completed so the
//! backend flips the node back to online.

use super::BufferedDetection;

use serde::Serialize;

const DEFAULT_BATCH_SIZE: usize = 10;

#[derive(Serialize)]
struct BatchRequest<'a> {
    node_id: &'a str,
    detections: Vec<&'a serde_json::Value>,
}

#[derive(Serialize)]
struct CompleteRequest {
    transmitted_count: i64,
}

/// Result of a burst transmission.
#[derive(Debug, Clone, Default)]
pub struct BurstSummary {
    pub total: usize,
    pub transmitted: usize,
    pub failed: usize,
}

/// Post a drained buffer to the backend batch endpoint in batches.
///
/// Transport failures are counted, not propagated: the caller decides what
/// to do with a partial transmission.
pub async fn transmit_drained(
    client: &reqwest::Client,
    backend_url: &str,
    node_id: &str,
    detections: &[BufferedDetection],
    batch_size: Option<usize>,
) -> BurstSummary {
    let batch_size = batch_size.unwrap_or(DEFAULT_BATCH_SIZE).max(1);
    let mut summary = BurstSummary {
        total: detections.len(),
        ..Default::default()
    };

    if detections.is_empty() {
        return summary;
    }

    let url = format!("{}/api/detections/batch", backend_url.trim_end_matches('/'));
    tracing::info!(
        "Burst transmission of {} detections for node {} starting",
        summary.total,
        node_id
    );

    for chunk in detections.chunks(batch_size) {
        let body = BatchRequest {
            node_id,
            detections: chunk.iter().map(|d| &d.payload).collect(),
        };

        match client.post(&url).json(&body).send().await {
            Ok(response) if response.status().is_success() => {
                summary.transmitted += chunk.len();
            }
            Ok(response) => {
                tracing::warn!(
                    "Burst batch rejected for node {}: HTTP {}",
                    node_id,
                    response.status()
                );
                summary.failed += chunk.len();
            }
            Err(e) => {
                tracing::warn!("Burst batch failed for node {}: {}", node_id, e);
                summary.failed += chunk.len();
            }
        }
    }

    tracing::info!(
        "Burst transmission for node {} done: {}/{} transmitted, {} failed",
        node_id,
        summary.transmitted,
        summary.total,
        summary.failed
    );

    summary
}

/// Tell the backend the replay finished so it flips the node back online.
pub async fn complete_resumption(
    client: &reqwest::Client,
    backend_url: &str,
    node_id: &str,
    transmitted_count: i64,
) -> Result<(), reqwest::Error> {
    let url = format!(
        "{}/api/nodes/{}/blackout/complete",
        backend_url.trim_end_matches('/'),
        node_id
    );
    client
        .post(&url)
        .json(&CompleteRequest { transmitted_count })
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_empty_drain_is_trivially_complete() {
        let summary = tokio_test::block_on(transmit_drained(
            &reqwest::Client::new(),
            "http://localhost:1",
            "sentry-01",
            &[],
            None,
        ));
        assert_eq!(summary.total, 0);
        assert_eq!(summary.transmitted, 0);
        assert_eq!(summary.failed, 0);
    }

    #[test]
    fn test_unreachable_backend_counts_failures() {
        let detections: Vec<BufferedDetection> = (0..3)
            .map(|i| BufferedDetection {
                id: i,
                queued_at: Utc::now(),
                payload: serde_json::json!({"seq": i}),
            })
            .collect();

        // Nothing listens on port 9; every batch fails, nothing is lost
        // silently.
        let summary = tokio_test::block_on(transmit_drained(
            &reqwest::Client::new(),
            "http://127.0.0.1:9",
            "sentry-01",
            &detections,
            Some(2),
        ));
        assert_eq!(summary.total, 3);
        assert_eq!(summary.transmitted, 0);
        assert_eq!(summary.failed, 3);
    }
}
