//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Operational mode of a sensor node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeMode {
    Online,
    Offline,
    Covert,
    Resuming,
}

impl NodeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeMode::Online => "online",
            NodeMode::Offline => "offline",
            NodeMode::Covert => "covert",
            NodeMode::Resuming => "resuming",
        }
    }

    pub fn parse(s: &str) -> Option<NodeMode> {
        match s {
            "online" => Some(NodeMode::Online),
            "offline" => Some(NodeMode::Offline),
            "covert" => Some(NodeMode::Covert),
            "resuming" => Some(NodeMode::Resuming),
            _ => None,
        }
    }
}

impl fmt::Display for NodeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered sensor node.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: i64,
    pub node_id: String,
    pub mode: NodeMode,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A detection awaiting insertion.
#[derive(Debug, Clone)]
pub struct NewDetection {
    pub node_id: i64,
    /// Original capture time, never the ingestion time.
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_m: Option<f64>,
    pub accuracy_m: Option<f64>,
    /// Classified bounding boxes plus model metadata, as JSON text.
    pub payload: String,
    pub detection_count: i64,
    pub inference_time_ms: Option<f64>,
    pub model: Option<String>,
}

/// A stored detection record. `node` carries the opaque node identifier
/// joined from the nodes table.
#[derive(Debug, Clone)]
pub struct Detection {
    pub id: i64,
    pub node_id: i64,
    pub node: String,
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_m: Option<f64>,
    pub accuracy_m: Option<f64>,
    pub payload: String,
    pub detection_count: i64,
    pub inference_time_ms: Option<f64>,
    pub model: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle state of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<QueueStatus> {
        match s {
            "pending" => Some(QueueStatus::Pending),
            "processing" => Some(QueueStatus::Processing),
            "completed" => Some(QueueStatus::Completed),
            "failed" => Some(QueueStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QueueStatus::Completed | QueueStatus::Failed)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A payload awaiting delivery.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: i64,
    pub node_id: i64,
    pub payload: String,
    pub status: QueueStatus,
    pub retry_count: i64,
    pub created_at: DateTime<Utc>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// One blackout episode in the audit log.
#[derive(Debug, Clone)]
pub struct BlackoutEvent {
    pub id: i64,
    pub node_id: i64,
    pub activated_at: DateTime<Utc>,
    pub deactivated_at: Option<DateTime<Utc>>,
    pub activated_by: Option<String>,
    pub reason: Option<String>,
    pub detections_queued: i64,
    pub duration_seconds: Option<i64>,
    pub detections_transmitted: Option<i64>,
    /// Set when the resume watchdog forced the node back online instead of
    /// a normal completion.
    pub auto_recovered: bool,
}

/// Per-status queue counts for the stats endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

/// A node forced out of `resuming` by the watchdog.
#[derive(Debug, Clone)]
pub struct RecoveredNode {
    pub node_id: String,
    pub event_id: i64,
    pub deactivated_at: DateTime<Utc>,
    pub stuck_seconds: i64,
}
