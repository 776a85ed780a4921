//! HTTP request handlers.

use super::AppState;
use crate::blackout::BlackoutError;
use crate::broadcast::Event;
use crate::db::{Detection, DetectionQuery, NewDetection, Node, NodeMode, QueueItem, QueueStatus};
use crate::queue::{QueueError, QueuedDetection};
use crate::registry::{is_valid_node_id, RegistryError};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Error mapping
// ============================================================================

fn registry_error(e: RegistryError) -> Response {
    match &e {
        RegistryError::NodeNotFound(_) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
        RegistryError::StorageUnavailable(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}

fn blackout_error(e: BlackoutError) -> Response {
    match &e {
        BlackoutError::NodeNotFound(_) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
        BlackoutError::InvalidStateTransition { .. } | BlackoutError::NoOpenBlackoutEvent(_) => {
            (StatusCode::CONFLICT, e.to_string()).into_response()
        }
        BlackoutError::StorageUnavailable(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}

fn queue_error(e: QueueError) -> Response {
    match &e {
        QueueError::StorageUnavailable(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
}

pub async fn handle_health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        timestamp: Utc::now(),
    })
}

// ============================================================================
// API: Nodes
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RegisterNodeRequest {
    pub node_id: String,
}

#[derive(Debug, Serialize)]
pub struct NodeResponse {
    pub id: i64,
    pub node_id: String,
    pub mode: NodeMode,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<Node> for NodeResponse {
    fn from(node: Node) -> Self {
        Self {
            id: node.id,
            node_id: node.node_id,
            mode: node.mode,
            last_heartbeat: node.last_heartbeat,
            created_at: node.created_at,
        }
    }
}

pub async fn handle_register_node(
    State(state): State<AppState>,
    Json(req): Json<RegisterNodeRequest>,
) -> impl IntoResponse {
    if !is_valid_node_id(&req.node_id) {
        return (StatusCode::BAD_REQUEST, "Invalid node id").into_response();
    }

    match state.registry.register(&req.node_id) {
        Ok(node) => Json(NodeResponse::from(node)).into_response(),
        Err(e) => registry_error(e),
    }
}

pub async fn handle_get_nodes(State(state): State<AppState>) -> impl IntoResponse {
    match state.registry.list() {
        Ok(nodes) => {
            let nodes: Vec<NodeResponse> = nodes.into_iter().map(NodeResponse::from).collect();
            Json(nodes).into_response()
        }
        Err(e) => registry_error(e),
    }
}

pub async fn handle_node_status(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> impl IntoResponse {
    match state.registry.get(&node_id) {
        Ok(node) => Json(NodeResponse::from(node)).into_response(),
        Err(e) => registry_error(e),
    }
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    pub status: &'static str,
    pub timestamp: Option<DateTime<Utc>>,
}

pub async fn handle_heartbeat(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> impl IntoResponse {
    match state.registry.heartbeat(&node_id) {
        Ok(node) => Json(HeartbeatResponse {
            status: "success",
            timestamp: node.last_heartbeat,
        })
        .into_response(),
        Err(e) => registry_error(e),
    }
}

// ============================================================================
// API: Detections
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub altitude_m: Option<f64>,
    #[serde(default)]
    pub accuracy_m: Option<f64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateDetectionRequest {
    pub node_id: String,
    /// Original capture time; preserved verbatim, even for late deliveries.
    pub timestamp: DateTime<Utc>,
    pub location: Location,
    pub detections: serde_json::Value,
    pub detection_count: i64,
    #[serde(default)]
    pub inference_time_ms: Option<f64>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DetectionBody {
    pub timestamp: DateTime<Utc>,
    pub location: Location,
    pub detections: serde_json::Value,
    pub detection_count: i64,
    #[serde(default)]
    pub inference_time_ms: Option<f64>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BatchDetectionRequest {
    pub node_id: String,
    pub detections: Vec<DetectionBody>,
}

#[derive(Debug, Serialize)]
pub struct DetectionResponse {
    pub id: i64,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_m: Option<f64>,
    pub accuracy_m: Option<f64>,
    pub detections: serde_json::Value,
    pub detection_count: i64,
    pub inference_time_ms: Option<f64>,
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queued: Option<bool>,
}

impl From<Detection> for DetectionResponse {
    fn from(d: Detection) -> Self {
        let detections = serde_json::from_str(&d.payload).unwrap_or(serde_json::Value::Null);
        Self {
            id: d.id,
            node_id: d.node,
            timestamp: d.timestamp,
            latitude: d.latitude,
            longitude: d.longitude,
            altitude_m: d.altitude_m,
            accuracy_m: d.accuracy_m,
            detections,
            detection_count: d.detection_count,
            inference_time_ms: d.inference_time_ms,
            model: d.model,
            created_at: Some(d.created_at),
            queued: None,
        }
    }
}

pub async fn handle_create_detection(
    State(state): State<AppState>,
    Json(req): Json<CreateDetectionRequest>,
) -> impl IntoResponse {
    let node = match state.registry.get(&req.node_id) {
        Ok(n) => n,
        Err(e) => return registry_error(e),
    };

    // A covert node's detections go to the retry queue for replay after
    // deactivation; everything else is stored immediately.
    if node.mode == NodeMode::Covert {
        let queued = QueuedDetection {
            timestamp: req.timestamp,
            latitude: req.location.latitude,
            longitude: req.location.longitude,
            altitude_m: req.location.altitude_m,
            accuracy_m: req.location.accuracy_m,
            detections: req.detections.clone(),
            detection_count: req.detection_count,
            inference_time_ms: req.inference_time_ms,
            model: req.model.clone(),
        };
        let payload = match serde_json::to_string(&queued) {
            Ok(p) => p,
            Err(e) => {
                return (StatusCode::BAD_REQUEST, format!("Invalid payload: {}", e))
                    .into_response()
            }
        };

        if let Err(e) = state.queue.enqueue(node.id, &payload) {
            return queue_error(e);
        }

        match state.queue.pending_count(node.id) {
            Ok(count) => {
                if let Err(e) = state.blackout.update_queued_count(&node.node_id, count) {
                    tracing::warn!("Failed to update queued count for {}: {}", node.node_id, e);
                }
            }
            Err(e) => tracing::warn!("Failed to count pending items for {}: {}", node.node_id, e),
        }

        return Json(DetectionResponse {
            id: 0,
            node_id: req.node_id,
            timestamp: req.timestamp,
            latitude: req.location.latitude,
            longitude: req.location.longitude,
            altitude_m: req.location.altitude_m,
            accuracy_m: req.location.accuracy_m,
            detections: req.detections,
            detection_count: req.detection_count,
            inference_time_ms: req.inference_time_ms,
            model: req.model,
            created_at: None,
            queued: Some(true),
        })
        .into_response();
    }

    let new_detection = NewDetection {
        node_id: node.id,
        timestamp: req.timestamp,
        latitude: req.location.latitude,
        longitude: req.location.longitude,
        altitude_m: req.location.altitude_m,
        accuracy_m: req.location.accuracy_m,
        payload: req.detections.to_string(),
        detection_count: req.detection_count,
        inference_time_ms: req.inference_time_ms,
        model: req.model.clone(),
    };

    let id = match state.store.add_detection(&new_detection) {
        Ok(id) => id,
        Err(e) => return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    };

    state.broadcaster.broadcast(&Event::Detection {
        node_id: node.node_id.clone(),
        detection_id: id,
        timestamp: req.timestamp,
        detection_count: req.detection_count,
        latitude: req.location.latitude,
        longitude: req.location.longitude,
    });

    Json(DetectionResponse {
        id,
        node_id: req.node_id,
        timestamp: req.timestamp,
        latitude: req.location.latitude,
        longitude: req.location.longitude,
        altitude_m: req.location.altitude_m,
        accuracy_m: req.location.accuracy_m,
        detections: req.detections,
        detection_count: req.detection_count,
        inference_time_ms: req.inference_time_ms,
        model: req.model,
        created_at: Some(Utc::now()),
        queued: None,
    })
    .into_response()
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub node_id: String,
    pub stored: usize,
}

pub async fn handle_batch_detections(
    State(state): State<AppState>,
    Json(req): Json<BatchDetectionRequest>,
) -> impl IntoResponse {
    let node = match state.registry.get(&req.node_id) {
        Ok(n) => n,
        Err(e) => return registry_error(e),
    };

    let new_detections: Vec<NewDetection> = req
        .detections
        .into_iter()
        .map(|d| NewDetection {
            node_id: node.id,
            timestamp: d.timestamp,
            latitude: d.location.latitude,
            longitude: d.location.longitude,
            altitude_m: d.location.altitude_m,
            accuracy_m: d.location.accuracy_m,
            payload: d.detections.to_string(),
            detection_count: d.detection_count,
            inference_time_ms: d.inference_time_ms,
            model: d.model,
        })
        .collect();

    let ids = match state.store.add_detections(&new_detections) {
        Ok(ids) => ids,
        Err(e) => return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    };

    tracing::info!(
        "Stored batch of {} detections for node {}",
        ids.len(),
        node.node_id
    );

    // One node_status event per batch, not one detection event per item;
    // a long replay would otherwise flood every observer.
    state.broadcaster.node_status(&node.node_id, node.mode);

    Json(BatchResponse {
        node_id: node.node_id,
        stored: ids.len(),
    })
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct DetectionsQuery {
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub offset: Option<i64>,
}

pub async fn handle_get_detections(
    State(state): State<AppState>,
    Query(query): Query<DetectionsQuery>,
) -> impl IntoResponse {
    let node_pk = match &query.node_id {
        Some(node_id) => match state.registry.get(node_id) {
            Ok(node) => Some(node.id),
            Err(e) => return registry_error(e),
        },
        None => None,
    };

    let start = query
        .start
        .as_ref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));
    let end = query
        .end
        .as_ref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));

    let detection_query = DetectionQuery {
        node_id: node_pk,
        start,
        end,
        limit: query.limit.unwrap_or(100).clamp(1, 1000),
        offset: query.offset.unwrap_or(0).max(0),
    };

    match state.store.get_detections(&detection_query) {
        Ok(detections) => {
            let detections: Vec<DetectionResponse> =
                detections.into_iter().map(DetectionResponse::from).collect();
            Json(detections).into_response()
        }
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

// ============================================================================
// API: Blackout
// ============================================================================

#[derive(Debug, Deserialize, Default)]
pub struct ActivateBlackoutRequest {
    #[serde(default)]
    pub operator_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BlackoutEventResponse {
    pub blackout_id: i64,
    pub node_id: String,
    pub activated_at: DateTime<Utc>,
    pub activated_by: Option<String>,
    pub reason: Option<String>,
    pub detections_queued: i64,
}

pub async fn handle_activate_blackout(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Json(req): Json<ActivateBlackoutRequest>,
) -> impl IntoResponse {
    match state
        .blackout
        .activate(&node_id, req.operator_id.as_deref(), req.reason.as_deref())
    {
        Ok(event) => Json(BlackoutEventResponse {
            blackout_id: event.id,
            node_id,
            activated_at: event.activated_at,
            activated_by: event.activated_by,
            reason: event.reason,
            detections_queued: event.detections_queued,
        })
        .into_response(),
        Err(e) => blackout_error(e),
    }
}

pub async fn handle_deactivate_blackout(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> impl IntoResponse {
    let node = match state.registry.get(&node_id) {
        Ok(n) => n,
        Err(e) => return registry_error(e),
    };

    let summary = match state.blackout.deactivate(&node_id) {
        Ok(s) => s,
        Err(e) => return blackout_error(e),
    };

    // Kick the backlog replay without holding up the response; the node is
    // `resuming` until completion is reported.
    let queue = state.queue.clone();
    let node_pk = node.id;
    let node_name = node.node_id.clone();
    tokio::spawn(async move {
        match queue.process_eligible(node_pk) {
            Ok(outcome) => tracing::info!(
                "Burst replay for node {}: {}/{} delivered",
                node_name,
                outcome.delivered,
                outcome.attempted
            ),
            Err(e) => tracing::error!("Burst replay sweep failed for node {}: {}", node_name, e),
        }
    });

    Json(summary).into_response()
}

#[derive(Debug, Deserialize)]
pub struct CompleteBlackoutRequest {
    pub transmitted_count: i64,
}

#[derive(Debug, Serialize)]
pub struct CompleteBlackoutResponse {
    pub node_id: String,
    pub blackout_id: i64,
    pub detections_transmitted: Option<i64>,
}

pub async fn handle_complete_blackout(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Json(req): Json<CompleteBlackoutRequest>,
) -> impl IntoResponse {
    match state
        .blackout
        .complete_resumption(&node_id, req.transmitted_count)
    {
        Ok(event) => Json(CompleteBlackoutResponse {
            node_id,
            blackout_id: event.id,
            detections_transmitted: event.detections_transmitted,
        })
        .into_response(),
        Err(e) => blackout_error(e),
    }
}

pub async fn handle_blackout_status(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> impl IntoResponse {
    match state.blackout.status(&node_id) {
        Ok(status) => Json(status).into_response(),
        Err(e) => blackout_error(e),
    }
}

// ============================================================================
// API: Queue
// ============================================================================

#[derive(Debug, Serialize)]
pub struct QueueItemResponse {
    pub id: i64,
    pub status: QueueStatus,
    pub retry_count: i64,
    pub created_at: DateTime<Utc>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub payload: serde_json::Value,
}

impl From<QueueItem> for QueueItemResponse {
    fn from(item: QueueItem) -> Self {
        let payload = serde_json::from_str(&item.payload).unwrap_or(serde_json::Value::Null);
        Self {
            id: item.id,
            status: item.status,
            retry_count: item.retry_count,
            created_at: item.created_at,
            next_attempt_at: item.next_attempt_at,
            payload,
        }
    }
}

pub async fn handle_node_queue(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
) -> impl IntoResponse {
    let node = match state.registry.get(&node_id) {
        Ok(n) => n,
        Err(e) => return registry_error(e),
    };

    match state.queue.pending_items(node.id) {
        Ok(items) => {
            let items: Vec<QueueItemResponse> =
                items.into_iter().map(QueueItemResponse::from).collect();
            Json(items).into_response()
        }
        Err(e) => queue_error(e),
    }
}

pub async fn handle_queue_stats(State(state): State<AppState>) -> impl IntoResponse {
    match state.queue.stats() {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => queue_error(e),
    }
}
