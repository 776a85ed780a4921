//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use super::models::*;

/// Timestamp format used for all stored datetimes. Lexicographic order on
/// this format matches chronological order, which the range queries rely on.
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
}

/// Outcome of a blackout activation attempt.
#[derive(Debug)]
pub enum ActivationOutcome {
    Activated(BlackoutEvent),
    /// The node was not `online`; no side effect occurred.
    WrongMode(NodeMode),
}

/// Outcome of a blackout close attempt.
#[derive(Debug)]
pub enum CloseOutcome {
    Closed(BlackoutEvent),
    /// The node was not `covert`; no side effect occurred.
    WrongMode(NodeMode),
    /// The node was `covert` but had no open event; no side effect occurred.
    NoOpenEvent,
}

/// Outcome of a resumption completion attempt.
#[derive(Debug)]
pub enum CompleteOutcome {
    Completed(BlackoutEvent),
    /// The node was not `resuming`; no side effect occurred.
    WrongMode(NodeMode),
    /// No closed event exists to record the transmitted count on.
    NoClosedEvent,
}

/// Filter for detection queries.
#[derive(Debug, Clone, Default)]
pub struct DetectionQuery {
    pub node_id: Option<i64>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: i64,
    pub offset: i64,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();

        // Run migrations inline (embedded SQL)
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;

        // Try to run subsequent migrations, ignoring "already exists" errors
        let _ = conn.execute_batch(include_str!("../../migrations/000002_queue_next_attempt.up.sql"));
        let _ = conn.execute_batch(include_str!("../../migrations/000003_blackout_audit_columns.up.sql"));

        Ok(())
    }

    // --- Nodes ---

    /// Register a node, or return the existing record unchanged.
    pub fn register_node(&self, node_id: &str) -> Result<Node, DbError> {
        let now = Utc::now();
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT OR IGNORE INTO nodes (node_id, mode, last_heartbeat, created_at) VALUES (?1, 'online', ?2, ?2)",
                params![node_id, fmt_time(now)],
            )?;
        }
        self.get_node(node_id)
    }

    /// Get a node by its opaque identifier.
    pub fn get_node(&self, node_id: &str) -> Result<Node, DbError> {
        let conn = self.conn.lock().unwrap();
        let node = conn
            .query_row(
                "SELECT id, node_id, mode, last_heartbeat, created_at FROM nodes WHERE node_id = ?1",
                params![node_id],
                node_from_row,
            )
            .optional()?;
        node.ok_or(DbError::NotFound)
    }

    /// Get a node by surrogate key.
    pub fn get_node_by_pk(&self, id: i64) -> Result<Node, DbError> {
        let conn = self.conn.lock().unwrap();
        let node = conn
            .query_row(
                "SELECT id, node_id, mode, last_heartbeat, created_at FROM nodes WHERE id = ?1",
                params![id],
                node_from_row,
            )
            .optional()?;
        node.ok_or(DbError::NotFound)
    }

    /// Get all nodes.
    pub fn get_nodes(&self) -> Result<Vec<Node>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, node_id, mode, last_heartbeat, created_at FROM nodes ORDER BY node_id",
        )?;
        let nodes = stmt
            .query_map([], node_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(nodes)
    }

    /// Update the heartbeat timestamp. Returns the node and whether it came
    /// back from `offline`.
    pub fn touch_heartbeat(&self, node_id: &str, now: DateTime<Utc>) -> Result<(Node, bool), DbError> {
        let came_online;
        {
            let conn = self.conn.lock().unwrap();
            let tx = conn.unchecked_transaction()?;
            let changed = tx.execute(
                "UPDATE nodes SET last_heartbeat = ?2 WHERE node_id = ?1",
                params![node_id, fmt_time(now)],
            )?;
            if changed == 0 {
                return Err(DbError::NotFound);
            }
            came_online = tx.execute(
                "UPDATE nodes SET mode = 'online' WHERE node_id = ?1 AND mode = 'offline'",
                params![node_id],
            )? > 0;
            tx.commit()?;
        }
        let node = self.get_node(node_id)?;
        Ok((node, came_online))
    }

    /// Flip `online` nodes with a stale heartbeat to `offline`. Returns the
    /// identifiers of the nodes that changed. covert/resuming are untouched.
    pub fn mark_stale_offline(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, DbError> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        let stale: Vec<String> = {
            let mut stmt = tx.prepare(
                "SELECT node_id FROM nodes
                 WHERE mode = 'online' AND last_heartbeat IS NOT NULL AND last_heartbeat < ?1",
            )?;
            let rows = stmt
                .query_map(params![fmt_time(cutoff)], |row| row.get(0))?
                .collect::<SqlResult<Vec<_>>>()?;
            rows
        };
        for node_id in &stale {
            tx.execute(
                "UPDATE nodes SET mode = 'offline' WHERE node_id = ?1 AND mode = 'online'",
                params![node_id],
            )?;
        }
        tx.commit()?;
        Ok(stale)
    }

    // --- Detections ---

    /// Store a single detection and return its ID.
    pub fn add_detection(&self, det: &NewDetection) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO detections (node_id, timestamp, latitude, longitude, altitude_m, accuracy_m,
                                     payload, detection_count, inference_time_ms, model, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                det.node_id,
                fmt_time(det.timestamp),
                det.latitude,
                det.longitude,
                det.altitude_m,
                det.accuracy_m,
                det.payload,
                det.detection_count,
                det.inference_time_ms,
                det.model,
                fmt_time(Utc::now()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Store a batch of detections in one transaction.
    pub fn add_detections(&self, dets: &[NewDetection]) -> Result<Vec<i64>, DbError> {
        if dets.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        let mut ids = Vec::with_capacity(dets.len());

        {
            let mut stmt = tx.prepare(
                "INSERT INTO detections (node_id, timestamp, latitude, longitude, altitude_m, accuracy_m,
                                         payload, detection_count, inference_time_ms, model, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;

            let now = fmt_time(Utc::now());
            for det in dets {
                stmt.execute(params![
                    det.node_id,
                    fmt_time(det.timestamp),
                    det.latitude,
                    det.longitude,
                    det.altitude_m,
                    det.accuracy_m,
                    det.payload,
                    det.detection_count,
                    det.inference_time_ms,
                    det.model,
                    now,
                ])?;
                ids.push(tx.last_insert_rowid());
            }
        }

        tx.commit()?;
        Ok(ids)
    }

    /// Query detections, newest first.
    pub fn get_detections(&self, query: &DetectionQuery) -> Result<Vec<Detection>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT d.id, d.node_id, n.node_id, d.timestamp, d.latitude, d.longitude,
                    d.altitude_m, d.accuracy_m, d.payload, d.detection_count,
                    d.inference_time_ms, d.model, d.created_at
             FROM detections d JOIN nodes n ON d.node_id = n.id
             WHERE (?1 IS NULL OR d.node_id = ?1)
               AND (?2 IS NULL OR d.timestamp >= ?2)
               AND (?3 IS NULL OR d.timestamp < ?3)
             ORDER BY d.timestamp DESC, d.id DESC
             LIMIT ?4 OFFSET ?5",
        )?;

        let detections = stmt
            .query_map(
                params![
                    query.node_id,
                    query.start.map(fmt_time),
                    query.end.map(fmt_time),
                    query.limit,
                    query.offset,
                ],
                detection_from_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(detections)
    }

    // --- Retry queue ---

    /// Insert a new pending queue item and return its ID.
    pub fn enqueue_item(&self, node_id: i64, payload: &str, now: DateTime<Utc>) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO queue_items (node_id, payload, status, retry_count, created_at)
             VALUES (?1, ?2, 'pending', 0, ?3)",
            params![node_id, payload, fmt_time(now)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Get a queue item by ID.
    pub fn get_queue_item(&self, item_id: i64) -> Result<QueueItem, DbError> {
        let conn = self.conn.lock().unwrap();
        let item = conn
            .query_row(
                "SELECT id, node_id, payload, status, retry_count, created_at, next_attempt_at, processed_at
                 FROM queue_items WHERE id = ?1",
                params![item_id],
                queue_item_from_row,
            )
            .optional()?;
        item.ok_or(DbError::NotFound)
    }

    /// All pending items for a node, oldest first. Creation time is the sort
    /// key, tie-broken by ID; replay ordering depends on this.
    pub fn pending_items(&self, node_id: i64) -> Result<Vec<QueueItem>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, node_id, payload, status, retry_count, created_at, next_attempt_at, processed_at
             FROM queue_items WHERE node_id = ?1 AND status = 'pending'
             ORDER BY created_at, id",
        )?;
        let items = stmt
            .query_map(params![node_id], queue_item_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(items)
    }

    /// Pending items whose next attempt is due, oldest first.
    pub fn eligible_items(&self, node_id: i64, now: DateTime<Utc>) -> Result<Vec<QueueItem>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, node_id, payload, status, retry_count, created_at, next_attempt_at, processed_at
             FROM queue_items
             WHERE node_id = ?1 AND status = 'pending'
               AND (next_attempt_at IS NULL OR next_attempt_at <= ?2)
             ORDER BY created_at, id",
        )?;
        let items = stmt
            .query_map(params![node_id, fmt_time(now)], queue_item_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(items)
    }

    /// Count of pending items for a node.
    pub fn pending_count(&self, node_id: i64) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM queue_items WHERE node_id = ?1 AND status = 'pending'",
            params![node_id],
            |r| r.get(0),
        )?)
    }

    /// Claim a pending item for processing. Returns false if another sweep
    /// claimed it first or it is no longer pending.
    pub fn claim_item(&self, item_id: i64) -> Result<bool, DbError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE queue_items SET status = 'processing' WHERE id = ?1 AND status = 'pending'",
            params![item_id],
        )?;
        Ok(changed == 1)
    }

    /// Mark an item completed. No-op for already-terminal items.
    pub fn complete_item(&self, item_id: i64, now: DateTime<Utc>) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE queue_items SET status = 'completed', processed_at = ?2
             WHERE id = ?1 AND status IN ('pending', 'processing')",
            params![item_id, fmt_time(now)],
        )?;
        Ok(())
    }

    /// Return an item to pending with an updated retry count and next
    /// attempt time. No-op for already-terminal items.
    pub fn requeue_item(
        &self,
        item_id: i64,
        retry_count: i64,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE queue_items SET status = 'pending', retry_count = ?2, next_attempt_at = ?3
             WHERE id = ?1 AND status IN ('pending', 'processing')",
            params![item_id, retry_count, fmt_time(next_attempt_at)],
        )?;
        Ok(())
    }

    /// Mark an item permanently failed. No-op for already-terminal items.
    pub fn fail_item(&self, item_id: i64, retry_count: i64, now: DateTime<Utc>) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE queue_items SET status = 'failed', retry_count = ?2, processed_at = ?3
             WHERE id = ?1 AND status IN ('pending', 'processing')",
            params![item_id, retry_count, fmt_time(now)],
        )?;
        Ok(())
    }

    /// Node surrogate keys that currently have pending items.
    pub fn nodes_with_pending(&self) -> Result<Vec<i64>, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT DISTINCT node_id FROM queue_items WHERE status = 'pending'")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(ids)
    }

    /// Queue item counts grouped by status.
    pub fn queue_stats(&self) -> Result<QueueStats, DbError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM queue_items GROUP BY status")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        let mut stats = QueueStats::default();
        for (status, count) in rows {
            match QueueStatus::parse(&status) {
                Some(QueueStatus::Pending) => stats.pending = count,
                Some(QueueStatus::Processing) => stats.processing = count,
                Some(QueueStatus::Completed) => stats.completed = count,
                Some(QueueStatus::Failed) => stats.failed = count,
                None => {}
            }
        }
        Ok(stats)
    }

    // --- Blackout events ---

    /// Atomically flip an `online` node to `covert` and open a blackout
    /// event. Check-and-set inside one transaction so concurrent activations
    /// cannot both succeed.
    pub fn begin_blackout(
        &self,
        node_id: &str,
        operator_id: Option<&str>,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ActivationOutcome, DbError> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;

        let node = tx
            .query_row(
                "SELECT id, node_id, mode, last_heartbeat, created_at FROM nodes WHERE node_id = ?1",
                params![node_id],
                node_from_row,
            )
            .optional()?
            .ok_or(DbError::NotFound)?;

        let changed = tx.execute(
            "UPDATE nodes SET mode = 'covert' WHERE id = ?1 AND mode = 'online'",
            params![node.id],
        )?;
        if changed == 0 {
            return Ok(ActivationOutcome::WrongMode(node.mode));
        }

        tx.execute(
            "INSERT INTO blackout_events (node_id, activated_at, activated_by, reason, detections_queued)
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![node.id, fmt_time(now), operator_id, reason],
        )?;
        let event_id = tx.last_insert_rowid();

        let event = tx.query_row(
            "SELECT id, node_id, activated_at, deactivated_at, activated_by, reason,
                    detections_queued, duration_seconds, detections_transmitted, auto_recovered
             FROM blackout_events WHERE id = ?1",
            params![event_id],
            event_from_row,
        )?;

        tx.commit()?;
        Ok(ActivationOutcome::Activated(event))
    }

    /// Atomically flip a `covert` node to `resuming` and close its open
    /// blackout event, recording the episode duration.
    pub fn close_blackout(&self, node_id: &str, now: DateTime<Utc>) -> Result<CloseOutcome, DbError> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;

        let node = tx
            .query_row(
                "SELECT id, node_id, mode, last_heartbeat, created_at FROM nodes WHERE node_id = ?1",
                params![node_id],
                node_from_row,
            )
            .optional()?
            .ok_or(DbError::NotFound)?;

        let changed = tx.execute(
            "UPDATE nodes SET mode = 'resuming' WHERE id = ?1 AND mode = 'covert'",
            params![node.id],
        )?;
        if changed == 0 {
            return Ok(CloseOutcome::WrongMode(node.mode));
        }

        let open = tx
            .query_row(
                "SELECT id, node_id, activated_at, deactivated_at, activated_by, reason,
                        detections_queued, duration_seconds, detections_transmitted, auto_recovered
                 FROM blackout_events WHERE node_id = ?1 AND deactivated_at IS NULL
                 ORDER BY activated_at DESC, id DESC",
                params![node.id],
                event_from_row,
            )
            .optional()?;

        let Some(open) = open else {
            // Dropping the transaction rolls back the mode flip.
            return Ok(CloseOutcome::NoOpenEvent);
        };

        let duration = (now - open.activated_at).num_seconds();
        tx.execute(
            "UPDATE blackout_events SET deactivated_at = ?2, duration_seconds = ?3 WHERE id = ?1",
            params![open.id, fmt_time(now), duration],
        )?;

        let event = tx.query_row(
            "SELECT id, node_id, activated_at, deactivated_at, activated_by, reason,
                    detections_queued, duration_seconds, detections_transmitted, auto_recovered
             FROM blackout_events WHERE id = ?1",
            params![open.id],
            event_from_row,
        )?;

        tx.commit()?;
        Ok(CloseOutcome::Closed(event))
    }

    /// Record the queued-detection count on the open event. No-op unless the
    /// node is currently `covert`.
    pub fn set_queued_count(&self, node_id: &str, count: i64) -> Result<(), DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE blackout_events SET detections_queued = ?2
             WHERE deactivated_at IS NULL
               AND node_id = (SELECT id FROM nodes WHERE node_id = ?1 AND mode = 'covert')",
            params![node_id, count],
        )?;
        Ok(())
    }

    /// Atomically flip a `resuming` node to `online` and record the
    /// transmitted count on the most recently closed event.
    pub fn finish_resumption(
        &self,
        node_id: &str,
        transmitted: i64,
    ) -> Result<CompleteOutcome, DbError> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;

        let node = tx
            .query_row(
                "SELECT id, node_id, mode, last_heartbeat, created_at FROM nodes WHERE node_id = ?1",
                params![node_id],
                node_from_row,
            )
            .optional()?
            .ok_or(DbError::NotFound)?;

        let changed = tx.execute(
            "UPDATE nodes SET mode = 'online' WHERE id = ?1 AND mode = 'resuming'",
            params![node.id],
        )?;
        if changed == 0 {
            return Ok(CompleteOutcome::WrongMode(node.mode));
        }

        let closed = tx
            .query_row(
                "SELECT id, node_id, activated_at, deactivated_at, activated_by, reason,
                        detections_queued, duration_seconds, detections_transmitted, auto_recovered
                 FROM blackout_events WHERE node_id = ?1 AND deactivated_at IS NOT NULL
                 ORDER BY deactivated_at DESC, id DESC LIMIT 1",
                params![node.id],
                event_from_row,
            )
            .optional()?;

        let Some(closed) = closed else {
            return Ok(CompleteOutcome::NoClosedEvent);
        };

        tx.execute(
            "UPDATE blackout_events SET detections_transmitted = ?2 WHERE id = ?1",
            params![closed.id, transmitted],
        )?;

        let event = tx.query_row(
            "SELECT id, node_id, activated_at, deactivated_at, activated_by, reason,
                    detections_queued, duration_seconds, detections_transmitted, auto_recovered
             FROM blackout_events WHERE id = ?1",
            params![closed.id],
            event_from_row,
        )?;

        tx.commit()?;
        Ok(CompleteOutcome::Completed(event))
    }

    /// The open blackout event for a node, if any.
    pub fn open_event(&self, node_pk: i64) -> Result<Option<BlackoutEvent>, DbError> {
        let conn = self.conn.lock().unwrap();
        let event = conn
            .query_row(
                "SELECT id, node_id, activated_at, deactivated_at, activated_by, reason,
                        detections_queued, duration_seconds, detections_transmitted, auto_recovered
                 FROM blackout_events WHERE node_id = ?1 AND deactivated_at IS NULL
                 ORDER BY activated_at DESC, id DESC",
                params![node_pk],
                event_from_row,
            )
            .optional()?;
        Ok(event)
    }

    /// The most recently closed blackout event for a node, if any.
    pub fn latest_closed_event(&self, node_pk: i64) -> Result<Option<BlackoutEvent>, DbError> {
        let conn = self.conn.lock().unwrap();
        let event = conn
            .query_row(
                "SELECT id, node_id, activated_at, deactivated_at, activated_by, reason,
                        detections_queued, duration_seconds, detections_transmitted, auto_recovered
                 FROM blackout_events WHERE node_id = ?1 AND deactivated_at IS NOT NULL
                 ORDER BY deactivated_at DESC, id DESC LIMIT 1",
                params![node_pk],
                event_from_row,
            )
            .optional()?;
        Ok(event)
    }

    /// Force nodes stuck in `resuming` back to `online`. A node qualifies
    /// when its latest closed event was deactivated before `cutoff`. The
    /// event is flagged `auto_recovered` to keep the audit log honest.
    pub fn recover_stuck_resuming(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<RecoveredNode>, DbError> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;

        let candidates: Vec<(i64, String, i64, DateTime<Utc>)> = {
            let mut stmt = tx.prepare(
                "SELECT n.id, n.node_id, e.id, e.deactivated_at
                 FROM nodes n JOIN blackout_events e ON e.node_id = n.id
                 WHERE n.mode = 'resuming'
                   AND e.deactivated_at IS NOT NULL
                   AND e.deactivated_at < ?1
                   AND e.id = (SELECT id FROM blackout_events
                               WHERE node_id = n.id AND deactivated_at IS NOT NULL
                               ORDER BY deactivated_at DESC, id DESC LIMIT 1)",
            )?;
            let rows = stmt
                .query_map(params![fmt_time(cutoff)], |row| {
                    let deactivated: String = row.get(3)?;
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        parse_db_time(&deactivated).unwrap_or_else(Utc::now),
                    ))
                })?
                .collect::<SqlResult<Vec<_>>>()?;
            rows
        };

        let mut recovered = Vec::new();
        for (node_pk, node_id, event_id, deactivated_at) in candidates {
            let changed = tx.execute(
                "UPDATE nodes SET mode = 'online' WHERE id = ?1 AND mode = 'resuming'",
                params![node_pk],
            )?;
            if changed == 0 {
                continue;
            }
            tx.execute(
                "UPDATE blackout_events SET auto_recovered = 1 WHERE id = ?1",
                params![event_id],
            )?;
            recovered.push(RecoveredNode {
                node_id,
                event_id,
                deactivated_at,
                stuck_seconds: (now - deactivated_at).num_seconds(),
            });
        }

        tx.commit()?;
        Ok(recovered)
    }
}

/// Format a datetime for storage.
fn fmt_time(t: DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    // Try various formats
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.9fZ",
        "%Y-%m-%dT%H:%M:%SZ",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    // Try ISO 8601
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}

fn opt_time(value: Option<String>) -> Option<DateTime<Utc>> {
    value.and_then(|s| parse_db_time(&s))
}

fn node_from_row(row: &rusqlite::Row<'_>) -> SqlResult<Node> {
    let mode_str: String = row.get(2)?;
    let mode = NodeMode::parse(&mode_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown node mode: {}", mode_str).into(),
        )
    })?;
    let heartbeat: Option<String> = row.get(3)?;
    let created: String = row.get(4)?;
    Ok(Node {
        id: row.get(0)?,
        node_id: row.get(1)?,
        mode,
        last_heartbeat: opt_time(heartbeat),
        created_at: parse_db_time(&created).unwrap_or_else(Utc::now),
    })
}

fn detection_from_row(row: &rusqlite::Row<'_>) -> SqlResult<Detection> {
    let timestamp: String = row.get(3)?;
    let created: String = row.get(12)?;
    Ok(Detection {
        id: row.get(0)?,
        node_id: row.get(1)?,
        node: row.get(2)?,
        timestamp: parse_db_time(&timestamp).unwrap_or_else(Utc::now),
        latitude: row.get(4)?,
        longitude: row.get(5)?,
        altitude_m: row.get(6)?,
        accuracy_m: row.get(7)?,
        payload: row.get(8)?,
        detection_count: row.get(9)?,
        inference_time_ms: row.get(10)?,
        model: row.get(11)?,
        created_at: parse_db_time(&created).unwrap_or_else(Utc::now),
    })
}

fn queue_item_from_row(row: &rusqlite::Row<'_>) -> SqlResult<QueueItem> {
    let status_str: String = row.get(3)?;
    let status = QueueStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Text,
            format!("unknown queue status: {}", status_str).into(),
        )
    })?;
    let created: String = row.get(5)?;
    let next_attempt: Option<String> = row.get(6)?;
    let processed: Option<String> = row.get(7)?;
    Ok(QueueItem {
        id: row.get(0)?,
        node_id: row.get(1)?,
        payload: row.get(2)?,
        status,
        retry_count: row.get(4)?,
        created_at: parse_db_time(&created).unwrap_or_else(Utc::now),
        next_attempt_at: opt_time(next_attempt),
        processed_at: opt_time(processed),
    })
}

fn event_from_row(row: &rusqlite::Row<'_>) -> SqlResult<BlackoutEvent> {
    let activated: String = row.get(2)?;
    let deactivated: Option<String> = row.get(3)?;
    let auto_recovered: i64 = row.get(9)?;
    Ok(BlackoutEvent {
        id: row.get(0)?,
        node_id: row.get(1)?,
        activated_at: parse_db_time(&activated).unwrap_or_else(Utc::now),
        deactivated_at: opt_time(deactivated),
        activated_by: row.get(4)?,
        reason: row.get(5)?,
        detections_queued: row.get(6)?,
        duration_seconds: row.get(7)?,
        detections_transmitted: row.get(8)?,
        auto_recovered: auto_recovered != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn test_store() -> (Store, NamedTempFile) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        (store, tmp)
    }

    #[test]
    fn test_register_node_idempotent() {
        let (store, _tmp) = test_store();

        let first = store.register_node("sentry-01").unwrap();
        assert_eq!(first.node_id, "sentry-01");
        assert_eq!(first.mode, NodeMode::Online);

        let second = store.register_node("sentry-01").unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.created_at, first.created_at);
    }

    #[test]
    fn test_detection_timestamp_roundtrip() {
        let (store, _tmp) = test_store();
        let node = store.register_node("sentry-01").unwrap();

        let captured = Utc::now() - chrono::Duration::hours(3);
        let id = store
            .add_detection(&NewDetection {
                node_id: node.id,
                timestamp: captured,
                latitude: 59.33,
                longitude: 18.06,
                altitude_m: Some(12.5),
                accuracy_m: None,
                payload: r#"[{"class":"person","confidence":0.91}]"#.to_string(),
                detection_count: 1,
                inference_time_ms: Some(42.0),
                model: Some("yolo".to_string()),
            })
            .unwrap();
        assert!(id > 0);

        let stored = store
            .get_detections(&DetectionQuery {
                node_id: Some(node.id),
                limit: 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(stored.len(), 1);
        // Capture time survives storage; it must not become ingestion time.
        assert_eq!(stored[0].timestamp, captured);
        assert!(stored[0].created_at > captured);
        assert_eq!(stored[0].node, "sentry-01");
    }

    #[test]
    fn test_open_event_unique_per_node() {
        let (store, _tmp) = test_store();
        let node = store.register_node("sentry-01").unwrap();

        let outcome = store
            .begin_blackout("sentry-01", None, None, Utc::now())
            .unwrap();
        assert!(matches!(outcome, ActivationOutcome::Activated(_)));

        // The partial unique index rejects a second open event even when
        // inserted directly, bypassing the state machine.
        let conn = store.conn.lock().unwrap();
        let result = conn.execute(
            "INSERT INTO blackout_events (node_id, activated_at, detections_queued) VALUES (?1, ?2, 0)",
            params![node.id, fmt_time(Utc::now())],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_claim_item_exactly_once() {
        let (store, _tmp) = test_store();
        let node = store.register_node("sentry-01").unwrap();

        let id = store.enqueue_item(node.id, "{}", Utc::now()).unwrap();
        assert!(store.claim_item(id).unwrap());
        assert!(!store.claim_item(id).unwrap());
    }

    #[test]
    fn test_pending_order_ties_broken_by_id() {
        let (store, _tmp) = test_store();
        let node = store.register_node("sentry-01").unwrap();

        let now = Utc::now();
        let a = store.enqueue_item(node.id, "a", now).unwrap();
        let b = store.enqueue_item(node.id, "b", now).unwrap();
        let c = store.enqueue_item(node.id, "c", now).unwrap();

        let pending = store.pending_items(node.id).unwrap();
        let ids: Vec<i64> = pending.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![a, b, c]);
    }

    #[test]
    fn test_close_without_open_event_rolls_back() {
        let (store, _tmp) = test_store();
        let node = store.register_node("sentry-01").unwrap();

        store
            .begin_blackout("sentry-01", None, None, Utc::now())
            .unwrap();
        // Close the event behind the state machine's back, leaving the node
        // covert with no open event.
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "UPDATE blackout_events SET deactivated_at = ?2 WHERE node_id = ?1",
                params![node.id, fmt_time(Utc::now())],
            )
            .unwrap();
        }

        let outcome = store.close_blackout("sentry-01", Utc::now()).unwrap();
        assert!(matches!(outcome, CloseOutcome::NoOpenEvent));
        // The mode flip must have been rolled back.
        assert_eq!(store.get_node("sentry-01").unwrap().mode, NodeMode::Covert);
    }

    #[test]
    fn test_stale_heartbeat_goes_offline() {
        let (store, _tmp) = test_store();
        store.register_node("sentry-01").unwrap();

        let past = Utc::now() - chrono::Duration::minutes(30);
        store.touch_heartbeat("sentry-01", past).unwrap();

        let flipped = store
            .mark_stale_offline(Utc::now() - chrono::Duration::minutes(5))
            .unwrap();
        assert_eq!(flipped, vec!["sentry-01".to_string()]);
        assert_eq!(store.get_node("sentry-01").unwrap().mode, NodeMode::Offline);

        let (node, came_online) = store.touch_heartbeat("sentry-01", Utc::now()).unwrap();
        assert!(came_online);
        assert_eq!(node.mode, NodeMode::Online);
    }
}
