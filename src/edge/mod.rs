//! Edge-side durable buffer for detections captured while the node is
//! covert or network-denied.
//!
//! Lives on the sensor node itself, in its own SQLite file, so the backlog
//! survives a process restart. Replayed in insertion order on command.

mod burst;

pub use burst::*;

use crate::db::DbError;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Result as SqlResult};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// A detection held in the local buffer.
#[derive(Debug, Clone)]
pub struct BufferedDetection {
    pub id: i64,
    pub queued_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

/// Durable node-local detection buffer.
#[derive(Clone)]
pub struct LocalBuffer {
    conn: Arc<Mutex<Connection>>,
}

impl LocalBuffer {
    /// Open (or create) a buffer at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS buffered_detections (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queued_at TEXT NOT NULL,
                payload TEXT NOT NULL
            )",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Append a detection to the buffer.
    pub fn enqueue_locally(&self, payload: &serde_json::Value) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO buffered_detections (queued_at, payload) VALUES (?1, ?2)",
            params![Utc::now().to_rfc3339(), payload.to_string()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Remove and return every buffered detection, oldest first. The read
    /// and the delete happen in one transaction so nothing is lost between
    /// them.
    pub fn drain_all(&self) -> Result<Vec<BufferedDetection>, DbError> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;

        let detections = {
            let mut stmt = tx.prepare(
                "SELECT id, queued_at, payload FROM buffered_detections ORDER BY id",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    let queued_at: String = row.get(1)?;
                    let payload: String = row.get(2)?;
                    Ok(BufferedDetection {
                        id: row.get(0)?,
                        queued_at: DateTime::parse_from_rfc3339(&queued_at)
                            .map(|t| t.with_timezone(&Utc))
                            .unwrap_or_else(|_| Utc::now()),
                        payload: serde_json::from_str(&payload)
                            .unwrap_or(serde_json::Value::Null),
                    })
                })?
                .collect::<SqlResult<Vec<_>>>()?;
            rows
        };

        tx.execute("DELETE FROM buffered_detections", [])?;
        tx.commit()?;

        Ok(detections)
    }

    /// Number of buffered detections.
    pub fn len(&self) -> Result<i64, DbError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row("SELECT COUNT(*) FROM buffered_detections", [], |r| r.get(0))?)
    }

    pub fn is_empty(&self) -> Result<bool, DbError> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_drain_returns_insertion_order() {
        let tmp = NamedTempFile::new().unwrap();
        let buffer = LocalBuffer::open(tmp.path()).unwrap();

        for i in 0..3 {
            buffer
                .enqueue_locally(&serde_json::json!({"seq": i}))
                .unwrap();
        }
        assert_eq!(buffer.len().unwrap(), 3);

        let drained = buffer.drain_all().unwrap();
        let seqs: Vec<i64> = drained
            .iter()
            .map(|d| d.payload["seq"].as_i64().unwrap())
            .collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert!(buffer.is_empty().unwrap());
    }

    #[test]
    fn test_buffer_survives_reopen() {
        let tmp = NamedTempFile::new().unwrap();

        {
            let buffer = LocalBuffer::open(tmp.path()).unwrap();
            buffer
                .enqueue_locally(&serde_json::json!({"class": "vehicle"}))
                .unwrap();
        }

        let reopened = LocalBuffer::open(tmp.path()).unwrap();
        let drained = reopened.drain_all().unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].payload["class"], "vehicle");
    }

    #[test]
    fn test_drain_empty_buffer() {
        let tmp = NamedTempFile::new().unwrap();
        let buffer = LocalBuffer::open(tmp.path()).unwrap();
        assert!(buffer.drain_all().unwrap().is_empty());
    }
}
