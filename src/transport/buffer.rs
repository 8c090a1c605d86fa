//! Durable store-and-forward buffer.
//!
//! Messages that no transport accepted are persisted in SQLite keyed by
//! `msg_id` and replayed later in `priority DESC, created_at ASC` order. A
//! record leaves the replay set when it is acknowledged, when its deadline
//! passes, or when its retry budget is spent.
//!
//! # Concurrency
//! The single connection lives behind a mutex and every statement runs on
//! the blocking pool, so writes are serialized without stalling the runtime.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use super::router::{DeliveryOutcome, TransportRouter};
use super::TransportMessage;
use crate::metrics;

/// Default time a buffered message stays eligible for replay.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);

/// Default number of records pulled per replay pass.
pub const DEFAULT_BATCH_SIZE: usize = 100;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS buffered_messages (
    msg_id          TEXT PRIMARY KEY,
    created_at      INTEGER NOT NULL,
    priority        INTEGER NOT NULL,
    transport_tried TEXT,
    payload         TEXT NOT NULL,
    checksum        TEXT NOT NULL,
    ack_received    INTEGER NOT NULL DEFAULT 0,
    retry_count     INTEGER NOT NULL DEFAULT 0,
    max_retries     INTEGER NOT NULL,
    deadline_ts     INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_buffered_replay
    ON buffered_messages (ack_received, priority DESC, created_at ASC);
";

const COLUMNS: &str = "msg_id, created_at, priority, transport_tried, payload, checksum, \
                       ack_received, retry_count, max_retries, deadline_ts";

const ELIGIBLE: &str =
    "ack_received = 0 AND deadline_ts > ?1 AND retry_count < max_retries";

#[derive(Error, Debug)]
pub enum BufferError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to encode message: {0}")]
    Encode(#[from] super::TransportError),

    #[error("Buffer task failed: {0}")]
    Task(String),
}

/// One persisted row.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedMessageRecord {
    pub msg_id: String,
    pub created_at: DateTime<Utc>,
    pub priority: i32,
    pub transport_tried: Option<String>,
    /// Full encoded `TransportMessage`
    pub payload: String,
    pub checksum: String,
    pub ack_received: bool,
    pub retry_count: u32,
    pub max_retries: u32,
    pub deadline_ts: DateTime<Utc>,
}

impl BufferedMessageRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            msg_id: row.get(0)?,
            created_at: from_millis(row.get(1)?),
            priority: row.get(2)?,
            transport_tried: row.get(3)?,
            payload: row.get(4)?,
            checksum: row.get(5)?,
            ack_received: row.get(6)?,
            retry_count: row.get(7)?,
            max_retries: row.get(8)?,
            deadline_ts: from_millis(row.get(9)?),
        })
    }

    /// Decode the stored message, rejecting it if the checksum no longer matches.
    pub fn message(&self) -> Result<TransportMessage, super::TransportError> {
        let mut message = TransportMessage::decode_verified(self.payload.as_bytes())?;
        message.retry_count = self.retry_count;
        Ok(message)
    }
}

/// Row counts by replay eligibility.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct BufferStats {
    pub total: u64,
    pub pending: u64,
    pub acknowledged: u64,
    pub expired: u64,
    pub exhausted: u64,
}

/// Result of one replay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub selected: usize,
    pub delivered: usize,
    pub rebuffered: usize,
    /// Records removed because their stored copy failed integrity checks
    pub dropped: usize,
}

pub struct MessageBuffer {
    conn: Arc<Mutex<Connection>>,
    ttl: Duration,
    batch_size: usize,
}

impl MessageBuffer {
    /// Open (or create) the buffer database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BufferError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    /// Private in-memory buffer, for tests and dry runs.
    pub fn in_memory() -> Result<Self, BufferError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, BufferError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            ttl: DEFAULT_TTL,
            batch_size: DEFAULT_BATCH_SIZE,
        })
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, BufferError>
    where
        F: FnOnce(&mut Connection) -> Result<T, BufferError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            // Handle mutex poisoning gracefully
            let mut guard = conn.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut guard)
        })
        .await
        .map_err(|e| BufferError::Task(e.to_string()))?
    }

    /// Upsert `message` with a deadline of now + TTL.
    pub async fn buffer(
        &self,
        message: &TransportMessage,
        transport_tried: Option<&str>,
    ) -> Result<(), BufferError> {
        let now = Utc::now();
        let deadline = chrono::Duration::from_std(self.ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.buffer_with_deadline(message, transport_tried, deadline)
            .await
    }

    /// Upsert with an explicit deadline.
    ///
    /// A second insert of the same `msg_id` keeps the original `created_at`
    /// and deadline and refreshes the payload and retry count.
    pub async fn buffer_with_deadline(
        &self,
        message: &TransportMessage,
        transport_tried: Option<&str>,
        deadline: DateTime<Utc>,
    ) -> Result<(), BufferError> {
        let payload = String::from_utf8_lossy(&message.encode()?).into_owned();
        let msg_id = message.msg_id.clone();
        let checksum = message.checksum.clone();
        let priority = message.priority;
        let retry_count = message.retry_count;
        let max_retries = message.max_retries;
        let tried = transport_tried.map(str::to_string);
        let now = Utc::now().timestamp_millis();
        let deadline = deadline.timestamp_millis();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO buffered_messages
                    (msg_id, created_at, priority, transport_tried, payload, checksum,
                     ack_received, retry_count, max_retries, deadline_ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?8, ?9)
                 ON CONFLICT(msg_id) DO UPDATE SET
                    transport_tried = excluded.transport_tried,
                    payload = excluded.payload,
                    checksum = excluded.checksum,
                    retry_count = MAX(retry_count, excluded.retry_count),
                    max_retries = excluded.max_retries",
                params![msg_id, now, priority, tried, payload, checksum, retry_count, max_retries, deadline],
            )?;
            Ok(())
        })
        .await?;

        metrics::record_buffered(&message.msg_type);
        debug!(msg_id = %message.msg_id, priority = message.priority, "Message buffered");
        Ok(())
    }

    /// Stop replaying `msg_id`. Returns `false` if no unacknowledged row matched.
    pub async fn mark_acknowledged(&self, msg_id: &str) -> Result<bool, BufferError> {
        let msg_id = msg_id.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE buffered_messages SET ack_received = 1
                 WHERE msg_id = ?1 AND ack_received = 0",
                params![msg_id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    pub async fn get(&self, msg_id: &str) -> Result<Option<BufferedMessageRecord>, BufferError> {
        let msg_id = msg_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {} FROM buffered_messages WHERE msg_id = ?1", COLUMNS);
            Ok(conn
                .query_row(&sql, params![msg_id], BufferedMessageRecord::from_row)
                .optional()?)
        })
        .await
    }

    /// Replay-eligible records in replay order, without claiming them.
    pub async fn pending(&self, limit: usize) -> Result<Vec<BufferedMessageRecord>, BufferError> {
        let now = Utc::now().timestamp_millis();
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM buffered_messages WHERE {}
                 ORDER BY priority DESC, created_at ASC, rowid ASC LIMIT ?2",
                COLUMNS, ELIGIBLE
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params![now, limit as i64], BufferedMessageRecord::from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
    }

    /// Select a batch and bump each row's `retry_count` in one transaction.
    async fn claim_batch(&self) -> Result<Vec<BufferedMessageRecord>, BufferError> {
        let now = Utc::now().timestamp_millis();
        let limit = self.batch_size as i64;
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let batch = {
                let sql = format!(
                    "SELECT {} FROM buffered_messages WHERE {}
                     ORDER BY priority DESC, created_at ASC, rowid ASC LIMIT ?2",
                    COLUMNS, ELIGIBLE
                );
                let mut stmt = tx.prepare(&sql)?;
                let mut rows = stmt
                    .query_map(params![now, limit], BufferedMessageRecord::from_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                for row in &mut rows {
                    row.retry_count += 1;
                }
                rows
            };
            for row in &batch {
                tx.execute(
                    "UPDATE buffered_messages SET retry_count = ?2 WHERE msg_id = ?1",
                    params![row.msg_id, row.retry_count],
                )?;
            }
            tx.commit()?;
            Ok(batch)
        })
        .await
    }

    async fn delete(&self, msg_id: &str) -> Result<(), BufferError> {
        let msg_id = msg_id.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM buffered_messages WHERE msg_id = ?1", params![msg_id])?;
            Ok(())
        })
        .await
    }

    /// Resubmit one batch through `router`.
    ///
    /// Each selected record is attempted exactly once per pass. A record that
    /// fails again is re-buffered by the router with its incremented retry
    /// count and is not retried within the same pass.
    pub async fn replay(&self, router: &TransportRouter) -> Result<ReplayReport, BufferError> {
        let batch = self.claim_batch().await?;
        let mut report = ReplayReport {
            selected: batch.len(),
            ..ReplayReport::default()
        };

        for record in batch {
            let message = match record.message() {
                Ok(message) => message,
                Err(e) => {
                    warn!(msg_id = %record.msg_id, error = %e, "Dropping corrupt buffered message");
                    self.delete(&record.msg_id).await?;
                    metrics::record_replay("dropped");
                    report.dropped += 1;
                    continue;
                }
            };

            match router.send_with_failover(&message).await? {
                DeliveryOutcome::Delivered(transport) => {
                    debug!(msg_id = %message.msg_id, transport = %transport, "Replayed message delivered");
                    metrics::record_replay("delivered");
                    report.delivered += 1;
                }
                DeliveryOutcome::Buffered => {
                    metrics::record_replay("rebuffered");
                    report.rebuffered += 1;
                }
            }
        }

        if report.selected > 0 {
            debug!(
                selected = report.selected,
                delivered = report.delivered,
                rebuffered = report.rebuffered,
                dropped = report.dropped,
                "Replay pass complete"
            );
        }
        Ok(report)
    }

    /// Delete acknowledged, expired and retry-exhausted rows.
    pub async fn purge(&self) -> Result<usize, BufferError> {
        let now = Utc::now().timestamp_millis();
        let removed = self
            .with_conn(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM buffered_messages
                     WHERE ack_received = 1 OR deadline_ts <= ?1 OR retry_count >= max_retries",
                    params![now],
                )?)
            })
            .await?;
        if removed > 0 {
            debug!(removed, "Purged buffered messages");
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<BufferStats, BufferError> {
        let now = Utc::now().timestamp_millis();
        self.with_conn(move |conn| {
            let stats = conn.query_row(
                "SELECT
                    COUNT(*),
                    COALESCE(SUM(CASE WHEN ack_received = 0 AND deadline_ts > ?1
                                       AND retry_count < max_retries THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN ack_received = 1 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN ack_received = 0 AND deadline_ts <= ?1 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN ack_received = 0 AND deadline_ts > ?1
                                       AND retry_count >= max_retries THEN 1 ELSE 0 END), 0)
                 FROM buffered_messages",
                params![now],
                |row| {
                    Ok(BufferStats {
                        total: row.get::<_, i64>(0)? as u64,
                        pending: row.get::<_, i64>(1)? as u64,
                        acknowledged: row.get::<_, i64>(2)? as u64,
                        expired: row.get::<_, i64>(3)? as u64,
                        exhausted: row.get::<_, i64>(4)? as u64,
                    })
                },
            )?;
            Ok(stats)
        })
        .await
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
