//! Durable FIFO of pending mutating operations, stored in SQLite.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::action::{ActionHandler, SyncAction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
  Pending,
  Completed,
  Failed,
}

impl SyncStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::Completed => "completed",
      Self::Failed => "failed",
    }
  }

  fn parse(s: &str) -> Result<Self> {
    match s {
      "pending" => Ok(Self::Pending),
      "completed" => Ok(Self::Completed),
      "failed" => Ok(Self::Failed),
      other => Err(eyre!("Unknown sync status '{}'", other)),
    }
  }
}

impl std::fmt::Display for SyncStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// One queued operation. Items are never deleted; they stay as an audit trail.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncQueueItem {
  pub id: i64,
  pub action: SyncAction,
  pub timestamp: DateTime<Utc>,
  pub status: SyncStatus,
  pub error: Option<String>,
  /// Number of times the action has been executed
  pub attempts: u32,
}

/// Summary of one drain pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
  pub completed: Vec<i64>,
  pub failed: Vec<(i64, String)>,
  /// Items not due in this pass (completed, or failed without retry)
  pub skipped: usize,
}

impl DrainReport {
  pub fn processed(&self) -> usize {
    self.completed.len() + self.failed.len()
  }
}

pub struct SyncQueue {
  conn: Mutex<Connection>,
  retry_failed: bool,
}

impl SyncQueue {
  /// Open (or create) the queue database at `path` and run migrations.
  pub fn open(path: &Path, retry_failed: bool) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create queue directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open queue database at {}: {}", path.display(), e))?;

    Self::with_connection(conn, retry_failed)
  }

  #[cfg(test)]
  pub fn open_in_memory(retry_failed: bool) -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory queue database: {}", e))?;
    Self::with_connection(conn, retry_failed)
  }

  fn with_connection(conn: Connection, retry_failed: bool) -> Result<Self> {
    let queue = Self {
      conn: Mutex::new(conn),
      retry_failed,
    };
    queue.migrate()?;
    Ok(queue)
  }

  /// Create the queue table if absent. Safe to call repeatedly.
  pub fn migrate(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(QUEUE_SCHEMA)
      .map_err(|e| eyre!("Failed to run queue migrations: {}", e))
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Append a pending item and return its id.
  pub fn enqueue(&self, action: &SyncAction) -> Result<i64> {
    let data = serde_json::to_string(action.data())
      .map_err(|e| eyre!("Failed to serialize action data: {}", e))?;
    let conn = self.lock()?;

    conn
      .execute(
        "INSERT INTO sync_queue (action_type, data, timestamp, status)
         VALUES (?, ?, ?, ?)",
        params![
          action.kind(),
          data,
          Utc::now().to_rfc3339(),
          SyncStatus::Pending.as_str()
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue {} action: {}", action.kind(), e))?;

    let id = conn.last_insert_rowid();
    info!(id, kind = action.kind(), "Queued action");
    Ok(id)
  }

  /// All items in insertion order.
  pub fn items(&self) -> Result<Vec<SyncQueueItem>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, action_type, data, timestamp, status, error, attempts
         FROM sync_queue ORDER BY id",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], RawItem::from_row)
      .map_err(|e| eyre!("Failed to scan sync queue: {}", e))?
      .collect::<rusqlite::Result<Vec<RawItem>>>()
      .map_err(|e| eyre!("Failed to read sync queue item: {}", e))?;

    rows.into_iter().map(RawItem::into_item).collect()
  }

  pub fn get(&self, id: i64) -> Result<Option<SyncQueueItem>> {
    let raw = self
      .lock()?
      .query_row(
        "SELECT id, action_type, data, timestamp, status, error, attempts
         FROM sync_queue WHERE id = ?",
        params![id],
        RawItem::from_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to read sync queue item {}: {}", id, e))?;

    raw.map(RawItem::into_item).transpose()
  }

  /// Replay every due item in insertion order.
  ///
  /// A failing handler marks its item failed and the pass moves on to the
  /// next item. Items enqueued after the scan wait for the next pass.
  pub async fn drain<H: ActionHandler>(&self, handler: &H) -> Result<DrainReport> {
    let items = self.items()?;
    let mut report = DrainReport::default();

    for item in items {
      if !self.is_due(&item) {
        report.skipped += 1;
        continue;
      }

      match handler.execute(&item.action).await {
        Ok(_) => {
          self.record_attempt(item.id, SyncStatus::Completed, None)?;
          debug!(id = item.id, kind = item.action.kind(), "Synced action");
          report.completed.push(item.id);
        }
        Err(e) => {
          let message = e.to_string();
          warn!(id = item.id, kind = item.action.kind(), "Sync failed: {}", message);
          self.record_attempt(item.id, SyncStatus::Failed, Some(&message))?;
          report.failed.push((item.id, message));
        }
      }
    }

    if report.processed() > 0 {
      info!(
        completed = report.completed.len(),
        failed = report.failed.len(),
        "Drained sync queue"
      );
    }
    Ok(report)
  }

  /// Failed items are only due when the queue retries them automatically.
  fn is_due(&self, item: &SyncQueueItem) -> bool {
    match item.status {
      SyncStatus::Pending => true,
      SyncStatus::Failed => self.retry_failed,
      SyncStatus::Completed => false,
    }
  }

  fn record_attempt(&self, id: i64, status: SyncStatus, error: Option<&str>) -> Result<()> {
    self
      .lock()?
      .execute(
        "UPDATE sync_queue
         SET status = ?, error = ?, attempts = attempts + 1, updated_at = ?
         WHERE id = ?",
        params![status.as_str(), error, Utc::now().to_rfc3339(), id],
      )
      .map_err(|e| eyre!("Failed to update sync queue item {}: {}", id, e))?;
    Ok(())
  }

  /// Re-mark a failed item as pending and clear its error.
  ///
  /// Returns false when the item does not exist or is not failed.
  pub fn retry(&self, id: i64) -> Result<bool> {
    let changed = self
      .lock()?
      .execute(
        "UPDATE sync_queue SET status = ?, error = NULL, updated_at = ?
         WHERE id = ? AND status = ?",
        params![
          SyncStatus::Pending.as_str(),
          Utc::now().to_rfc3339(),
          id,
          SyncStatus::Failed.as_str()
        ],
      )
      .map_err(|e| eyre!("Failed to retry sync queue item {}: {}", id, e))?;
    Ok(changed == 1)
  }

  /// Re-mark every failed item as pending. Returns how many were re-marked.
  pub fn retry_failed(&self) -> Result<usize> {
    self
      .lock()?
      .execute(
        "UPDATE sync_queue SET status = ?, error = NULL, updated_at = ?
         WHERE status = ?",
        params![
          SyncStatus::Pending.as_str(),
          Utc::now().to_rfc3339(),
          SyncStatus::Failed.as_str()
        ],
      )
      .map_err(|e| eyre!("Failed to retry failed sync queue items: {}", e))
  }
}

const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sync_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    action_type TEXT NOT NULL,
    data TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    error TEXT,
    attempts INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_sync_queue_status ON sync_queue(status);
"#;

/// Row as stored, before the JSON and timestamp columns are decoded.
struct RawItem {
  id: i64,
  action_type: String,
  data: String,
  timestamp: String,
  status: String,
  error: Option<String>,
  attempts: u32,
}

impl RawItem {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      action_type: row.get(1)?,
      data: row.get(2)?,
      timestamp: row.get(3)?,
      status: row.get(4)?,
      error: row.get(5)?,
      attempts: row.get(6)?,
    })
  }

  fn into_item(self) -> Result<SyncQueueItem> {
    let data = serde_json::from_str(&self.data)
      .map_err(|e| eyre!("Failed to deserialize action {}: {}", self.id, e))?;
    let timestamp = DateTime::parse_from_rfc3339(&self.timestamp)
      .map_err(|e| eyre!("Failed to parse timestamp '{}': {}", self.timestamp, e))?
      .with_timezone(&Utc);

    Ok(SyncQueueItem {
      id: self.id,
      action: SyncAction::from_parts(&self.action_type, data),
      timestamp,
      status: SyncStatus::parse(&self.status)?,
      error: self.error,
      attempts: self.attempts,
    })
  }
}
