//! Durable store for pending operations.
//!
//! An ordered, persistent collection surviving process restarts. Insertion
//! order is replay order; the store only ever contains operations not yet
//! acknowledged by the server.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

/// The wire shape of a buffered operation. The payload is opaque to this
/// layer and only validated at the remote boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
  #[serde(rename = "type")]
  pub kind: String,
  pub payload: serde_json::Value,
  /// Milliseconds since the epoch, stamped at enqueue time.
  pub queued_at: i64,
}

/// An operation as stored, with its store-assigned id.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedOperation {
  pub id: i64,
  pub operation: Operation,
}

/// Trait for durable queue backends.
pub trait QueueStore: Send + Sync {
  /// Append an operation; returns the assigned id. Storage failures here are
  /// correctness-critical and must reach the caller.
  fn append(&self, operation: &Operation) -> Result<i64>;

  /// The entire queue in insertion order.
  fn read_all(&self) -> Result<Vec<QueuedOperation>>;

  /// Remove exactly the given ids in one transaction. Operations appended
  /// after the batch was read are untouched.
  fn remove(&self, ids: &[i64]) -> Result<()>;
}

/// SQLite-based durable queue.
pub struct SqliteQueueStore {
  conn: Mutex<Connection>,
}

impl SqliteQueueStore {
  /// Open or create the queue database at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create queue directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open queue database at {}: {}", path.display(), e))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// In-memory store, used in tests.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory queue database: {}", e))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute_batch(QUEUE_SCHEMA)
      .map_err(|e| eyre!("Failed to run queue migrations: {}", e))?;
    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for the durable queue. AUTOINCREMENT keeps ids monotonic even
/// after deletes, so id order always equals enqueue order.
const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sync_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    queued_at INTEGER NOT NULL
);
"#;

impl QueueStore for SqliteQueueStore {
  fn append(&self, operation: &Operation) -> Result<i64> {
    let conn = self.lock()?;

    let payload = serde_json::to_string(&operation.payload)
      .map_err(|e| eyre!("Failed to serialize payload: {}", e))?;

    conn
      .execute(
        "INSERT INTO sync_queue (kind, payload, queued_at) VALUES (?, ?, ?)",
        params![operation.kind, payload, operation.queued_at],
      )
      .map_err(|e| eyre!("Failed to append operation: {}", e))?;

    Ok(conn.last_insert_rowid())
  }

  fn read_all(&self) -> Result<Vec<QueuedOperation>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT id, kind, payload, queued_at FROM sync_queue ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(i64, String, String, i64)> = stmt
      .query_map([], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .map_err(|e| eyre!("Failed to read queue: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    let mut queued = Vec::with_capacity(rows.len());
    for (id, kind, payload, queued_at) in rows {
      let payload = serde_json::from_str(&payload)
        .map_err(|e| eyre!("Failed to deserialize payload for id {}: {}", id, e))?;
      queued.push(QueuedOperation {
        id,
        operation: Operation {
          kind,
          payload,
          queued_at,
        },
      });
    }

    Ok(queued)
  }

  fn remove(&self, ids: &[i64]) -> Result<()> {
    let conn = self.lock()?;

    conn
      .execute("BEGIN IMMEDIATE", [])
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for id in ids {
      if let Err(err) = conn.execute("DELETE FROM sync_queue WHERE id = ?", params![id]) {
        let _ = conn.execute("ROLLBACK", []);
        return Err(eyre!("Failed to remove operation {}: {}", id, err));
      }
    }

    conn
      .execute("COMMIT", [])
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }
}
