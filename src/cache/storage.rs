//! SQLite-backed generational response store.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::http::Response;

/// Persistent key → response store partitioned by cache generation.
///
/// Every write is a single statement or a single transaction, so an
/// interrupted write never leaves a half-written entry behind.
pub struct CacheStore {
  conn: Mutex<Connection>,
}

impl CacheStore {
  /// Open (or create) the store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Register a generation; no-op when it already exists.
  pub fn create_generation(&self, name: &str) -> Result<()> {
    self
      .lock()?
      .execute(
        "INSERT OR IGNORE INTO cache_generations (name) VALUES (?)",
        params![name],
      )
      .map_err(|e| eyre!("Failed to create cache generation {}: {}", name, e))?;
    Ok(())
  }

  /// All generation names, oldest first.
  #[cfg(test)]
  pub fn generations(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_generations ORDER BY created_at, name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache generations: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache generation: {}", e))?;

    Ok(names)
  }

  /// Mark `name` as the only active generation.
  pub fn set_active(&self, name: &str) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO cache_generations (name) VALUES (?)",
      params![name],
    )
    .map_err(|e| eyre!("Failed to create cache generation {}: {}", name, e))?;
    tx.execute(
      "UPDATE cache_generations SET active = (name = ?)",
      params![name],
    )
    .map_err(|e| eyre!("Failed to activate cache generation {}: {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))
  }

  pub fn active_generation(&self) -> Result<Option<String>> {
    self
      .lock()?
      .query_row(
        "SELECT name FROM cache_generations WHERE active = 1",
        [],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read active cache generation: {}", e))
  }

  /// Store one entry, replacing any previous entry for the same key.
  pub fn put(&self, generation: &str, key: &str, response: &Response) -> Result<()> {
    let headers = encode_headers(&response.headers)?;
    let conn = self.lock()?;

    conn
      .execute(
        "INSERT OR IGNORE INTO cache_generations (name) VALUES (?)",
        params![generation],
      )
      .map_err(|e| eyre!("Failed to create cache generation {}: {}", generation, e))?;
    conn
      .execute(
        "INSERT OR REPLACE INTO cache_entries (generation, resource_key, status, headers, body, stored_at)
         VALUES (?, ?, ?, ?, ?, datetime('now'))",
        params![generation, key, response.status, headers, response.body],
      )
      .map_err(|e| eyre!("Failed to store {}: {}", key, e))?;

    Ok(())
  }

  /// Store a batch of entries in one transaction: all of them or none.
  pub fn put_all(&self, generation: &str, entries: &[(String, Response)]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO cache_generations (name) VALUES (?)",
      params![generation],
    )
    .map_err(|e| eyre!("Failed to create cache generation {}: {}", generation, e))?;

    for (key, response) in entries {
      let headers = encode_headers(&response.headers)?;
      tx.execute(
        "INSERT OR REPLACE INTO cache_entries (generation, resource_key, status, headers, body, stored_at)
         VALUES (?, ?, ?, ?, ?, datetime('now'))",
        params![generation, key, response.status, headers, response.body],
      )
      .map_err(|e| eyre!("Failed to store {}: {}", key, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))
  }

  pub fn get(&self, generation: &str, key: &str) -> Result<Option<Response>> {
    let conn = self.lock()?;
    let row: Option<(u16, String, Vec<u8>)> = conn
      .query_row(
        "SELECT status, headers, body FROM cache_entries
         WHERE generation = ? AND resource_key = ?",
        params![generation, key],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {}: {}", key, e))?;

    match row {
      Some((status, headers, body)) => Ok(Some(Response {
        status,
        headers: decode_headers(&headers)?,
        body,
      })),
      None => Ok(None),
    }
  }

  /// Keys stored in a generation, sorted.
  #[cfg(test)]
  pub fn keys(&self, generation: &str) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare(
        "SELECT resource_key FROM cache_entries WHERE generation = ? ORDER BY resource_key",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![generation], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache keys: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache key: {}", e))?;

    Ok(keys)
  }

  /// Delete every generation except `keep`, returning the deleted names.
  pub fn delete_generations_except(&self, keep: &str) -> Result<Vec<String>> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let stale: Vec<String> = {
      let mut stmt = tx
        .prepare("SELECT name FROM cache_generations WHERE name != ? ORDER BY name")
        .map_err(|e| eyre!("Failed to prepare query: {}", e))?;
      let names = stmt
        .query_map(params![keep], |row| row.get(0))
        .map_err(|e| eyre!("Failed to list stale generations: {}", e))?
        .collect::<rusqlite::Result<Vec<String>>>()
        .map_err(|e| eyre!("Failed to read stale generation: {}", e))?;
      names
    };

    // Entries can exist for generations that were never registered.
    let mut orphans: Vec<String> = {
      let mut stmt = tx
        .prepare(
          "SELECT DISTINCT generation FROM cache_entries
           WHERE generation != ? AND generation NOT IN (SELECT name FROM cache_generations)",
        )
        .map_err(|e| eyre!("Failed to prepare query: {}", e))?;
      let names = stmt
        .query_map(params![keep], |row| row.get(0))
        .map_err(|e| eyre!("Failed to list orphaned entries: {}", e))?
        .collect::<rusqlite::Result<Vec<String>>>()
        .map_err(|e| eyre!("Failed to read orphaned generation: {}", e))?;
      names
    };

    tx.execute(
      "DELETE FROM cache_entries WHERE generation != ?",
      params![keep],
    )
    .map_err(|e| eyre!("Failed to delete stale cache entries: {}", e))?;
    tx.execute(
      "DELETE FROM cache_generations WHERE name != ?",
      params![keep],
    )
    .map_err(|e| eyre!("Failed to delete stale cache generations: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    let mut deleted = stale;
    deleted.append(&mut orphans);
    Ok(deleted)
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_generations (
    name TEXT PRIMARY KEY,
    active INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One live entry per (generation, resource_key)
CREATE TABLE IF NOT EXISTS cache_entries (
    generation TEXT NOT NULL,
    resource_key TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (generation, resource_key)
);
"#;

fn encode_headers(headers: &BTreeMap<String, String>) -> Result<String> {
  serde_json::to_string(headers).map_err(|e| eyre!("Failed to serialize headers: {}", e))
}

fn decode_headers(data: &str) -> Result<BTreeMap<String, String>> {
  serde_json::from_str(data).map_err(|e| eyre!("Failed to deserialize headers: {}", e))
}
