//! Persistent key/value store backends.
//!
//! The store models a browser-style string map: every value is text, and
//! writes may fail because the store is full. [`ChunkStore`] is the only
//! writer.
//!
//! [`ChunkStore`]: super::ChunkStore

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::error::{CacheError, CacheResult};

/// Key used by [`probe_capacity`].
const PROBE_KEY: &str = "__storage_probe__";

/// Default probe size (1 MB).
pub const DEFAULT_PROBE_BYTES: usize = 1_000_000;

/// Trait for key/value storage backends.
pub trait KeyValueStore: Send + Sync {
  /// Write `value` under `key`, replacing any previous value.
  ///
  /// Fails with [`CacheError::QuotaExceeded`] when the store is full.
  fn set_item(&self, key: &str, value: &str) -> CacheResult<()>;

  /// Read the value under `key`.
  fn get_item(&self, key: &str) -> CacheResult<Option<String>>;

  /// Remove `key`. Removing a missing key is not an error.
  fn remove_item(&self, key: &str) -> CacheResult<()>;

  /// All keys currently present.
  fn keys(&self) -> CacheResult<Vec<String>>;
}

impl<S: KeyValueStore + ?Sized> KeyValueStore for std::sync::Arc<S> {
  fn set_item(&self, key: &str, value: &str) -> CacheResult<()> {
    (**self).set_item(key, value)
  }

  fn get_item(&self, key: &str) -> CacheResult<Option<String>> {
    (**self).get_item(key)
  }

  fn remove_item(&self, key: &str) -> CacheResult<()> {
    (**self).remove_item(key)
  }

  fn keys(&self) -> CacheResult<Vec<String>> {
    (**self).keys()
  }
}

/// Check whether `bytes` more bytes fit in the store.
///
/// Writes and removes a throwaway value. Returns `Ok(false)` when the write
/// hits the quota; other failures propagate.
pub fn probe_capacity<S: KeyValueStore + ?Sized>(store: &S, bytes: usize) -> CacheResult<bool> {
  let value = "x".repeat(bytes);
  match store.set_item(PROBE_KEY, &value) {
    Ok(()) => {
      store.remove_item(PROBE_KEY)?;
      Ok(true)
    }
    Err(CacheError::QuotaExceeded { .. }) => Ok(false),
    Err(e) => Err(e),
  }
}

fn entry_size(key: &str, value: &str) -> usize {
  key.len() + value.len()
}

/// In-process store, optionally capped at a byte quota.
#[derive(Default)]
pub struct MemoryStore {
  entries: Mutex<BTreeMap<String, String>>,
  quota: Option<usize>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  /// Cap total key and value bytes at `quota`.
  pub fn with_quota(quota: usize) -> Self {
    Self {
      entries: Mutex::new(BTreeMap::new()),
      quota: Some(quota),
    }
  }

  /// Bytes currently used by keys and values.
  pub fn used_bytes(&self) -> usize {
    self
      .entries
      .lock()
      .map(|entries| entries.iter().map(|(k, v)| entry_size(k, v)).sum())
      .unwrap_or(0)
  }

  fn lock(&self) -> CacheResult<std::sync::MutexGuard<'_, BTreeMap<String, String>>> {
    self
      .entries
      .lock()
      .map_err(|e| CacheError::Storage(format!("Lock poisoned: {}", e)))
  }
}

impl KeyValueStore for MemoryStore {
  fn set_item(&self, key: &str, value: &str) -> CacheResult<()> {
    let mut entries = self.lock()?;

    if let Some(quota) = self.quota {
      let used: usize = entries.iter().map(|(k, v)| entry_size(k, v)).sum();
      let replaced = entries.get(key).map(|old| entry_size(key, old)).unwrap_or(0);
      if used - replaced + entry_size(key, value) > quota {
        return Err(CacheError::QuotaExceeded {
          key: key.to_string(),
        });
      }
    }

    entries.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn get_item(&self, key: &str) -> CacheResult<Option<String>> {
    Ok(self.lock()?.get(key).cloned())
  }

  fn remove_item(&self, key: &str) -> CacheResult<()> {
    self.lock()?.remove(key);
    Ok(())
  }

  fn keys(&self) -> CacheResult<Vec<String>> {
    Ok(self.lock()?.keys().cloned().collect())
  }
}

/// SQLite-backed store: one table of text keys and text values.
pub struct SqliteStore {
  conn: Mutex<Connection>,
  quota: Option<usize>,
}

/// Schema for the key/value table.
const KV_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

impl SqliteStore {
  /// Open the store at the default location.
  pub fn open_default() -> color_eyre::Result<Self> {
    let path = Self::default_path()?;
    Self::open(&path).map_err(|e| color_eyre::eyre::eyre!("{}", e))
  }

  /// Open or create the store at `path`.
  pub fn open(path: &Path) -> CacheResult<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| CacheError::Storage(format!("Failed to create cache directory: {}", e)))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      CacheError::Storage(format!(
        "Failed to open cache database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::from_connection(conn)
  }

  /// Store backed by a private in-memory database.
  pub fn open_in_memory() -> CacheResult<Self> {
    let conn = Connection::open_in_memory().map_err(CacheError::storage)?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> CacheResult<Self> {
    conn
      .execute_batch(KV_SCHEMA)
      .map_err(|e| CacheError::Storage(format!("Failed to run cache migrations: {}", e)))?;

    Ok(Self {
      conn: Mutex::new(conn),
      quota: None,
    })
  }

  /// Cap total key and value bytes at `quota`.
  pub fn with_quota(mut self, quota: Option<usize>) -> Self {
    self.quota = quota;
    self
  }

  /// Get the default database path.
  pub fn default_path() -> color_eyre::Result<PathBuf> {
    Ok(crate::config::data_dir()?.join("cache.db"))
  }

  fn lock(&self) -> CacheResult<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| CacheError::Storage(format!("Lock poisoned: {}", e)))
  }
}

fn map_write_error(key: &str, err: rusqlite::Error) -> CacheError {
  match err {
    rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::DiskFull => {
      CacheError::QuotaExceeded {
        key: key.to_string(),
      }
    }
    other => CacheError::Storage(format!("Failed to write '{}': {}", key, other)),
  }
}

impl KeyValueStore for SqliteStore {
  fn set_item(&self, key: &str, value: &str) -> CacheResult<()> {
    let conn = self.lock()?;

    if let Some(quota) = self.quota {
      let used: i64 = conn
        .query_row(
          "SELECT COALESCE(SUM(length(CAST(key AS BLOB)) + length(CAST(value AS BLOB))), 0)
           FROM kv WHERE key != ?",
          params![key],
          |row| row.get(0),
        )
        .map_err(CacheError::storage)?;
      if used as usize + entry_size(key, value) > quota {
        debug!(key, used, quota, "sqlite store over quota");
        return Err(CacheError::QuotaExceeded {
          key: key.to_string(),
        });
      }
    }

    conn
      .execute(
        "INSERT OR REPLACE INTO kv (key, value) VALUES (?, ?)",
        params![key, value],
      )
      .map_err(|e| map_write_error(key, e))?;

    Ok(())
  }

  fn get_item(&self, key: &str) -> CacheResult<Option<String>> {
    let conn = self.lock()?;
    conn
      .query_row("SELECT value FROM kv WHERE key = ?", params![key], |row| {
        row.get(0)
      })
      .optional()
      .map_err(|e| CacheError::Storage(format!("Failed to read '{}': {}", key, e)))
  }

  fn remove_item(&self, key: &str) -> CacheResult<()> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM kv WHERE key = ?", params![key])
      .map_err(|e| CacheError::Storage(format!("Failed to remove '{}': {}", key, e)))?;
    Ok(())
  }

  fn keys(&self) -> CacheResult<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT key FROM kv ORDER BY key")
      .map_err(CacheError::storage)?;
    let keys = stmt
      .query_map([], |row| row.get(0))
      .map_err(CacheError::storage)?
      .collect::<Result<Vec<String>, _>>()
      .map_err(CacheError::storage)?;
    Ok(keys)
  }
}
