//! Shared fakes for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Map, Value};

use crate::cache::{Clock, KeyValueStore, MemoryStore};
use crate::error::{CacheError, CacheResult, FetchError};
use crate::remote::{PageQuery, Record, RemoteSource, DEFAULT_CREATED_COLUMN};

/// A row with an integer id and an RFC 3339 `created_at`.
pub fn record(id: i64, created_at: &str) -> Record {
  let mut fields = Map::new();
  fields.insert("id".into(), json!(id));
  fields.insert(DEFAULT_CREATED_COLUMN.into(), json!(created_at));
  fields.insert("status".into(), json!("open"));
  Record::new(fields)
}

pub fn record_at(id: i64, created_at: DateTime<Utc>) -> Record {
  record(id, &created_at.to_rfc3339())
}

/// In-memory remote honoring the page contract: rows at or after `since`,
/// newest first with id as tie-breaker, then offset/limit.
#[derive(Default)]
pub struct FakeRemote {
  tables: Mutex<HashMap<String, Vec<Record>>>,
  queries: AtomicUsize,
  fail_on: AtomicUsize,
  updates: Mutex<Vec<(String, Value, Map<String, Value>)>>,
  deletes: Mutex<Vec<(String, Value)>>,
}

impl FakeRemote {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&self, table: &str, rows: Vec<Record>) {
    self
      .tables
      .lock()
      .unwrap()
      .entry(table.to_string())
      .or_default()
      .extend(rows);
  }

  pub fn rows(&self, table: &str) -> Vec<Record> {
    self.tables.lock().unwrap().get(table).cloned().unwrap_or_default()
  }

  pub fn query_count(&self) -> usize {
    self.queries.load(Ordering::SeqCst)
  }

  /// Make the `n`th query from now on (1-based, counted across all tables)
  /// fail with a server error.
  pub fn fail_on_query(&self, n: usize) {
    self.fail_on.store(self.query_count() + n, Ordering::SeqCst);
  }

  pub fn updates(&self) -> Vec<(String, Value, Map<String, Value>)> {
    self.updates.lock().unwrap().clone()
  }

  pub fn deletes(&self) -> Vec<(String, Value)> {
    self.deletes.lock().unwrap().clone()
  }
}

fn sort_key(record: &Record, column: &str) -> (Option<DateTime<Utc>>, i64) {
  (
    record.created_at(column),
    record.id().and_then(Value::as_i64).unwrap_or_default(),
  )
}

#[async_trait]
impl RemoteSource for FakeRemote {
  async fn query(&self, query: &PageQuery) -> Result<Vec<Record>, FetchError> {
    let n = self.queries.fetch_add(1, Ordering::SeqCst) + 1;
    if n == self.fail_on.load(Ordering::SeqCst) {
      return Err(FetchError::Remote {
        table: query.table.clone(),
        status: 503,
        message: "service unavailable".into(),
      });
    }

    let mut rows: Vec<Record> = self
      .rows(&query.table)
      .into_iter()
      .filter(|r| r.created_at(&query.created_column).is_some_and(|t| t >= query.since))
      .collect();
    rows.sort_by(|a, b| sort_key(b, &query.created_column).cmp(&sort_key(a, &query.created_column)));

    Ok(rows.into_iter().skip(query.offset).take(query.limit).collect())
  }

  async fn update(&self, table: &str, id: &Value, patch: &Map<String, Value>) -> Result<(), FetchError> {
    self
      .updates
      .lock()
      .unwrap()
      .push((table.to_string(), id.clone(), patch.clone()));
    if let Some(rows) = self.tables.lock().unwrap().get_mut(table) {
      if let Some(row) = rows.iter_mut().find(|r| r.has_id(id)) {
        row.apply_patch(patch);
      }
    }
    Ok(())
  }

  async fn delete(&self, table: &str, id: &Value) -> Result<(), FetchError> {
    self.deletes.lock().unwrap().push((table.to_string(), id.clone()));
    if let Some(rows) = self.tables.lock().unwrap().get_mut(table) {
      rows.retain(|r| !r.has_id(id));
    }
    Ok(())
  }
}

/// Store whose writes always fail; counts every call.
#[derive(Default)]
pub struct FailingStore {
  inner: MemoryStore,
  sets: AtomicUsize,
  gets: AtomicUsize,
  removes: AtomicUsize,
  key_scans: AtomicUsize,
}

impl FailingStore {
  /// Every write reports [`CacheError::QuotaExceeded`].
  pub fn quota() -> Self {
    Self::default()
  }

  pub fn set_calls(&self) -> usize {
    self.sets.load(Ordering::SeqCst)
  }

  /// Number of key scans; each [`ChunkStore::clear`] does exactly one.
  ///
  /// [`ChunkStore::clear`]: crate::cache::ChunkStore::clear
  pub fn keys_calls(&self) -> usize {
    self.key_scans.load(Ordering::SeqCst)
  }

  pub fn total_calls(&self) -> usize {
    self.set_calls()
      + self.keys_calls()
      + self.gets.load(Ordering::SeqCst)
      + self.removes.load(Ordering::SeqCst)
  }
}

impl KeyValueStore for FailingStore {
  fn set_item(&self, key: &str, _value: &str) -> CacheResult<()> {
    self.sets.fetch_add(1, Ordering::SeqCst);
    Err(CacheError::QuotaExceeded { key: key.to_string() })
  }

  fn get_item(&self, key: &str) -> CacheResult<Option<String>> {
    self.gets.fetch_add(1, Ordering::SeqCst);
    self.inner.get_item(key)
  }

  fn remove_item(&self, key: &str) -> CacheResult<()> {
    self.removes.fetch_add(1, Ordering::SeqCst);
    self.inner.remove_item(key)
  }

  fn keys(&self) -> CacheResult<Vec<String>> {
    self.key_scans.fetch_add(1, Ordering::SeqCst);
    self.inner.keys()
  }
}

/// Clock that only moves when told to.
pub struct ManualClock(Mutex<DateTime<Utc>>);

impl ManualClock {
  pub fn new(now: DateTime<Utc>) -> Self {
    Self(Mutex::new(now))
  }

  pub fn advance(&self, by: Duration) {
    let mut now = self.0.lock().unwrap();
    *now += by;
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.0.lock().unwrap()
  }
}
