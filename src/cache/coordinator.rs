//! Cache coordinator: serves the mirrored dataset from the encrypted local
//! cache when it is fresh and refetches it otherwise.
//!
//! Read path: retrieve → decrypt → freshness check. Any failure on that
//! path is a miss; the slots are purged and the failure is reported to the
//! policy.
//!
//! Write path: encrypt → store, falling back once to storing the plain
//! envelope. If both attempts fail the policy is told and the load still
//! succeeds with the network data.
//!
//! All operations take the coordinator's gate for their whole duration, so
//! loads and patches against the cache key run one at a time.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::chunk_store::{parts_needed, ChunkStore, Chunked, Layout, DEFAULT_MAX_CHUNK_BYTES};
use super::cipher::Cipher;
use super::envelope::{CacheEnvelope, StoredPayload};
use super::policy::{CacheFailurePolicy, FailureCounter, PolicyState};
use super::storage::KeyValueStore;
use crate::error::{CacheError, CacheResult, FetchError};
use crate::remote::{window_start, Record, RemoteSource, SyncEngine, TableRole, DEFAULT_RETENTION_MONTHS};

/// AES-GCM tag bytes added to every sealed plaintext.
const TAG_LEN: usize = 16;

/// Default base key in the store.
pub const DEFAULT_CACHE_KEY: &str = "dashboard_data_cache";

/// Source of the current time.
pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// Tunables for the coordinator.
#[derive(Debug, Clone)]
pub struct CacheSettings {
  pub key: String,
  /// Maximum age of a cached envelope.
  pub ttl: Duration,
  pub retention_months: u32,
  pub max_chunk_bytes: usize,
}

impl Default for CacheSettings {
  fn default() -> Self {
    Self {
      key: DEFAULT_CACHE_KEY.to_string(),
      ttl: Duration::minutes(5),
      retention_months: DEFAULT_RETENTION_MONTHS,
      max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
    }
  }
}

/// Tables mirrored into one envelope.
#[derive(Debug, Clone)]
pub struct Tables {
  pub primary: String,
  pub sidecar: Option<String>,
}

impl Tables {
  pub fn name(&self, role: TableRole) -> Option<&str> {
    match role {
      TableRole::Primary => Some(&self.primary),
      TableRole::Sidecar => self.sidecar.as_deref(),
    }
  }
}

/// Where a loaded dataset came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh cached envelope; no network traffic.
  Cache,
  /// Fetched from the remote during this call.
  Network,
}

/// Result of [`CacheCoordinator::load`].
#[derive(Debug, Clone)]
pub struct LoadOutcome {
  pub dataset: Arc<CacheEnvelope>,
  pub source: CacheSource,
  /// When the remote fetch behind `dataset` completed.
  pub fetched_at: DateTime<Utc>,
}

/// Snapshot for status displays.
#[derive(Debug)]
pub struct CacheStatus {
  pub state: PolicyState,
  pub counter: FailureCounter,
  pub layout: CacheResult<Layout>,
  /// Primary and sidecar row counts of the loaded dataset.
  pub in_memory_rows: Option<(usize, usize)>,
  pub in_memory_bytes: Option<usize>,
}

struct State {
  envelope: Option<Arc<CacheEnvelope>>,
  policy: CacheFailurePolicy,
}

pub struct CacheCoordinator<R, S: KeyValueStore> {
  sync: SyncEngine<R>,
  chunks: ChunkStore<S>,
  cipher: Arc<Cipher>,
  tables: Tables,
  settings: CacheSettings,
  clock: Arc<dyn Clock>,
  state: Mutex<State>,
}

impl<R: RemoteSource, S: KeyValueStore> CacheCoordinator<R, S> {
  pub fn new(sync: SyncEngine<R>, store: S, cipher: Cipher, tables: Tables) -> Self {
    Self {
      sync,
      chunks: ChunkStore::new(store),
      cipher: Arc::new(cipher),
      tables,
      settings: CacheSettings::default(),
      clock: Arc::new(SystemClock),
      state: Mutex::new(State {
        envelope: None,
        policy: CacheFailurePolicy::default(),
      }),
    }
  }

  pub fn with_settings(mut self, settings: CacheSettings) -> Self {
    self.settings = settings;
    self
  }

  pub fn with_policy(mut self, policy: CacheFailurePolicy) -> Self {
    self.state.get_mut().policy = policy;
    self
  }

  pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
    self.clock = clock;
    self
  }

  pub fn settings(&self) -> &CacheSettings {
    &self.settings
  }

  pub fn tables(&self) -> &Tables {
    &self.tables
  }

  pub fn remote(&self) -> &R {
    self.sync.remote()
  }

  pub fn chunk_store(&self) -> &ChunkStore<S> {
    &self.chunks
  }

  /// Load the dataset, from cache when a fresh envelope exists and
  /// `force_refresh` is false, from the remote otherwise.
  ///
  /// Only remote failures are returned; cache problems degrade to a
  /// network load.
  pub async fn load(&self, force_refresh: bool) -> Result<LoadOutcome, FetchError> {
    let mut state = self.state.lock().await;
    let State { envelope, policy } = &mut *state;

    if !force_refresh && policy.is_enabled() {
      if let Some(cached) = self.read_cache(policy).await {
        let now = self.clock.now();
        if cached.is_fresh(now, self.settings.ttl) {
          info!(
            key = %self.settings.key,
            rows = cached.dataset.len(),
            age_secs = (now - cached.timestamp).num_seconds(),
            "serving dataset from cache"
          );
          let cached = Arc::new(cached);
          *envelope = Some(Arc::clone(&cached));
          return Ok(LoadOutcome {
            fetched_at: cached.timestamp,
            dataset: cached,
            source: CacheSource::Cache,
          });
        }
        debug!(key = %self.settings.key, "cached dataset is stale");
      }
    } else if !policy.is_enabled() {
      debug!("caching disabled; going to the network");
    }

    let since = window_start(self.clock.now(), self.settings.retention_months);
    let dataset = self.sync.fetch_all(&self.tables.primary, since).await?;
    let sidecar = match &self.tables.sidecar {
      Some(table) => self.sync.fetch_all(table, since).await?,
      None => Vec::new(),
    };

    let fresh = Arc::new(CacheEnvelope {
      timestamp: self.clock.now(),
      dataset,
      sidecar,
    });
    info!(
      rows = fresh.dataset.len(),
      sidecar_rows = fresh.sidecar.len(),
      "dataset loaded from remote"
    );

    if policy.is_enabled() {
      self.write_cache(Arc::clone(&fresh), policy).await;
    } else {
      debug!("caching disabled; skipping cache write");
    }

    *envelope = Some(Arc::clone(&fresh));
    Ok(LoadOutcome {
      fetched_at: fresh.timestamp,
      dataset: fresh,
      source: CacheSource::Network,
    })
  }

  /// Patch one in-memory record and rewrite the cache.
  ///
  /// The envelope keeps its original timestamp, so this does not extend
  /// its freshness. Returns `false` when nothing is loaded or no record in
  /// `table` has `id`.
  pub async fn persist_update<F>(&self, table: TableRole, id: &Value, mutate: F) -> bool
  where
    F: FnOnce(&mut Record),
  {
    self
      .patch_envelope(table, |rows| match rows.iter_mut().find(|r| r.has_id(id)) {
        Some(record) => {
          mutate(record);
          true
        }
        None => false,
      })
      .await
  }

  /// Drop one in-memory record and rewrite the cache, keeping the
  /// envelope timestamp.
  pub async fn persist_removal(&self, table: TableRole, id: &Value) -> bool {
    self
      .patch_envelope(table, |rows| match rows.iter().position(|r| r.has_id(id)) {
        Some(index) => {
          rows.remove(index);
          true
        }
        None => false,
      })
      .await
  }

  async fn patch_envelope<F>(&self, table: TableRole, patch: F) -> bool
  where
    F: FnOnce(&mut Vec<Record>) -> bool,
  {
    let mut state = self.state.lock().await;
    let State { envelope, policy } = &mut *state;

    let Some(current) = envelope.as_mut() else {
      debug!("no dataset loaded; nothing to patch");
      return false;
    };

    let env = Arc::make_mut(current);
    let rows = match table {
      TableRole::Primary => &mut env.dataset,
      TableRole::Sidecar => &mut env.sidecar,
    };
    if !patch(rows) {
      debug!(?table, "record not found in loaded dataset");
      return false;
    }

    if policy.is_enabled() {
      self.write_cache(Arc::clone(current), policy).await;
    } else {
      debug!("caching disabled; patch kept in memory only");
    }
    true
  }

  /// Purge every cache slot and turn caching back on.
  pub async fn clear_cache(&self) -> CacheResult<()> {
    let mut state = self.state.lock().await;
    let result = self.chunks.clear(&self.settings.key);
    state.policy.reenable();
    if let Err(e) = &result {
      warn!(error = %e, "failed to clear cache slots");
    } else {
      info!(key = %self.settings.key, "cache cleared");
    }
    result
  }

  pub async fn status(&self) -> CacheStatus {
    let state = self.state.lock().await;
    CacheStatus {
      state: state.policy.state(),
      counter: state.policy.counter(),
      layout: self.chunks.layout(&self.settings.key),
      in_memory_rows: state
        .envelope
        .as_ref()
        .map(|e| (e.dataset.len(), e.sidecar.len())),
      in_memory_bytes: state.envelope.as_ref().map(|e| e.encoded_size()),
    }
  }

  async fn read_cache(&self, policy: &mut CacheFailurePolicy) -> Option<CacheEnvelope> {
    let key = &self.settings.key;

    let result = match self.chunks.read_parts(key) {
      Ok(None) => {
        debug!(%key, "cache miss");
        return None;
      }
      Ok(Some(parts)) => self.open(parts).await,
      Err(e) => Err(e),
    };

    match result {
      Ok(envelope) => {
        policy.on_success();
        Some(envelope)
      }
      Err(e) => {
        warn!(%key, error = %e, "discarding unreadable cache");
        if let Err(clear_err) = self.chunks.clear(key) {
          warn!(%key, error = %clear_err, "failed to purge unreadable cache");
        }
        policy.on_failure(e.kind(), || self.chunks.clear(key));
        None
      }
    }
  }

  async fn write_cache(&self, envelope: Arc<CacheEnvelope>, policy: &mut CacheFailurePolicy) {
    let key = &self.settings.key;
    let max = self.settings.max_chunk_bytes;

    let encrypted = match self.seal(Arc::clone(&envelope)).await {
      Ok(parts) => self.chunks.write_parts(key, &parts, parts.iter().map(String::len).sum()),
      Err(e) => Err(e),
    };

    let first_error = match encrypted {
      Ok(receipt) => {
        info!(%key, chunks = receipt.chunks, bytes = receipt.total_size, "cache saved");
        policy.on_success();
        return;
      }
      Err(e) => e,
    };

    warn!(%key, error = %first_error, "encrypted cache write failed; retrying unencrypted");
    match self.chunks.store(key, envelope.as_ref(), max) {
      Ok(receipt) => {
        info!(%key, chunks = receipt.chunks, bytes = receipt.total_size, "cache saved unencrypted");
        policy.on_success();
      }
      Err(e) => {
        warn!(%key, error = %e, "cache write failed; skipping cache for this load");
        policy.on_failure(e.kind(), || self.chunks.clear(key));
      }
    }
  }

  async fn seal(&self, envelope: Arc<CacheEnvelope>) -> CacheResult<Vec<String>> {
    let cipher = Arc::clone(&self.cipher);
    let max = self.settings.max_chunk_bytes;
    tokio::task::spawn_blocking(move || seal_envelope(&cipher, &envelope, max))
      .await
      .map_err(|e| CacheError::Crypto(format!("cipher task failed: {}", e)))?
  }

  async fn open(&self, parts: Vec<String>) -> CacheResult<CacheEnvelope> {
    let cipher = Arc::clone(&self.cipher);
    let key = self.settings.key.clone();
    tokio::task::spawn_blocking(move || open_parts(&cipher, &key, &parts))
      .await
      .map_err(|e| CacheError::Crypto(format!("cipher task failed: {}", e)))?
  }
}

/// Encrypt `envelope` into store pieces.
///
/// The record list is split first and every piece is sealed on its own, so
/// each chunk decrypts without the others. The piece count comes from the
/// sealed size of the whole envelope.
fn seal_envelope(cipher: &Cipher, envelope: &CacheEnvelope, max_chunk_bytes: usize) -> CacheResult<Vec<String>> {
  let sealer = cipher.sealer();
  let sealed_size = 4 * (envelope.encoded_size() + TAG_LEN).div_ceil(3);
  let wanted = parts_needed(sealed_size, max_chunk_bytes);

  let pieces = if wanted == 1 {
    vec![sealer.encrypt(envelope)?]
  } else {
    envelope
      .split(wanted)
      .iter()
      .map(|piece| sealer.encrypt(piece))
      .collect::<CacheResult<Vec<_>>>()?
  };

  pieces
    .iter()
    .map(|blob| serde_json::to_string(blob).map_err(CacheError::format))
    .collect()
}

/// Decode, decrypt and reassemble stored pieces. Plain pieces (unencrypted
/// fallback writes, older caches) are taken as they are.
fn open_parts(cipher: &Cipher, key: &str, parts: &[String]) -> CacheResult<CacheEnvelope> {
  let pieces = parts
    .iter()
    .map(|text| match serde_json::from_str::<StoredPayload>(text).map_err(CacheError::format)? {
      StoredPayload::Encrypted(blob) => cipher.decrypt(&blob),
      StoredPayload::Plain(envelope) => {
        debug!(key, "read unencrypted cache piece");
        Ok(envelope)
      }
    })
    .collect::<CacheResult<Vec<CacheEnvelope>>>()?;

  CacheEnvelope::merge(pieces).map_err(|reason| CacheError::Corruption {
    key: key.to_string(),
    reason,
  })
}
