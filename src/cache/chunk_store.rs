//! Splits a logical payload across several store slots.
//!
//! Layout under a base key `K`:
//!
//! - small payloads: the JSON text under `K` itself
//! - large payloads: a [`ChunkIndex`] under `K_info` and pieces under
//!   `K_chunk_0 .. K_chunk_{n-1}`
//!
//! Splitting happens on the logical collection, not on the encoded text, so
//! each chunk is a complete JSON document.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::storage::KeyValueStore;
use crate::error::{CacheError, CacheResult};

/// Default per-slot capacity in bytes of encoded text.
pub const DEFAULT_MAX_CHUNK_BYTES: usize = 500_000;

/// Payloads that can be cut into pieces that each stand on their own.
pub trait Chunked: Sized {
  /// Cut into at most `parts` pieces, preserving order.
  fn split(&self, parts: usize) -> Vec<Self>;

  /// Reassemble pieces produced by [`Chunked::split`], in order.
  fn merge(parts: Vec<Self>) -> Result<Self, String>;
}

/// Number of pieces a payload of `total_size` encoded bytes is cut into.
pub fn parts_needed(total_size: usize, max_chunk_bytes: usize) -> usize {
  total_size.div_ceil(max_chunk_bytes.max(1)).max(1)
}

/// Cut `items` into at most `parts` consecutive slices of equal length
/// (the last one may be shorter). Always returns at least one slice.
pub fn slice_evenly<T: Clone>(items: &[T], parts: usize) -> Vec<Vec<T>> {
  if items.is_empty() || parts <= 1 {
    return vec![items.to_vec()];
  }
  let size = items.len().div_ceil(parts);
  items.chunks(size).map(<[T]>::to_vec).collect()
}

impl<T: Clone> Chunked for Vec<T> {
  fn split(&self, parts: usize) -> Vec<Self> {
    slice_evenly(self, parts)
  }

  fn merge(parts: Vec<Self>) -> Result<Self, String> {
    Ok(parts.into_iter().flatten().collect())
  }
}

/// Describes a chunked layout. Written before the chunks it describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkIndex {
  pub total_chunks: usize,
  /// Length of the whole payload's encoded text.
  pub total_size: usize,
  #[serde(with = "chrono::serde::ts_milliseconds", alias = "timestamp")]
  pub created_at: DateTime<Utc>,
}

/// Result of a successful [`ChunkStore::store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreReceipt {
  pub chunks: usize,
  pub total_size: usize,
}

/// How a key is currently laid out in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Layout {
  Empty,
  Single { bytes: usize },
  Chunked(ChunkIndex),
}

/// Chunked reader/writer over a [`KeyValueStore`].
pub struct ChunkStore<S: KeyValueStore> {
  store: S,
}

pub fn info_key(key: &str) -> String {
  format!("{}_info", key)
}

pub fn chunk_prefix(key: &str) -> String {
  format!("{}_chunk_", key)
}

pub fn chunk_key(key: &str, index: usize) -> String {
  format!("{}_chunk_{}", key, index)
}

impl<S: KeyValueStore> ChunkStore<S> {
  pub fn new(store: S) -> Self {
    Self { store }
  }

  /// The underlying store.
  pub fn backend(&self) -> &S {
    &self.store
  }

  /// Persist `payload` under `key`, replacing whatever layout was there.
  pub fn store<T>(&self, key: &str, payload: &T, max_chunk_bytes: usize) -> CacheResult<StoreReceipt>
  where
    T: Chunked + Serialize,
  {
    let encoded = serde_json::to_string(payload).map_err(CacheError::format)?;
    let total_size = encoded.len();

    let wanted = parts_needed(total_size, max_chunk_bytes);
    if wanted == 1 {
      return self.write_parts(key, &[encoded], total_size);
    }
    drop(encoded);

    let parts = payload
      .split(wanted)
      .iter()
      .map(|piece| serde_json::to_string(piece).map_err(CacheError::format))
      .collect::<CacheResult<Vec<_>>>()?;
    self.write_parts(key, &parts, total_size)
  }

  /// Read back a payload written by [`ChunkStore::store`].
  ///
  /// `Ok(None)` is a plain miss. An index whose chunks are missing or
  /// outnumbered fails with [`CacheError::Corruption`].
  pub fn retrieve<T>(&self, key: &str) -> CacheResult<Option<T>>
  where
    T: Chunked + DeserializeOwned,
  {
    let Some(parts) = self.read_parts(key)? else {
      return Ok(None);
    };
    let pieces = parts
      .iter()
      .map(|text| serde_json::from_str(text).map_err(CacheError::format))
      .collect::<CacheResult<Vec<T>>>()?;
    T::merge(pieces).map(Some).map_err(|reason| corruption(key, reason))
  }

  /// Write already encoded pieces. One piece goes under `key` itself;
  /// several get an index describing `total_size` and one slot each.
  ///
  /// Pieces must each be a complete document, as produced from
  /// [`Chunked::split`].
  pub fn write_parts(&self, key: &str, parts: &[String], total_size: usize) -> CacheResult<StoreReceipt> {
    if parts.is_empty() {
      return Err(CacheError::Format(format!("no pieces to store under '{}'", key)));
    }
    if let [text] = parts {
      // Drop the index first so no reader pairs it with the new value.
      self.store.remove_item(&info_key(key))?;
      self.store.set_item(key, text)?;
      self.remove_chunks_from(key, 0)?;
      debug!(key, total_size, "stored cache payload as a single value");
      return Ok(StoreReceipt {
        chunks: 1,
        total_size,
      });
    }

    let index = ChunkIndex {
      total_chunks: parts.len(),
      total_size,
      created_at: Utc::now(),
    };

    let index_text = serde_json::to_string(&index).map_err(CacheError::format)?;
    self.store.set_item(&info_key(key), &index_text)?;
    for (i, text) in parts.iter().enumerate() {
      self.store.set_item(&chunk_key(key, i), text)?;
    }

    self.store.remove_item(key)?;
    self.remove_chunks_from(key, parts.len())?;

    debug!(key, chunks = parts.len(), total_size, "stored cache payload in chunks");
    Ok(StoreReceipt {
      chunks: parts.len(),
      total_size,
    })
  }

  /// Raw pieces under `key`, in order. A single value comes back as one
  /// piece.
  pub fn read_parts(&self, key: &str) -> CacheResult<Option<Vec<String>>> {
    let Some(index) = self.read_index(key)? else {
      return Ok(self.store.get_item(key)?.map(|text| vec![text]));
    };

    if index.total_chunks == 0 {
      return Err(corruption(key, "index declares zero chunks"));
    }

    let present = self.chunk_keys(key)?.len();
    if present != index.total_chunks {
      return Err(corruption(
        key,
        format!(
          "index declares {} chunks but {} are present",
          index.total_chunks, present
        ),
      ));
    }

    let mut parts = Vec::with_capacity(index.total_chunks);
    for i in 0..index.total_chunks {
      let text = self
        .store
        .get_item(&chunk_key(key, i))?
        .ok_or_else(|| corruption(key, format!("chunk {} is missing", i)))?;
      parts.push(text);
    }
    Ok(Some(parts))
  }

  /// Remove every slot belonging to `key`. Safe to call on absent keys.
  pub fn clear(&self, key: &str) -> CacheResult<()> {
    self.store.remove_item(&info_key(key))?;
    for chunk in self.chunk_keys(key)? {
      self.store.remove_item(&chunk)?;
    }
    self.store.remove_item(key)?;
    debug!(key, "cleared cache slots");
    Ok(())
  }

  /// Describe the current layout of `key` without decoding the payload.
  pub fn layout(&self, key: &str) -> CacheResult<Layout> {
    if let Some(index) = self.read_index(key)? {
      return Ok(Layout::Chunked(index));
    }
    Ok(match self.store.get_item(key)? {
      Some(text) => Layout::Single { bytes: text.len() },
      None => Layout::Empty,
    })
  }

  fn read_index(&self, key: &str) -> CacheResult<Option<ChunkIndex>> {
    match self.store.get_item(&info_key(key))? {
      Some(text) => serde_json::from_str(&text)
        .map(Some)
        .map_err(|e| corruption(key, format!("unreadable chunk index: {}", e))),
      None => Ok(None),
    }
  }

  /// Chunk slot keys for `key` that are physically present.
  fn chunk_keys(&self, key: &str) -> CacheResult<Vec<String>> {
    let prefix = chunk_prefix(key);
    Ok(
      self
        .store
        .keys()?
        .into_iter()
        .filter(|k| {
          k.strip_prefix(&prefix)
            .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
        })
        .collect(),
    )
  }

  /// Remove chunk slots numbered `from` and above.
  fn remove_chunks_from(&self, key: &str, from: usize) -> CacheResult<()> {
    let prefix = chunk_prefix(key);
    for stale in self.chunk_keys(key)? {
      let index = stale[prefix.len()..].parse::<usize>().unwrap_or(usize::MAX);
      if index >= from {
        self.store.remove_item(&stale)?;
      }
    }
    Ok(())
  }
}

fn corruption(key: &str, reason: impl Into<String>) -> CacheError {
  let reason = reason.into();
  warn!(key, %reason, "cache layout is corrupted");
  CacheError::Corruption {
    key: key.to_string(),
    reason,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::MemoryStore;
  use crate::testing::{record, FailingStore};
  use crate::remote::Record;

  const KEY: &str = "dashboard_data_cache";

  fn rows(n: usize) -> Vec<Record> {
    (0..n as i64)
      .map(|i| record(i, "2024-06-01T12:00:00Z"))
      .collect()
  }

  #[test]
  fn test_small_payload_is_single_value() {
    let chunks = ChunkStore::new(MemoryStore::new());
    let payload = rows(5);

    let receipt = chunks.store(KEY, &payload, DEFAULT_MAX_CHUNK_BYTES).unwrap();
    assert_eq!(receipt.chunks, 1);
    assert_eq!(chunks.backend().keys().unwrap(), vec![KEY]);
    assert_eq!(chunks.retrieve::<Vec<Record>>(KEY).unwrap(), Some(payload));
  }

  #[test]
  fn test_large_payload_is_chunked_and_reassembled() {
    let chunks = ChunkStore::new(MemoryStore::new());
    let payload = rows(1000);
    let max = 8_000;

    let receipt = chunks.store(KEY, &payload, max).unwrap();
    assert!(receipt.chunks > 1);

    match chunks.layout(KEY).unwrap() {
      Layout::Chunked(index) => {
        assert_eq!(index.total_chunks, receipt.chunks);
        assert_eq!(index.total_size, receipt.total_size);
      }
      other => panic!("expected chunked layout, got {:?}", other),
    }
    assert_eq!(chunks.backend().get_item(KEY).unwrap(), None);
    assert_eq!(chunks.retrieve::<Vec<Record>>(KEY).unwrap(), Some(payload));
  }

  #[test]
  fn test_every_chunk_is_a_standalone_document() {
    let chunks = ChunkStore::new(MemoryStore::new());
    let payload = rows(1000);
    let receipt = chunks.store(KEY, &payload, 8_000).unwrap();

    let mut rejoined = Vec::new();
    for i in 0..receipt.chunks {
      let text = chunks.backend().get_item(&chunk_key(KEY, i)).unwrap().unwrap();
      let piece: Vec<Record> = serde_json::from_str(&text).unwrap();
      assert!(!piece.is_empty());
      rejoined.extend(piece);
    }
    assert_eq!(rejoined, payload);
  }

  #[test]
  fn test_missing_chunk_is_corruption() {
    let chunks = ChunkStore::new(MemoryStore::new());
    chunks.store(KEY, &rows(1000), 8_000).unwrap();
    chunks.backend().remove_item(&chunk_key(KEY, 1)).unwrap();

    let err = chunks.retrieve::<Vec<Record>>(KEY).unwrap_err();
    assert!(matches!(err, CacheError::Corruption { .. }));
  }

  #[test]
  fn test_extra_chunk_is_corruption() {
    let chunks = ChunkStore::new(MemoryStore::new());
    let receipt = chunks.store(KEY, &rows(1000), 8_000).unwrap();
    chunks
      .backend()
      .set_item(&chunk_key(KEY, receipt.chunks), "[]")
      .unwrap();

    let err = chunks.retrieve::<Vec<Record>>(KEY).unwrap_err();
    assert!(matches!(err, CacheError::Corruption { .. }));
  }

  #[test]
  fn test_rewrite_replaces_previous_layout() {
    let chunks = ChunkStore::new(MemoryStore::new());
    let first = chunks.store(KEY, &rows(1000), 5_000).unwrap();
    let second = chunks.store(KEY, &rows(300), 5_000).unwrap();
    assert!(second.chunks < first.chunks);
    assert_eq!(chunks.retrieve::<Vec<Record>>(KEY).unwrap(), Some(rows(300)));

    chunks.store(KEY, &rows(2), 5_000).unwrap();
    assert_eq!(chunks.backend().keys().unwrap(), vec![KEY]);
    assert_eq!(chunks.retrieve::<Vec<Record>>(KEY).unwrap(), Some(rows(2)));
  }

  #[test]
  fn test_clear_is_idempotent() {
    let chunks = ChunkStore::new(MemoryStore::new());
    chunks.clear(KEY).unwrap();

    chunks.store(KEY, &rows(1000), 8_000).unwrap();
    chunks.backend().set_item("unrelated", "keep").unwrap();
    chunks.clear(KEY).unwrap();
    chunks.clear(KEY).unwrap();

    assert_eq!(chunks.backend().keys().unwrap(), vec!["unrelated"]);
    assert_eq!(chunks.retrieve::<Vec<Record>>(KEY).unwrap(), None);
  }

  #[test]
  fn test_clear_leaves_similarly_named_keys() {
    let chunks = ChunkStore::new(MemoryStore::new());
    chunks.backend().set_item("dashboard_data_cache_chunk_notes", "x").unwrap();
    chunks.clear(KEY).unwrap();
    assert_eq!(
      chunks.backend().keys().unwrap(),
      vec!["dashboard_data_cache_chunk_notes"]
    );
  }

  #[test]
  fn test_legacy_index_field_name() {
    let chunks = ChunkStore::new(MemoryStore::new());
    let store = chunks.backend();
    store
      .set_item(&info_key(KEY), r#"{"totalChunks":2,"totalSize":10,"timestamp":1717000000000}"#)
      .unwrap();
    store.set_item(&chunk_key(KEY, 0), "[1,2]").unwrap();
    store.set_item(&chunk_key(KEY, 1), "[3]").unwrap();

    assert_eq!(chunks.retrieve::<Vec<u32>>(KEY).unwrap(), Some(vec![1, 2, 3]));
  }

  #[test]
  fn test_malformed_single_value_is_format_error() {
    let chunks = ChunkStore::new(MemoryStore::new());
    chunks.backend().set_item(KEY, "[{\"id\":").unwrap();
    assert!(matches!(
      chunks.retrieve::<Vec<Record>>(KEY),
      Err(CacheError::Format(_))
    ));
  }

  #[test]
  fn test_quota_failure_is_classified() {
    let chunks = ChunkStore::new(FailingStore::quota());
    let err = chunks.store(KEY, &rows(3), DEFAULT_MAX_CHUNK_BYTES).unwrap_err();
    assert!(matches!(err, CacheError::QuotaExceeded { .. }));
  }
}
