//! Shapes that get persisted under the cache key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::chunk_store::{slice_evenly, Chunked};
use super::cipher::{IV_LEN, SALT_LEN};
use crate::remote::Record;

/// Output of [`Cipher::encrypt`](super::cipher::Cipher::encrypt).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedBlob {
  pub iv: [u8; IV_LEN],
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub salt: Option<[u8; SALT_LEN]>,
  /// Base64 ciphertext including the GCM tag.
  pub data: String,
}

/// Plaintext snapshot of the mirrored tables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEnvelope {
  /// When the remote fetch that produced `dataset` completed.
  #[serde(with = "chrono::serde::ts_milliseconds")]
  pub timestamp: DateTime<Utc>,
  #[serde(rename = "data")]
  pub dataset: Vec<Record>,
  #[serde(rename = "errorData", default)]
  pub sidecar: Vec<Record>,
}

impl CacheEnvelope {
  pub fn is_fresh(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
    now - self.timestamp < ttl
  }

  /// Size in bytes of the plaintext JSON of this envelope.
  pub fn encoded_size(&self) -> usize {
    serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
  }
}

/// What actually sits in the key/value store.
///
/// Encrypted blobs are tried first; anything that does not have the blob
/// shape is read as a plain envelope (writes that fell back to plaintext,
/// or caches written before encryption existed).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredPayload {
  Encrypted(EncryptedBlob),
  Plain(CacheEnvelope),
}

impl StoredPayload {
  pub fn is_encrypted(&self) -> bool {
    matches!(self, Self::Encrypted(_))
  }
}

impl Chunked for CacheEnvelope {
  /// Every piece repeats the timestamp; the sidecar rides in the first piece.
  fn split(&self, parts: usize) -> Vec<Self> {
    slice_evenly(&self.dataset, parts)
      .into_iter()
      .enumerate()
      .map(|(i, dataset)| Self {
        timestamp: self.timestamp,
        dataset,
        sidecar: if i == 0 {
          self.sidecar.clone()
        } else {
          Vec::new()
        },
      })
      .collect()
  }

  fn merge(parts: Vec<Self>) -> Result<Self, String> {
    let mut parts = parts.into_iter();
    let mut merged = parts.next().ok_or("no pieces to merge")?;
    for (i, piece) in parts.enumerate() {
      if piece.timestamp != merged.timestamp {
        return Err(format!("piece {} has a different timestamp", i + 1));
      }
      merged.dataset.extend(piece.dataset);
      merged.sidecar.extend(piece.sidecar);
    }
    Ok(merged)
  }
}
