//! Error taxonomy for the cache and sync layers.
//!
//! Cache errors are always recoverable at the coordinator boundary: reads
//! degrade to a miss, writes degrade to an advisory notice. Fetch errors are
//! the only kind that abort a user-facing operation.

use thiserror::Error;

/// Failures raised by the cipher, codec, chunk store and key/value backends.
#[derive(Debug, Error)]
pub enum CacheError {
  /// Ciphertext did not verify under the derived key (wrong passphrase,
  /// wrong IV or tampered bytes).
  #[error("authentication failed: ciphertext did not verify")]
  Authentication,

  /// Malformed encoded text or JSON.
  #[error("format error: {0}")]
  Format(String),

  /// Chunk index and chunk slots disagree.
  #[error("corrupted cache layout for '{key}': {reason}")]
  Corruption { key: String, reason: String },

  /// The backing store is full.
  #[error("storage quota exceeded while writing '{key}'")]
  QuotaExceeded { key: String },

  /// The cipher itself failed (sealing, key state).
  #[error("cipher error: {0}")]
  Crypto(String),

  /// Any other store I/O failure.
  #[error("storage error: {0}")]
  Storage(String),
}

impl CacheError {
  /// Classify this error for the failure policy.
  pub fn kind(&self) -> FailureKind {
    match self {
      Self::Authentication => FailureKind::Authentication,
      Self::Crypto(_) => FailureKind::Crypto,
      Self::Format(_) => FailureKind::Format,
      Self::Corruption { .. } => FailureKind::Corruption,
      Self::QuotaExceeded { .. } => FailureKind::QuotaExceeded,
      Self::Storage(_) => FailureKind::Storage,
    }
  }

  pub(crate) fn format(err: impl std::fmt::Display) -> Self {
    Self::Format(err.to_string())
  }

  pub(crate) fn storage(err: impl std::fmt::Display) -> Self {
    Self::Storage(err.to_string())
  }
}

/// Coarse classification of a [`CacheError`], as seen by the failure policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
  Authentication,
  Crypto,
  Format,
  Corruption,
  QuotaExceeded,
  Storage,
}

/// Failures while talking to the remote data source.
#[derive(Debug, Error)]
pub enum FetchError {
  /// The remote answered with an error status.
  #[error("remote error on '{table}' (status {status}): {message}")]
  Remote {
    table: String,
    status: u16,
    message: String,
  },

  /// The request never completed (connect, timeout, TLS).
  #[error("transport error on '{table}': {message}")]
  Transport { table: String, message: String },

  /// The response body could not be decoded into rows.
  #[error("could not decode response from '{table}': {message}")]
  Decode { table: String, message: String },
}

impl FetchError {
  /// Table the failing request targeted.
  pub fn table(&self) -> &str {
    match self {
      Self::Remote { table, .. } | Self::Transport { table, .. } | Self::Decode { table, .. } => {
        table
      }
    }
  }
}

pub type CacheResult<T> = std::result::Result<T, CacheError>;
