//! Encrypted, chunked local cache of the mirrored dataset.
//!
//! This module provides:
//! - passphrase based authenticated encryption of cache envelopes
//! - a chunked layout over a size-limited key/value store
//! - a failure policy that switches caching off after repeated storage errors
//! - the coordinator that ties those to the remote sync

pub mod chunk_store;
pub mod cipher;
pub mod codec;
mod coordinator;
mod envelope;
mod policy;
mod storage;

pub use chunk_store::{parts_needed, ChunkIndex, ChunkStore, Chunked, Layout, StoreReceipt, DEFAULT_MAX_CHUNK_BYTES};
pub use cipher::{Cipher, SaltMode, Sealer};
pub use coordinator::{
  CacheCoordinator, CacheSettings, CacheSource, CacheStatus, Clock, LoadOutcome, SystemClock, Tables,
  DEFAULT_CACHE_KEY,
};
pub use envelope::{CacheEnvelope, EncryptedBlob, StoredPayload};
pub use policy::{
  CacheFailurePolicy, FailureCounter, Notice, NoticeLevel, PolicyState, DEFAULT_MAX_FAILURES,
};
pub use storage::{probe_capacity, KeyValueStore, MemoryStore, SqliteStore, DEFAULT_PROBE_BYTES};
