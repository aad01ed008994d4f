//! The remote data source and the pagination engine that mirrors it.

mod client;
mod sync;
mod types;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::FetchError;

pub use client::PostgrestClient;
pub use sync::{window_start, SyncEngine, DEFAULT_PAGE_SIZE, DEFAULT_RETENTION_MONTHS};
pub use types::{PageQuery, Record, TableRole, DEFAULT_CREATED_COLUMN};

/// A paginated, row-addressable remote table store.
#[async_trait]
pub trait RemoteSource: Send + Sync {
  /// Fetch one page; see [`PageQuery`] for the filter and order contract.
  async fn query(&self, query: &PageQuery) -> Result<Vec<Record>, FetchError>;

  /// Shallow-merge `patch` into the row with `id`.
  async fn update(&self, table: &str, id: &Value, patch: &Map<String, Value>) -> Result<(), FetchError>;

  /// Delete the row with `id`.
  async fn delete(&self, table: &str, id: &Value) -> Result<(), FetchError>;
}

#[async_trait]
impl<R: RemoteSource + ?Sized> RemoteSource for Arc<R> {
  async fn query(&self, query: &PageQuery) -> Result<Vec<Record>, FetchError> {
    (**self).query(query).await
  }

  async fn update(&self, table: &str, id: &Value, patch: &Map<String, Value>) -> Result<(), FetchError> {
    (**self).update(table, id, patch).await
  }

  async fn delete(&self, table: &str, id: &Value) -> Result<(), FetchError> {
    (**self).delete(table, id).await
  }
}
