use chrono::{DateTime, Months, Utc};
use tracing::{debug, info, warn};

use super::types::{PageQuery, Record, DEFAULT_CREATED_COLUMN};
use super::RemoteSource;
use crate::error::FetchError;

/// Rows requested per page.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// How far back a sync reaches.
pub const DEFAULT_RETENTION_MONTHS: u32 = 2;

/// Oldest creation time a sync started at `now` will pull.
pub fn window_start(now: DateTime<Utc>, retention_months: u32) -> DateTime<Utc> {
  now
    .checked_sub_months(Months::new(retention_months))
    .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Pulls complete, time-bounded tables from a [`RemoteSource`].
pub struct SyncEngine<R> {
  remote: R,
  page_size: usize,
  created_column: String,
}

impl<R: RemoteSource> SyncEngine<R> {
  pub fn new(remote: R) -> Self {
    Self {
      remote,
      page_size: DEFAULT_PAGE_SIZE,
      created_column: DEFAULT_CREATED_COLUMN.to_string(),
    }
  }

  pub fn with_page_size(mut self, page_size: usize) -> Self {
    self.page_size = page_size.max(1);
    self
  }

  pub fn with_created_column(mut self, column: impl Into<String>) -> Self {
    self.created_column = column.into();
    self
  }

  pub fn remote(&self) -> &R {
    &self.remote
  }

  pub fn created_column(&self) -> &str {
    &self.created_column
  }

  /// Fetch every row of `table` created at or after `window_start`.
  ///
  /// Pages are requested one after another; a short or empty page ends the
  /// sync. Any page error aborts the whole fetch and discards earlier pages.
  pub async fn fetch_all(&self, table: &str, window_start: DateTime<Utc>) -> Result<Vec<Record>, FetchError> {
    info!(table, since = %window_start, "fetching table");

    let mut rows = Vec::new();
    let mut page = 0usize;

    loop {
      let query = PageQuery {
        table: table.to_string(),
        created_column: self.created_column.clone(),
        since: window_start,
        offset: page * self.page_size,
        limit: self.page_size,
      };

      let batch = self.remote.query(&query).await.map_err(|e| {
        warn!(table, page = page + 1, error = %e, "page request failed");
        e
      })?;

      let count = batch.len();
      debug!(table, page = page + 1, count, "received page");
      rows.extend(batch);

      // Check if we've fetched all rows
      if count < self.page_size {
        break;
      }
      page += 1;
    }

    info!(table, rows = rows.len(), pages = page + 1, "table fetched");
    Ok(rows)
  }
}
