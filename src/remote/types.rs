use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Default name of the row creation timestamp column.
pub const DEFAULT_CREATED_COLUMN: &str = "created_at";

/// One row of a mirrored table.
///
/// Rows are opaque JSON objects; only the `id` and the creation timestamp
/// column carry meaning for syncing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
  pub fn new(fields: Map<String, Value>) -> Self {
    Self(fields)
  }

  pub fn fields(&self) -> &Map<String, Value> {
    &self.0
  }

  pub fn get(&self, field: &str) -> Option<&Value> {
    self.0.get(field)
  }

  pub fn id(&self) -> Option<&Value> {
    self.0.get("id")
  }

  pub fn has_id(&self, id: &Value) -> bool {
    self.id() == Some(id)
  }

  /// Parse the creation timestamp stored in `column` (RFC 3339).
  pub fn created_at(&self, column: &str) -> Option<DateTime<Utc>> {
    self
      .0
      .get(column)
      .and_then(Value::as_str)
      .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
      .map(|dt| dt.with_timezone(&Utc))
  }

  /// Shallow-merge `patch` into this row.
  pub fn apply_patch(&mut self, patch: &Map<String, Value>) {
    for (field, value) in patch {
      self.0.insert(field.clone(), value.clone());
    }
  }

  /// Serialized size in bytes.
  pub fn encoded_size(&self) -> usize {
    serde_json::to_vec(&self.0).map(|v| v.len()).unwrap_or(0)
  }
}

impl From<Map<String, Value>> for Record {
  fn from(fields: Map<String, Value>) -> Self {
    Self(fields)
  }
}

/// Which of the mirrored tables a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableRole {
  /// The main dataset.
  Primary,
  /// The secondary table cached alongside it (error reports).
  Sidecar,
}

/// One page request against a remote table.
///
/// Rows must come back filtered to `created_at >= since` and ordered by
/// `(created_at desc, id desc)`; the id tiebreak makes the order total so
/// offset paging neither repeats nor skips rows sharing a timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageQuery {
  pub table: String,
  pub created_column: String,
  pub since: DateTime<Utc>,
  pub offset: usize,
  pub limit: usize,
}
