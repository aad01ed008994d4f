//! Dashboard data access: the cache coordinator plus the remote mutations
//! that have to keep the cached envelope in step.

use color_eyre::{eyre::eyre, Result};
use serde_json::{Map, Value};
use tokio::sync::mpsc::UnboundedSender;
use tracing::info;

use crate::cache::{
  probe_capacity, CacheCoordinator, CacheFailurePolicy, CacheStatus, Cipher, KeyValueStore,
  LoadOutcome, Notice, SqliteStore, Tables,
};
use crate::config::Config;
use crate::remote::{PostgrestClient, RemoteSource, SyncEngine, TableRole};

/// Dashboard data source with transparent encrypted caching.
pub struct Dashboard<R, S: KeyValueStore> {
  coordinator: CacheCoordinator<R, S>,
}

impl Dashboard<PostgrestClient, SqliteStore> {
  /// Build the live stack from configuration and environment.
  pub fn new(config: &Config, notices: Option<UnboundedSender<Notice>>) -> Result<Self> {
    let remote = PostgrestClient::new(&config.remote)?;
    let sync = SyncEngine::new(remote)
      .with_page_size(config.remote.page_size)
      .with_created_column(config.remote.created_column.clone());

    let store = match &config.cache.db_path {
      Some(path) => SqliteStore::open(path)?,
      None => SqliteStore::open_default()?,
    }
    .with_quota(config.cache.store_quota_bytes);

    let cipher = Cipher::new(Config::get_passphrase()?).with_salt_mode(config.cache.salt_mode);

    let tables = Tables {
      primary: config.remote.table.clone(),
      sidecar: config.remote.sidecar_table.clone(),
    };

    let mut policy = CacheFailurePolicy::new(config.cache.max_failures);
    if let Some(tx) = notices {
      policy = policy.with_notices(tx);
    }

    let coordinator = CacheCoordinator::new(sync, store, cipher, tables)
      .with_settings(config.cache.settings())
      .with_policy(policy);

    Ok(Self::from_parts(coordinator))
  }
}

impl<R: RemoteSource, S: KeyValueStore> Dashboard<R, S> {
  pub fn from_parts(coordinator: CacheCoordinator<R, S>) -> Self {
    Self { coordinator }
  }

  pub fn coordinator(&self) -> &CacheCoordinator<R, S> {
    &self.coordinator
  }

  /// Load the dataset, serving a fresh cache when allowed.
  pub async fn load(&self, force_refresh: bool) -> Result<LoadOutcome> {
    Ok(self.coordinator.load(force_refresh).await?)
  }

  /// Update one row remotely, then patch the cached copy.
  ///
  /// Returns whether the cached copy contained the row.
  pub async fn update_record(&self, role: TableRole, id: &Value, patch: Map<String, Value>) -> Result<bool> {
    let table = self.table(role)?;
    self.coordinator.remote().update(table, id, &patch).await?;
    info!(table, %id, fields = patch.len(), "record updated");

    Ok(
      self
        .coordinator
        .persist_update(role, id, |record| record.apply_patch(&patch))
        .await,
    )
  }

  /// Delete one row remotely, then drop it from the cached copy.
  pub async fn delete_record(&self, role: TableRole, id: &Value) -> Result<bool> {
    let table = self.table(role)?;
    self.coordinator.remote().delete(table, id).await?;
    info!(table, %id, "record deleted");

    Ok(self.coordinator.persist_removal(role, id).await)
  }

  /// Purge the cache and turn caching back on.
  pub async fn clear_cache(&self) -> Result<()> {
    Ok(self.coordinator.clear_cache().await?)
  }

  pub async fn status(&self) -> CacheStatus {
    self.coordinator.status().await
  }

  /// Whether `bytes` more bytes currently fit in the store.
  pub fn probe(&self, bytes: usize) -> Result<bool> {
    Ok(probe_capacity(self.coordinator.chunk_store().backend(), bytes)?)
  }

  /// Resolve a CLI table name to its role.
  pub fn role_of(&self, table: &str) -> Result<TableRole> {
    let tables = self.coordinator.tables();
    if table == tables.primary {
      Ok(TableRole::Primary)
    } else if tables.sidecar.as_deref() == Some(table) {
      Ok(TableRole::Sidecar)
    } else {
      Err(eyre!("Unknown table: {}", table))
    }
  }

  fn table(&self, role: TableRole) -> Result<&str> {
    self
      .coordinator
      .tables()
      .name(role)
      .ok_or_else(|| eyre!("No {:?} table configured", role))
  }
}
