use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::cache::{CacheSettings, SaltMode, DEFAULT_CACHE_KEY, DEFAULT_MAX_CHUNK_BYTES, DEFAULT_MAX_FAILURES};
use crate::remote::{DEFAULT_CREATED_COLUMN, DEFAULT_PAGE_SIZE, DEFAULT_RETENTION_MONTHS};

/// Application directory name under the platform config/data dirs.
const APP_DIR: &str = "dashsync";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub remote: RemoteConfig,
  #[serde(default)]
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
  /// PostgREST base URL (e.g. a Supabase project URL)
  pub url: String,
  /// Primary table to mirror
  pub table: String,
  /// Secondary table cached alongside the primary one
  pub sidecar_table: Option<String>,
  /// Name of the row creation timestamp column
  #[serde(default = "default_created_column")]
  pub created_column: String,
  #[serde(default = "default_page_size")]
  pub page_size: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub key: String,
  pub ttl_secs: i64,
  pub retention_months: u32,
  pub max_chunk_bytes: usize,
  pub max_failures: u32,
  pub salt_mode: SaltMode,
  /// Emulated store quota in bytes; unlimited when unset
  pub store_quota_bytes: Option<usize>,
  /// Cache database location (default: $XDG_DATA_HOME/dashsync/cache.db)
  pub db_path: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      key: DEFAULT_CACHE_KEY.to_string(),
      ttl_secs: 5 * 60,
      retention_months: DEFAULT_RETENTION_MONTHS,
      max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
      max_failures: DEFAULT_MAX_FAILURES,
      salt_mode: SaltMode::default(),
      store_quota_bytes: None,
      db_path: None,
    }
  }
}

impl CacheConfig {
  pub fn settings(&self) -> CacheSettings {
    CacheSettings {
      key: self.key.clone(),
      ttl: Duration::seconds(self.ttl_secs),
      retention_months: self.retention_months,
      max_chunk_bytes: self.max_chunk_bytes,
    }
  }
}

fn default_created_column() -> String {
  DEFAULT_CREATED_COLUMN.to_string()
}

fn default_page_size() -> usize {
  DEFAULT_PAGE_SIZE
}

/// Per-user data directory for the cache database and logs.
pub fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join(APP_DIR))
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./dashsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/dashsync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/dashsync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("dashsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join(APP_DIR).join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    if config.cache.ttl_secs < 0 {
      return Err(eyre!("cache.ttl_secs must not be negative"));
    }
    Ok(config)
  }

  /// Get the remote API key from environment variables.
  ///
  /// Checks DASHSYNC_API_KEY first, then SUPABASE_API_KEY as fallback.
  pub fn get_api_key() -> Result<String> {
    std::env::var("DASHSYNC_API_KEY")
      .or_else(|_| std::env::var("SUPABASE_API_KEY"))
      .map_err(|_| {
        eyre!("Remote API key not found. Set DASHSYNC_API_KEY or SUPABASE_API_KEY environment variable.")
      })
  }

  /// Get the signed-in session token, if any.
  pub fn get_access_token() -> Option<String> {
    std::env::var("DASHSYNC_ACCESS_TOKEN").ok()
  }

  /// Get the cache passphrase from environment variables.
  pub fn get_passphrase() -> Result<String> {
    std::env::var("DASHSYNC_PASSPHRASE")
      .map_err(|_| eyre!("Cache passphrase not found. Set DASHSYNC_PASSPHRASE environment variable."))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::parse(
      r#"
remote:
  url: https://project.example.co
  table: save_selection
"#,
    )
    .unwrap();

    assert_eq!(config.remote.created_column, "created_at");
    assert_eq!(config.remote.page_size, 1000);
    assert!(config.remote.sidecar_table.is_none());

    let settings = config.cache.settings();
    assert_eq!(settings.key, "dashboard_data_cache");
    assert_eq!(settings.ttl, Duration::minutes(5));
    assert_eq!(settings.retention_months, 2);
    assert_eq!(settings.max_chunk_bytes, 500_000);
    assert_eq!(config.cache.max_failures, 3);
    assert_eq!(config.cache.salt_mode, SaltMode::PerBlob);
  }

  #[test]
  fn test_full_config() {
    let config = Config::parse(
      r#"
remote:
  url: https://project.example.co
  table: save_selection
  sidecar_table: error_reports
  created_column: create_at
cache:
  key: other_cache
  ttl_secs: 60
  salt_mode: fixed
  store_quota_bytes: 5242880
"#,
    )
    .unwrap();

    assert_eq!(config.remote.sidecar_table.as_deref(), Some("error_reports"));
    assert_eq!(config.remote.created_column, "create_at");
    assert_eq!(config.cache.key, "other_cache");
    assert_eq!(config.cache.settings().ttl, Duration::seconds(60));
    assert_eq!(config.cache.salt_mode, SaltMode::Fixed);
    assert_eq!(config.cache.store_quota_bytes, Some(5_242_880));
    assert_eq!(config.cache.max_chunk_bytes, 500_000);
  }

  #[test]
  fn test_rejects_negative_ttl() {
    let err = Config::parse(
      r#"
remote: { url: "https://x.test", table: t }
cache: { ttl_secs: -1 }
"#,
    );
    assert!(err.is_err());
  }

  #[test]
  fn test_missing_explicit_path() {
    assert!(Config::load(Some(Path::new("/definitely/not/here.yaml"))).is_err());
  }
}
