use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::queue::RetryPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  /// Signed-in user; enables the user-specific preload step
  pub user_id: Option<String>,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL, e.g. https://console.example.org/api
  pub url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// Database file (defaults to $XDG_DATA_HOME/fieldsync/offline.db)
  pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// How long a reachability change must hold before it is committed
  #[serde(default = "default_debounce_ms")]
  pub debounce_ms: u64,
  #[serde(default = "default_health_check_interval_secs")]
  pub health_check_interval_secs: u64,
  /// Periodic sync while online; 0 disables it
  #[serde(default = "default_auto_sync_interval_secs")]
  pub auto_sync_interval_secs: u64,
  #[serde(default)]
  pub retry: RetryPolicy,
}

fn default_debounce_ms() -> u64 {
  1500
}

fn default_health_check_interval_secs() -> u64 {
  15
}

fn default_auto_sync_interval_secs() -> u64 {
  300
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      debounce_ms: default_debounce_ms(),
      health_check_interval_secs: default_health_check_interval_secs(),
      auto_sync_interval_secs: default_auto_sync_interval_secs(),
      retry: RetryPolicy::default(),
    }
  }
}

impl SyncConfig {
  pub fn debounce(&self) -> Duration {
    Duration::from_millis(self.debounce_ms)
  }

  pub fn health_check_interval(&self) -> Duration {
    Duration::from_secs(self.health_check_interval_secs.max(1))
  }

  pub fn auto_sync_interval(&self) -> Option<Duration> {
    (self.auto_sync_interval_secs > 0).then(|| Duration::from_secs(self.auto_sync_interval_secs))
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./fieldsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/fieldsync/config.yaml
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
        "No configuration file found. Create one at ~/.config/fieldsync/config.yaml\n\
                 with at least `api: {{ url: ... }}`."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("fieldsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("fieldsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    url::Url::parse(&config.api.url)
      .map_err(|e| eyre!("Invalid api.url '{}': {}", config.api.url, e))?;
    Ok(config)
  }

  /// Get the API session token from the environment, if one was provided.
  pub fn get_api_token() -> Option<String> {
    std::env::var("FIELDSYNC_API_TOKEN").ok()
  }

  /// Get the login password from environment variables.
  ///
  /// Checks FIELDSYNC_PASSWORD.
  pub fn get_password() -> Result<String> {
    std::env::var("FIELDSYNC_PASSWORD")
      .map_err(|_| eyre!("Password not found. Set FIELDSYNC_PASSWORD environment variable."))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::from_yaml("api:\n  url: https://console.example.org/api\n").unwrap();
    assert_eq!(config.user_id, None);
    assert_eq!(config.sync.debounce(), Duration::from_millis(1500));
    assert_eq!(config.sync.retry, RetryPolicy::default());
    assert!(config.storage.path.is_none());
  }

  #[test]
  fn test_full_config() {
    let yaml = r#"
api:
  url: http://localhost:4000/api
user_id: "42"
storage:
  path: /tmp/fieldsync.db
sync:
  debounce_ms: 0
  auto_sync_interval_secs: 0
  retry:
    max_retries: 3
"#;
    let config = Config::from_yaml(yaml).unwrap();
    assert_eq!(config.user_id.as_deref(), Some("42"));
    assert_eq!(config.sync.auto_sync_interval(), None);
    assert_eq!(config.sync.retry.max_retries, 3);
    assert_eq!(config.sync.retry.base_delay_secs, 2);
  }

  #[test]
  fn test_invalid_url_is_rejected() {
    assert!(Config::from_yaml("api:\n  url: not a url\n").is_err());
  }
}
