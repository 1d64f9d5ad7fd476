use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub sync: SyncConfig,
  pub cache: CacheConfig,
  #[serde(default)]
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Remote batch endpoint, e.g. "https://shop.example/api/sync/"
  pub endpoint: String,
  /// Cookie carrying the anti-forgery token
  #[serde(default = "default_csrf_cookie")]
  pub csrf_cookie: String,
  /// Bounded timeout for a batch submission
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Origin served by the worker, e.g. "https://shop.example"
  pub origin: String,
  /// Label of the cache generation this build installs
  pub generation: String,
  /// Path prefix routed network-first as API traffic
  #[serde(default = "default_api_prefix")]
  pub api_prefix: String,
  /// Resource served when a navigation has no network and no cached copy
  #[serde(default = "default_offline_page")]
  pub offline_page: String,
  /// Shell resources precached at install; paths or absolute CDN URLs
  pub shell_manifest: Vec<String>,
  /// Authenticated page paths purged when a new generation activates
  #[serde(default)]
  pub purge_on_activate: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// Directory for the durable stores (default: platform data dir)
  pub path: Option<PathBuf>,
}

fn default_csrf_cookie() -> String {
  "csrftoken".to_string()
}

fn default_timeout_secs() -> u64 {
  30
}

fn default_api_prefix() -> String {
  "/api/".to_string()
}

fn default_offline_page() -> String {
  "/".to_string()
}

impl StorageConfig {
  fn data_dir(&self) -> Result<PathBuf> {
    if let Some(path) = &self.path {
      return Ok(path.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("tillsync"))
  }

  /// Database file for the durable sync queue (page context).
  pub fn queue_path(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join("queue.db"))
  }

  /// Database file for the response cache (worker context).
  pub fn cache_path(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join("cache.db"))
  }
}

impl Config {
  /// Load the deployment configuration. An explicit path wins and must
  /// exist; otherwise `tillsync.yaml` in the working directory is tried,
  /// then `tillsync/config.yaml` under the platform config directory.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    if let Some(path) = explicit_path {
      if !path.exists() {
        return Err(eyre!("Config file not found: {}", path.display()));
      }
      return Self::load_from_path(path);
    }

    let path = Self::find_config_file().ok_or_else(|| {
      eyre!("No configuration file found. Create one at ~/.config/tillsync/config.yaml")
    })?;
    Self::load_from_path(&path)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("tillsync.yaml");
    if local.exists() {
      return Some(local);
    }

    dirs::config_dir()
      .map(|dir| dir.join("tillsync").join("config.yaml"))
      .filter(|path| path.exists())
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
    serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }
}
