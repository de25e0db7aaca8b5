use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Immutable settings shared by every component.
///
/// Built once at startup and handed to each component on construction.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin of the controlled application; relative paths resolve against it.
  /// Validated on load, read through [`Config::origin`].
  pub origin: String,
  /// Where the cache and queue databases live (defaults to the XDG data dir)
  pub data_dir: Option<PathBuf>,
  pub cache: CacheConfig,
  pub queue: QueueConfig,
  pub reconcile: ReconcileConfig,
  pub api: ApiConfig,
  pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Name of the current cache generation; bump it to ship a new version
  pub generation: String,
  /// Resources fetched and stored at install time
  pub precache: Vec<String>,
  /// Path suffixes served cache-first (matched case-insensitively)
  #[serde(deserialize_with = "deserialize_lowercase_list")]
  pub static_extensions: Vec<String>,
  pub app_root: String,
  pub offline_document: String,
  /// Served in place of images that are neither cached nor reachable
  pub placeholder_image: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  pub store_name: String,
  /// Re-execute failed items on every drain instead of waiting for a manual retry
  pub retry_failed: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
  pub interval_secs: u64,
  /// Resources checked for upstream changes and refreshed on the periodic pass
  pub fresh_resources: Vec<String>,
  /// Upper bound on concurrent fetches in one refresh or population pass
  pub concurrency: usize,
  pub probe_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  pub submit_endpoint: String,
  pub update_endpoint: String,
  pub push_key_endpoint: String,
  pub push_subscription_endpoint: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
  pub app_name: String,
  pub default_body: String,
  pub update_body: String,
  pub icon: String,
  pub badge: String,
  pub vibration: Vec<u32>,
  pub default_tag: String,
  pub default_url: String,
  pub open_title: String,
  pub close_title: String,
}

fn deserialize_lowercase_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(
    v.into_iter()
      .map(|s| s.trim_start_matches('.').to_lowercase())
      .collect(),
  )
}

fn strings(items: &[&str]) -> Vec<String> {
  items.iter().map(|s| s.to_string()).collect()
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:8080/".to_string(),
      data_dir: None,
      cache: CacheConfig::default(),
      queue: QueueConfig::default(),
      reconcile: ReconcileConfig::default(),
      api: ApiConfig::default(),
      notifications: NotificationConfig::default(),
    }
  }
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      generation: "offgrid-cache-v1".to_string(),
      precache: strings(&[
        "/",
        "/index.html",
        "/script.js",
        "/pwa-install.js",
        "/manifest.json",
        "/logo-any.png",
        "/logo-maskable.png",
        "/offline.html",
      ]),
      static_extensions: strings(&["jpg", "jpeg", "png", "gif", "svg", "css", "js"]),
      app_root: "/".to_string(),
      offline_document: "/offline.html".to_string(),
      placeholder_image: "/logo-any.png".to_string(),
    }
  }
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      store_name: "offgrid-sync".to_string(),
      retry_failed: false,
    }
  }
}

impl Default for ReconcileConfig {
  fn default() -> Self {
    Self {
      interval_secs: 24 * 60 * 60,
      fresh_resources: strings(&[
        "/",
        "/index.html",
        "/script.js",
        "/pwa-install.js",
        "/manifest.json",
      ]),
      concurrency: 4,
      probe_interval_secs: 30,
    }
  }
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      submit_endpoint: "/api/submit".to_string(),
      update_endpoint: "/api/update".to_string(),
      push_key_endpoint: "/api/vapid-public-key".to_string(),
      push_subscription_endpoint: "/api/push-subscription".to_string(),
    }
  }
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      app_name: "offgrid".to_string(),
      default_body: "You have a new message".to_string(),
      update_body: "A new version of the application is available".to_string(),
      icon: "/logo-any.png".to_string(),
      badge: "/logo-any.png".to_string(),
      vibration: vec![100, 50, 100],
      default_tag: "default".to_string(),
      default_url: "/".to_string(),
      open_title: "Open app".to_string(),
      close_title: "Close".to_string(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offgrid.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offgrid/config.yaml
  ///
  /// Falls back to built-in defaults when no file exists. Environment
  /// overrides are applied last.
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

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    config.with_env_overrides()
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("offgrid.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offgrid").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.origin()?;
    Ok(config)
  }

  /// Apply OFFGRID_ORIGIN and OFFGRID_DATA_DIR when set.
  fn with_env_overrides(mut self) -> Result<Self> {
    if let Ok(origin) = std::env::var("OFFGRID_ORIGIN") {
      self.origin = origin;
      self
        .origin()
        .map_err(|e| eyre!("Invalid OFFGRID_ORIGIN: {}", e))?;
    }
    if let Ok(dir) = std::env::var("OFFGRID_DATA_DIR") {
      self.data_dir = Some(PathBuf::from(dir));
    }
    Ok(self)
  }

  pub fn origin(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  /// Resolve a configured path (or absolute URL) against the origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin()?
      .join(path)
      .map_err(|e| eyre!("Invalid resource '{}': {}", path, e))
  }

  pub fn resolve_all(&self, paths: &[String]) -> Result<Vec<Url>> {
    paths.iter().map(|p| self.resolve(p)).collect()
  }

  pub fn periodic_interval(&self) -> Duration {
    Duration::from_secs(self.reconcile.interval_secs.max(1))
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.reconcile.probe_interval_secs.max(1))
  }

  /// Directory holding the persistent stores.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offgrid"))
  }

  pub fn cache_db_path(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join("cache.db"))
  }

  pub fn queue_db_path(&self) -> Result<PathBuf> {
    Ok(
      self
        .data_dir()?
        .join(format!("{}.db", self.queue.store_name)),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_mirror_worker_constants() {
    let config = Config::default();
    assert_eq!(config.periodic_interval(), Duration::from_secs(86_400));
    assert_eq!(config.notifications.default_tag, "default");
    assert_eq!(config.api.submit_endpoint, "/api/submit");
    assert!(config.cache.precache.contains(&"/offline.html".to_string()));
  }

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let config = Config::from_yaml(
      "origin: https://app.example.com/\n\
       cache:\n  generation: app-v2\n  static_extensions: ['.PNG', css]\n\
       queue:\n  retry_failed: true\n",
    )
    .unwrap();

    assert_eq!(config.origin().unwrap().as_str(), "https://app.example.com/");
    assert_eq!(config.cache.generation, "app-v2");
    assert_eq!(config.cache.static_extensions, vec!["png", "css"]);
    assert_eq!(config.cache.offline_document, "/offline.html");
    assert!(config.queue.retry_failed);
    assert_eq!(config.reconcile.concurrency, 4);
  }

  #[test]
  fn test_invalid_origin_is_rejected_on_load() {
    let err = Config::from_yaml("origin: not a url\n").unwrap_err();
    assert!(err.to_string().contains("Invalid origin 'not a url'"));
  }

  #[test]
  fn test_resolve_relative_and_absolute() {
    let config = Config::default();
    assert_eq!(
      config.resolve("/index.html").unwrap().as_str(),
      "http://localhost:8080/index.html"
    );
    assert_eq!(
      config.resolve("https://cdn.example.com/x.css").unwrap().as_str(),
      "https://cdn.example.com/x.css"
    );
  }

  #[test]
  fn test_queue_path_uses_store_name() {
    let config = Config {
      data_dir: Some(PathBuf::from("/tmp/offgrid-test")),
      ..Config::default()
    };
    assert_eq!(
      config.queue_db_path().unwrap(),
      PathBuf::from("/tmp/offgrid-test/offgrid-sync.db")
    );
  }
}
