use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

/// Static shell of the dashboard, pre-cached on install.
const DEFAULT_MANIFEST: &[&str] = &[
  "/",
  "/index.html",
  "/src/styles/main.css",
  "/src/styles/components.css",
  "/src/styles/animations.css",
  "/src/scripts/config.js",
  "/src/scripts/appwrite.js",
  "/src/scripts/app.js",
  "/src/scripts/animations.js",
  "/manifest.json",
  "https://fonts.googleapis.com/css2?family=Outfit:wght@300;400;500;600;700&family=Space+Mono:wght@400;700&display=swap",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin the dashboard is served from; decides which responses are same-origin
  pub origin: String,
  /// Name of the live cache generation
  pub cache_version: String,
  /// Assets fetched on install, root-relative or absolute
  pub manifest: Vec<String>,
  /// Document served to navigations when the network is down
  pub fallback_document: String,
  /// Where queued sales are POSTed, relative to the origin unless absolute
  pub sale_endpoint: String,
  /// Name of the local sale database
  pub database: String,
  /// Sync tag that triggers a replay
  pub sync_tag: String,
  /// Activate right after a successful install
  pub skip_waiting: bool,
  pub request_timeout_secs: u64,
  /// Overrides the platform data directory
  pub data_dir: Option<PathBuf>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:8080".to_string(),
      cache_version: "scotech-inventory-v1".to_string(),
      manifest: DEFAULT_MANIFEST.iter().map(|s| s.to_string()).collect(),
      fallback_document: "/index.html".to_string(),
      sale_endpoint: "/api/sales".to_string(),
      database: "scotech-inventory".to_string(),
      sync_tag: "sync-sales".to_string(),
      skip_waiting: true,
      request_timeout_secs: 30,
      data_dir: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./scotech-sw.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/scotech-sw/config.yaml
  ///
  /// Without any file the built-in defaults are used.
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
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("scotech-sw.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("scotech-sw").join("config.yaml");
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
    config.origin_url()?;
    Ok(config)
  }

  pub fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  /// Resolve a root-relative path (or pass through an absolute URL).
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin_url()?
      .join(path)
      .map_err(|e| eyre!("Invalid URL '{}': {}", path, e))
  }

  pub fn sale_endpoint_url(&self) -> Result<Url> {
    self.resolve(&self.sale_endpoint)
  }

  /// Directory holding databases and logs.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("scotech-sw"))
  }

  pub fn cache_db_path(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join("caches.db"))
  }

  pub fn sales_db_path(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join(format!("{}.db", self.database)))
  }

  pub fn log_dir(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join("logs"))
  }

  /// Bearer token for the sale endpoint, from SCOTECH_API_TOKEN.
  pub fn get_api_token() -> Option<String> {
    std::env::var("SCOTECH_API_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }
}
