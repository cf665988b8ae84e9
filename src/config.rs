//! Configuration loader and validator for the content sync daemon.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub server: Server,
    #[serde(default)]
    pub assets: Assets,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// How often the daemon wakes to deliver writes and check staleness.
    pub sync_interval_ms: u64,
    /// A cache older than this is pulled again: in the background on read,
    /// and on the daemon's next wake-up.
    pub stale_after_seconds: u64,
    #[serde(default = "default_page_size")]
    pub page_size: i64,
}

/// Content server connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Server {
    pub base_url: String,
    pub token: String,
    /// Acting user; unset means anonymous and no sync runs.
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Asset download settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Assets {
    pub max_concurrent_downloads: usize,
    #[serde(default)]
    pub media_dir: Option<String>,
}

impl Default for Assets {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 4,
            media_dir: None,
        }
    }
}

fn default_page_size() -> i64 {
    10
}

impl Config {
    /// Ensure required directories exist (data dir and media dir).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)?;
        fs::create_dir_all(self.media_dir())
    }

    /// `assets.media_dir`, or `<data_dir>/media` when unset.
    pub fn media_dir(&self) -> PathBuf {
        match self.assets.media_dir.as_deref().filter(|d| !d.trim().is_empty()) {
            Some(dir) => PathBuf::from(dir),
            None => Path::new(&self.app.data_dir).join("media"),
        }
    }

    /// `DATABASE_URL` if set, otherwise `<data_dir>/content.db`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/content.db", self.app.data_dir))
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.sync_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.sync_interval_ms must be > 0"));
    }
    if cfg.app.stale_after_seconds == 0 {
        return Err(ConfigError::Invalid("app.stale_after_seconds must be > 0"));
    }
    if cfg.app.page_size <= 0 {
        return Err(ConfigError::Invalid("app.page_size must be > 0"));
    }

    if cfg.server.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("server.base_url must be non-empty"));
    }
    if reqwest::Url::parse(&cfg.server.base_url).is_err() {
        return Err(ConfigError::Invalid("server.base_url must be an absolute URL"));
    }

    if cfg.assets.max_concurrent_downloads == 0 {
        return Err(ConfigError::Invalid("assets.max_concurrent_downloads must be >= 1"));
    }

    Ok(())
}

/// Returns a complete, valid example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  sync_interval_ms: 300000
  stale_after_seconds: 900
  page_size: 10

server:
  base_url: "https://api.example.com/"
  token: "YOUR_API_TOKEN"
  user_id: "user-123"

assets:
  max_concurrent_downloads: 4
"#
}
