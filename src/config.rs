//! Service configuration.
//!
//! Read from the TOML file named by `RIDESHARE_CONFIG` (default
//! `rideshare.toml`). A missing file yields the defaults, a malformed one logs
//! a warning and yields the defaults. `PORT` and `DATABASE_URL` override the
//! file.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

const CONFIG_ENV: &str = "RIDESHARE_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "rideshare.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub store: StoreConfig,
    pub changes: ChangesConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: [u8; 4],
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: [0, 0, 0, 0],
            port: 3000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_read_connections: u32,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_read_connections: 8,
            busy_timeout_ms: 5_000,
        }
    }
}

/// Timeout and retry policy applied to every store call.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub request_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5_000,
            max_retries: 3,
            retry_backoff_ms: 50,
        }
    }
}

impl StoreConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChangesConfig {
    pub capacity: usize,
}

impl Default for ChangesConfig {
    fn default() -> Self {
        Self { capacity: 256 }
    }
}

/// Production keeps the database on the `/data` volume, local runs under `./data`.
pub fn default_database_url() -> String {
    if Path::new("/data").exists() {
        "sqlite:/data/rideshare.db?mode=rwc".to_string()
    } else {
        "sqlite:./data/rideshare.db?mode=rwc".to_string()
    }
}

impl Config {
    /// Load from the configured path, then apply environment overrides.
    pub async fn load() -> Self {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::from_file(Path::new(&path)).await;

        if let Some(port) = std::env::var("PORT").ok().and_then(|p| p.parse().ok()) {
            config.server.port = port;
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database.url = url;
        }

        config
    }

    pub async fn from_file(path: &Path) -> Self {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No config found at {}, using defaults", path.display());
                return Self::default();
            }
            Err(err) => {
                tracing::warn!("Failed to read {}: {err}, using defaults", path.display());
                return Self::default();
            }
        };

        match toml::from_str::<Config>(&content) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("Failed to parse {}: {err}, using defaults", path.display());
                Self::default()
            }
        }
    }
}
