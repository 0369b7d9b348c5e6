//! Configuration management for the flowrun service
//!
//! Server address, storage location and runtime limits, read from
//! environment variables with built-in fallbacks.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    pub port: u16,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Directory holding flowrun.db (created if missing)
    pub data_dir: String,
}

impl DatabaseConfig {
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir).join("flowrun.db")
    }
}

/// Runtime limits and integration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Cap for a single Wait step
    pub max_wait_seconds: u64,
    /// Timeout for outbound HTTP, webhook and mail relay calls
    pub http_timeout_seconds: u64,
    /// Concurrent background runs
    pub background_workers: usize,
    /// Default mail relay for EmailSend steps
    pub mail_relay_url: Option<String>,
}

impl EngineConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_seconds)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for container deployment
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: std::env::var("FLOWRUN_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env_parse("FLOWRUN_PORT", 3004),
            },
            database: DatabaseConfig {
                data_dir: std::env::var("FLOWRUN_DATA_DIR").unwrap_or_else(|_| "data".to_string()),
            },
            engine: EngineConfig {
                max_wait_seconds: env_parse("FLOWRUN_MAX_WAIT_SECONDS", 3600),
                http_timeout_seconds: env_parse("FLOWRUN_HTTP_TIMEOUT_SECONDS", 30),
                background_workers: env_parse("FLOWRUN_BACKGROUND_WORKERS", 8),
                mail_relay_url: std::env::var("FLOWRUN_MAIL_RELAY_URL")
                    .ok()
                    .filter(|url| !url.trim().is_empty()),
            },
        }
    }
}

/// Parse an environment variable, falling back on absence or bad input
fn env_parse<T: std::str::FromStr>(name: &str, fallback: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(fallback)
}
