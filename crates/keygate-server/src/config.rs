//! Configuration management

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use keygate_core::EngineConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Which backend holds the license records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Whole-file JSON snapshot
    Json,
    /// SQLite database
    Sqlite,
}

impl FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(StoreBackend::Json),
            "sqlite" => Ok(StoreBackend::Sqlite),
            other => Err(ConfigError::Invalid(format!(
                "store_backend must be one of: json, sqlite (got {other})"
            ))),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub store_backend: StoreBackend,
    pub licenses_path: PathBuf,
    pub binding_required: bool,
    pub max_bind_attempts: u32,
    /// Verify requests allowed per client IP per minute; 0 disables limiting
    pub rate_limit_per_minute: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            store_backend: StoreBackend::Json,
            licenses_path: PathBuf::from("licenses.json"),
            binding_required: true,
            max_bind_attempts: 3,
            rate_limit_per_minute: 60,
        }
    }
}

/// Optional overrides read from a TOML file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    listen_addr: Option<String>,
    store_backend: Option<StoreBackend>,
    licenses_path: Option<PathBuf>,
    binding_required: Option<bool>,
    max_bind_attempts: Option<u32>,
    rate_limit_per_minute: Option<u32>,
}

impl ServerConfig {
    /// Load configuration from environment variables and TOML file
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        // Load from environment variables
        config.apply_env(|name| std::env::var(name).ok())?;

        // Load from TOML config file (if specified)
        if let Ok(config_path) = std::env::var("KEYGATE_CONFIG") {
            config.load_from_toml(config_path)?;
        }

        config.validate()?;

        Ok(config)
    }

    /// Apply overrides from an environment lookup.
    ///
    /// `PORT` keeps the listen host and only replaces the port, for hosting
    /// platforms that inject it.
    pub fn apply_env<F>(&mut self, var: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = var("PORT") {
            let port: u16 = port
                .trim()
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("Invalid PORT: {}", e)))?;
            self.listen_addr.set_port(port);
        }

        if let Some(addr) = var("KEYGATE_LISTEN_ADDR") {
            self.listen_addr = addr
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("Invalid listen_addr: {}", e)))?;
        }

        if let Some(backend) = var("KEYGATE_STORE_BACKEND") {
            self.store_backend = backend.parse()?;
        }

        if let Some(path) = var("KEYGATE_LICENSES_PATH") {
            self.licenses_path = PathBuf::from(path);
        }

        if let Some(required) = var("KEYGATE_BINDING_REQUIRED") {
            self.binding_required = parse_bool(&required).ok_or_else(|| {
                ConfigError::Invalid(format!("Invalid binding_required: {}", required))
            })?;
        }

        if let Some(limit) = var("KEYGATE_RATE_LIMIT_PER_MINUTE") {
            self.rate_limit_per_minute = limit
                .trim()
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("Invalid rate_limit_per_minute: {}", e)))?;
        }

        Ok(())
    }

    /// Load from TOML config file
    pub fn load_from_toml(&mut self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.apply_toml(&content)
    }

    fn apply_toml(&mut self, content: &str) -> Result<(), ConfigError> {
        let file: FileConfig = toml::from_str(content)?;

        if let Some(addr) = file.listen_addr {
            self.listen_addr = addr
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("Invalid listen_addr in TOML: {}", e)))?;
        }
        if let Some(backend) = file.store_backend {
            self.store_backend = backend;
        }
        if let Some(path) = file.licenses_path {
            self.licenses_path = path;
        }
        if let Some(required) = file.binding_required {
            self.binding_required = required;
        }
        if let Some(attempts) = file.max_bind_attempts {
            self.max_bind_attempts = attempts;
        }
        if let Some(limit) = file.rate_limit_per_minute {
            self.rate_limit_per_minute = limit;
        }

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_bind_attempts == 0 {
            return Err(ConfigError::Invalid("max_bind_attempts must be > 0".to_string()));
        }

        if self.licenses_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("licenses_path must not be empty".to_string()));
        }

        Ok(())
    }

    /// Get engine config
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            binding_required: self.binding_required,
            max_bind_attempts: self.max_bind_attempts,
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
