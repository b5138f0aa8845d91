// engine/src/config.rs
//!
//! TOML application config. Every field has a default so a missing file or a
//! partial file both load; `ODRL_FORGE_BACKEND_URL` overrides the backend URL.

use crate::api::HttpBackend;
use crate::progress::ReconnectPolicy;
use crate::settings::Settings;
use crate::store::DATABASE_FILE;
use crate::sync::SyncMode;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const BACKEND_URL_ENV: &str = "ODRL_FORGE_BACKEND_URL";
const APP_DIR: &str = "odrl-forge";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            request_timeout_secs: 300,
            connect_timeout_secs: 10,
        }
    }
}

impl BackendConfig {
    pub fn http_backend(&self) -> HttpBackend {
        HttpBackend::with_timeouts(
            self.base_url.clone(),
            Duration::from_secs(self.connect_timeout_secs),
            Duration::from_secs(self.request_timeout_secs),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub keepalive_timeout_ms: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            reconnect_delay_ms: 2_000,
            keepalive_timeout_ms: 45_000,
        }
    }
}

impl ProgressConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: self.max_reconnect_attempts,
            delay: Duration::from_millis(self.reconnect_delay_ms),
            keepalive_timeout: Duration::from_millis(self.keepalive_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub max_entries: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_entries: crate::history::DEFAULT_MAX_ENTRIES,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Defaults to the platform data directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

/// Session defaults; `Settings::reset` returns to these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DefaultsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub temperature: f64,
    pub sync_mode: SyncMode,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            model: None,
            temperature: 0.3,
            sync_mode: SyncMode::LocalOnly,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub backend: BackendConfig,
    pub progress: ProgressConfig,
    pub history: HistoryConfig,
    pub storage: StorageConfig,
    pub defaults: DefaultsConfig,
}

impl AppConfig {
    /// `<config dir>/odrl-forge/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join("config.toml"))
    }

    /// Load from the default location, falling back to defaults.
    pub fn load_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) => Self::load_from_path(&path),
            None => Ok(Self::default().with_env_overrides()),
        }
    }

    /// Load from `path`. A missing file yields the defaults.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no config file; using defaults");
            return Ok(Self::default().with_env_overrides());
        }
        let raw = std::fs::read_to_string(path)?;
        let config = Self::load_from_str(&raw)
            .map_err(|err| Error::Config(format!("{}: {err}", path.display())))?;
        debug!(path = %path.display(), "loaded config");
        Ok(config.with_env_overrides())
    }

    /// Parse TOML without applying environment overrides.
    pub fn load_from_str(raw: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(raw).map_err(|err| Error::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|err| Error::Config(err.to_string()))
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var(BACKEND_URL_ENV) {
            if !url.trim().is_empty() {
                self.backend.base_url = url.trim().to_string();
            }
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend.base_url.trim().is_empty() {
            return Err(Error::Config("backend.base_url must not be empty".into()));
        }
        if self.history.max_entries == 0 {
            return Err(Error::Config("history.max_entries must be positive".into()));
        }
        if !(0.0..=2.0).contains(&self.defaults.temperature) {
            return Err(Error::Config(
                "defaults.temperature must be between 0.0 and 2.0".into(),
            ));
        }
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        self.storage.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(APP_DIR)
        })
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join(DATABASE_FILE)
    }

    /// Fresh session settings seeded from `[defaults]`.
    pub fn settings(&self) -> Settings {
        Settings::new(self.defaults.clone())
    }
}
