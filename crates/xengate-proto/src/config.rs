//! Configuration document and its persistence boundary

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use thiserror::Error;

use crate::models::{BlockedIpInfo, RuleRecord, ServerProfile};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration store unavailable: {0}")]
    Unavailable(String),
}

/// Everything xengate persists: server profiles, access rules and the
/// blocklist.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppConfig {
    #[serde(default)]
    pub connections: Vec<ServerProfile>,
    #[serde(default)]
    pub rules: Vec<RuleRecord>,
    #[serde(default)]
    pub blocked_list: Vec<BlockedIpInfo>,
}

impl AppConfig {
    pub fn find_profile(&self, name: &str) -> Option<&ServerProfile> {
        self.connections.iter().find(|p| p.name == name)
    }
}

/// Loads and saves the whole [`AppConfig`] document.
///
/// Components change only the section they own, through
/// [`update`](ConfigStore::update), so that sections owned by other
/// components survive concurrent writes.
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<AppConfig, ConfigError>;
    fn save(&self, config: &AppConfig) -> Result<(), ConfigError>;

    /// Load, apply `change` and save as one step. No other `update` on the
    /// same store interleaves with it.
    fn update(&self, change: &mut dyn FnMut(&mut AppConfig)) -> Result<(), ConfigError>;
}

/// In-memory store for embedding and tests
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    config: Mutex<AppConfig>,
}

impl MemoryConfigStore {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Mutex::new(config),
        }
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> Result<AppConfig, ConfigError> {
        self.config
            .lock()
            .map(|config| config.clone())
            .map_err(|e| ConfigError::Unavailable(e.to_string()))
    }

    fn save(&self, config: &AppConfig) -> Result<(), ConfigError> {
        let mut current = self
            .config
            .lock()
            .map_err(|e| ConfigError::Unavailable(e.to_string()))?;
        *current = config.clone();
        Ok(())
    }

    fn update(&self, change: &mut dyn FnMut(&mut AppConfig)) -> Result<(), ConfigError> {
        let mut current = self
            .config
            .lock()
            .map_err(|e| ConfigError::Unavailable(e.to_string()))?;
        change(&mut *current);
        Ok(())
    }
}
