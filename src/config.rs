//! JSON configuration file

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;
use xengate_proto::{AppConfig, ConfigError, ConfigStore};

/// `~/.xengate/config.json`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".xengate").join("config.json"))
}

/// Stores the whole document as pretty-printed JSON at one path.
///
/// A missing file loads as an empty document. Saves go through a temporary
/// file in the same directory and a rename. Updates from one process are
/// serialized by an in-process lock.
#[derive(Debug)]
pub struct FileConfigStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> Result<AppConfig, ConfigError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No configuration file, starting empty");
            return Ok(AppConfig::default());
        }

        let contents = fs::read_to_string(&self.path)?;
        if contents.trim().is_empty() {
            return Ok(AppConfig::default());
        }
        Ok(serde_json::from_str(&contents)?)
    }

    fn save(&self, config: &AppConfig) -> Result<(), ConfigError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| ConfigError::Unavailable(e.to_string()))?;
        self.write(config)
    }

    fn update(&self, change: &mut dyn FnMut(&mut AppConfig)) -> Result<(), ConfigError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| ConfigError::Unavailable(e.to_string()))?;
        let mut config = self.load()?;
        change(&mut config);
        self.write(&config)
    }
}

impl FileConfigStore {
    fn write(&self, config: &AppConfig) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let json = serde_json::to_string_pretty(config)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;

        debug!(path = %self.path.display(), "Configuration saved");
        Ok(())
    }
}
