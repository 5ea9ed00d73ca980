use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::filename::DEFAULT_FILENAME_PREFIX;
use crate::{Error, Result};

pub const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
    pub backup_dir: Option<PathBuf>,
    pub filename_prefix: String,
    pub reload_delay_ms: u64,
    /// Never read from or written to the config file.
    #[serde(skip)]
    pub access_token: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000/api".to_string(),
            request_timeout_secs: 60,
            backup_dir: None,
            filename_prefix: DEFAULT_FILENAME_PREFIX.to_string(),
            reload_delay_ms: 3000,
            access_token: None,
        }
    }
}

pub fn config_path(config_dir: &Path) -> PathBuf {
    config_dir.join(CONFIG_FILE_NAME)
}

impl ClientConfig {
    /// Loads `config.toml` from `config_dir`, falling back to defaults when
    /// the file does not exist.
    pub fn load(config_dir: &Path) -> Result<Self> {
        let path = config_path(config_dir);
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::InvalidConfig {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let base = self.base_url.trim();
        if base.is_empty() {
            return Err(Error::InvalidConfig {
                message: "base_url must not be empty".to_string(),
            });
        }
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(Error::InvalidConfig {
                message: format!("base_url must be an http(s) URL: {base}"),
            });
        }
        if self.request_timeout_secs == 0 {
            return Err(Error::InvalidConfig {
                message: "request_timeout_secs must be > 0".to_string(),
            });
        }
        if self.filename_prefix.trim().is_empty() {
            return Err(Error::InvalidConfig {
                message: "filename_prefix must not be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn reload_delay(&self) -> Duration {
        Duration::from_millis(self.reload_delay_ms)
    }

    pub fn backup_dir_or(&self, data_dir: &Path) -> PathBuf {
        self.backup_dir
            .clone()
            .unwrap_or_else(|| data_dir.join("backups"))
    }
}
