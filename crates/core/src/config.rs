//! Versioned TOML configuration: data directory, chunk-engine concurrency
//! tuning, and the storage-channel endpoint. Saved atomically and validated
//! on load.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const CONFIG_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub data_dir: PathBuf,
    #[serde(default)]
    pub telegram: TelegramEndpointConfig,
    #[serde(default)]
    pub transfer: TransferTuning,
}

fn default_schema_version() -> u32 {
    CONFIG_SCHEMA_VERSION
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelegramEndpointConfig {
    /// Key under which the bot token is stored in the credential cache,
    /// never the token itself.
    pub bot_token_key: String,
    pub chat_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferTuning {
    /// Process-wide semaphore permits for new (non-resumed) transfers.
    pub max_concurrent_transfers: usize,
    /// Fixed-at-3 semaphore permits reserved for tasks resumed after a
    /// restart, kept separate from new-transfer permits so a burst of new
    /// work can't starve resumes.
    pub resume_concurrency: usize,
    /// Catalogue-sync debounce window, seconds.
    pub debounce_secs: u64,
    /// File-existence watcher poll interval, milliseconds.
    pub watcher_poll_ms: u64,
}

impl Default for TransferTuning {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: 4,
            resume_concurrency: 3,
            debounce_secs: 2,
            watcher_poll_ms: 500,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.schema_version == 0 {
            return Err(Error::InvalidConfig {
                message: "schema_version must be >= 1".to_string(),
            });
        }
        if self.transfer.max_concurrent_transfers == 0 {
            return Err(Error::InvalidConfig {
                message: "max_concurrent_transfers must be > 0".to_string(),
            });
        }
        if self.transfer.resume_concurrency == 0 {
            return Err(Error::InvalidConfig {
                message: "resume_concurrency must be > 0".to_string(),
            });
        }
        Ok(())
    }

    pub fn metadata_db_path(&self) -> PathBuf {
        self.data_dir.join("metadata.db")
    }

    pub fn checkpoint_db_path(&self) -> PathBuf {
        self.data_dir.join("checkpoint.db")
    }

    pub fn load_or_default(path: &Path, data_dir: &Path) -> Result<Self> {
        if !path.exists() {
            let config = Self {
                schema_version: CONFIG_SCHEMA_VERSION,
                data_dir: data_dir.to_path_buf(),
                telegram: TelegramEndpointConfig::default(),
                transfer: TransferTuning::default(),
            };
            config.save(path)?;
            return Ok(config);
        }
        Self::load(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text).map_err(|e| Error::InvalidConfig {
            message: format!("failed to parse {}: {e}", path.display()),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Atomic write: serialize to a sibling temp file, then rename into
    /// place, so a crash mid-write never leaves a truncated config.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| Error::InvalidConfig {
            message: format!("failed to serialize config: {e}"),
        })?;
        let tmp = path.with_extension("toml.tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}
