//! Daemon configuration

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::model::KdfParams;
use crate::Result;

/// Daemon configuration, read from `config.json` in the root directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Lock the session after this long without a served request (seconds)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// How often the idle check runs (seconds)
    #[serde(default = "default_idle_check_interval")]
    pub idle_check_interval_secs: u64,

    /// Argon2id parameters for newly enrolled accounts
    #[serde(default)]
    pub kdf: KdfParams,
}

fn default_idle_timeout() -> u64 {
    900
}

fn default_idle_check_interval() -> u64 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            idle_check_interval_secs: default_idle_check_interval(),
            kdf: KdfParams::default(),
        }
    }
}

impl Config {
    /// Load config from file, defaults if it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content).map_err(|e| {
                crate::Error::InvalidRequest(format!("{}: {}", path.display(), e))
            })
        } else {
            Ok(Self::default())
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn idle_check_interval(&self) -> Duration {
        Duration::from_secs(self.idle_check_interval_secs.max(1))
    }
}
