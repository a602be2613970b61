use crate::error::AppError;
use crate::identity::Identity;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const STATS_PATH_ENV: &str = "SERVER_TRACKER_STATS";

/// Tracker settings, read from `config.json`. Every field has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub stats_path: PathBuf,
    /// Initial number of server slots.
    pub slots: usize,
    /// How long an owner or requester has to answer a prompt.
    pub prompt_timeout_ms: u64,
    pub leaderboard_size: usize,
    /// Ask the requester before walking the owners of a full pool.
    pub require_confirmation: bool,
    /// May overwrite any hand-off prompt and resize the pool.
    pub admins: Vec<Identity>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            stats_path: PathBuf::from("./data/serverStats.json"),
            slots: 1,
            prompt_timeout_ms: 300_000,
            leaderboard_size: 9,
            require_confirmation: true,
            admins: Vec::new(),
        }
    }
}

impl TrackerConfig {
    pub fn prompt_window(&self) -> Duration {
        Duration::from_millis(self.prompt_timeout_ms)
    }

    pub fn is_admin(&self, identity: &Identity) -> bool {
        self.admins.contains(identity)
    }

    /// `<config_dir>/server-tracker/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("server-tracker").join("config.json"))
    }

    /// Load from an explicit path (must exist), else the default location if
    /// present, else defaults. `SERVER_TRACKER_STATS` overrides `stats_path`.
    pub fn load(explicit: Option<&Path>) -> Result<Self, AppError> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };

        if let Ok(stats) = std::env::var(STATS_PATH_ENV) {
            if !stats.is_empty() {
                config.stats_path = PathBuf::from(stats);
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, AppError> {
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.slots == 0 {
            return Err(AppError::Config("slots must be at least 1".into()));
        }
        if self.leaderboard_size == 0 {
            return Err(AppError::Config("leaderboard_size must be at least 1".into()));
        }
        Ok(())
    }
}
