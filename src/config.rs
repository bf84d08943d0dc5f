use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const DEFAULT_LOCK_MAX_PENDING: usize = 1_000;
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 500;
/// Three days, the retention window of the event log.
pub const DEFAULT_PRUNE_TIME_LIMIT_SECS: u64 = 3 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubConfig {
    pub data_dir: PathBuf,
    /// Commit requests allowed to queue on the commit slot before new ones
    /// fail fast.
    pub lock_max_pending: usize,
    /// How long a commit waits for the slot before failing.
    pub lock_timeout_ms: u64,
    pub prune_time_limit_secs: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for HubConfig {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            data_dir: default_data_dir(),
            lock_max_pending: DEFAULT_LOCK_MAX_PENDING,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            prune_time_limit_secs: DEFAULT_PRUNE_TIME_LIMIT_SECS,
            created_at: now,
            updated_at: now,
        }
    }
}

impl HubConfig {
    pub fn load_or_default(path: Option<PathBuf>) -> Result<(HubConfig, PathBuf)> {
        let config_path = match path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                path
            }
            None => default_config_path(),
        };

        if config_path.exists() {
            let contents = fs::read_to_string(&config_path)?;
            let config: HubConfig = toml::from_str(&contents)?;
            config.ensure_data_dir()?;
            Ok((config, config_path))
        } else {
            let mut config = HubConfig::default();
            config.ensure_data_dir()?;
            config.save(&config_path)?;
            Ok((config, config_path))
        }
    }

    pub fn save(&mut self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        self.updated_at = Utc::now();
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn ensure_data_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.data_dir)?;
        Ok(())
    }

    pub fn event_store_path(&self) -> PathBuf {
        self.data_dir.join("events")
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn prune_time_limit(&self) -> Duration {
        Duration::from_secs(self.prune_time_limit_secs)
    }
}

fn default_config_path() -> PathBuf {
    default_base_dir().join("config.toml")
}

fn default_data_dir() -> PathBuf {
    default_base_dir().join("data")
}

fn default_base_dir() -> PathBuf {
    let Ok(current_dir) = env::current_dir() else {
        return PathBuf::from(".hubdbx");
    };
    current_dir.join(".hubdbx")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_carry_the_documented_tunables() {
        let config = HubConfig::default();
        assert_eq!(config.lock_max_pending, 1_000);
        assert_eq!(config.lock_timeout(), Duration::from_millis(500));
        assert_eq!(config.prune_time_limit(), Duration::from_secs(259_200));
    }

    #[test]
    fn round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = HubConfig::default();
        config.data_dir = dir.path().join("data");
        config.lock_max_pending = 16;
        config.save(&path).unwrap();

        let (loaded, loaded_path) = HubConfig::load_or_default(Some(path.clone())).unwrap();
        assert_eq!(loaded_path, path);
        assert_eq!(loaded.lock_max_pending, 16);
        assert_eq!(loaded.data_dir, config.data_dir);
        assert!(config.data_dir.is_dir());
    }

}
