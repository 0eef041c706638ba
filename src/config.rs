//! Configuration for lamad-store

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default storage directory
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lamad-store")
}

/// Configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the SQLite database
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// How long a statement waits on a locked database before failing
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Internal retries for transient storage failures on reads and appends
    #[serde(default = "default_transient_retries")]
    pub transient_retries: u32,

    /// Retries for an interaction append that collided with a concurrent writer
    #[serde(default = "default_append_conflict_retries")]
    pub append_conflict_retries: u32,

    /// Upper bound on DEPENDENCY hops walked when resolving inherited permissions
    #[serde(default = "default_max_inheritance_depth")]
    pub max_inheritance_depth: u32,

    /// Buffered events per event bus subscriber
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_transient_retries() -> u32 {
    3
}

fn default_append_conflict_retries() -> u32 {
    8
}

fn default_max_inheritance_depth() -> u32 {
    16
}

fn default_event_bus_capacity() -> usize {
    1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_dir: default_storage_dir(),
            busy_timeout_ms: default_busy_timeout_ms(),
            transient_retries: default_transient_retries(),
            append_conflict_retries: default_append_conflict_retries(),
            max_inheritance_depth: default_max_inheritance_depth(),
            event_bus_capacity: default_event_bus_capacity(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Get database file path
    pub fn db_path(&self) -> PathBuf {
        self.storage_dir.join("lamad.db")
    }

    /// Get config file path
    pub fn config_path(&self) -> PathBuf {
        self.storage_dir.join("config.toml")
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
storage_dir = "/tmp/lamad-test"
append_conflict_retries = 2
"#,
        )
        .expect("valid TOML");

        assert_eq!(config.storage_dir, PathBuf::from("/tmp/lamad-test"));
        assert_eq!(config.append_conflict_retries, 2);
        assert_eq!(config.busy_timeout_ms, 5000);
        assert_eq!(config.max_inheritance_depth, 16);
        assert_eq!(config.db_path(), PathBuf::from("/tmp/lamad-test/lamad.db"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            storage_dir: dir.path().to_path_buf(),
            transient_retries: 5,
            ..Default::default()
        };

        config.save(config.config_path()).unwrap();
        let loaded = Config::load(config.config_path()).unwrap();
        assert_eq!(loaded, config);
    }
}
