//! Worker configuration

use keyward_core::KeywardConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Worker process configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Optional TOML/YAML/JSON file layered under `KEYWARD_*` variables
    pub config_path: Option<PathBuf>,
    /// PostgreSQL URL; overrides `database_url` from the config file
    pub database_url: Option<String>,
    /// Use in-memory storage (for testing/development)
    pub use_memory_store: bool,
    /// Database pool size
    pub max_connections: u32,
    /// Seconds between rate limiter pruning passes
    pub maintenance_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            config_path: None,
            database_url: None,
            use_memory_store: false,
            max_connections: 10,
            maintenance_interval_secs: 60,
        }
    }
}

impl WorkerConfig {
    /// Load the service configuration and apply command-line overrides
    pub fn resolve(&self) -> anyhow::Result<KeywardConfig> {
        let mut config = KeywardConfig::load(self.config_path.as_deref())?;
        if self.database_url.is_some() {
            config.database_url = self.database_url.clone();
        }
        Ok(config)
    }

    /// Database URL to connect to, or `None` for the in-memory store
    pub fn database_url<'a>(&self, config: &'a KeywardConfig) -> Option<&'a str> {
        if self.use_memory_store {
            None
        } else {
            config.database_url.as_deref()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_cli_database_url_wins() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "database_url = \"postgres://file/keyward\"").unwrap();
        writeln!(file, "[rotation]\nbatch_size = 25").unwrap();

        let worker = WorkerConfig {
            config_path: Some(file.path().to_path_buf()),
            database_url: Some("postgres://cli/keyward".to_string()),
            ..Default::default()
        };
        let config = worker.resolve().unwrap();
        assert_eq!(config.rotation.batch_size, 25);
        assert_eq!(worker.database_url(&config), Some("postgres://cli/keyward"));
    }

    #[test]
    fn test_memory_store_ignores_database_url() {
        let worker = WorkerConfig {
            use_memory_store: true,
            ..Default::default()
        };
        let config = KeywardConfig {
            database_url: Some("postgres://localhost/keyward".to_string()),
            ..Default::default()
        };
        assert_eq!(worker.database_url(&config), None);
    }
}
