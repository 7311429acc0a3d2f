//! Keyward configuration
//!
//! Built once at startup and handed to the services. Values come from the
//! defaults below, an optional config file, then `KEYWARD_*` environment
//! variables with `__` separating sections (e.g. `KEYWARD_ROTATION__BATCH_SIZE`).

use crate::error::{KeywardError, Result};
use keyward_crypto::{
    keys::{PBKDF2_ITERATIONS, SALT_SIZE},
    password::DEFAULT_MIN_LENGTH,
    KdfParams, PasswordPolicy,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

const MIN_PBKDF2_ITERATIONS: u32 = 10_000;
const MIN_SALT_LEN: usize = 8;
/// Leases are renewed every third of their lifetime
const MIN_LEASE_SECS: u64 = 3;

/// Top-level configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeywardConfig {
    pub crypto: CryptoConfig,
    pub sharing: SharingConfig,
    pub rotation: RotationConfig,
    /// PostgreSQL connection string; the in-memory store is used when unset
    pub database_url: Option<String>,
}

/// Key derivation settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// PBKDF2-HMAC-SHA256 iteration count
    pub pbkdf2_iterations: u32,
    /// Salt length in bytes
    pub salt_len: usize,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            pbkdf2_iterations: PBKDF2_ITERATIONS,
            salt_len: SALT_SIZE,
        }
    }
}

/// Share link settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SharingConfig {
    /// Minimum share password length
    pub min_password_length: usize,
    /// Token regenerations tolerated on collision
    pub token_retry_attempts: u32,
    /// Password attempts allowed per client and token each minute
    pub access_attempts_per_minute: u32,
    /// Public base URL used to build share links
    pub base_url: String,
    /// Days share access log entries are kept before the worker prunes them
    pub access_log_retention_days: u32,
}

impl Default for SharingConfig {
    fn default() -> Self {
        Self {
            min_password_length: DEFAULT_MIN_LENGTH,
            token_retry_attempts: 5,
            access_attempts_per_minute: 10,
            base_url: "http://localhost:3000".to_string(),
            access_log_retention_days: 30,
        }
    }
}

/// Background rotation settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    /// Files re-wrapped per batch
    pub batch_size: usize,
    /// Rotations executing at the same time across all users
    pub max_concurrent_rotations: usize,
    /// Pending jobs buffered before `start_rotation` is refused
    pub queue_capacity: usize,
    /// Lifetime of a keyring lease between renewals, in seconds
    pub lease_secs: u64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_concurrent_rotations: 4,
            queue_capacity: 256,
            lease_secs: 60,
        }
    }
}

impl KeywardConfig {
    /// Load from an optional file and the environment, then validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("KEYWARD")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings below safe minimums
    pub fn validate(&self) -> Result<()> {
        if self.crypto.pbkdf2_iterations < MIN_PBKDF2_ITERATIONS {
            return Err(KeywardError::Config(format!(
                "crypto.pbkdf2_iterations must be at least {}",
                MIN_PBKDF2_ITERATIONS
            )));
        }
        if self.crypto.salt_len < MIN_SALT_LEN {
            return Err(KeywardError::Config(format!(
                "crypto.salt_len must be at least {}",
                MIN_SALT_LEN
            )));
        }
        if self.sharing.min_password_length < DEFAULT_MIN_LENGTH {
            return Err(KeywardError::Config(format!(
                "sharing.min_password_length must be at least {}",
                DEFAULT_MIN_LENGTH
            )));
        }
        if self.sharing.token_retry_attempts == 0 {
            return Err(KeywardError::Config(
                "sharing.token_retry_attempts must be at least 1".to_string(),
            ));
        }
        if self.sharing.access_attempts_per_minute == 0 {
            return Err(KeywardError::Config(
                "sharing.access_attempts_per_minute must be at least 1".to_string(),
            ));
        }
        if self.rotation.batch_size == 0 {
            return Err(KeywardError::Config(
                "rotation.batch_size must be at least 1".to_string(),
            ));
        }
        if self.rotation.max_concurrent_rotations == 0 {
            return Err(KeywardError::Config(
                "rotation.max_concurrent_rotations must be at least 1".to_string(),
            ));
        }
        if self.rotation.queue_capacity == 0 {
            return Err(KeywardError::Config(
                "rotation.queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.rotation.lease_secs < MIN_LEASE_SECS {
            return Err(KeywardError::Config(format!(
                "rotation.lease_secs must be at least {}",
                MIN_LEASE_SECS
            )));
        }
        if self.sharing.access_log_retention_days == 0 {
            return Err(KeywardError::Config(
                "sharing.access_log_retention_days must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// PBKDF2 parameters for password wrapping
    pub fn kdf_params(&self) -> KdfParams {
        KdfParams {
            iterations: self.crypto.pbkdf2_iterations,
            salt_len: self.crypto.salt_len,
        }
    }

    /// How long a keyring lease lives without renewal
    pub fn lease_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.rotation.lease_secs)
    }

    /// Strength policy for share passwords
    pub fn password_policy(&self) -> PasswordPolicy {
        PasswordPolicy::with_min_length(self.sharing.min_password_length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = KeywardConfig::default();
        config.validate().unwrap();
        assert_eq!(config.kdf_params(), KdfParams::default());
        assert_eq!(config.rotation.batch_size, 10);
        assert_eq!(config.password_policy().min_length, 8);
    }

    #[test]
    fn test_rejects_weak_settings() {
        let mut config = KeywardConfig::default();
        config.crypto.pbkdf2_iterations = 1_000;
        assert!(matches!(config.validate(), Err(KeywardError::Config(_))));

        let mut config = KeywardConfig::default();
        config.rotation.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = KeywardConfig::default();
        config.sharing.min_password_length = 6;
        assert!(config.validate().is_err());

        let mut config = KeywardConfig::default();
        config.rotation.lease_secs = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file_keeps_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[rotation]\nbatch_size = 25\n\n[sharing]\nbase_url = \"https://files.example.com\""
        )
        .unwrap();

        let config = KeywardConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.rotation.batch_size, 25);
        assert_eq!(config.rotation.max_concurrent_rotations, 4);
        assert_eq!(config.rotation.lease_secs, 60);
        assert_eq!(config.sharing.access_log_retention_days, 30);
        assert_eq!(config.sharing.base_url, "https://files.example.com");
        assert_eq!(config.crypto.pbkdf2_iterations, PBKDF2_ITERATIONS);
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[crypto]\npbkdf2_iterations = 5").unwrap();
        assert!(KeywardConfig::load(Some(file.path())).is_err());
    }
}
