//! Versioned envelope keys for rotation
//!
//! A user's content keys may be wrapped under any envelope key version the
//! user has ever had. `EnvelopeKeyring` holds the unlocked keys by version so
//! a rotation can re-wrap every file to the current version regardless of
//! where an earlier, interrupted rotation left it.

use crate::{
    CryptoError, Result,
    hierarchy::{rewrap_content_key, unwrap_content_key, wrap_content_key, EnvelopeWrappedKey},
    keys::{ContentKey, EnvelopeKey},
};
use std::collections::HashMap;

/// Unlocked envelope keys indexed by version
pub struct EnvelopeKeyring {
    keys: HashMap<u32, EnvelopeKey>,
    current_version: u32,
}

impl EnvelopeKeyring {
    /// Create a keyring whose current key is `key` at `version`
    pub fn new(version: u32, key: EnvelopeKey) -> Self {
        let mut keys = HashMap::new();
        keys.insert(version, key);
        Self {
            keys,
            current_version: version,
        }
    }

    /// Get the current envelope key version
    pub fn current_version(&self) -> u32 {
        self.current_version
    }

    /// Get the current envelope key
    pub fn current_key(&self) -> &EnvelopeKey {
        // Invariant: current_version is always present
        &self.keys[&self.current_version]
    }

    /// Whether a key for `version` is loaded
    pub fn contains(&self, version: u32) -> bool {
        self.keys.contains_key(&version)
    }

    /// Add an older key without changing the current version
    pub fn insert(&mut self, version: u32, key: EnvelopeKey) {
        self.keys.insert(version, key);
    }

    /// Install a new current key, keeping the previous ones for unwrapping
    pub fn rotate_to(&mut self, version: u32, key: EnvelopeKey) {
        self.keys.insert(version, key);
        self.current_version = version;
    }

    fn key_for(&self, version: u32) -> Result<&EnvelopeKey> {
        self.keys.get(&version).ok_or_else(|| {
            CryptoError::InvalidKey(format!(
                "envelope key version {} not loaded (current: {})",
                version, self.current_version
            ))
        })
    }

    /// Wrap a content key under the current version
    pub fn wrap(&self, content_key: &ContentKey) -> Result<(EnvelopeWrappedKey, u32)> {
        Ok((
            wrap_content_key(content_key, self.current_key())?,
            self.current_version,
        ))
    }

    /// Unwrap a content key wrapped under `version`
    pub fn unwrap(&self, wrapped: &EnvelopeWrappedKey, version: u32) -> Result<ContentKey> {
        unwrap_content_key(wrapped, self.key_for(version)?)
    }

    /// Re-wrap a content key from `version` to the current version
    pub fn rewrap(
        &self,
        wrapped: &EnvelopeWrappedKey,
        version: u32,
    ) -> Result<(EnvelopeWrappedKey, u32)> {
        let old = self.key_for(version)?;
        Ok((
            rewrap_content_key(wrapped, old, self.current_key())?,
            self.current_version,
        ))
    }
}

impl std::fmt::Debug for EnvelopeKeyring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut versions: Vec<_> = self.keys.keys().copied().collect();
        versions.sort_unstable();
        f.debug_struct("EnvelopeKeyring")
            .field("current_version", &self.current_version)
            .field("versions", &versions)
            .finish()
    }
}
