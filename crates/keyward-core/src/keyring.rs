//! Per-user keyrings: envelope key provisioning, file key registration,
//! and password changes
//!
//! PBKDF2 is CPU-bound, so every password wrap or unwrap runs on the
//! blocking pool. Anything that rewrites a user's envelope key records holds
//! that user's keyring lease while it does.

use crate::config::KeywardConfig;
use crate::error::{KeywardError, Result};
use crate::store::{EnvelopeKeyRecord, KeyStore, UserFile, UserKeyring};
use chrono::{DateTime, Duration, Utc};
use keyward_crypto::{
    generate_token,
    hierarchy::{self, PasswordWrappedKey},
    ContentKey, EnvelopeKey, KdfParams,
};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use zeroize::Zeroizing;

/// A user id together with the password protecting that user's envelope keys
#[derive(Clone)]
pub struct OwnerCredentials {
    pub user_id: String,
    password: Zeroizing<String>,
}

impl OwnerCredentials {
    pub fn new(user_id: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            password: Zeroizing::new(password.into()),
        }
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl std::fmt::Debug for OwnerCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnerCredentials")
            .field("user_id", &self.user_id)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// Wrap an envelope key under a password on the blocking pool
pub(crate) async fn wrap_under_password(
    key: &EnvelopeKey,
    password: &str,
    params: KdfParams,
) -> Result<PasswordWrappedKey> {
    let key = key.clone();
    let password = Zeroizing::new(password.to_string());
    Ok(tokio::task::spawn_blocking(move || {
        hierarchy::wrap_envelope_key(&key, &password, &params)
    })
    .await??)
}

/// Unwrap an envelope key with a password on the blocking pool
pub(crate) async fn unwrap_with_password(
    wrapped: &PasswordWrappedKey,
    password: &str,
    params: KdfParams,
) -> Result<EnvelopeKey> {
    let wrapped = wrapped.clone();
    let password = Zeroizing::new(password.to_string());
    Ok(tokio::task::spawn_blocking(move || {
        hierarchy::unwrap_envelope_key(&wrapped, &password, &params)
    })
    .await??)
}

/// Service managing user envelope keys and file content keys
pub struct KeyringService<S: KeyStore> {
    store: Arc<S>,
    kdf: KdfParams,
    lease_ttl: Duration,
}

impl<S: KeyStore> Clone for KeyringService<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            kdf: self.kdf,
            lease_ttl: self.lease_ttl,
        }
    }
}

impl<S: KeyStore> KeyringService<S> {
    pub fn new(store: Arc<S>, config: &KeywardConfig) -> Self {
        Self {
            store,
            kdf: config.kdf_params(),
            lease_ttl: Duration::from_std(config.lease_ttl()).unwrap_or_else(|_| Duration::days(1)),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn kdf_params(&self) -> KdfParams {
        self.kdf
    }

    fn lease_deadline(&self) -> DateTime<Utc> {
        Utc::now() + self.lease_ttl
    }

    /// Take the owner's keyring lease; `Conflict` while someone else holds it
    pub(crate) async fn acquire_lease(&self, user_id: &str, holder: &str) -> Result<()> {
        self.store
            .acquire_keyring_lease(user_id, holder, self.lease_deadline())
            .await
    }

    pub(crate) async fn renew_lease(&self, user_id: &str, holder: &str) -> Result<()> {
        self.store
            .renew_keyring_lease(user_id, holder, self.lease_deadline())
            .await
    }

    /// Give the lease back; failures only delay the next holder until expiry
    pub(crate) async fn release_lease(&self, user_id: &str, holder: &str) {
        if let Err(e) = self.store.release_keyring_lease(user_id, holder).await {
            warn!(user_id, holder, error = %e, "Failed to release keyring lease");
        }
    }

    /// Mint a user's first envelope key and store it wrapped as version 1
    #[instrument(skip(self, owner), fields(user_id = %owner.user_id))]
    pub async fn provision_user(&self, owner: &OwnerCredentials) -> Result<UserKeyring> {
        let envelope_key = EnvelopeKey::generate()?;
        let wrapped = wrap_under_password(&envelope_key, owner.password(), self.kdf).await?;
        self.store.create_keyring(&owner.user_id, &wrapped).await?;
        info!("Provisioned keyring");
        self.store.get_keyring(&owner.user_id).await
    }

    /// Unlock one version of the owner's envelope key
    ///
    /// A wrong password is `Authentication`.
    pub async fn unlock_envelope_key(
        &self,
        owner: &OwnerCredentials,
        version: u32,
    ) -> Result<EnvelopeKey> {
        let record = self.store.get_envelope_key(&owner.user_id, version).await?;
        unwrap_with_password(&record.wrapped, owner.password(), self.kdf).await
    }

    /// Unlock the owner's current envelope key, returning it with its version
    pub async fn unlock_current(&self, owner: &OwnerCredentials) -> Result<(u32, EnvelopeKey)> {
        let keyring = self.store.get_keyring(&owner.user_id).await?;
        let key = self
            .unlock_envelope_key(owner, keyring.current_envelope_version)
            .await?;
        Ok((keyring.current_envelope_version, key))
    }

    /// Generate a content key for a new upload and store it wrapped
    ///
    /// The returned key encrypts the file bytes; it is never persisted in clear.
    #[instrument(skip(self, owner), fields(user_id = %owner.user_id))]
    pub async fn register_file(
        &self,
        owner: &OwnerCredentials,
        file_id: &str,
        folder_id: Option<String>,
    ) -> Result<(ContentKey, UserFile)> {
        let (version, envelope_key) = self.unlock_current(owner).await?;
        let content_key = ContentKey::generate()?;
        let file = UserFile {
            file_id: file_id.to_string(),
            user_id: owner.user_id.clone(),
            wrapped_key: hierarchy::wrap_content_key(&content_key, &envelope_key)?,
            envelope_version: version,
            folder_id,
            deleted_at: None,
        };
        self.store.insert_file(&file).await?;
        debug!(envelope_version = version, "Registered file key");
        Ok((content_key, file))
    }

    /// Load an owned, non-deleted file row
    pub async fn owned_file(&self, owner: &OwnerCredentials, file_id: &str) -> Result<UserFile> {
        let file = self.store.get_file(file_id).await?;
        if file.user_id != owner.user_id || file.is_deleted() {
            return Err(KeywardError::NotFound(format!("file {}", file_id)));
        }
        Ok(file)
    }

    /// Recover a file's content key with the owner's credentials
    #[instrument(skip(self, owner), fields(user_id = %owner.user_id))]
    pub async fn unlock_file_key(
        &self,
        owner: &OwnerCredentials,
        file_id: &str,
    ) -> Result<ContentKey> {
        let file = self.owned_file(owner, file_id).await?;
        let envelope_key = self
            .unlock_envelope_key(owner, file.envelope_version)
            .await?;
        Ok(hierarchy::unwrap_content_key(&file.wrapped_key, &envelope_key)?)
    }

    /// Re-wrap every envelope key version under a new password
    ///
    /// File rows are untouched. All versions are unlocked before any is
    /// rewritten, so a wrong old password changes nothing. Runs under the
    /// keyring lease, so it fails with `Conflict` while a rotation or rollback
    /// for the same user holds it.
    #[instrument(skip(self, owner, new_password), fields(user_id = %owner.user_id))]
    pub async fn change_password(
        &self,
        owner: &OwnerCredentials,
        new_password: &str,
    ) -> Result<()> {
        let holder = format!("password:{}", generate_token()?);
        self.acquire_lease(&owner.user_id, &holder).await?;
        let result = self.rewrap_versions(owner, new_password, &holder).await;
        self.release_lease(&owner.user_id, &holder).await;
        result
    }

    async fn rewrap_versions(
        &self,
        owner: &OwnerCredentials,
        new_password: &str,
        holder: &str,
    ) -> Result<()> {
        let records = self.store.list_envelope_keys(&owner.user_id).await?;
        if records.is_empty() {
            return Err(KeywardError::NotFound(format!("keyring {}", owner.user_id)));
        }

        let mut unlocked = Vec::with_capacity(records.len());
        for record in &records {
            let key = unwrap_with_password(&record.wrapped, owner.password(), self.kdf).await?;
            unlocked.push((record.version, key));
        }

        let mut rewrapped = Vec::with_capacity(unlocked.len());
        for (version, key) in &unlocked {
            rewrapped.push((*version, wrap_under_password(key, new_password, self.kdf).await?));
        }

        // PBKDF2 is slow; only write if the lease survived it
        self.renew_lease(&owner.user_id, holder).await?;
        for (version, wrapped) in rewrapped {
            self.store
                .save_envelope_key(&EnvelopeKeyRecord {
                    user_id: owner.user_id.clone(),
                    version,
                    wrapped,
                })
                .await?;
        }

        info!(versions = unlocked.len(), "Changed keyring password");
        Ok(())
    }
}
