//! Password-protected share links
//!
//! Each share gets its own envelope key. The file's content key is wrapped
//! under that key, and the share key is wrapped under the share password, so
//! a recipient never touches the owner's key hierarchy.
//!
//! ```text
//! share password ──PBKDF2──▶ share envelope key ──AES-GCM──▶ content key
//! ```
//!
//! Every attempt against an existing share is written to its access log.

use crate::config::KeywardConfig;
use crate::error::{KeywardError, Result};
use crate::keyring::{unwrap_with_password, wrap_under_password, KeyringService, OwnerCredentials};
use crate::limiter::AccessLimiter;
use crate::link::{validate_token, ShareLink};
use crate::store::{
    AccessStats, KeyStore, ShareAccessLog, ShareChanges, ShareRecord, UNLIMITED_DOWNLOADS,
};
use chrono::{DateTime, Duration, Utc};
use keyward_crypto::{
    generate_token, hierarchy, ContentKey, EnvelopeKey, KdfParams, PasswordPolicy,
};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Result of creating a share
#[derive(Clone, Debug, Serialize)]
pub struct CreatedShare {
    pub share_token: String,
    pub url: String,
    pub max_downloads: i64,
    pub expires_at: DateTime<Utc>,
}

/// Public metadata about a share, without key material
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ShareSummary {
    pub share_token: String,
    pub file_id: String,
    pub url: String,
    pub max_downloads: i64,
    pub download_count: i64,
    /// -1 when unlimited
    pub remaining_downloads: i64,
    pub expires_at: DateTime<Utc>,
    pub expired: bool,
    pub created_at: DateTime<Utc>,
}

/// A content key recovered through a share password
#[derive(Debug)]
pub struct UnlockedShare {
    pub file_id: String,
    pub content_key: ContentKey,
}

/// Owner edits for [`ShareService::update_share`]; `None` keeps the current value
#[derive(Clone, Default)]
pub struct ShareUpdate {
    pub password: Option<String>,
    pub max_downloads: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for ShareUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShareUpdate")
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("max_downloads", &self.max_downloads)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Access log reason for a delivery that failed after the share unlocked
pub const DELIVERY_FAILED: &str = "DELIVERY_FAILED";

/// Window counted as recent in [`AccessStats::recent_attempts`]
const RECENT_ACCESS_HOURS: i64 = 24;

fn validate_max_downloads(max_downloads: i64) -> Result<()> {
    if max_downloads != UNLIMITED_DOWNLOADS && max_downloads < 1 {
        return Err(KeywardError::Validation(
            "max downloads must be -1 (unlimited) or at least 1".to_string(),
        ));
    }
    Ok(())
}

fn validate_expiry(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Result<()> {
    if expires_at <= now {
        return Err(KeywardError::Validation(
            "expiry must be in the future".to_string(),
        ));
    }
    Ok(())
}

/// Creates, opens and revokes password-protected shares
pub struct ShareService<S: KeyStore> {
    keyring: KeyringService<S>,
    store: Arc<S>,
    policy: PasswordPolicy,
    kdf: KdfParams,
    token_retry_attempts: u32,
    log_retention: Duration,
    limiter: AccessLimiter,
    links: ShareLink,
}

impl<S: KeyStore> ShareService<S> {
    pub fn new(store: Arc<S>, config: &KeywardConfig) -> Result<Self> {
        Ok(Self {
            keyring: KeyringService::new(Arc::clone(&store), config),
            store,
            policy: config.password_policy(),
            kdf: config.kdf_params(),
            token_retry_attempts: config.sharing.token_retry_attempts,
            log_retention: Duration::days(i64::from(config.sharing.access_log_retention_days)),
            limiter: AccessLimiter::per_minute(config.sharing.access_attempts_per_minute)?,
            links: ShareLink::new(&config.sharing.base_url)?,
        })
    }

    pub fn links(&self) -> &ShareLink {
        &self.links
    }

    pub fn limiter(&self) -> &AccessLimiter {
        &self.limiter
    }

    /// Create a password-protected share of one of the owner's files
    ///
    /// `max_downloads` is -1 for unlimited or at least 1.
    #[instrument(skip(self, owner, password), fields(user_id = %owner.user_id))]
    pub async fn create_share(
        &self,
        owner: &OwnerCredentials,
        file_id: &str,
        password: &str,
        max_downloads: i64,
        expires_at: DateTime<Utc>,
    ) -> Result<CreatedShare> {
        self.policy.validate(password)?;
        validate_max_downloads(max_downloads)?;
        let now = Utc::now();
        validate_expiry(expires_at, now)?;

        let content_key = self.keyring.unlock_file_key(owner, file_id).await?;
        let share_key = EnvelopeKey::generate()?;
        let wrapped_file_key = hierarchy::wrap_content_key(&content_key, &share_key)?;
        let wrapped_envelope_key = wrap_under_password(&share_key, password, self.kdf).await?;

        let mut record = ShareRecord {
            share_token: String::new(),
            file_id: file_id.to_string(),
            owner_id: owner.user_id.clone(),
            wrapped_file_key,
            wrapped_envelope_key,
            max_downloads,
            download_count: 0,
            expires_at,
            created_at: now,
        };

        for attempt in 1..=self.token_retry_attempts {
            record.share_token = generate_token()?;
            match self.store.insert_share(&record).await {
                Ok(()) => {
                    info!(file_id, max_downloads, "Created share link");
                    return Ok(CreatedShare {
                        url: self.links.url_for(&record.share_token),
                        share_token: record.share_token,
                        max_downloads,
                        expires_at,
                    });
                }
                Err(KeywardError::Conflict(_)) => {
                    warn!(attempt, "Share token collision, regenerating");
                }
                Err(e) => return Err(e),
            }
        }

        Err(KeywardError::Internal(
            "failed to allocate a unique share token".to_string(),
        ))
    }

    /// Load a usable share record, enforcing expiry and download limit
    async fn load_usable(&self, token: &str) -> Result<ShareRecord> {
        validate_token(token)?;
        let record = self.store.get_share(token).await?;
        if record.is_expired(Utc::now()) {
            return Err(KeywardError::Expired);
        }
        if record.is_exhausted() {
            return Err(KeywardError::DownloadLimitExceeded);
        }
        Ok(record)
    }

    async fn unlock(&self, client: &str, token: &str, password: &str) -> Result<UnlockedShare> {
        self.limiter.check(client, token)?;

        let record = self.load_usable(token).await?;
        let share_key =
            unwrap_with_password(&record.wrapped_envelope_key, password, self.kdf).await?;
        let content_key = hierarchy::unwrap_content_key(&record.wrapped_file_key, &share_key)?;

        debug!(file_id = %record.file_id, "Share unlocked");
        Ok(UnlockedShare {
            file_id: record.file_id,
            content_key,
        })
    }

    async fn log_access(&self, client: &str, token: &str, failure: Option<&str>) {
        let entry = ShareAccessLog {
            share_token: token.to_string(),
            client: client.to_string(),
            success: failure.is_none(),
            failure_reason: failure.map(str::to_string),
            attempted_at: Utc::now(),
        };
        if let Err(e) = self.store.insert_access_log(&entry).await {
            warn!(error = %e, "Failed to record share access");
        }
    }

    async fn log_failure(&self, client: &str, token: &str, error: &KeywardError) {
        // Unknown tokens have no share to attribute the attempt to
        if matches!(error, KeywardError::NotFound(_)) {
            return;
        }
        self.log_access(client, token, Some(error.kind().as_str())).await;
    }

    /// Recover a share's content key without consuming a download
    ///
    /// Callers that deliver bytes themselves must follow up with
    /// [`record_download`](Self::record_download).
    #[instrument(skip(self, token, password))]
    pub async fn open_share(
        &self,
        client: &str,
        token: &str,
        password: &str,
    ) -> Result<UnlockedShare> {
        validate_token(token)?;
        match self.unlock(client, token, password).await {
            Ok(unlocked) => {
                self.log_access(client, token, None).await;
                Ok(unlocked)
            }
            Err(e) => {
                self.log_failure(client, token, &e).await;
                Err(e)
            }
        }
    }

    /// Count one completed download, refusing past the limit
    pub async fn record_download(&self, token: &str) -> Result<i64> {
        validate_token(token)?;
        self.store.increment_download(token).await
    }

    /// Unlock a share and hand the content key to `deliver`
    ///
    /// A download is reserved before `deliver` runs, so concurrent requests
    /// never hand out more copies than the limit allows. A failed delivery
    /// gives the reservation back.
    #[instrument(skip(self, token, password, deliver))]
    pub async fn access_share<F, Fut, T>(
        &self,
        client: &str,
        token: &str,
        password: &str,
        deliver: F,
    ) -> Result<T>
    where
        F: FnOnce(String, ContentKey) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        validate_token(token)?;
        let reserved = match self.unlock(client, token, password).await {
            Ok(unlocked) => self
                .store
                .increment_download(token)
                .await
                .map(|count| (unlocked, count)),
            Err(e) => Err(e),
        };
        let (unlocked, count) = match reserved {
            Ok(reserved) => reserved,
            Err(e) => {
                self.log_failure(client, token, &e).await;
                return Err(e);
            }
        };

        match deliver(unlocked.file_id, unlocked.content_key).await {
            Ok(delivered) => {
                self.log_access(client, token, None).await;
                debug!(download_count = count, "Share download recorded");
                Ok(delivered)
            }
            Err(e) => {
                if let Err(release) = self.store.release_download(token).await {
                    warn!(error = %release, "Failed to release reserved download");
                }
                self.log_access(client, token, Some(DELIVERY_FAILED)).await;
                Err(e)
            }
        }
    }

    /// Change a share's password, download limit or expiry
    ///
    /// A new password does not need the old one: the owner recovers the
    /// content key through their keyring and wraps it under a fresh share
    /// key. Downloads already used are kept, and a finite limit below them is
    /// rejected with `Validation`.
    #[instrument(skip(self, owner, token, update), fields(user_id = %owner.user_id))]
    pub async fn update_share(
        &self,
        owner: &OwnerCredentials,
        token: &str,
        update: ShareUpdate,
    ) -> Result<ShareSummary> {
        validate_token(token)?;
        if let Some(password) = &update.password {
            self.policy.validate(password)?;
        }
        if let Some(max_downloads) = update.max_downloads {
            validate_max_downloads(max_downloads)?;
        }
        if let Some(expires_at) = update.expires_at {
            validate_expiry(expires_at, Utc::now())?;
        }

        let record = self.store.get_share(token).await?;
        if record.owner_id != owner.user_id {
            return Err(KeywardError::NotFound("share link".to_string()));
        }

        let rewrapped = match &update.password {
            Some(password) => {
                let content_key = self.keyring.unlock_file_key(owner, &record.file_id).await?;
                let share_key = EnvelopeKey::generate()?;
                Some((
                    hierarchy::wrap_content_key(&content_key, &share_key)?,
                    wrap_under_password(&share_key, password, self.kdf).await?,
                ))
            }
            None => None,
        };
        let password_changed = rewrapped.is_some();

        let updated = self
            .store
            .update_share(
                &owner.user_id,
                token,
                &ShareChanges {
                    rewrapped,
                    max_downloads: update.max_downloads,
                    expires_at: update.expires_at,
                },
            )
            .await?;
        info!(
            password_changed,
            max_downloads = updated.max_downloads,
            "Updated share link"
        );
        Ok(self.summarize(&updated, Utc::now()))
    }

    /// Access totals for one of the owner's shares
    pub async fn access_stats(&self, owner_id: &str, token: &str) -> Result<AccessStats> {
        validate_token(token)?;
        let record = self.store.get_share(token).await?;
        if record.owner_id != owner_id {
            return Err(KeywardError::NotFound("share link".to_string()));
        }
        self.store
            .access_stats(token, Utc::now() - Duration::hours(RECENT_ACCESS_HOURS))
            .await
    }

    /// Drop access log entries older than the configured retention
    pub async fn prune_access_logs(&self) -> Result<u64> {
        let removed = self
            .store
            .delete_access_logs_before(Utc::now() - self.log_retention)
            .await?;
        if removed > 0 {
            info!(removed, "Pruned share access logs");
        }
        Ok(removed)
    }

    /// Delete a share owned by `owner_id`
    #[instrument(skip(self, token))]
    pub async fn revoke_share(&self, owner_id: &str, token: &str) -> Result<()> {
        validate_token(token)?;
        self.store.delete_share(owner_id, token).await?;
        info!("Revoked share link");
        Ok(())
    }

    /// All shares created by `owner_id`, newest first
    pub async fn list_shares(&self, owner_id: &str) -> Result<Vec<ShareSummary>> {
        let now = Utc::now();
        Ok(self
            .store
            .list_shares(owner_id)
            .await?
            .iter()
            .map(|record| self.summarize(record, now))
            .collect())
    }

    /// Public metadata for a usable share; no password needed
    pub async fn share_metadata(&self, token: &str) -> Result<ShareSummary> {
        let record = self.load_usable(token).await?;
        Ok(self.summarize(&record, Utc::now()))
    }

    fn summarize(&self, record: &ShareRecord, now: DateTime<Utc>) -> ShareSummary {
        ShareSummary {
            share_token: record.share_token.clone(),
            file_id: record.file_id.clone(),
            url: self.links.url_for(&record.share_token),
            max_downloads: record.max_downloads,
            download_count: record.download_count,
            remaining_downloads: record.remaining_downloads(),
            expires_at: record.expires_at,
            expired: record.is_expired(now),
            created_at: record.created_at,
        }
    }
}
