//! Persisted records and the `KeyStore` trait
//!
//! Every uniqueness rule (share tokens, one active rotation per user, one
//! keyring lease holder per user) is enforced by the store itself and reported
//! as `KeywardError::Conflict`, so services never need a read-then-write check.

use crate::error::{KeywardError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keyward_crypto::{EnvelopeWrappedKey, PasswordWrappedKey};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Sentinel for `max_downloads` meaning no limit
pub const UNLIMITED_DOWNLOADS: i64 = -1;

/// Per-user pointer to the current envelope key version
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserKeyring {
    pub user_id: String,
    pub current_envelope_version: u32,
}

/// One version of a user's envelope key, wrapped under the user's password
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeKeyRecord {
    pub user_id: String,
    pub version: u32,
    pub wrapped: PasswordWrappedKey,
}

/// A stored file's key row
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserFile {
    pub file_id: String,
    pub user_id: String,
    /// Content key wrapped under the envelope key at `envelope_version`
    pub wrapped_key: EnvelopeWrappedKey,
    pub envelope_version: u32,
    pub folder_id: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl UserFile {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// A password-protected share link
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareRecord {
    pub share_token: String,
    pub file_id: String,
    pub owner_id: String,
    /// Content key wrapped under the share's own envelope key
    pub wrapped_file_key: EnvelopeWrappedKey,
    /// Share envelope key wrapped under the share password
    pub wrapped_envelope_key: PasswordWrappedKey,
    pub max_downloads: i64,
    pub download_count: i64,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl ShareRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn is_unlimited(&self) -> bool {
        self.max_downloads == UNLIMITED_DOWNLOADS
    }

    /// Whether a finite download limit has been reached
    pub fn is_exhausted(&self) -> bool {
        !self.is_unlimited() && self.download_count >= self.max_downloads
    }

    /// Downloads left, or -1 when unlimited
    pub fn remaining_downloads(&self) -> i64 {
        if self.is_unlimited() {
            UNLIMITED_DOWNLOADS
        } else {
            (self.max_downloads - self.download_count).max(0)
        }
    }
}

/// Owner edits to an existing share; `None` fields are left alone
#[derive(Clone, Debug, Default)]
pub struct ShareChanges {
    /// Content key and share envelope key re-wrapped for a new share password
    pub rewrapped: Option<(EnvelopeWrappedKey, PasswordWrappedKey)>,
    pub max_downloads: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// One attempt to open or download a share
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareAccessLog {
    pub share_token: String,
    /// Client address or other identifier the attempt came from
    pub client: String,
    pub success: bool,
    pub failure_reason: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

/// Aggregate of a share's access log
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessStats {
    pub total_attempts: u64,
    pub successful_attempts: u64,
    pub failed_attempts: u64,
    /// Attempts since the `recent_since` cutoff of the query
    pub recent_attempts: u64,
    pub unique_clients: u64,
}

/// Exclusive claim on a user's keyring while its envelope keys change
///
/// Rotations, rollbacks and password changes each take the lease, so no two
/// of them ever rewrite the same keyring concurrently. A lease whose holder
/// stopped renewing it can be taken over once `expires_at` passes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyringLease {
    pub user_id: String,
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

impl KeyringLease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Lifecycle of a rotation job
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RotationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    RolledBack,
}

impl RotationStatus {
    pub const ALL: [RotationStatus; 5] = [
        Self::Pending,
        Self::InProgress,
        Self::Completed,
        Self::Failed,
        Self::RolledBack,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::RolledBack => "ROLLED_BACK",
        }
    }

    /// PENDING or IN_PROGRESS; at most one such job per user
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }

    /// No further automatic transition happens from this state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::RolledBack)
    }

    /// Legal state machine edges
    pub fn can_transition_to(&self, next: RotationStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress)
                | (Self::Pending, Self::Failed)
                | (Self::InProgress, Self::Completed)
                | (Self::InProgress, Self::Failed)
                | (Self::Completed, Self::RolledBack)
        )
    }

    /// States from which `next` can be reached
    pub fn predecessors(next: RotationStatus) -> Vec<RotationStatus> {
        Self::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(next))
            .collect()
    }
}

impl std::fmt::Display for RotationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RotationStatus {
    type Err = KeywardError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| KeywardError::Storage(format!("unknown rotation status: {}", s)))
    }
}

/// A background envelope key rotation for one user
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationJob {
    pub rotation_id: String,
    pub user_id: String,
    pub status: RotationStatus,
    pub old_envelope_version: u32,
    pub new_envelope_version: u32,
    /// Wrapped bytes of the envelope key being replaced, for rollback
    pub previous_wrapped_envelope_key: PasswordWrappedKey,
    pub total_files: u64,
    pub files_processed: u64,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A file's wrapped key as it was before a rotation overwrote it
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyBackupRecord {
    pub rotation_id: String,
    pub file_id: String,
    pub old_wrapped_key: EnvelopeWrappedKey,
    pub old_envelope_version: u32,
}

/// Transactional storage for keyrings, files, shares and rotations
#[async_trait]
pub trait KeyStore: Send + Sync + 'static {
    // ==================== Keyrings ====================

    /// Create a keyring whose version 1 envelope key is `wrapped`
    ///
    /// Fails with `Conflict` when the user already has one.
    async fn create_keyring(&self, user_id: &str, wrapped: &PasswordWrappedKey) -> Result<()>;

    async fn get_keyring(&self, user_id: &str) -> Result<UserKeyring>;

    async fn get_envelope_key(&self, user_id: &str, version: u32) -> Result<EnvelopeKeyRecord>;

    /// All versions, oldest first
    async fn list_envelope_keys(&self, user_id: &str) -> Result<Vec<EnvelopeKeyRecord>>;

    /// Insert or replace one envelope key version
    async fn save_envelope_key(&self, record: &EnvelopeKeyRecord) -> Result<()>;

    async fn set_current_envelope_version(&self, user_id: &str, version: u32) -> Result<()>;

    /// Take the user's keyring lease for `holder` until `expires_at`
    ///
    /// Fails with `Conflict` while another holder's lease is unexpired.
    /// Re-acquiring a lease already held by `holder` extends it.
    async fn acquire_keyring_lease(
        &self,
        user_id: &str,
        holder: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Extend a lease `holder` still owns
    ///
    /// Fails with `Conflict` once the lease was released or taken over.
    async fn renew_keyring_lease(
        &self,
        user_id: &str,
        holder: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Drop the lease if `holder` owns it; otherwise a no-op
    async fn release_keyring_lease(&self, user_id: &str, holder: &str) -> Result<()>;

    // ==================== Files ====================

    async fn insert_file(&self, file: &UserFile) -> Result<()>;

    async fn get_file(&self, file_id: &str) -> Result<UserFile>;

    /// Non-deleted files of a user ordered by id, starting after `after`
    async fn list_active_files(
        &self,
        user_id: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<UserFile>>;

    async fn count_active_files(&self, user_id: &str) -> Result<u64>;

    async fn update_file_key(
        &self,
        file_id: &str,
        wrapped_key: &EnvelopeWrappedKey,
        envelope_version: u32,
    ) -> Result<()>;

    async fn soft_delete_file(&self, file_id: &str, at: DateTime<Utc>) -> Result<()>;

    // ==================== Shares ====================

    /// Fails with `Conflict` when the token is already taken
    async fn insert_share(&self, share: &ShareRecord) -> Result<()>;

    async fn get_share(&self, token: &str) -> Result<ShareRecord>;

    async fn list_shares(&self, owner_id: &str) -> Result<Vec<ShareRecord>>;

    /// Atomically bump the download count, refusing once a finite limit is hit
    ///
    /// Returns the new count.
    async fn increment_download(&self, token: &str) -> Result<i64>;

    /// Give back a download reserved by `increment_download`
    ///
    /// Never takes the count below zero. Returns the new count.
    async fn release_download(&self, token: &str) -> Result<i64>;

    /// Apply owner edits in one step
    ///
    /// Fails with `NotFound` when absent or owned by someone else, and with
    /// `Validation` when a finite `max_downloads` is below the downloads
    /// already used.
    async fn update_share(
        &self,
        owner_id: &str,
        token: &str,
        changes: &ShareChanges,
    ) -> Result<ShareRecord>;

    /// Fails with `NotFound` when absent or owned by someone else
    async fn delete_share(&self, owner_id: &str, token: &str) -> Result<()>;

    // ==================== Rotations ====================

    /// Fails with `Conflict` when the user already has an active rotation
    async fn create_rotation(&self, job: &RotationJob) -> Result<()>;

    async fn get_rotation(&self, rotation_id: &str) -> Result<RotationJob>;

    /// Move a job to `next` if its current status allows it
    ///
    /// Terminal states stamp `completed_at`. Illegal edges fail with
    /// `Validation` and leave the job untouched.
    async fn transition_rotation(
        &self,
        rotation_id: &str,
        next: RotationStatus,
        error_message: Option<&str>,
    ) -> Result<RotationJob>;

    /// Record progress of an IN_PROGRESS job
    ///
    /// Fails with `Conflict` once the job has left IN_PROGRESS, which tells a
    /// stale executor to stop.
    async fn update_rotation_progress(&self, rotation_id: &str, files_processed: u64)
        -> Result<()>;

    /// Jobs in PENDING or IN_PROGRESS across all users
    async fn list_active_rotations(&self) -> Result<Vec<RotationJob>>;

    // ==================== Backups ====================

    async fn insert_backup(&self, backup: &KeyBackupRecord) -> Result<()>;

    async fn list_backups(&self, rotation_id: &str) -> Result<Vec<KeyBackupRecord>>;

    /// Returns the number of backups removed
    async fn delete_backups(&self, rotation_id: &str) -> Result<u64>;

    // ==================== Access logs ====================

    async fn insert_access_log(&self, log: &ShareAccessLog) -> Result<()>;

    /// Totals for one share; `recent_attempts` counts those at or after `recent_since`
    async fn access_stats(&self, token: &str, recent_since: DateTime<Utc>) -> Result<AccessStats>;

    /// Delete entries attempted before `cutoff`, returning how many went
    async fn delete_access_logs_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Error for a transition the state machine forbids
pub(crate) fn illegal_transition(from: RotationStatus, to: RotationStatus) -> KeywardError {
    KeywardError::Validation(format!(
        "rotation cannot move from {} to {}",
        from, to
    ))
}

/// Error for a finite download limit set below the downloads already used
pub(crate) fn limit_below_usage(max_downloads: i64, download_count: i64) -> KeywardError {
    KeywardError::Validation(format!(
        "max downloads {} is below the {} downloads already used",
        max_downloads, download_count
    ))
}

/// Error for a keyring lease held by someone else
pub(crate) fn lease_held(user_id: &str) -> KeywardError {
    KeywardError::Conflict(format!(
        "another key operation is in progress for user {}",
        user_id
    ))
}
