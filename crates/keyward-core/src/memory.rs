//! In-memory key store for development and testing

use crate::error::{KeywardError, Result};
use crate::store::{
    illegal_transition, lease_held, limit_below_usage, AccessStats, EnvelopeKeyRecord,
    KeyBackupRecord, KeyStore, KeyringLease, RotationJob, RotationStatus, ShareAccessLog,
    ShareChanges, ShareRecord, UserFile, UserKeyring, UNLIMITED_DOWNLOADS,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use keyward_crypto::{EnvelopeWrappedKey, PasswordWrappedKey};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// A `KeyStore` backed by concurrent maps
///
/// Rotations live behind a single lock so the one-active-job-per-user check
/// and the insert happen together.
#[derive(Clone, Default)]
pub struct MemoryKeyStore {
    keyrings: Arc<DashMap<String, UserKeyring>>,
    envelope_keys: Arc<DashMap<(String, u32), EnvelopeKeyRecord>>,
    files: Arc<DashMap<String, UserFile>>,
    shares: Arc<DashMap<String, ShareRecord>>,
    rotations: Arc<Mutex<HashMap<String, RotationJob>>>,
    backups: Arc<DashMap<String, Vec<KeyBackupRecord>>>,
    leases: Arc<DashMap<String, KeyringLease>>,
    access_logs: Arc<Mutex<Vec<ShareAccessLog>>>,
}

impl MemoryKeyStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of share records held
    pub fn share_count(&self) -> usize {
        self.shares.len()
    }

    /// Clear all records
    pub fn clear(&self) {
        self.keyrings.clear();
        self.envelope_keys.clear();
        self.files.clear();
        self.shares.clear();
        self.rotations.lock().clear();
        self.backups.clear();
        self.leases.clear();
        self.access_logs.lock().clear();
    }
}

fn not_found(what: &str, id: &str) -> KeywardError {
    KeywardError::NotFound(format!("{} {}", what, id))
}

#[async_trait]
impl KeyStore for MemoryKeyStore {
    async fn create_keyring(&self, user_id: &str, wrapped: &PasswordWrappedKey) -> Result<()> {
        match self.keyrings.entry(user_id.to_string()) {
            Entry::Occupied(_) => Err(KeywardError::Conflict(format!(
                "keyring already exists for user {}",
                user_id
            ))),
            Entry::Vacant(entry) => {
                self.envelope_keys.insert(
                    (user_id.to_string(), 1),
                    EnvelopeKeyRecord {
                        user_id: user_id.to_string(),
                        version: 1,
                        wrapped: wrapped.clone(),
                    },
                );
                entry.insert(UserKeyring {
                    user_id: user_id.to_string(),
                    current_envelope_version: 1,
                });
                Ok(())
            }
        }
    }

    async fn get_keyring(&self, user_id: &str) -> Result<UserKeyring> {
        self.keyrings
            .get(user_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| not_found("keyring", user_id))
    }

    async fn get_envelope_key(&self, user_id: &str, version: u32) -> Result<EnvelopeKeyRecord> {
        self.envelope_keys
            .get(&(user_id.to_string(), version))
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                KeywardError::NotFound(format!(
                    "envelope key version {} for user {}",
                    version, user_id
                ))
            })
    }

    async fn list_envelope_keys(&self, user_id: &str) -> Result<Vec<EnvelopeKeyRecord>> {
        let mut records: Vec<_> = self
            .envelope_keys
            .iter()
            .filter(|entry| entry.key().0 == user_id)
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by_key(|record| record.version);
        Ok(records)
    }

    async fn save_envelope_key(&self, record: &EnvelopeKeyRecord) -> Result<()> {
        self.envelope_keys
            .insert((record.user_id.clone(), record.version), record.clone());
        Ok(())
    }

    async fn set_current_envelope_version(&self, user_id: &str, version: u32) -> Result<()> {
        let mut keyring = self
            .keyrings
            .get_mut(user_id)
            .ok_or_else(|| not_found("keyring", user_id))?;
        keyring.current_envelope_version = version;
        Ok(())
    }

    async fn acquire_keyring_lease(
        &self,
        user_id: &str,
        holder: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let lease = KeyringLease {
            user_id: user_id.to_string(),
            holder: holder.to_string(),
            expires_at,
        };
        match self.leases.entry(user_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let current = entry.get();
                if current.holder != holder && !current.is_expired(Utc::now()) {
                    return Err(lease_held(user_id));
                }
                entry.insert(lease);
            }
            Entry::Vacant(entry) => {
                entry.insert(lease);
            }
        }
        Ok(())
    }

    async fn renew_keyring_lease(
        &self,
        user_id: &str,
        holder: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        match self.leases.get_mut(user_id) {
            Some(mut lease) if lease.holder == holder => {
                lease.expires_at = expires_at;
                Ok(())
            }
            _ => Err(KeywardError::Conflict(format!(
                "keyring lease for user {} was lost",
                user_id
            ))),
        }
    }

    async fn release_keyring_lease(&self, user_id: &str, holder: &str) -> Result<()> {
        self.leases.remove_if(user_id, |_, lease| lease.holder == holder);
        Ok(())
    }

    async fn insert_file(&self, file: &UserFile) -> Result<()> {
        match self.files.entry(file.file_id.clone()) {
            Entry::Occupied(_) => Err(KeywardError::Conflict(format!(
                "file {} already exists",
                file.file_id
            ))),
            Entry::Vacant(entry) => {
                entry.insert(file.clone());
                Ok(())
            }
        }
    }

    async fn get_file(&self, file_id: &str) -> Result<UserFile> {
        self.files
            .get(file_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| not_found("file", file_id))
    }

    async fn list_active_files(
        &self,
        user_id: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<UserFile>> {
        let mut files: Vec<_> = self
            .files
            .iter()
            .filter(|entry| {
                let file = entry.value();
                file.user_id == user_id
                    && !file.is_deleted()
                    && after.map_or(true, |after| file.file_id.as_str() > after)
            })
            .map(|entry| entry.value().clone())
            .collect();
        files.sort_by(|a, b| a.file_id.cmp(&b.file_id));
        files.truncate(limit);
        Ok(files)
    }

    async fn count_active_files(&self, user_id: &str) -> Result<u64> {
        Ok(self
            .files
            .iter()
            .filter(|entry| entry.value().user_id == user_id && !entry.value().is_deleted())
            .count() as u64)
    }

    async fn update_file_key(
        &self,
        file_id: &str,
        wrapped_key: &EnvelopeWrappedKey,
        envelope_version: u32,
    ) -> Result<()> {
        let mut file = self
            .files
            .get_mut(file_id)
            .ok_or_else(|| not_found("file", file_id))?;
        file.wrapped_key = wrapped_key.clone();
        file.envelope_version = envelope_version;
        Ok(())
    }

    async fn soft_delete_file(&self, file_id: &str, at: DateTime<Utc>) -> Result<()> {
        let mut file = self
            .files
            .get_mut(file_id)
            .ok_or_else(|| not_found("file", file_id))?;
        file.deleted_at = Some(at);
        Ok(())
    }

    async fn insert_share(&self, share: &ShareRecord) -> Result<()> {
        match self.shares.entry(share.share_token.clone()) {
            Entry::Occupied(_) => Err(KeywardError::Conflict(
                "share token already in use".to_string(),
            )),
            Entry::Vacant(entry) => {
                entry.insert(share.clone());
                Ok(())
            }
        }
    }

    async fn get_share(&self, token: &str) -> Result<ShareRecord> {
        self.shares
            .get(token)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| KeywardError::NotFound("share link".to_string()))
    }

    async fn list_shares(&self, owner_id: &str) -> Result<Vec<ShareRecord>> {
        let mut shares: Vec<_> = self
            .shares
            .iter()
            .filter(|entry| entry.value().owner_id == owner_id)
            .map(|entry| entry.value().clone())
            .collect();
        shares.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(shares)
    }

    async fn increment_download(&self, token: &str) -> Result<i64> {
        let mut share = self
            .shares
            .get_mut(token)
            .ok_or_else(|| KeywardError::NotFound("share link".to_string()))?;
        if share.is_exhausted() {
            return Err(KeywardError::DownloadLimitExceeded);
        }
        share.download_count += 1;
        Ok(share.download_count)
    }

    async fn release_download(&self, token: &str) -> Result<i64> {
        let mut share = self
            .shares
            .get_mut(token)
            .ok_or_else(|| KeywardError::NotFound("share link".to_string()))?;
        if share.download_count > 0 {
            share.download_count -= 1;
        }
        Ok(share.download_count)
    }

    async fn update_share(
        &self,
        owner_id: &str,
        token: &str,
        changes: &ShareChanges,
    ) -> Result<ShareRecord> {
        let mut share = self
            .shares
            .get_mut(token)
            .filter(|share| share.owner_id == owner_id)
            .ok_or_else(|| KeywardError::NotFound("share link".to_string()))?;
        if let Some(max_downloads) = changes.max_downloads {
            if max_downloads != UNLIMITED_DOWNLOADS && max_downloads < share.download_count {
                return Err(limit_below_usage(max_downloads, share.download_count));
            }
            share.max_downloads = max_downloads;
        }
        if let Some(expires_at) = changes.expires_at {
            share.expires_at = expires_at;
        }
        if let Some((file_key, envelope_key)) = &changes.rewrapped {
            share.wrapped_file_key = file_key.clone();
            share.wrapped_envelope_key = envelope_key.clone();
        }
        Ok(share.clone())
    }

    async fn delete_share(&self, owner_id: &str, token: &str) -> Result<()> {
        self.shares
            .remove_if(token, |_, share| share.owner_id == owner_id)
            .map(|_| ())
            .ok_or_else(|| KeywardError::NotFound("share link".to_string()))
    }

    async fn create_rotation(&self, job: &RotationJob) -> Result<()> {
        let mut rotations = self.rotations.lock();
        if rotations.contains_key(&job.rotation_id) {
            return Err(KeywardError::Conflict(
                "rotation id already in use".to_string(),
            ));
        }
        if rotations
            .values()
            .any(|existing| existing.user_id == job.user_id && existing.status.is_active())
        {
            return Err(KeywardError::Conflict(
                "a key rotation is already in progress".to_string(),
            ));
        }
        rotations.insert(job.rotation_id.clone(), job.clone());
        Ok(())
    }

    async fn get_rotation(&self, rotation_id: &str) -> Result<RotationJob> {
        self.rotations
            .lock()
            .get(rotation_id)
            .cloned()
            .ok_or_else(|| not_found("rotation", rotation_id))
    }

    async fn transition_rotation(
        &self,
        rotation_id: &str,
        next: RotationStatus,
        error_message: Option<&str>,
    ) -> Result<RotationJob> {
        let mut rotations = self.rotations.lock();
        let job = rotations
            .get_mut(rotation_id)
            .ok_or_else(|| not_found("rotation", rotation_id))?;
        if !job.status.can_transition_to(next) {
            return Err(illegal_transition(job.status, next));
        }
        job.status = next;
        if let Some(message) = error_message {
            job.error_message = Some(message.to_string());
        }
        if next.is_terminal() {
            job.completed_at = Some(Utc::now());
        }
        Ok(job.clone())
    }

    async fn update_rotation_progress(
        &self,
        rotation_id: &str,
        files_processed: u64,
    ) -> Result<()> {
        let mut rotations = self.rotations.lock();
        let job = rotations
            .get_mut(rotation_id)
            .ok_or_else(|| not_found("rotation", rotation_id))?;
        if job.status != RotationStatus::InProgress {
            return Err(KeywardError::Conflict(format!(
                "rotation {} is {}",
                rotation_id, job.status
            )));
        }
        job.files_processed = files_processed;
        Ok(())
    }

    async fn list_active_rotations(&self) -> Result<Vec<RotationJob>> {
        Ok(self
            .rotations
            .lock()
            .values()
            .filter(|job| job.status.is_active())
            .cloned()
            .collect())
    }

    async fn insert_backup(&self, backup: &KeyBackupRecord) -> Result<()> {
        self.backups
            .entry(backup.rotation_id.clone())
            .or_default()
            .push(backup.clone());
        Ok(())
    }

    async fn list_backups(&self, rotation_id: &str) -> Result<Vec<KeyBackupRecord>> {
        Ok(self
            .backups
            .get(rotation_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default())
    }

    async fn delete_backups(&self, rotation_id: &str) -> Result<u64> {
        Ok(self
            .backups
            .remove(rotation_id)
            .map(|(_, backups)| backups.len() as u64)
            .unwrap_or(0))
    }

    async fn insert_access_log(&self, log: &ShareAccessLog) -> Result<()> {
        self.access_logs.lock().push(log.clone());
        Ok(())
    }

    async fn access_stats(&self, token: &str, recent_since: DateTime<Utc>) -> Result<AccessStats> {
        let logs = self.access_logs.lock();
        let mut stats = AccessStats::default();
        let mut clients = HashSet::new();
        for log in logs.iter().filter(|log| log.share_token == token) {
            stats.total_attempts += 1;
            if log.success {
                stats.successful_attempts += 1;
            } else {
                stats.failed_attempts += 1;
            }
            if log.attempted_at >= recent_since {
                stats.recent_attempts += 1;
            }
            clients.insert(log.client.as_str());
        }
        stats.unique_clients = clients.len() as u64;
        Ok(stats)
    }

    async fn delete_access_logs_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut logs = self.access_logs.lock();
        let before = logs.len();
        logs.retain(|log| log.attempted_at >= cutoff);
        Ok((before - logs.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn wrapped_envelope(tag: &str) -> PasswordWrappedKey {
        PasswordWrappedKey {
            ciphertext_hex: tag.to_string(),
            salt_hex: "00".repeat(16),
            iv_hex: "00".repeat(12),
        }
    }

    fn wrapped_content(tag: &str) -> EnvelopeWrappedKey {
        EnvelopeWrappedKey {
            ciphertext_hex: tag.to_string(),
            iv_hex: "00".repeat(12),
        }
    }

    fn file(id: &str, user: &str) -> UserFile {
        UserFile {
            file_id: id.to_string(),
            user_id: user.to_string(),
            wrapped_key: wrapped_content(id),
            envelope_version: 1,
            folder_id: None,
            deleted_at: None,
        }
    }

    fn share(token: &str, max_downloads: i64) -> ShareRecord {
        let now = Utc::now();
        ShareRecord {
            share_token: token.to_string(),
            file_id: "f1".to_string(),
            owner_id: "alice".to_string(),
            wrapped_file_key: wrapped_content("k"),
            wrapped_envelope_key: wrapped_envelope("e"),
            max_downloads,
            download_count: 0,
            expires_at: now + Duration::days(1),
            created_at: now,
        }
    }

    fn job(id: &str, user: &str) -> RotationJob {
        RotationJob {
            rotation_id: id.to_string(),
            user_id: user.to_string(),
            status: RotationStatus::Pending,
            old_envelope_version: 1,
            new_envelope_version: 2,
            previous_wrapped_envelope_key: wrapped_envelope("old"),
            total_files: 0,
            files_processed: 0,
            error_message: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_keyring_lifecycle() {
        let store = MemoryKeyStore::new();
        store.create_keyring("alice", &wrapped_envelope("v1")).await.unwrap();
        assert!(matches!(
            store.create_keyring("alice", &wrapped_envelope("again")).await,
            Err(KeywardError::Conflict(_))
        ));

        store
            .save_envelope_key(&EnvelopeKeyRecord {
                user_id: "alice".into(),
                version: 2,
                wrapped: wrapped_envelope("v2"),
            })
            .await
            .unwrap();
        store.set_current_envelope_version("alice", 2).await.unwrap();

        assert_eq!(store.get_keyring("alice").await.unwrap().current_envelope_version, 2);
        let versions: Vec<_> = store
            .list_envelope_keys("alice")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.version)
            .collect();
        assert_eq!(versions, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_file_pagination_skips_deleted() {
        let store = MemoryKeyStore::new();
        for id in ["a", "b", "c", "d", "e"] {
            store.insert_file(&file(id, "alice")).await.unwrap();
        }
        store.insert_file(&file("z", "bob")).await.unwrap();
        store.soft_delete_file("c", Utc::now()).await.unwrap();

        assert_eq!(store.count_active_files("alice").await.unwrap(), 4);

        let first = store.list_active_files("alice", None, 2).await.unwrap();
        let ids: Vec<_> = first.iter().map(|f| f.file_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let rest = store.list_active_files("alice", Some("b"), 10).await.unwrap();
        let ids: Vec<_> = rest.iter().map(|f| f.file_id.as_str()).collect();
        assert_eq!(ids, vec!["d", "e"]);
    }

    #[tokio::test]
    async fn test_duplicate_share_token_conflicts() {
        let store = MemoryKeyStore::new();
        store.insert_share(&share("tok", 1)).await.unwrap();
        assert!(matches!(
            store.insert_share(&share("tok", 1)).await,
            Err(KeywardError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_increment_download_respects_limit() {
        let store = MemoryKeyStore::new();
        store.insert_share(&share("tok", 2)).await.unwrap();
        assert_eq!(store.increment_download("tok").await.unwrap(), 1);
        assert_eq!(store.increment_download("tok").await.unwrap(), 2);
        assert!(matches!(
            store.increment_download("tok").await,
            Err(KeywardError::DownloadLimitExceeded)
        ));
        assert_eq!(store.get_share("tok").await.unwrap().download_count, 2);
    }

    #[tokio::test]
    async fn test_concurrent_increments_never_exceed_limit() {
        let store = MemoryKeyStore::new();
        store.insert_share(&share("tok", 5)).await.unwrap();

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.increment_download("tok").await.is_ok() })
            })
            .collect();
        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap() {
                successes += 1;
            }
        }
        assert_eq!(successes, 5);
        assert_eq!(store.get_share("tok").await.unwrap().download_count, 5);
    }

    #[tokio::test]
    async fn test_delete_share_checks_owner() {
        let store = MemoryKeyStore::new();
        store.insert_share(&share("tok", 1)).await.unwrap();
        assert!(matches!(
            store.delete_share("mallory", "tok").await,
            Err(KeywardError::NotFound(_))
        ));
        store.delete_share("alice", "tok").await.unwrap();
        assert_eq!(store.share_count(), 0);
    }

    #[tokio::test]
    async fn test_one_active_rotation_per_user() {
        let store = MemoryKeyStore::new();
        store.create_rotation(&job("r1", "alice")).await.unwrap();
        assert!(matches!(
            store.create_rotation(&job("r2", "alice")).await,
            Err(KeywardError::Conflict(_))
        ));
        store.create_rotation(&job("r3", "bob")).await.unwrap();

        store
            .transition_rotation("r1", RotationStatus::Failed, Some("boom"))
            .await
            .unwrap();
        store.create_rotation(&job("r2", "alice")).await.unwrap();
    }

    #[tokio::test]
    async fn test_transition_rules() {
        let store = MemoryKeyStore::new();
        store.create_rotation(&job("r1", "alice")).await.unwrap();

        assert!(matches!(
            store
                .transition_rotation("r1", RotationStatus::RolledBack, None)
                .await,
            Err(KeywardError::Validation(_))
        ));

        store
            .transition_rotation("r1", RotationStatus::InProgress, None)
            .await
            .unwrap();
        let done = store
            .transition_rotation("r1", RotationStatus::Completed, None)
            .await
            .unwrap();
        assert!(done.completed_at.is_some());
        assert!(store.list_active_rotations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_backups() {
        let store = MemoryKeyStore::new();
        for id in ["a", "b"] {
            store
                .insert_backup(&KeyBackupRecord {
                    rotation_id: "r1".into(),
                    file_id: id.into(),
                    old_wrapped_key: wrapped_content(id),
                    old_envelope_version: 1,
                })
                .await
                .unwrap();
        }
        assert_eq!(store.list_backups("r1").await.unwrap().len(), 2);
        assert_eq!(store.delete_backups("r1").await.unwrap(), 2);
        assert!(store.list_backups("r1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_keyring_lease_is_exclusive() {
        let store = MemoryKeyStore::new();
        let later = Utc::now() + Duration::minutes(1);
        store.acquire_keyring_lease("alice", "rot-1", later).await.unwrap();
        assert!(matches!(
            store.acquire_keyring_lease("alice", "password", later).await,
            Err(KeywardError::Conflict(_))
        ));
        // Same holder extends, other users are independent
        store.acquire_keyring_lease("alice", "rot-1", later).await.unwrap();
        store.acquire_keyring_lease("bob", "password", later).await.unwrap();

        // Releasing someone else's lease does nothing
        store.release_keyring_lease("alice", "password").await.unwrap();
        assert!(store.acquire_keyring_lease("alice", "password", later).await.is_err());

        store.release_keyring_lease("alice", "rot-1").await.unwrap();
        store.acquire_keyring_lease("alice", "password", later).await.unwrap();
        assert!(matches!(
            store.renew_keyring_lease("alice", "rot-1", later).await,
            Err(KeywardError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let store = MemoryKeyStore::new();
        let past = Utc::now() - Duration::seconds(1);
        store.acquire_keyring_lease("alice", "crashed", past).await.unwrap();
        store
            .acquire_keyring_lease("alice", "recovery", Utc::now() + Duration::minutes(1))
            .await
            .unwrap();
        assert!(store
            .renew_keyring_lease("alice", "crashed", Utc::now() + Duration::minutes(1))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_release_download_never_goes_negative() {
        let store = MemoryKeyStore::new();
        store.insert_share(&share("tok", 1)).await.unwrap();
        assert_eq!(store.increment_download("tok").await.unwrap(), 1);
        assert_eq!(store.release_download("tok").await.unwrap(), 0);
        assert_eq!(store.release_download("tok").await.unwrap(), 0);
        assert_eq!(store.increment_download("tok").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_update_share_checks_owner_and_usage() {
        let store = MemoryKeyStore::new();
        store.insert_share(&share("tok", 5)).await.unwrap();
        store.increment_download("tok").await.unwrap();
        store.increment_download("tok").await.unwrap();

        let lower = ShareChanges {
            max_downloads: Some(1),
            ..Default::default()
        };
        assert!(matches!(
            store.update_share("alice", "tok", &lower).await,
            Err(KeywardError::Validation(_))
        ));
        assert!(matches!(
            store.update_share("mallory", "tok", &ShareChanges::default()).await,
            Err(KeywardError::NotFound(_))
        ));

        let expires_at = Utc::now() + Duration::days(7);
        let updated = store
            .update_share(
                "alice",
                "tok",
                &ShareChanges {
                    rewrapped: Some((wrapped_content("k2"), wrapped_envelope("e2"))),
                    max_downloads: Some(2),
                    expires_at: Some(expires_at),
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.max_downloads, 2);
        assert_eq!(updated.download_count, 2);
        assert_eq!(updated.expires_at, expires_at);
        assert_eq!(updated.wrapped_envelope_key, wrapped_envelope("e2"));
        assert_eq!(store.get_share("tok").await.unwrap(), updated);
    }

    #[tokio::test]
    async fn test_progress_requires_in_progress() {
        let store = MemoryKeyStore::new();
        store.create_rotation(&job("r1", "alice")).await.unwrap();
        assert!(store.update_rotation_progress("r1", 1).await.is_err());

        store
            .transition_rotation("r1", RotationStatus::InProgress, None)
            .await
            .unwrap();
        store.update_rotation_progress("r1", 1).await.unwrap();

        store
            .transition_rotation("r1", RotationStatus::Failed, Some("interrupted"))
            .await
            .unwrap();
        assert!(matches!(
            store.update_rotation_progress("r1", 2).await,
            Err(KeywardError::Conflict(_))
        ));
        assert_eq!(store.get_rotation("r1").await.unwrap().files_processed, 1);
    }

    #[tokio::test]
    async fn test_access_stats_and_pruning() {
        let store = MemoryKeyStore::new();
        let now = Utc::now();
        let entries = [
            ("203.0.113.1", true, now - Duration::days(3)),
            ("203.0.113.1", false, now - Duration::hours(1)),
            ("203.0.113.2", false, now),
        ];
        for (client, success, attempted_at) in entries {
            store
                .insert_access_log(&ShareAccessLog {
                    share_token: "tok".into(),
                    client: client.into(),
                    success,
                    failure_reason: (!success).then(|| "AUTHENTICATION".to_string()),
                    attempted_at,
                })
                .await
                .unwrap();
        }

        let stats = store.access_stats("tok", now - Duration::days(1)).await.unwrap();
        assert_eq!(
            stats,
            AccessStats {
                total_attempts: 3,
                successful_attempts: 1,
                failed_attempts: 2,
                recent_attempts: 2,
                unique_clients: 2,
            }
        );
        assert_eq!(store.access_stats("other", now).await.unwrap(), AccessStats::default());

        assert_eq!(store.delete_access_logs_before(now - Duration::days(1)).await.unwrap(), 1);
        assert_eq!(
            store.access_stats("tok", now).await.unwrap().total_attempts,
            2
        );
    }
}
