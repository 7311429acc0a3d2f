//! Background envelope key rotation
//!
//! A rotation replaces a user's envelope key and re-wraps every file's
//! content key under the new one. File bytes are never re-encrypted.
//!
//! ```text
//! start_rotation ──▶ PENDING ──▶ IN_PROGRESS ──┬──▶ COMPLETED ──▶ ROLLED_BACK
//!                       │                      │
//!                       └──────────────────────┴──▶ FAILED
//! ```
//!
//! Jobs are queued on a bounded channel and executed by a dispatcher that
//! caps how many run at once. Files are processed in fixed-size batches, one
//! batch at a time, with a backup of each file's old wrapped key written
//! before it is overwritten.
//!
//! Each job holds its user's keyring lease from the moment it is created
//! until it reaches a terminal state. The engine renews the leases of the
//! jobs it accepted; a job whose lease lapsed belongs to an engine that went
//! away and is failed by [`RotationEngine::recover_interrupted`].

use crate::config::KeywardConfig;
use crate::error::{KeywardError, Result};
use crate::keyring::{wrap_under_password, KeyringService, OwnerCredentials};
use crate::store::{
    EnvelopeKeyRecord, KeyBackupRecord, KeyStore, RotationJob, RotationStatus,
};
use chrono::Utc;
use dashmap::DashMap;
use keyward_crypto::{generate_token, EnvelopeKey, EnvelopeKeyring, KdfParams};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, instrument, warn};

/// Message recorded on jobs whose engine stopped renewing them
pub const INTERRUPTED_MESSAGE: &str = "interrupted by restart";

const QUEUE_FULL_MESSAGE: &str = "rotation queue is full";
const SHUT_DOWN_MESSAGE: &str = "rotation engine is shut down";

/// A job waiting for a worker; credentials exist only here, in memory
struct QueuedRotation {
    rotation_id: String,
    owner: OwnerCredentials,
}

/// A job this engine owns, queued or executing
struct AcceptedRotation {
    user_id: String,
    running: bool,
}

struct EngineInner<S: KeyStore> {
    store: Arc<S>,
    keyring: KeyringService<S>,
    kdf: KdfParams,
    batch_size: usize,
    permits: Arc<Semaphore>,
    accepted: DashMap<String, AcceptedRotation>,
}

/// Schedules and executes key rotations
pub struct RotationEngine<S: KeyStore> {
    inner: Arc<EngineInner<S>>,
    queue: Mutex<Option<mpsc::Sender<QueuedRotation>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl<S: KeyStore> RotationEngine<S> {
    /// Create the engine and start its dispatcher on the current runtime
    pub fn spawn(store: Arc<S>, config: &KeywardConfig) -> Self {
        let inner = Arc::new(EngineInner {
            keyring: KeyringService::new(Arc::clone(&store), config),
            store,
            kdf: config.kdf_params(),
            batch_size: config.rotation.batch_size,
            permits: Arc::new(Semaphore::new(config.rotation.max_concurrent_rotations)),
            accepted: DashMap::new(),
        });
        let (tx, rx) = mpsc::channel(config.rotation.queue_capacity);
        let dispatcher = tokio::spawn(dispatch(Arc::clone(&inner), rx));
        let heartbeat = tokio::spawn(heartbeat(Arc::downgrade(&inner), config.lease_ttl() / 3));

        info!(
            batch_size = config.rotation.batch_size,
            max_concurrent = config.rotation.max_concurrent_rotations,
            lease_secs = config.rotation.lease_secs,
            "Rotation engine started"
        );

        Self {
            inner,
            queue: Mutex::new(Some(tx)),
            dispatcher: Mutex::new(Some(dispatcher)),
            heartbeat: Mutex::new(Some(heartbeat)),
        }
    }

    /// Mark FAILED every active job nobody is executing any more
    ///
    /// A job counts as abandoned when this engine did not accept it and its
    /// keyring lease has lapsed. Jobs of other live engines keep their lease
    /// renewed and are left alone. Run at startup and periodically. Returns
    /// the number of jobs marked.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let mut recovered = 0;
        for job in self.inner.store.list_active_rotations().await? {
            if self.inner.accepted.contains_key(&job.rotation_id) {
                continue;
            }

            // Taking the lease over also stops a stalled executor from renewing it
            let holder = format!("recovery:{}", job.rotation_id);
            match self.inner.keyring.acquire_lease(&job.user_id, &holder).await {
                Ok(()) => {}
                Err(KeywardError::Conflict(_)) => {
                    debug!(rotation_id = %job.rotation_id, "Rotation lease still held");
                    continue;
                }
                Err(e) => return Err(e),
            }

            let outcome = self
                .inner
                .store
                .transition_rotation(&job.rotation_id, RotationStatus::Failed, Some(INTERRUPTED_MESSAGE))
                .await;
            self.inner.keyring.release_lease(&job.user_id, &holder).await;

            match outcome {
                Ok(_) => {
                    warn!(rotation_id = %job.rotation_id, user_id = %job.user_id, "Marked interrupted rotation as failed");
                    recovered += 1;
                }
                // Finished concurrently
                Err(KeywardError::Validation(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(recovered)
    }

    /// Begin rotating the owner's envelope key
    ///
    /// Returns the PENDING job immediately; poll
    /// [`get_rotation_status`](Self::get_rotation_status) for progress.
    /// Fails with `Conflict` while another rotation, rollback or password
    /// change for the owner is under way.
    #[instrument(skip(self, owner), fields(user_id = %owner.user_id))]
    pub async fn start_rotation(&self, owner: &OwnerCredentials) -> Result<RotationJob> {
        let rotation_id = generate_token()?;
        self.inner.keyring.acquire_lease(&owner.user_id, &rotation_id).await?;
        match self.enqueue(owner, &rotation_id).await {
            Ok(job) => Ok(job),
            Err(e) => {
                self.inner.keyring.release_lease(&owner.user_id, &rotation_id).await;
                Err(e)
            }
        }
    }

    /// Create and queue the job; runs under the keyring lease
    async fn enqueue(&self, owner: &OwnerCredentials, rotation_id: &str) -> Result<RotationJob> {
        let store = &self.inner.store;
        let current = store.get_keyring(&owner.user_id).await?.current_envelope_version;
        // Wrong credentials fail here, before any job exists. Checked under
        // the lease so a password change cannot slip in before the executor.
        self.inner.keyring.unlock_envelope_key(owner, current).await?;

        let previous = store.get_envelope_key(&owner.user_id, current).await?;
        let newest = store
            .list_envelope_keys(&owner.user_id)
            .await?
            .iter()
            .map(|record| record.version)
            .max()
            .unwrap_or(current);

        let job = RotationJob {
            rotation_id: rotation_id.to_string(),
            user_id: owner.user_id.clone(),
            status: RotationStatus::Pending,
            old_envelope_version: current,
            new_envelope_version: newest + 1,
            previous_wrapped_envelope_key: previous.wrapped,
            total_files: store.count_active_files(&owner.user_id).await?,
            files_processed: 0,
            error_message: None,
            started_at: Utc::now(),
            completed_at: None,
        };
        store.create_rotation(&job).await?;
        self.inner.accepted.insert(
            job.rotation_id.clone(),
            AcceptedRotation {
                user_id: owner.user_id.clone(),
                running: false,
            },
        );

        let queued = QueuedRotation {
            rotation_id: job.rotation_id.clone(),
            owner: owner.clone(),
        };
        let refused = match self.queue.lock().as_ref() {
            Some(tx) => match tx.try_send(queued) {
                Ok(()) => None,
                Err(TrySendError::Full(_)) => Some(QUEUE_FULL_MESSAGE),
                Err(TrySendError::Closed(_)) => Some(SHUT_DOWN_MESSAGE),
            },
            None => Some(SHUT_DOWN_MESSAGE),
        };
        if let Some(reason) = refused {
            self.inner.accepted.remove(&job.rotation_id);
            store
                .transition_rotation(&job.rotation_id, RotationStatus::Failed, Some(reason))
                .await?;
            warn!(rotation_id = %job.rotation_id, reason, "Key rotation refused");
            return Err(KeywardError::Internal(reason.to_string()));
        }

        info!(
            rotation_id = %job.rotation_id,
            total_files = job.total_files,
            new_version = job.new_envelope_version,
            "Key rotation queued"
        );
        Ok(job)
    }

    async fn owned_job(&self, owner_id: &str, rotation_id: &str) -> Result<RotationJob> {
        let job = self.inner.store.get_rotation(rotation_id).await?;
        if job.user_id != owner_id {
            return Err(KeywardError::NotFound(format!("rotation {}", rotation_id)));
        }
        Ok(job)
    }

    /// Current state and progress of one of the owner's rotations
    pub async fn get_rotation_status(
        &self,
        owner_id: &str,
        rotation_id: &str,
    ) -> Result<RotationJob> {
        self.owned_job(owner_id, rotation_id).await
    }

    /// Undo a completed rotation from its backups
    ///
    /// Only the owner's most recent rotation can be rolled back. Runs under
    /// the keyring lease, so it fails with `Conflict` while a rotation or
    /// password change for the owner is under way.
    #[instrument(skip(self))]
    pub async fn rollback_rotation(&self, owner_id: &str, rotation_id: &str) -> Result<RotationJob> {
        self.owned_job(owner_id, rotation_id).await?;

        let holder = format!("rollback:{}", rotation_id);
        self.inner.keyring.acquire_lease(owner_id, &holder).await?;
        let result = self.restore(owner_id, rotation_id).await;
        self.inner.keyring.release_lease(owner_id, &holder).await;
        result
    }

    async fn restore(&self, owner_id: &str, rotation_id: &str) -> Result<RotationJob> {
        let store = &self.inner.store;
        // Re-read under the lease; a concurrent rollback may have won
        let job = store.get_rotation(rotation_id).await?;
        if job.status != RotationStatus::Completed {
            return Err(KeywardError::Validation(format!(
                "only completed rotations can be rolled back (status: {})",
                job.status
            )));
        }
        // An abandoned job not yet recovered still counts as active
        if store
            .list_active_rotations()
            .await?
            .iter()
            .any(|active| active.user_id == owner_id)
        {
            return Err(KeywardError::Conflict(
                "a key rotation is already in progress".to_string(),
            ));
        }
        let keyring = store.get_keyring(owner_id).await?;
        if keyring.current_envelope_version != job.new_envelope_version {
            return Err(KeywardError::Validation(
                "only the most recent rotation can be rolled back".to_string(),
            ));
        }

        let backups = store.list_backups(rotation_id).await?;
        for backup in &backups {
            store
                .update_file_key(&backup.file_id, &backup.old_wrapped_key, backup.old_envelope_version)
                .await?;
        }

        // The old version is normally still stored; fall back to the bytes
        // captured when the rotation started.
        match store.get_envelope_key(owner_id, job.old_envelope_version).await {
            Ok(_) => {}
            Err(KeywardError::NotFound(_)) => {
                store
                    .save_envelope_key(&EnvelopeKeyRecord {
                        user_id: owner_id.to_string(),
                        version: job.old_envelope_version,
                        wrapped: job.previous_wrapped_envelope_key.clone(),
                    })
                    .await?;
            }
            Err(e) => return Err(e),
        }
        store
            .set_current_envelope_version(owner_id, job.old_envelope_version)
            .await?;

        let rolled_back = store
            .transition_rotation(rotation_id, RotationStatus::RolledBack, None)
            .await?;
        info!(restored = backups.len(), "Key rotation rolled back");

        match store.delete_backups(rotation_id).await {
            Ok(purged) => debug!(purged, "Purged rotation backups"),
            Err(e) => warn!(error = %e, "Failed to purge rotation backups"),
        }

        Ok(rolled_back)
    }

    /// Number of rotations executing right now
    pub fn running(&self) -> usize {
        self.inner.accepted.iter().filter(|entry| entry.value().running).count()
    }

    /// Stop accepting rotations and wait for queued and running ones to finish
    pub async fn shutdown(&self) {
        self.queue.lock().take();
        let dispatcher = self.dispatcher.lock().take();
        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                error!(error = %e, "Rotation dispatcher panicked");
            }
        }
        if let Some(handle) = self.heartbeat.lock().take() {
            handle.abort();
        }
        info!("Rotation engine stopped");
    }
}

async fn dispatch<S: KeyStore>(
    inner: Arc<EngineInner<S>>,
    mut rx: mpsc::Receiver<QueuedRotation>,
) {
    let mut workers = JoinSet::new();

    while let Some(queued) = rx.recv().await {
        let permit = match Arc::clone(&inner.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let inner = Arc::clone(&inner);
        workers.spawn(async move {
            let _permit = permit;
            inner.run(queued).await;
        });

        while let Some(finished) = workers.try_join_next() {
            if let Err(e) = finished {
                error!(error = %e, "Rotation worker panicked");
            }
        }
    }

    while let Some(finished) = workers.join_next().await {
        if let Err(e) = finished {
            error!(error = %e, "Rotation worker panicked");
        }
    }
}

/// Keep the leases of accepted jobs alive until the engine is dropped
async fn heartbeat<S: KeyStore>(engine: Weak<EngineInner<S>>, period: Duration) {
    let mut ticker = tokio::time::interval(period.max(Duration::from_secs(1)));
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = engine.upgrade() else {
            break;
        };
        inner.renew_leases().await;
    }
}

impl<S: KeyStore> EngineInner<S> {
    async fn renew_leases(&self) {
        let held: Vec<(String, String)> = self
            .accepted
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().user_id.clone()))
            .collect();
        for (rotation_id, user_id) in held {
            if let Err(e) = self.keyring.renew_lease(&user_id, &rotation_id).await {
                warn!(rotation_id = %rotation_id, error = %e, "Could not renew rotation lease");
            }
        }
    }

    async fn run(&self, queued: QueuedRotation) {
        let rotation_id = queued.rotation_id.clone();
        let user_id = queued.owner.user_id.clone();
        {
            let mut entry = self
                .accepted
                .entry(rotation_id.clone())
                .or_insert_with(|| AcceptedRotation {
                    user_id: user_id.clone(),
                    running: false,
                });
            if entry.running {
                warn!(rotation_id = %rotation_id, "Rotation already has an executor");
                return;
            }
            entry.running = true;
        }

        if let Err(e) = self.execute(&queued).await {
            error!(rotation_id = %rotation_id, error = %e, "Key rotation failed");
            let message = e.to_string();
            if let Err(e) = self
                .store
                .transition_rotation(&rotation_id, RotationStatus::Failed, Some(&message))
                .await
            {
                warn!(rotation_id = %rotation_id, error = %e, "Could not mark rotation failed");
            }
        }

        self.accepted.remove(&rotation_id);
        self.keyring.release_lease(&user_id, &rotation_id).await;
    }

    #[instrument(skip(self, queued), fields(rotation_id = %queued.rotation_id, user_id = %queued.owner.user_id))]
    async fn execute(&self, queued: &QueuedRotation) -> Result<()> {
        let owner = &queued.owner;
        let rotation_id = queued.rotation_id.as_str();
        let job = self
            .store
            .transition_rotation(rotation_id, RotationStatus::InProgress, None)
            .await?;
        self.keyring.renew_lease(&owner.user_id, rotation_id).await?;

        // The lease makes this job the keyring's only writer; a stale
        // snapshot still means something bypassed it.
        let keyring = self.store.get_keyring(&owner.user_id).await?;
        if keyring.current_envelope_version != job.old_envelope_version {
            return Err(KeywardError::Conflict(format!(
                "envelope key moved to version {} before the rotation started",
                keyring.current_envelope_version
            )));
        }
        match self
            .store
            .get_envelope_key(&owner.user_id, job.new_envelope_version)
            .await
        {
            Err(KeywardError::NotFound(_)) => {}
            Ok(_) => {
                return Err(KeywardError::Conflict(format!(
                    "envelope key version {} already exists",
                    job.new_envelope_version
                )))
            }
            Err(e) => return Err(e),
        }

        let old_key = self
            .keyring
            .unlock_envelope_key(owner, job.old_envelope_version)
            .await?;
        let mut ring = EnvelopeKeyring::new(job.old_envelope_version, old_key);

        let new_key = EnvelopeKey::generate()?;
        let wrapped = wrap_under_password(&new_key, owner.password(), self.kdf).await?;
        self.keyring.renew_lease(&owner.user_id, rotation_id).await?;
        self.store
            .save_envelope_key(&EnvelopeKeyRecord {
                user_id: owner.user_id.clone(),
                version: job.new_envelope_version,
                wrapped,
            })
            .await?;
        self.store
            .set_current_envelope_version(&owner.user_id, job.new_envelope_version)
            .await?;
        ring.rotate_to(job.new_envelope_version, new_key);
        info!(version = job.new_envelope_version, "New envelope key installed");

        let mut processed = 0u64;
        let mut cursor: Option<String> = None;
        loop {
            let batch = self
                .store
                .list_active_files(&owner.user_id, cursor.as_deref(), self.batch_size)
                .await?;
            if batch.is_empty() {
                break;
            }

            for file in &batch {
                if file.envelope_version == ring.current_version() {
                    continue;
                }
                if !ring.contains(file.envelope_version) {
                    let key = self
                        .keyring
                        .unlock_envelope_key(owner, file.envelope_version)
                        .await?;
                    ring.insert(file.envelope_version, key);
                }

                let (rewrapped, version) = ring
                    .rewrap(&file.wrapped_key, file.envelope_version)
                    .map_err(|e| {
                        KeywardError::Internal(format!(
                            "failed to re-wrap key for file {}: {}",
                            file.file_id, e
                        ))
                    })?;

                self.store
                    .insert_backup(&KeyBackupRecord {
                        rotation_id: rotation_id.to_string(),
                        file_id: file.file_id.clone(),
                        old_wrapped_key: file.wrapped_key.clone(),
                        old_envelope_version: file.envelope_version,
                    })
                    .await?;
                self.store
                    .update_file_key(&file.file_id, &rewrapped, version)
                    .await?;
            }

            processed += batch.len() as u64;
            // Fails once the job was marked FAILED elsewhere, halting this executor
            self.store
                .update_rotation_progress(rotation_id, processed)
                .await?;
            self.keyring.renew_lease(&owner.user_id, rotation_id).await?;
            debug!(processed, total = job.total_files, "Rotation batch done");

            if batch.len() < self.batch_size {
                break;
            }
            cursor = batch.last().map(|file| file.file_id.clone());
        }

        self.store
            .transition_rotation(rotation_id, RotationStatus::Completed, None)
            .await?;
        info!(processed, "Key rotation completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryKeyStore;
    use crate::testing::{fast_config, wait_for_terminal};
    use keyward_crypto::EnvelopeWrappedKey;

    struct Fixture {
        store: Arc<MemoryKeyStore>,
        keyring: KeyringService<MemoryKeyStore>,
        engine: RotationEngine<MemoryKeyStore>,
        owner: OwnerCredentials,
    }

    async fn fixture(files: usize, batch_size: usize) -> Fixture {
        let mut config = fast_config();
        config.rotation.batch_size = batch_size;
        let store = Arc::new(MemoryKeyStore::new());
        let keyring = KeyringService::new(Arc::clone(&store), &config);
        let owner = OwnerCredentials::new("alice", "alice-Passw0rd!");
        keyring.provision_user(&owner).await.unwrap();
        for i in 0..files {
            keyring
                .register_file(&owner, &format!("file-{:03}", i), None)
                .await
                .unwrap();
        }
        Fixture {
            engine: RotationEngine::spawn(Arc::clone(&store), &config),
            store,
            keyring,
            owner,
        }
    }

    #[tokio::test]
    async fn test_rotation_rewraps_every_file() {
        let fx = fixture(25, 10).await;
        let mut keys = Vec::new();
        for i in 0..25 {
            let id = format!("file-{:03}", i);
            keys.push(fx.keyring.unlock_file_key(&fx.owner, &id).await.unwrap());
        }

        let job = fx.engine.start_rotation(&fx.owner).await.unwrap();
        assert_eq!(job.status, RotationStatus::Pending);
        assert_eq!(job.total_files, 25);

        let done = wait_for_terminal(&fx.engine, "alice", &job.rotation_id).await;
        assert_eq!(done.status, RotationStatus::Completed);
        assert_eq!(done.files_processed, 25);
        assert!(done.completed_at.is_some());

        assert_eq!(fx.store.get_keyring("alice").await.unwrap().current_envelope_version, 2);
        for (i, key) in keys.iter().enumerate() {
            let id = format!("file-{:03}", i);
            assert_eq!(fx.store.get_file(&id).await.unwrap().envelope_version, 2);
            let recovered = fx.keyring.unlock_file_key(&fx.owner, &id).await.unwrap();
            assert_eq!(recovered.as_bytes(), key.as_bytes());
        }
        assert_eq!(fx.store.list_backups(&job.rotation_id).await.unwrap().len(), 25);
    }

    #[tokio::test]
    async fn test_wrong_password_creates_no_job() {
        let fx = fixture(1, 10).await;
        let wrong = OwnerCredentials::new("alice", "nope");
        assert!(matches!(
            fx.engine.start_rotation(&wrong).await,
            Err(KeywardError::Authentication)
        ));
        assert!(fx.store.list_active_rotations().await.unwrap().is_empty());
        fx.keyring.acquire_lease("alice", "password:next").await.unwrap();
    }

    #[tokio::test]
    async fn test_status_hidden_from_other_users() {
        let fx = fixture(1, 10).await;
        let job = fx.engine.start_rotation(&fx.owner).await.unwrap();
        assert!(matches!(
            fx.engine.get_rotation_status("bob", &job.rotation_id).await,
            Err(KeywardError::NotFound(_))
        ));
        wait_for_terminal(&fx.engine, "alice", &job.rotation_id).await;
    }

    #[tokio::test]
    async fn test_rollback_restores_previous_keys() {
        let fx = fixture(12, 5).await;
        let before = fx.store.get_file("file-007").await.unwrap();
        let key = fx.keyring.unlock_file_key(&fx.owner, "file-007").await.unwrap();

        let job = fx.engine.start_rotation(&fx.owner).await.unwrap();
        let done = wait_for_terminal(&fx.engine, "alice", &job.rotation_id).await;
        assert_eq!(done.status, RotationStatus::Completed);

        let rolled_back = fx
            .engine
            .rollback_rotation("alice", &job.rotation_id)
            .await
            .unwrap();
        assert_eq!(rolled_back.status, RotationStatus::RolledBack);

        assert_eq!(fx.store.get_file("file-007").await.unwrap(), before);
        assert_eq!(fx.store.get_keyring("alice").await.unwrap().current_envelope_version, 1);
        let recovered = fx.keyring.unlock_file_key(&fx.owner, "file-007").await.unwrap();
        assert_eq!(recovered.as_bytes(), key.as_bytes());
        assert!(fx.store.list_backups(&job.rotation_id).await.unwrap().is_empty());

        // One-shot
        assert!(matches!(
            fx.engine.rollback_rotation("alice", &job.rotation_id).await,
            Err(KeywardError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_failure_halts_and_keeps_files_readable() {
        let fx = fixture(6, 2).await;
        let intact = fx.keyring.unlock_file_key(&fx.owner, "file-001").await.unwrap();

        // file-003 gets a key that no longer authenticates
        let mut broken = fx.store.get_file("file-003").await.unwrap();
        broken.wrapped_key = EnvelopeWrappedKey {
            ciphertext_hex: "00".repeat(48),
            iv_hex: broken.wrapped_key.iv_hex.clone(),
        };
        fx.store
            .update_file_key("file-003", &broken.wrapped_key, broken.envelope_version)
            .await
            .unwrap();

        let job = fx.engine.start_rotation(&fx.owner).await.unwrap();
        let done = wait_for_terminal(&fx.engine, "alice", &job.rotation_id).await;
        assert_eq!(done.status, RotationStatus::Failed);
        assert!(done.error_message.unwrap().contains("file-003"));
        assert_eq!(done.files_processed, 2);

        // Rotated before the failure, and left untouched after it
        assert_eq!(fx.store.get_file("file-001").await.unwrap().envelope_version, 2);
        assert_eq!(fx.store.get_file("file-005").await.unwrap().envelope_version, 1);
        let recovered = fx.keyring.unlock_file_key(&fx.owner, "file-001").await.unwrap();
        assert_eq!(recovered.as_bytes(), intact.as_bytes());
        fx.keyring.unlock_file_key(&fx.owner, "file-005").await.unwrap();

        assert!(matches!(
            fx.engine.rollback_rotation("alice", &job.rotation_id).await,
            Err(KeywardError::Validation(_))
        ));
    }

    async fn stale_job(fx: &Fixture) -> RotationJob {
        let keyring = fx.store.get_keyring("alice").await.unwrap();
        let previous = fx.store.get_envelope_key("alice", 1).await.unwrap();
        RotationJob {
            rotation_id: generate_token().unwrap(),
            user_id: "alice".to_string(),
            status: RotationStatus::InProgress,
            old_envelope_version: keyring.current_envelope_version,
            new_envelope_version: 2,
            previous_wrapped_envelope_key: previous.wrapped,
            total_files: 3,
            files_processed: 0,
            error_message: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_recover_interrupted_allows_new_rotation() {
        let fx = fixture(3, 10).await;
        let stale = stale_job(&fx).await;
        fx.store.create_rotation(&stale).await.unwrap();

        assert!(matches!(
            fx.engine.start_rotation(&fx.owner).await,
            Err(KeywardError::Conflict(_))
        ));

        assert_eq!(fx.engine.recover_interrupted().await.unwrap(), 1);
        let failed = fx.store.get_rotation(&stale.rotation_id).await.unwrap();
        assert_eq!(failed.status, RotationStatus::Failed);
        assert_eq!(failed.error_message.as_deref(), Some(INTERRUPTED_MESSAGE));

        let job = fx.engine.start_rotation(&fx.owner).await.unwrap();
        let done = wait_for_terminal(&fx.engine, "alice", &job.rotation_id).await;
        assert_eq!(done.status, RotationStatus::Completed);
    }

    #[tokio::test]
    async fn test_recovery_leaves_other_engines_rotation_running() {
        let fx = fixture(30, 1).await;
        let job = fx.engine.start_rotation(&fx.owner).await.unwrap();

        // A second engine on the same store, as a separate worker process runs
        let other = RotationEngine::spawn(Arc::clone(&fx.store), &fast_config());
        assert!(fx.store.get_rotation(&job.rotation_id).await.unwrap().status.is_active());
        assert_eq!(other.recover_interrupted().await.unwrap(), 0);

        let done = wait_for_terminal(&fx.engine, "alice", &job.rotation_id).await;
        assert_eq!(done.status, RotationStatus::Completed);
        assert_eq!(done.files_processed, 30);
        for file in fx.store.list_active_files("alice", None, 100).await.unwrap() {
            assert_eq!(file.envelope_version, 2);
        }
    }

    #[tokio::test]
    async fn test_recovery_waits_for_lease_to_lapse() {
        let fx = fixture(2, 10).await;
        let stale = stale_job(&fx).await;
        fx.store.create_rotation(&stale).await.unwrap();

        // Still renewed by whoever runs it
        fx.store
            .acquire_keyring_lease("alice", &stale.rotation_id, Utc::now() + chrono::Duration::minutes(1))
            .await
            .unwrap();
        assert_eq!(fx.engine.recover_interrupted().await.unwrap(), 0);
        assert_eq!(
            fx.store.get_rotation(&stale.rotation_id).await.unwrap().status,
            RotationStatus::InProgress
        );

        // Its executor stopped renewing
        fx.store
            .acquire_keyring_lease("alice", &stale.rotation_id, Utc::now() - chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(fx.engine.recover_interrupted().await.unwrap(), 1);
        assert!(fx
            .store
            .update_rotation_progress(&stale.rotation_id, 1)
            .await
            .is_err());

        let job = fx.engine.start_rotation(&fx.owner).await.unwrap();
        let done = wait_for_terminal(&fx.engine, "alice", &job.rotation_id).await;
        assert_eq!(done.status, RotationStatus::Completed);
    }

    #[tokio::test]
    async fn test_full_queue_fails_job() {
        let mut config = fast_config();
        config.rotation.max_concurrent_rotations = 1;
        config.rotation.queue_capacity = 1;
        let store = Arc::new(MemoryKeyStore::new());
        let keyring = KeyringService::new(Arc::clone(&store), &config);
        let engine = RotationEngine::spawn(Arc::clone(&store), &config);

        // Hold the only permit so nothing gets past the dispatcher
        let permit = Arc::clone(&engine.inner.permits).acquire_owned().await.unwrap();

        let mut accepted = Vec::new();
        let mut refused = Vec::new();
        for i in 0..4 {
            let owner = OwnerCredentials::new(format!("user-{}", i), "user-Passw0rd!");
            keyring.provision_user(&owner).await.unwrap();
            keyring.register_file(&owner, &format!("file-{}", i), None).await.unwrap();
            match engine.start_rotation(&owner).await {
                Ok(job) => accepted.push((owner, job)),
                Err(KeywardError::Internal(message)) => {
                    assert_eq!(message, QUEUE_FULL_MESSAGE);
                    refused.push(owner);
                }
                Err(e) => panic!("unexpected error: {}", e),
            }
        }

        // One job waits on the permit and one fills the queue
        assert!(!accepted.is_empty() && accepted.len() <= 2);
        assert!(!refused.is_empty());
        let active = store.list_active_rotations().await.unwrap();
        assert_eq!(active.len(), accepted.len());

        drop(permit);
        for (owner, job) in &accepted {
            let done = wait_for_terminal(&engine, &owner.user_id, &job.rotation_id).await;
            assert_eq!(done.status, RotationStatus::Completed);
        }

        // The refused job gave its lease back
        let retry = engine.start_rotation(&refused[0]).await.unwrap();
        let done = wait_for_terminal(&engine, &refused[0].user_id, &retry.rotation_id).await;
        assert_eq!(done.status, RotationStatus::Completed);
    }

    #[tokio::test]
    async fn test_rollback_refused_while_lease_held() {
        let fx = fixture(3, 10).await;
        let job = fx.engine.start_rotation(&fx.owner).await.unwrap();
        wait_for_terminal(&fx.engine, "alice", &job.rotation_id).await;

        fx.keyring.acquire_lease("alice", "password:pending").await.unwrap();
        assert!(matches!(
            fx.engine.rollback_rotation("alice", &job.rotation_id).await,
            Err(KeywardError::Conflict(_))
        ));
        assert_eq!(fx.store.get_keyring("alice").await.unwrap().current_envelope_version, 2);
        assert_eq!(fx.store.get_file("file-000").await.unwrap().envelope_version, 2);

        fx.keyring.release_lease("alice", "password:pending").await;
        fx.engine.rollback_rotation("alice", &job.rotation_id).await.unwrap();
        assert_eq!(fx.store.get_keyring("alice").await.unwrap().current_envelope_version, 1);
    }

    #[tokio::test]
    async fn test_racing_rollbacks_restore_once() {
        let fx = fixture(4, 10).await;
        let job = fx.engine.start_rotation(&fx.owner).await.unwrap();
        wait_for_terminal(&fx.engine, "alice", &job.rotation_id).await;

        let (a, b) = tokio::join!(
            fx.engine.rollback_rotation("alice", &job.rotation_id),
            fx.engine.rollback_rotation("alice", &job.rotation_id)
        );
        assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);
        for file in fx.store.list_active_files("alice", None, 10).await.unwrap() {
            assert_eq!(file.envelope_version, 1);
            fx.keyring.unlock_file_key(&fx.owner, &file.file_id).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_second_rotation_picks_up_mixed_versions() {
        let fx = fixture(4, 10).await;
        let first = fx.engine.start_rotation(&fx.owner).await.unwrap();
        wait_for_terminal(&fx.engine, "alice", &first.rotation_id).await;

        // Registered after the first rotation, so already at version 2
        fx.keyring.register_file(&fx.owner, "file-new", None).await.unwrap();
        // Simulate a file left behind at version 1
        let backup = &fx.store.list_backups(&first.rotation_id).await.unwrap()[0];
        fx.store
            .update_file_key(&backup.file_id, &backup.old_wrapped_key, 1)
            .await
            .unwrap();

        let second = fx.engine.start_rotation(&fx.owner).await.unwrap();
        assert_eq!(second.new_envelope_version, 3);
        let done = wait_for_terminal(&fx.engine, "alice", &second.rotation_id).await;
        assert_eq!(done.status, RotationStatus::Completed);

        for file in fx.store.list_active_files("alice", None, 100).await.unwrap() {
            assert_eq!(file.envelope_version, 3);
            fx.keyring.unlock_file_key(&fx.owner, &file.file_id).await.unwrap();
        }

        // The first rotation is no longer the latest
        assert!(matches!(
            fx.engine.rollback_rotation("alice", &first.rotation_id).await,
            Err(KeywardError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_start_after_shutdown_fails_job() {
        let fx = fixture(1, 10).await;
        fx.engine.shutdown().await;
        assert!(matches!(
            fx.engine.start_rotation(&fx.owner).await,
            Err(KeywardError::Internal(_))
        ));
        assert!(fx.store.list_active_rotations().await.unwrap().is_empty());
        // The refused job's lease is free again
        fx.keyring.acquire_lease("alice", "password:next").await.unwrap();
    }
}
