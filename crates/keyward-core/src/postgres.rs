//! PostgreSQL key store
//!
//! Uniqueness is carried by the schema: a unique share token column, a
//! partial unique index allowing one PENDING/IN_PROGRESS rotation per user and
//! a keyring lease row per user taken with a conditional upsert. Unique
//! violations and lost leases surface as `KeywardError::Conflict`.

use crate::error::{KeywardError, Result};
use crate::store::{
    illegal_transition, lease_held, limit_below_usage, AccessStats, EnvelopeKeyRecord,
    KeyBackupRecord, KeyStore, RotationJob, RotationStatus, ShareAccessLog, ShareChanges,
    ShareRecord, UserFile, UserKeyring,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keyward_crypto::{EnvelopeWrappedKey, PasswordWrappedKey};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

const ROTATION_COLUMNS: &str = r#"
    rotation_id,
    user_id,
    status,
    old_envelope_key_version,
    new_envelope_key_version,
    old_envelope_key,
    old_envelope_salt,
    old_envelope_iv,
    total_files_affected,
    files_processed,
    error_message,
    started_at,
    completed_at
"#;

const SHARE_COLUMNS: &str = r#"
    share_token,
    user_file_id,
    user_id,
    encrypted_key,
    iv,
    envelope_key,
    envelope_salt,
    envelope_iv,
    max_downloads,
    download_count,
    expires_at,
    created_at
"#;

const FILE_COLUMNS: &str = r#"
    file_id,
    user_id,
    encryption_key,
    encryption_iv,
    envelope_version,
    folder_id,
    deleted_at
"#;

/// A `KeyStore` backed by a PostgreSQL pool
#[derive(Clone, Debug)]
pub struct PgKeyStore {
    pool: PgPool,
}

impl PgKeyStore {
    /// Connect and run pending migrations
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    async fn find_rotation(&self, rotation_id: &str) -> Result<Option<RotationJob>> {
        let row = sqlx::query_as::<_, RotationRow>(&format!(
            "SELECT {} FROM key_rotations WHERE rotation_id = $1",
            ROTATION_COLUMNS
        ))
        .bind(rotation_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(RotationJob::try_from).transpose()
    }
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .map_or(false, |db_error| db_error.is_unique_violation())
}

fn conflict_or_storage(error: sqlx::Error, message: &str) -> KeywardError {
    if is_unique_violation(&error) {
        KeywardError::Conflict(message.to_string())
    } else {
        KeywardError::from(error)
    }
}

fn to_u32(value: i32, column: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| KeywardError::Storage(format!("negative value in {}", column)))
}

fn to_u64(value: i64, column: &str) -> Result<u64> {
    u64::try_from(value)
        .map_err(|_| KeywardError::Storage(format!("negative value in {}", column)))
}

fn to_i32(value: u32) -> Result<i32> {
    i32::try_from(value).map_err(|_| KeywardError::Validation("version out of range".into()))
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| KeywardError::Validation("count out of range".into()))
}

#[derive(Debug, sqlx::FromRow)]
struct EnvelopeKeyRow {
    user_id: String,
    version: i32,
    ciphertext: String,
    salt: String,
    iv: String,
}

impl TryFrom<EnvelopeKeyRow> for EnvelopeKeyRecord {
    type Error = KeywardError;

    fn try_from(row: EnvelopeKeyRow) -> Result<Self> {
        Ok(Self {
            user_id: row.user_id,
            version: to_u32(row.version, "envelope_keys.version")?,
            wrapped: PasswordWrappedKey {
                ciphertext_hex: row.ciphertext,
                salt_hex: row.salt,
                iv_hex: row.iv,
            },
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct FileRow {
    file_id: String,
    user_id: String,
    encryption_key: String,
    encryption_iv: String,
    envelope_version: i32,
    folder_id: Option<String>,
    deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<FileRow> for UserFile {
    type Error = KeywardError;

    fn try_from(row: FileRow) -> Result<Self> {
        Ok(Self {
            file_id: row.file_id,
            user_id: row.user_id,
            wrapped_key: EnvelopeWrappedKey {
                ciphertext_hex: row.encryption_key,
                iv_hex: row.encryption_iv,
            },
            envelope_version: to_u32(row.envelope_version, "user_files.envelope_version")?,
            folder_id: row.folder_id,
            deleted_at: row.deleted_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ShareRow {
    share_token: String,
    user_file_id: String,
    user_id: String,
    encrypted_key: String,
    iv: String,
    envelope_key: String,
    envelope_salt: String,
    envelope_iv: String,
    max_downloads: i64,
    download_count: i64,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl From<ShareRow> for ShareRecord {
    fn from(row: ShareRow) -> Self {
        Self {
            share_token: row.share_token,
            file_id: row.user_file_id,
            owner_id: row.user_id,
            wrapped_file_key: EnvelopeWrappedKey {
                ciphertext_hex: row.encrypted_key,
                iv_hex: row.iv,
            },
            wrapped_envelope_key: PasswordWrappedKey {
                ciphertext_hex: row.envelope_key,
                salt_hex: row.envelope_salt,
                iv_hex: row.envelope_iv,
            },
            max_downloads: row.max_downloads,
            download_count: row.download_count,
            expires_at: row.expires_at,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RotationRow {
    rotation_id: String,
    user_id: String,
    status: String,
    old_envelope_key_version: i32,
    new_envelope_key_version: i32,
    old_envelope_key: String,
    old_envelope_salt: String,
    old_envelope_iv: String,
    total_files_affected: i64,
    files_processed: i64,
    error_message: Option<String>,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<RotationRow> for RotationJob {
    type Error = KeywardError;

    fn try_from(row: RotationRow) -> Result<Self> {
        Ok(Self {
            rotation_id: row.rotation_id,
            user_id: row.user_id,
            status: row.status.parse()?,
            old_envelope_version: to_u32(row.old_envelope_key_version, "old_envelope_key_version")?,
            new_envelope_version: to_u32(row.new_envelope_key_version, "new_envelope_key_version")?,
            previous_wrapped_envelope_key: PasswordWrappedKey {
                ciphertext_hex: row.old_envelope_key,
                salt_hex: row.old_envelope_salt,
                iv_hex: row.old_envelope_iv,
            },
            total_files: to_u64(row.total_files_affected, "total_files_affected")?,
            files_processed: to_u64(row.files_processed, "files_processed")?,
            error_message: row.error_message,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct BackupRow {
    rotation_id: String,
    user_file_id: String,
    old_encryption_key: String,
    old_encryption_iv: String,
    old_envelope_version: i32,
}

impl TryFrom<BackupRow> for KeyBackupRecord {
    type Error = KeywardError;

    fn try_from(row: BackupRow) -> Result<Self> {
        Ok(Self {
            rotation_id: row.rotation_id,
            file_id: row.user_file_id,
            old_wrapped_key: EnvelopeWrappedKey {
                ciphertext_hex: row.old_encryption_key,
                iv_hex: row.old_encryption_iv,
            },
            old_envelope_version: to_u32(row.old_envelope_version, "old_envelope_version")?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AccessStatsRow {
    total_attempts: i64,
    successful_attempts: i64,
    failed_attempts: i64,
    recent_attempts: i64,
    unique_clients: i64,
}

impl TryFrom<AccessStatsRow> for AccessStats {
    type Error = KeywardError;

    fn try_from(row: AccessStatsRow) -> Result<Self> {
        Ok(Self {
            total_attempts: to_u64(row.total_attempts, "total_attempts")?,
            successful_attempts: to_u64(row.successful_attempts, "successful_attempts")?,
            failed_attempts: to_u64(row.failed_attempts, "failed_attempts")?,
            recent_attempts: to_u64(row.recent_attempts, "recent_attempts")?,
            unique_clients: to_u64(row.unique_clients, "unique_clients")?,
        })
    }
}

#[async_trait]
impl KeyStore for PgKeyStore {
    async fn create_keyring(&self, user_id: &str, wrapped: &PasswordWrappedKey) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO user_keyrings (user_id, current_envelope_version) VALUES ($1, 1)",
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| conflict_or_storage(e, "keyring already exists"))?;
        sqlx::query(
            r#"
            INSERT INTO envelope_keys (user_id, version, ciphertext, salt, iv)
            VALUES ($1, 1, $2, $3, $4)
            "#,
        )
        .bind(user_id)
        .bind(&wrapped.ciphertext_hex)
        .bind(&wrapped.salt_hex)
        .bind(&wrapped.iv_hex)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_keyring(&self, user_id: &str) -> Result<UserKeyring> {
        let version: Option<i32> = sqlx::query_scalar(
            "SELECT current_envelope_version FROM user_keyrings WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        let version =
            version.ok_or_else(|| KeywardError::NotFound(format!("keyring {}", user_id)))?;
        Ok(UserKeyring {
            user_id: user_id.to_string(),
            current_envelope_version: to_u32(version, "current_envelope_version")?,
        })
    }

    async fn get_envelope_key(&self, user_id: &str, version: u32) -> Result<EnvelopeKeyRecord> {
        sqlx::query_as::<_, EnvelopeKeyRow>(
            r#"
            SELECT user_id, version, ciphertext, salt, iv
            FROM envelope_keys
            WHERE user_id = $1 AND version = $2
            "#,
        )
        .bind(user_id)
        .bind(to_i32(version)?)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            KeywardError::NotFound(format!(
                "envelope key version {} for user {}",
                version, user_id
            ))
        })?
        .try_into()
    }

    async fn list_envelope_keys(&self, user_id: &str) -> Result<Vec<EnvelopeKeyRecord>> {
        sqlx::query_as::<_, EnvelopeKeyRow>(
            r#"
            SELECT user_id, version, ciphertext, salt, iv
            FROM envelope_keys
            WHERE user_id = $1
            ORDER BY version
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(EnvelopeKeyRecord::try_from)
        .collect()
    }

    async fn save_envelope_key(&self, record: &EnvelopeKeyRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO envelope_keys (user_id, version, ciphertext, salt, iv)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id, version) DO UPDATE SET
                ciphertext = excluded.ciphertext,
                salt = excluded.salt,
                iv = excluded.iv
            "#,
        )
        .bind(&record.user_id)
        .bind(to_i32(record.version)?)
        .bind(&record.wrapped.ciphertext_hex)
        .bind(&record.wrapped.salt_hex)
        .bind(&record.wrapped.iv_hex)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_current_envelope_version(&self, user_id: &str, version: u32) -> Result<()> {
        let result = sqlx::query(
            "UPDATE user_keyrings SET current_envelope_version = $2 WHERE user_id = $1",
        )
        .bind(user_id)
        .bind(to_i32(version)?)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(KeywardError::NotFound(format!("keyring {}", user_id)));
        }
        Ok(())
    }

    async fn acquire_keyring_lease(
        &self,
        user_id: &str,
        holder: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let acquired: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO keyring_leases (user_id, holder, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO UPDATE
            SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
            WHERE keyring_leases.holder = EXCLUDED.holder
               OR keyring_leases.expires_at <= $4
            RETURNING user_id
            "#,
        )
        .bind(user_id)
        .bind(holder)
        .bind(expires_at)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;
        acquired.map(|_| ()).ok_or_else(|| lease_held(user_id))
    }

    async fn renew_keyring_lease(
        &self,
        user_id: &str,
        holder: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE keyring_leases SET expires_at = $3 WHERE user_id = $1 AND holder = $2",
        )
        .bind(user_id)
        .bind(holder)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(KeywardError::Conflict(format!(
                "keyring lease for user {} was lost",
                user_id
            )));
        }
        Ok(())
    }

    async fn release_keyring_lease(&self, user_id: &str, holder: &str) -> Result<()> {
        sqlx::query("DELETE FROM keyring_leases WHERE user_id = $1 AND holder = $2")
            .bind(user_id)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn insert_file(&self, file: &UserFile) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_files
                (file_id, user_id, encryption_key, encryption_iv, envelope_version, folder_id, deleted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&file.file_id)
        .bind(&file.user_id)
        .bind(&file.wrapped_key.ciphertext_hex)
        .bind(&file.wrapped_key.iv_hex)
        .bind(to_i32(file.envelope_version)?)
        .bind(&file.folder_id)
        .bind(file.deleted_at)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_or_storage(e, "file already exists"))?;
        Ok(())
    }

    async fn get_file(&self, file_id: &str) -> Result<UserFile> {
        sqlx::query_as::<_, FileRow>(&format!(
            "SELECT {} FROM user_files WHERE file_id = $1",
            FILE_COLUMNS
        ))
        .bind(file_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| KeywardError::NotFound(format!("file {}", file_id)))?
        .try_into()
    }

    async fn list_active_files(
        &self,
        user_id: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<UserFile>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        sqlx::query_as::<_, FileRow>(&format!(
            r#"
            SELECT {} FROM user_files
            WHERE user_id = $1
              AND deleted_at IS NULL
              AND ($2::TEXT IS NULL OR file_id > $2)
            ORDER BY file_id
            LIMIT $3
            "#,
            FILE_COLUMNS
        ))
        .bind(user_id)
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(UserFile::try_from)
        .collect()
    }

    async fn count_active_files(&self, user_id: &str) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM user_files WHERE user_id = $1 AND deleted_at IS NULL",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        to_u64(count, "count")
    }

    async fn update_file_key(
        &self,
        file_id: &str,
        wrapped_key: &EnvelopeWrappedKey,
        envelope_version: u32,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE user_files
            SET encryption_key = $2, encryption_iv = $3, envelope_version = $4
            WHERE file_id = $1
            "#,
        )
        .bind(file_id)
        .bind(&wrapped_key.ciphertext_hex)
        .bind(&wrapped_key.iv_hex)
        .bind(to_i32(envelope_version)?)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(KeywardError::NotFound(format!("file {}", file_id)));
        }
        Ok(())
    }

    async fn soft_delete_file(&self, file_id: &str, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query("UPDATE user_files SET deleted_at = $2 WHERE file_id = $1")
            .bind(file_id)
            .bind(at)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(KeywardError::NotFound(format!("file {}", file_id)));
        }
        Ok(())
    }

    async fn insert_share(&self, share: &ShareRecord) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO file_shares ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
            SHARE_COLUMNS
        ))
        .bind(&share.share_token)
        .bind(&share.file_id)
        .bind(&share.owner_id)
        .bind(&share.wrapped_file_key.ciphertext_hex)
        .bind(&share.wrapped_file_key.iv_hex)
        .bind(&share.wrapped_envelope_key.ciphertext_hex)
        .bind(&share.wrapped_envelope_key.salt_hex)
        .bind(&share.wrapped_envelope_key.iv_hex)
        .bind(share.max_downloads)
        .bind(share.download_count)
        .bind(share.expires_at)
        .bind(share.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_or_storage(e, "share token already in use"))?;
        Ok(())
    }

    async fn get_share(&self, token: &str) -> Result<ShareRecord> {
        sqlx::query_as::<_, ShareRow>(&format!(
            "SELECT {} FROM file_shares WHERE share_token = $1",
            SHARE_COLUMNS
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await?
        .map(ShareRecord::from)
        .ok_or_else(|| KeywardError::NotFound("share link".to_string()))
    }

    async fn list_shares(&self, owner_id: &str) -> Result<Vec<ShareRecord>> {
        Ok(sqlx::query_as::<_, ShareRow>(&format!(
            "SELECT {} FROM file_shares WHERE user_id = $1 ORDER BY created_at DESC",
            SHARE_COLUMNS
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(ShareRecord::from)
        .collect())
    }

    async fn increment_download(&self, token: &str) -> Result<i64> {
        let count: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE file_shares
            SET download_count = download_count + 1
            WHERE share_token = $1
              AND (max_downloads = -1 OR download_count < max_downloads)
            RETURNING download_count
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        match count {
            Some(count) => Ok(count),
            None => {
                // Distinguish a missing link from one that hit its limit
                self.get_share(token).await?;
                Err(KeywardError::DownloadLimitExceeded)
            }
        }
    }

    async fn release_download(&self, token: &str) -> Result<i64> {
        let count: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE file_shares
            SET download_count = download_count - 1
            WHERE share_token = $1 AND download_count > 0
            RETURNING download_count
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        match count {
            Some(count) => Ok(count),
            None => Ok(self.get_share(token).await?.download_count),
        }
    }

    async fn update_share(
        &self,
        owner_id: &str,
        token: &str,
        changes: &ShareChanges,
    ) -> Result<ShareRecord> {
        let (file_key, envelope_key) = match &changes.rewrapped {
            Some((file_key, envelope_key)) => (Some(file_key), Some(envelope_key)),
            None => (None, None),
        };
        let row = sqlx::query_as::<_, ShareRow>(&format!(
            r#"
            UPDATE file_shares
            SET encrypted_key = COALESCE($3, encrypted_key),
                iv = COALESCE($4, iv),
                envelope_key = COALESCE($5, envelope_key),
                envelope_salt = COALESCE($6, envelope_salt),
                envelope_iv = COALESCE($7, envelope_iv),
                max_downloads = COALESCE($8, max_downloads),
                expires_at = COALESCE($9, expires_at)
            WHERE share_token = $1 AND user_id = $2
              AND ($8::BIGINT IS NULL OR $8 = -1 OR $8 >= download_count)
            RETURNING {}
            "#,
            SHARE_COLUMNS
        ))
        .bind(token)
        .bind(owner_id)
        .bind(file_key.map(|key| key.ciphertext_hex.as_str()))
        .bind(file_key.map(|key| key.iv_hex.as_str()))
        .bind(envelope_key.map(|key| key.ciphertext_hex.as_str()))
        .bind(envelope_key.map(|key| key.salt_hex.as_str()))
        .bind(envelope_key.map(|key| key.iv_hex.as_str()))
        .bind(changes.max_downloads)
        .bind(changes.expires_at)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row.into()),
            None => {
                let current = self.get_share(token).await?;
                if current.owner_id != owner_id {
                    return Err(KeywardError::NotFound("share link".to_string()));
                }
                Err(limit_below_usage(
                    changes.max_downloads.unwrap_or(current.max_downloads),
                    current.download_count,
                ))
            }
        }
    }

    async fn delete_share(&self, owner_id: &str, token: &str) -> Result<()> {
        let result =
            sqlx::query("DELETE FROM file_shares WHERE share_token = $1 AND user_id = $2")
                .bind(token)
                .bind(owner_id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(KeywardError::NotFound("share link".to_string()));
        }
        Ok(())
    }

    async fn create_rotation(&self, job: &RotationJob) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO key_rotations ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
            ROTATION_COLUMNS
        ))
        .bind(&job.rotation_id)
        .bind(&job.user_id)
        .bind(job.status.as_str())
        .bind(to_i32(job.old_envelope_version)?)
        .bind(to_i32(job.new_envelope_version)?)
        .bind(&job.previous_wrapped_envelope_key.ciphertext_hex)
        .bind(&job.previous_wrapped_envelope_key.salt_hex)
        .bind(&job.previous_wrapped_envelope_key.iv_hex)
        .bind(to_i64(job.total_files)?)
        .bind(to_i64(job.files_processed)?)
        .bind(&job.error_message)
        .bind(job.started_at)
        .bind(job.completed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| conflict_or_storage(e, "a key rotation is already in progress"))?;
        Ok(())
    }

    async fn get_rotation(&self, rotation_id: &str) -> Result<RotationJob> {
        self.find_rotation(rotation_id)
            .await?
            .ok_or_else(|| KeywardError::NotFound(format!("rotation {}", rotation_id)))
    }

    async fn transition_rotation(
        &self,
        rotation_id: &str,
        next: RotationStatus,
        error_message: Option<&str>,
    ) -> Result<RotationJob> {
        let allowed: Vec<String> = RotationStatus::predecessors(next)
            .into_iter()
            .map(|status| status.as_str().to_string())
            .collect();

        let row = sqlx::query_as::<_, RotationRow>(&format!(
            r#"
            UPDATE key_rotations
            SET status = $2,
                error_message = COALESCE($3, error_message),
                completed_at = CASE WHEN $4 THEN NOW() ELSE completed_at END
            WHERE rotation_id = $1 AND status = ANY($5)
            RETURNING {}
            "#,
            ROTATION_COLUMNS
        ))
        .bind(rotation_id)
        .bind(next.as_str())
        .bind(error_message)
        .bind(next.is_terminal())
        .bind(allowed)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into(),
            None => {
                let current = self.get_rotation(rotation_id).await?;
                Err(illegal_transition(current.status, next))
            }
        }
    }

    async fn update_rotation_progress(
        &self,
        rotation_id: &str,
        files_processed: u64,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE key_rotations SET files_processed = $2
            WHERE rotation_id = $1 AND status = 'IN_PROGRESS'
            "#,
        )
        .bind(rotation_id)
        .bind(to_i64(files_processed)?)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            let current = self.get_rotation(rotation_id).await?;
            return Err(KeywardError::Conflict(format!(
                "rotation {} is {}",
                rotation_id, current.status
            )));
        }
        Ok(())
    }

    async fn list_active_rotations(&self) -> Result<Vec<RotationJob>> {
        sqlx::query_as::<_, RotationRow>(&format!(
            "SELECT {} FROM key_rotations WHERE status IN ('PENDING', 'IN_PROGRESS')",
            ROTATION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(RotationJob::try_from)
        .collect()
    }

    async fn insert_backup(&self, backup: &KeyBackupRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO key_rotation_backups
                (rotation_id, user_file_id, old_encryption_key, old_encryption_iv, old_envelope_version)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&backup.rotation_id)
        .bind(&backup.file_id)
        .bind(&backup.old_wrapped_key.ciphertext_hex)
        .bind(&backup.old_wrapped_key.iv_hex)
        .bind(to_i32(backup.old_envelope_version)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_backups(&self, rotation_id: &str) -> Result<Vec<KeyBackupRecord>> {
        sqlx::query_as::<_, BackupRow>(
            r#"
            SELECT rotation_id, user_file_id, old_encryption_key, old_encryption_iv, old_envelope_version
            FROM key_rotation_backups
            WHERE rotation_id = $1
            ORDER BY user_file_id
            "#,
        )
        .bind(rotation_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(KeyBackupRecord::try_from)
        .collect()
    }

    async fn delete_backups(&self, rotation_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM key_rotation_backups WHERE rotation_id = $1")
            .bind(rotation_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_access_log(&self, log: &ShareAccessLog) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO share_access_logs
                (share_token, client, success, failure_reason, attempted_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&log.share_token)
        .bind(&log.client)
        .bind(log.success)
        .bind(&log.failure_reason)
        .bind(log.attempted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn access_stats(&self, token: &str, recent_since: DateTime<Utc>) -> Result<AccessStats> {
        sqlx::query_as::<_, AccessStatsRow>(
            r#"
            SELECT COUNT(*) AS total_attempts,
                   COUNT(*) FILTER (WHERE success) AS successful_attempts,
                   COUNT(*) FILTER (WHERE NOT success) AS failed_attempts,
                   COUNT(*) FILTER (WHERE attempted_at >= $2) AS recent_attempts,
                   COUNT(DISTINCT client) AS unique_clients
            FROM share_access_logs
            WHERE share_token = $1
            "#,
        )
        .bind(token)
        .bind(recent_since)
        .fetch_one(&self.pool)
        .await?
        .try_into()
    }

    async fn delete_access_logs_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM share_access_logs WHERE attempted_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyward_crypto::generate_token;

    // Runs only when DATABASE_URL points at a disposable database
    async fn test_store() -> Option<PgKeyStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        Some(PgKeyStore::connect(&url, 2).await.expect("connect"))
    }

    fn wrapped_envelope() -> PasswordWrappedKey {
        PasswordWrappedKey {
            ciphertext_hex: "aa".repeat(48),
            salt_hex: "bb".repeat(16),
            iv_hex: "cc".repeat(12),
        }
    }

    fn job(user_id: &str) -> RotationJob {
        RotationJob {
            rotation_id: generate_token().unwrap(),
            user_id: user_id.to_string(),
            status: RotationStatus::Pending,
            old_envelope_version: 1,
            new_envelope_version: 2,
            previous_wrapped_envelope_key: wrapped_envelope(),
            total_files: 0,
            files_processed: 0,
            error_message: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_partial_index_allows_one_active_rotation() {
        let Some(store) = test_store().await else {
            return;
        };
        let user = generate_token().unwrap();
        let first = job(&user);
        store.create_rotation(&first).await.unwrap();
        assert!(matches!(
            store.create_rotation(&job(&user)).await,
            Err(KeywardError::Conflict(_))
        ));

        store
            .transition_rotation(&first.rotation_id, RotationStatus::Failed, Some("test"))
            .await
            .unwrap();
        store.create_rotation(&job(&user)).await.unwrap();
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected() {
        let Some(store) = test_store().await else {
            return;
        };
        let pending = job(&generate_token().unwrap());
        store.create_rotation(&pending).await.unwrap();
        assert!(matches!(
            store
                .transition_rotation(&pending.rotation_id, RotationStatus::RolledBack, None)
                .await,
            Err(KeywardError::Validation(_))
        ));
        assert_eq!(
            store.get_rotation(&pending.rotation_id).await.unwrap().status,
            RotationStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_lease_upsert_excludes_other_holders() {
        let Some(store) = test_store().await else {
            return;
        };
        let user = generate_token().unwrap();
        let later = Utc::now() + chrono::Duration::minutes(1);
        store.acquire_keyring_lease(&user, "a", later).await.unwrap();
        assert!(matches!(
            store.acquire_keyring_lease(&user, "b", later).await,
            Err(KeywardError::Conflict(_))
        ));
        store.renew_keyring_lease(&user, "a", later).await.unwrap();
        store.release_keyring_lease(&user, "a").await.unwrap();
        store.acquire_keyring_lease(&user, "b", later).await.unwrap();
        assert!(store.renew_keyring_lease(&user, "a", later).await.is_err());
    }

    #[tokio::test]
    async fn test_progress_rejected_after_failure() {
        let Some(store) = test_store().await else {
            return;
        };
        let running = job(&generate_token().unwrap());
        store.create_rotation(&running).await.unwrap();
        store
            .transition_rotation(&running.rotation_id, RotationStatus::InProgress, None)
            .await
            .unwrap();
        store.update_rotation_progress(&running.rotation_id, 3).await.unwrap();
        store
            .transition_rotation(&running.rotation_id, RotationStatus::Failed, Some("test"))
            .await
            .unwrap();
        assert!(matches!(
            store.update_rotation_progress(&running.rotation_id, 4).await,
            Err(KeywardError::Conflict(_))
        ));
    }
}
