//! Error types for the keyward-core crate

use keyward_crypto::CryptoError;
use serde::Serialize;
use thiserror::Error;

/// Result type alias using `KeywardError`
pub type Result<T> = std::result::Result<T, KeywardError>;

/// Stable error categories for the API layer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Authentication,
    Conflict,
    Expired,
    DownloadLimitExceeded,
    RateLimited,
    Internal,
}

impl ErrorKind {
    /// Get the error code string
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION",
            Self::NotFound => "NOT_FOUND",
            Self::Authentication => "AUTHENTICATION",
            Self::Conflict => "CONFLICT",
            Self::Expired => "EXPIRED",
            Self::DownloadLimitExceeded => "DOWNLOAD_LIMIT_EXCEEDED",
            Self::RateLimited => "RATE_LIMITED",
            Self::Internal => "INTERNAL",
        }
    }
}

/// Errors returned by key storage, sharing and rotation
#[derive(Error, Debug)]
pub enum KeywardError {
    /// Bad input: weak password, malformed token, illegal state transition
    #[error("validation error: {0}")]
    Validation(String),

    /// Record absent or not owned by the caller
    #[error("not found: {0}")]
    NotFound(String),

    /// Wrong password or corrupted key material
    #[error("authentication failed")]
    Authentication,

    /// Uniqueness violated, e.g. a rotation already in progress
    #[error("conflict: {0}")]
    Conflict(String),

    /// Share link past its expiry
    #[error("share link has expired")]
    Expired,

    /// Share link download limit reached
    #[error("download limit exceeded")]
    DownloadLimitExceeded,

    /// Too many access attempts
    #[error("too many attempts, try again later")]
    RateLimited,

    /// Unexpected failure in crypto or worker plumbing
    #[error("internal error: {0}")]
    Internal(String),

    /// Datastore failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl KeywardError {
    /// Map to the stable category reported to clients
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Authentication => ErrorKind::Authentication,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::Expired => ErrorKind::Expired,
            Self::DownloadLimitExceeded => ErrorKind::DownloadLimitExceeded,
            Self::RateLimited => ErrorKind::RateLimited,
            Self::Internal(_) | Self::Storage(_) | Self::Config(_) => ErrorKind::Internal,
        }
    }
}

impl From<CryptoError> for KeywardError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Authentication => Self::Authentication,
            CryptoError::WeakPassword(msg) => Self::Validation(msg),
            CryptoError::HexDecode(_) | CryptoError::Base64Decode(_) => {
                Self::Validation(err.to_string())
            }
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<sqlx::Error> for KeywardError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound("row not found".to_string()),
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for KeywardError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::Storage(format!("migration failed: {}", err))
    }
}

impl From<config::ConfigError> for KeywardError {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<tokio::task::JoinError> for KeywardError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(format!("task failed: {}", err))
    }
}
