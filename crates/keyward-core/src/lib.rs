//! # Keyward Core
//!
//! Key management services for Keyward encrypted file storage.
//!
//! This crate provides:
//! - **Keyrings**: per-user envelope keys wrapped under the owner's password
//! - **Sharing**: password-protected share links with download limits, expiry
//!   and an access log
//! - **Rotation**: background envelope key rotation with backups and rollback
//! - **Storage**: the [`KeyStore`] trait with in-memory and PostgreSQL backends
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │   ShareService    │   RotationEngine     │
//! ├──────────────────────────────────────────┤
//! │             KeyringService               │
//! ├──────────────────────────────────────────┤
//! │   KeyStore (MemoryKeyStore, PgKeyStore)  │
//! ├──────────────────────────────────────────┤
//! │             keyward-crypto               │
//! └──────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod keyring;
pub mod limiter;
pub mod link;
pub mod memory;
pub mod postgres;
pub mod rotation;
pub mod sharing;
pub mod store;

pub use config::KeywardConfig;
pub use error::{ErrorKind, KeywardError, Result};
pub use keyring::{KeyringService, OwnerCredentials};
pub use link::ShareLink;
pub use memory::MemoryKeyStore;
pub use postgres::PgKeyStore;
pub use rotation::RotationEngine;
pub use sharing::{CreatedShare, ShareService, ShareSummary, ShareUpdate, UnlockedShare};
pub use store::{
    AccessStats, KeyBackupRecord, KeyStore, KeyringLease, RotationJob, RotationStatus,
    ShareAccessLog, ShareChanges, ShareRecord, UserFile, UserKeyring, UNLIMITED_DOWNLOADS,
};
