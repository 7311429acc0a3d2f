//! Error types for the keyward-crypto crate

use thiserror::Error;

/// Result type alias using `CryptoError`
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Errors that can occur during cryptographic operations
///
/// None of the messages carry key material.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// The OS entropy source failed
    #[error("random number generation failed: {0}")]
    Rng(String),

    /// Invalid key format or length
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// Invalid IV or nonce length
    #[error("invalid nonce: {0}")]
    InvalidNonce(String),

    /// AEAD tag mismatch: wrong key, wrong password, or corrupted ciphertext
    #[error("authentication failed")]
    Authentication,

    /// Cipher construction or sealing failed
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Password rejected by the strength policy
    #[error("weak password: {0}")]
    WeakPassword(String),

    /// Base64 decode error
    #[error("base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    /// Hex decode error
    #[error("hex decode error: {0}")]
    HexDecode(#[from] hex::FromHexError),
}
