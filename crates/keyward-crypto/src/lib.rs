//! # Keyward Crypto
//!
//! Cryptographic primitives for the Keyward key hierarchy.
//!
//! This crate provides:
//! - **Key material**: OS-RNG keys, salts, IVs and nonces; PBKDF2-HMAC-SHA256
//!   password key derivation; hex/base64 codecs
//! - **AES-256-GCM**: wrapping of content keys and envelope keys
//! - **XSalsa20-Poly1305**: NaCl secretbox for file content, compatible with
//!   TweetNaCl in the browser
//! - **Key hierarchy**: content key → envelope key → password-derived key
//! - **Versioned keyrings**: re-wrapping content keys across envelope rotations
//!
//! ## Example
//!
//! ```rust
//! use keyward_crypto::{ContentKey, EnvelopeKey, KdfParams, hierarchy};
//!
//! # fn main() -> keyward_crypto::Result<()> {
//! let params = KdfParams { iterations: 1_000, ..KdfParams::default() };
//! let envelope = EnvelopeKey::generate()?;
//! let content = ContentKey::generate()?;
//!
//! let wrapped_content = hierarchy::wrap_content_key(&content, &envelope)?;
//! let wrapped_envelope = hierarchy::wrap_envelope_key(&envelope, "Str0ng!Pass", &params)?;
//!
//! let envelope = hierarchy::unwrap_envelope_key(&wrapped_envelope, "Str0ng!Pass", &params)?;
//! let recovered = hierarchy::unwrap_content_key(&wrapped_content, &envelope)?;
//! assert_eq!(recovered.as_bytes(), content.as_bytes());
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod hierarchy;
pub mod keys;
pub mod password;
pub mod rotation;
pub mod symmetric;

pub use error::{CryptoError, Result};
pub use hierarchy::{EnvelopeWrappedKey, PasswordWrappedKey};
pub use keys::{ContentKey, EnvelopeKey, KdfParams, PasswordKey};
pub use password::PasswordPolicy;
pub use rotation::EnvelopeKeyring;
pub use symmetric::AeadCipher;

/// Length in bytes of share tokens and rotation ids before hex encoding
pub const TOKEN_BYTES: usize = 32;

/// Generate a 32-byte random identifier, hex-encoded (64 characters)
pub fn generate_token() -> Result<String> {
    Ok(keys::encode_hex(&keys::generate_random_bytes(TOKEN_BYTES)?))
}

/// Check that `token` looks like the output of [`generate_token`]
pub fn is_well_formed_token(token: &str) -> bool {
    token.len() == TOKEN_BYTES * 2 && token.bytes().all(|b| b.is_ascii_hexdigit())
}
