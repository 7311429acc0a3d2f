//! Key material for the Keyward key hierarchy
//!
//! - Content keys: random symmetric keys for encrypting one file's bytes
//! - Envelope keys: random symmetric keys that wrap content keys
//! - Password-derived keys: PBKDF2-HMAC-SHA256 outputs that wrap envelope keys

use crate::{CryptoError, Result};
use base64::Engine;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of a symmetric key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// Size of an AES-GCM IV in bytes (96 bits)
pub const IV_SIZE: usize = 12;

/// Size of an XSalsa20-Poly1305 nonce in bytes (192 bits)
pub const NONCE_SIZE: usize = 24;

/// Default PBKDF2 salt length in bytes
pub const SALT_SIZE: usize = 16;

/// Default PBKDF2-HMAC-SHA256 iteration count
pub const PBKDF2_ITERATIONS: u32 = 100_000;

/// Fill a fresh buffer with `n` bytes from the OS RNG
pub fn generate_random_bytes(n: usize) -> Result<Vec<u8>> {
    let mut bytes = vec![0u8; n];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| CryptoError::Rng(e.to_string()))?;
    Ok(bytes)
}

fn random_array<const N: usize>() -> Result<[u8; N]> {
    let mut bytes = [0u8; N];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| CryptoError::Rng(e.to_string()))?;
    Ok(bytes)
}

/// Generate a PBKDF2 salt of the given length
pub fn generate_salt(len: usize) -> Result<Vec<u8>> {
    generate_random_bytes(len)
}

/// Generate a 12-byte AES-GCM IV
pub fn generate_iv() -> Result<[u8; IV_SIZE]> {
    random_array()
}

/// Generate a 24-byte secretbox nonce
pub fn generate_nonce() -> Result<[u8; NONCE_SIZE]> {
    random_array()
}

/// Derive `out_len` bytes from a password with PBKDF2-HMAC-SHA256
pub fn derive_key(password: &str, salt: &[u8], iterations: u32, out_len: usize) -> Vec<u8> {
    let mut out = vec![0u8; out_len];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut out);
    out
}

/// Encode bytes as lowercase hex
pub fn encode_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Decode a hex string
pub fn decode_hex(s: &str) -> Result<Vec<u8>> {
    Ok(hex::decode(s)?)
}

/// Encode bytes as standard base64
pub fn encode_base64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Decode a standard base64 string
pub fn decode_base64(s: &str) -> Result<Vec<u8>> {
    Ok(base64::engine::general_purpose::STANDARD.decode(s)?)
}

fn key_from_slice(kind: &str, bytes: &[u8]) -> Result<[u8; KEY_SIZE]> {
    if bytes.len() != KEY_SIZE {
        return Err(CryptoError::InvalidKey(format!(
            "{} must be {} bytes, got {}",
            kind,
            KEY_SIZE,
            bytes.len()
        )));
    }
    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(bytes);
    Ok(key)
}

macro_rules! symmetric_key {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, Zeroize, ZeroizeOnDrop)]
        pub struct $name {
            key: [u8; KEY_SIZE],
        }

        impl $name {
            /// Generate a new random key
            pub fn generate() -> Result<Self> {
                Ok(Self { key: random_array()? })
            }

            /// Create a key from raw bytes
            pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
                Ok(Self { key: key_from_slice($label, bytes)? })
            }

            /// Get the key bytes
            pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
                &self.key
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("key", &"[REDACTED]")
                    .finish()
            }
        }
    };
}

symmetric_key!(
    /// The key that directly encrypts one file's bytes
    ContentKey,
    "content key"
);

symmetric_key!(
    /// A key that wraps content keys; one current per user, or one per share
    EnvelopeKey,
    "envelope key"
);

/// A 256-bit key derived from a password, used only to wrap envelope keys
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct PasswordKey {
    key: [u8; KEY_SIZE],
}

impl PasswordKey {
    /// Derive from a password and salt
    pub fn derive(password: &str, salt: &[u8], iterations: u32) -> Result<Self> {
        let mut derived = derive_key(password, salt, iterations, KEY_SIZE);
        let key = key_from_slice("password key", &derived);
        derived.zeroize();
        Ok(Self { key: key? })
    }

    /// Get the key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }
}

/// PBKDF2 parameters applied when wrapping under a password
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KdfParams {
    /// PBKDF2 iteration count
    pub iterations: u32,
    /// Salt length in bytes
    pub salt_len: usize,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            iterations: PBKDF2_ITERATIONS,
            salt_len: SALT_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes_length_and_uniqueness() {
        let a = generate_random_bytes(32).unwrap();
        let b = generate_random_bytes(32).unwrap();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
        assert!(generate_random_bytes(0).unwrap().is_empty());
    }

    #[test]
    fn test_key_generation() {
        let k1 = ContentKey::generate().unwrap();
        let k2 = ContentKey::generate().unwrap();
        assert_ne!(k1.as_bytes(), k2.as_bytes());
    }

    #[test]
    fn test_key_from_bytes_rejects_wrong_length() {
        assert!(EnvelopeKey::from_bytes(&[0u8; 31]).is_err());
        assert!(EnvelopeKey::from_bytes(&[0u8; 33]).is_err());
        assert!(EnvelopeKey::from_bytes(&[7u8; 32]).is_ok());
    }

    #[test]
    fn test_debug_redacts_key() {
        let key = EnvelopeKey::from_bytes(&[0xAB; 32]).unwrap();
        let rendered = format!("{:?}", key);
        assert!(rendered.contains("REDACTED"));
        assert!(!rendered.contains("ab"));
    }

    #[test]
    fn test_pbkdf2_rfc_vector() {
        // RFC 7914 section 11, PBKDF2-HMAC-SHA256 with 1 iteration
        let out = derive_key("passwd", b"salt", 1, 64);
        assert_eq!(
            encode_hex(&out),
            "55ac046e56e3089fec1691c22544b605f94185216dde0465e68b9d57c20dacbc\
             49ca9cccf179b645991664b39d77ef317c71b845b1e30bd509112041d3a19783"
        );
    }

    #[test]
    fn test_derive_key_deterministic() {
        let salt = [1u8; 16];
        let a = derive_key("Str0ng!Pass", &salt, 1_000, 32);
        let b = derive_key("Str0ng!Pass", &salt, 1_000, 32);
        let c = derive_key("Str0ng!Pass", &[2u8; 16], 1_000, 32);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_codecs() {
        let bytes = [0u8, 1, 2, 254, 255];
        assert_eq!(encode_hex(&bytes), "000102feff");
        assert_eq!(decode_hex("000102feff").unwrap(), bytes);
        assert!(decode_hex("zz").is_err());
        assert_eq!(decode_base64(&encode_base64(&bytes)).unwrap(), bytes);
        assert!(decode_base64("***").is_err());
    }
}
