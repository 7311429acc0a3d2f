//! Symmetric encryption using AES-256-GCM and XSalsa20-Poly1305
//!
//! AES-256-GCM wraps keys (content keys under envelope keys, envelope keys
//! under password-derived keys). XSalsa20-Poly1305 ("secretbox") encrypts
//! bulk file content and matches the browser client's TweetNaCl framing.

use crate::{
    CryptoError, Result,
    keys::{generate_nonce, IV_SIZE, KEY_SIZE, NONCE_SIZE},
};
use aes_gcm::{
    Aes256Gcm, KeyInit,
    aead::{Aead as AeadTrait, generic_array::GenericArray},
};
use crypto_secretbox::XSalsa20Poly1305;

/// Supported AEAD ciphers
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AeadCipher {
    /// AES-256-GCM, 12-byte IV
    Aes256Gcm,
    /// XSalsa20-Poly1305 secretbox, 24-byte nonce
    XSalsa20Poly1305,
}

impl AeadCipher {
    /// Get the algorithm identifier string
    pub fn algorithm_id(&self) -> &'static str {
        match self {
            Self::Aes256Gcm => "aes-gcm",
            Self::XSalsa20Poly1305 => "nacl-secretbox",
        }
    }

    /// Required nonce length in bytes
    pub fn nonce_size(&self) -> usize {
        match self {
            Self::Aes256Gcm => IV_SIZE,
            Self::XSalsa20Poly1305 => NONCE_SIZE,
        }
    }

    /// Get the authentication tag size
    pub fn tag_size(&self) -> usize {
        16 // Both use 128-bit tags
    }
}

fn check_lengths(cipher: AeadCipher, key: &[u8], nonce: &[u8]) -> Result<()> {
    if key.len() != KEY_SIZE {
        return Err(CryptoError::InvalidKey(format!(
            "{} key must be {} bytes, got {}",
            cipher.algorithm_id(),
            KEY_SIZE,
            key.len()
        )));
    }
    if nonce.len() != cipher.nonce_size() {
        return Err(CryptoError::InvalidNonce(format!(
            "{} nonce must be {} bytes, got {}",
            cipher.algorithm_id(),
            cipher.nonce_size(),
            nonce.len()
        )));
    }
    Ok(())
}

/// Encrypt with AES-256-GCM, returning ciphertext with the 16-byte tag appended
pub fn aead_encrypt(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    check_lengths(AeadCipher::Aes256Gcm, key, iv)?;
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;
    cipher
        .encrypt(GenericArray::from_slice(iv), plaintext)
        .map_err(|e| CryptoError::Encryption(e.to_string()))
}

/// Decrypt AES-256-GCM ciphertext; any tag mismatch is `Authentication`
pub fn aead_decrypt(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    check_lengths(AeadCipher::Aes256Gcm, key, iv)?;
    let cipher = Aes256Gcm::new_from_slice(key)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;
    cipher
        .decrypt(GenericArray::from_slice(iv), ciphertext)
        .map_err(|_| CryptoError::Authentication)
}

/// Seal data with XSalsa20-Poly1305 (NaCl `secretbox`)
pub fn secretbox_seal(key: &[u8], nonce: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    check_lengths(AeadCipher::XSalsa20Poly1305, key, nonce)?;
    let cipher = XSalsa20Poly1305::new_from_slice(key)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;
    cipher
        .encrypt(GenericArray::from_slice(nonce), data)
        .map_err(|e| CryptoError::Encryption(e.to_string()))
}

/// Open a secretbox; any tag mismatch is `Authentication`
pub fn secretbox_open(key: &[u8], nonce: &[u8], boxed: &[u8]) -> Result<Vec<u8>> {
    check_lengths(AeadCipher::XSalsa20Poly1305, key, nonce)?;
    let cipher = XSalsa20Poly1305::new_from_slice(key)
        .map_err(|e| CryptoError::Encryption(e.to_string()))?;
    cipher
        .decrypt(GenericArray::from_slice(nonce), boxed)
        .map_err(|_| CryptoError::Authentication)
}

/// Encrypt file content under a fresh nonce, returning `nonce || box`
pub fn seal_file(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let nonce = generate_nonce()?;
    let boxed = secretbox_seal(key, &nonce, data)?;
    let mut framed = Vec::with_capacity(NONCE_SIZE + boxed.len());
    framed.extend_from_slice(&nonce);
    framed.extend_from_slice(&boxed);
    Ok(framed)
}

/// Decrypt `nonce || box` framed file content
pub fn open_file(key: &[u8], framed: &[u8]) -> Result<Vec<u8>> {
    if framed.len() < NONCE_SIZE {
        return Err(CryptoError::InvalidNonce(format!(
            "encrypted data too short: expected at least {} bytes, got {}",
            NONCE_SIZE,
            framed.len()
        )));
    }
    let (nonce, boxed) = framed.split_at(NONCE_SIZE);
    secretbox_open(key, nonce, boxed)
}
