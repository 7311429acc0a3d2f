//! Two-layer envelope key hierarchy
//!
//! ```text
//! password ──PBKDF2──▶ PasswordKey ──AES-GCM──▶ EnvelopeKey ──AES-GCM──▶ ContentKey
//! ```
//!
//! A password change re-wraps only the outer layer; content keys and file
//! bytes are never touched.

use crate::{
    CryptoError, Result,
    keys::{
        decode_hex, encode_hex, generate_iv, generate_salt, ContentKey, EnvelopeKey, KdfParams,
        PasswordKey,
    },
    symmetric::{aead_decrypt, aead_encrypt},
};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// An envelope key wrapped under a password-derived key
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordWrappedKey {
    pub ciphertext_hex: String,
    pub salt_hex: String,
    pub iv_hex: String,
}

/// A content key wrapped directly under an envelope key
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeWrappedKey {
    pub ciphertext_hex: String,
    pub iv_hex: String,
}

/// Wrap an envelope key under a password with a fresh salt and IV
pub fn wrap_envelope_key(
    envelope_key: &EnvelopeKey,
    password: &str,
    params: &KdfParams,
) -> Result<PasswordWrappedKey> {
    let salt = generate_salt(params.salt_len)?;
    let iv = generate_iv()?;
    let derived = PasswordKey::derive(password, &salt, params.iterations)?;
    let ciphertext = aead_encrypt(derived.as_bytes(), &iv, envelope_key.as_bytes())?;

    Ok(PasswordWrappedKey {
        ciphertext_hex: encode_hex(&ciphertext),
        salt_hex: encode_hex(&salt),
        iv_hex: encode_hex(&iv),
    })
}

/// Unwrap an envelope key with a password
///
/// Wrong passwords, corrupted ciphertext and malformed stored fields all
/// surface as [`CryptoError::Authentication`].
pub fn unwrap_envelope_key(
    wrapped: &PasswordWrappedKey,
    password: &str,
    params: &KdfParams,
) -> Result<EnvelopeKey> {
    let salt = decode_hex(&wrapped.salt_hex).map_err(|_| CryptoError::Authentication)?;
    let iv = decode_hex(&wrapped.iv_hex).map_err(|_| CryptoError::Authentication)?;
    let ciphertext =
        decode_hex(&wrapped.ciphertext_hex).map_err(|_| CryptoError::Authentication)?;

    let derived = PasswordKey::derive(password, &salt, params.iterations)?;
    let plaintext = Zeroizing::new(
        aead_decrypt(derived.as_bytes(), &iv, &ciphertext).map_err(|_| CryptoError::Authentication)?,
    );
    EnvelopeKey::from_bytes(&plaintext).map_err(|_| CryptoError::Authentication)
}

/// Re-wrap an envelope key under a new password, leaving the key itself unchanged
pub fn rewrap_envelope_key(
    wrapped: &PasswordWrappedKey,
    old_password: &str,
    new_password: &str,
    params: &KdfParams,
) -> Result<PasswordWrappedKey> {
    let envelope_key = unwrap_envelope_key(wrapped, old_password, params)?;
    wrap_envelope_key(&envelope_key, new_password, params)
}

/// Wrap a content key directly under an envelope key
pub fn wrap_content_key(
    content_key: &ContentKey,
    envelope_key: &EnvelopeKey,
) -> Result<EnvelopeWrappedKey> {
    let iv = generate_iv()?;
    let ciphertext = aead_encrypt(envelope_key.as_bytes(), &iv, content_key.as_bytes())?;

    Ok(EnvelopeWrappedKey {
        ciphertext_hex: encode_hex(&ciphertext),
        iv_hex: encode_hex(&iv),
    })
}

/// Unwrap a content key with its envelope key
pub fn unwrap_content_key(
    wrapped: &EnvelopeWrappedKey,
    envelope_key: &EnvelopeKey,
) -> Result<ContentKey> {
    let iv = decode_hex(&wrapped.iv_hex).map_err(|_| CryptoError::Authentication)?;
    let ciphertext =
        decode_hex(&wrapped.ciphertext_hex).map_err(|_| CryptoError::Authentication)?;

    let plaintext = Zeroizing::new(aead_decrypt(envelope_key.as_bytes(), &iv, &ciphertext)?);
    ContentKey::from_bytes(&plaintext).map_err(|_| CryptoError::Authentication)
}

/// Move a wrapped content key from one envelope key to another under a fresh IV
pub fn rewrap_content_key(
    wrapped: &EnvelopeWrappedKey,
    old_envelope: &EnvelopeKey,
    new_envelope: &EnvelopeKey,
) -> Result<EnvelopeWrappedKey> {
    let content_key = unwrap_content_key(wrapped, old_envelope)?;
    wrap_content_key(&content_key, new_envelope)
}
