//! AES-256-GCM encryption for OAuth state and token ciphertext.
//!
//! Produces the `iv:tag:ciphertext` wire format (each part hex-encoded) used
//! both for the OAuth `state` parameter and for tokens at rest. The master
//! keys must be 32 bytes (256 bits) and are provided from environment
//! variables, one key for state and a distinct key for stored tokens.

use aes_gcm::{
    aead::{consts::U16, Aead, KeyInit},
    aes::Aes256,
    AesGcm, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::{rngs::OsRng, RngCore};

/// AES-256-GCM parameterized with a 16-byte nonce to match the wire format.
type Aes256Gcm16 = AesGcm<Aes256, U16>;

/// Size of the encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the IV in bytes (the wire format fixes this at 16)
const IV_SIZE: usize = 16;

/// Size of the GCM authentication tag in bytes
const TAG_SIZE: usize = 16;

/// Validates that a master key is exactly 32 bytes when base64 decoded.
///
/// # Arguments
/// * `key_base64` - Base64-encoded master key
///
/// # Returns
/// * `Ok(Vec<u8>)` - Decoded key bytes (32 bytes)
/// * `Err` - If key is invalid length or invalid base64
pub fn validate_key(key_base64: &str) -> Result<Vec<u8>> {
    let key_bytes = BASE64
        .decode(key_base64)
        .context("Failed to decode base64 encryption key")?;

    if key_bytes.len() != KEY_SIZE {
        return Err(anyhow!(
            "Encryption key must be {} bytes (256 bits), got {} bytes",
            KEY_SIZE,
            key_bytes.len()
        ));
    }

    Ok(key_bytes)
}

/// Encrypts plaintext using AES-256-GCM with a random 16-byte IV.
///
/// # Arguments
/// * `plaintext` - Data to encrypt (state payload or token)
/// * `key` - 32-byte encryption key
///
/// # Returns
/// * `Ok(String)` - `hex(iv):hex(tag):hex(ciphertext)`
/// * `Err` - If the system entropy source or encryption fails
///
/// # Security
/// - IV is drawn from the OS entropy source per call (never reused)
/// - Entropy failure is an error, never a fallback to weak randomness
/// - Authenticated encryption (tampering detected on decrypt)
pub fn encrypt(plaintext: &str, key: &[u8]) -> Result<String> {
    if key.len() != KEY_SIZE {
        return Err(anyhow!("Encryption key must be {} bytes", KEY_SIZE));
    }

    let cipher = Aes256Gcm16::new_from_slice(key)
        .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;

    let mut iv = [0u8; IV_SIZE];
    OsRng
        .try_fill_bytes(&mut iv)
        .map_err(|e| anyhow!("System entropy source failed: {}", e))?;

    // Aead::encrypt returns ciphertext || tag; the wire format keeps them separate
    let mut sealed = cipher
        .encrypt(Nonce::<U16>::from_slice(&iv), plaintext.as_bytes())
        .map_err(|e| anyhow!("Encryption failed: {}", e))?;

    let tag = sealed.split_off(sealed.len() - TAG_SIZE);
    let ciphertext = sealed;

    Ok(format!(
        "{}:{}:{}",
        hex::encode(iv),
        hex::encode(tag),
        hex::encode(ciphertext)
    ))
}

/// Decrypts an `iv:tag:ciphertext` value produced by [`encrypt`].
///
/// # Arguments
/// * `encoded` - Three colon-separated hex parts
/// * `key` - 32-byte encryption key (must match the one used during encryption)
///
/// # Returns
/// * `Ok(String)` - Decrypted plaintext
/// * `Err` - If the format is malformed, the IV/tag lengths are wrong, or
///   authentication fails (wrong key, tampered or truncated data). Failure
///   never yields partial plaintext.
pub fn decrypt(encoded: &str, key: &[u8]) -> Result<String> {
    if key.len() != KEY_SIZE {
        return Err(anyhow!("Encryption key must be {} bytes", KEY_SIZE));
    }

    let parts: Vec<&str> = encoded.split(':').collect();
    if parts.len() != 3 {
        return Err(anyhow!(
            "Invalid encrypted payload: expected 3 parts, got {}",
            parts.len()
        ));
    }

    let iv = hex::decode(parts[0]).context("Failed to decode IV")?;
    let tag = hex::decode(parts[1]).context("Failed to decode auth tag")?;
    let ciphertext = hex::decode(parts[2]).context("Failed to decode ciphertext")?;

    if iv.len() != IV_SIZE {
        return Err(anyhow!(
            "Invalid IV size: expected {}, got {}",
            IV_SIZE,
            iv.len()
        ));
    }
    if tag.len() != TAG_SIZE {
        return Err(anyhow!(
            "Invalid auth tag size: expected {}, got {}",
            TAG_SIZE,
            tag.len()
        ));
    }

    let cipher = Aes256Gcm16::new_from_slice(key)
        .map_err(|e| anyhow!("Failed to create cipher: {}", e))?;

    // Reassemble ciphertext || tag for the AEAD API
    let mut sealed = ciphertext;
    sealed.extend_from_slice(&tag);

    let plaintext_bytes = cipher
        .decrypt(Nonce::<U16>::from_slice(&iv), sealed.as_ref())
        .map_err(|_| anyhow!("Decryption failed: authentication error (wrong key or tampered data)"))?;

    String::from_utf8(plaintext_bytes).context("Decrypted data is not valid UTF-8")
}
