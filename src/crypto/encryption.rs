//! AES-256-GCM encryption for stored connection secrets.
//!
//! Each value is encrypted with its own random nonce. The nonce is prepended
//! to the ciphertext and the pair is stored as a single base64 string, so one
//! column holds everything needed to decrypt.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

/// Size of the encryption key in bytes (256 bits)
const KEY_SIZE: usize = 32;

/// Size of the nonce in bytes (96 bits, standard for GCM)
const NONCE_SIZE: usize = 12;

/// Validates that the master key is exactly 32 bytes when base64 decoded.
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

/// Encrypts plaintext, returning base64(`nonce || ciphertext`).
pub fn encrypt(plaintext: &str, key: &[u8]) -> Result<String> {
    let cipher = cipher(key)?;

    // Never reuse a nonce under the same key
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|e| anyhow!("Encryption failed: {}", e))?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);

    Ok(BASE64.encode(sealed))
}

/// Decrypts a value produced by [`encrypt`].
///
/// Fails on a wrong key, corrupted data or tampering.
pub fn decrypt(sealed: &str, key: &[u8]) -> Result<String> {
    let cipher = cipher(key)?;

    let sealed = BASE64
        .decode(sealed)
        .context("Failed to decode encrypted value")?;

    if sealed.len() <= NONCE_SIZE {
        return Err(anyhow!(
            "Encrypted value too short: expected more than {} bytes, got {}",
            NONCE_SIZE,
            sealed.len()
        ));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);

    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| anyhow!("Decryption failed (wrong key or corrupted data): {}", e))?;

    String::from_utf8(plaintext).context("Decrypted data is not valid UTF-8")
}

fn cipher(key: &[u8]) -> Result<Aes256Gcm> {
    if key.len() != KEY_SIZE {
        return Err(anyhow!("Encryption key must be {} bytes", KEY_SIZE));
    }
    Aes256Gcm::new_from_slice(key).map_err(|e| anyhow!("Failed to create cipher: {}", e))
}
