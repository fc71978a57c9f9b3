//! Reversible encryption of connection secrets at rest.
//!
//! The SQLite backend passes `access_token`, `secret` and `refresh_token`
//! through a [`TextEncryptor`] before writing and after reading.
//!
//! # Security
//!
//! - [`AesGcmTextEncryptor`] uses AES-256-GCM with a unique nonce per value
//! - Master key must be 32 bytes (256 bits), base64-encoded
//! - Authenticated encryption (tampering detected)
//! - [`NoOpTextEncryptor`] stores plaintext and is meant for tests and local tooling

use crate::error::{ConnectError, Result};

mod encryption;

pub use encryption::validate_key;

/// Encrypts and decrypts text values.
pub trait TextEncryptor: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String>;

    fn decrypt(&self, encrypted: &str) -> Result<String>;
}

/// Stores values as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpTextEncryptor;

impl TextEncryptor for NoOpTextEncryptor {
    fn encrypt(&self, plaintext: &str) -> Result<String> {
        Ok(plaintext.to_string())
    }

    fn decrypt(&self, encrypted: &str) -> Result<String> {
        Ok(encrypted.to_string())
    }
}

/// AES-256-GCM [`TextEncryptor`].
pub struct AesGcmTextEncryptor {
    key: Vec<u8>,
}

impl AesGcmTextEncryptor {
    /// Creates an encryptor from a base64-encoded 32-byte master key.
    pub fn new(key_base64: &str) -> Result<Self> {
        let key = encryption::validate_key(key_base64)
            .map_err(|e| ConnectError::Encryption(format!("{:#}", e)))?;
        Ok(Self { key })
    }
}

impl TextEncryptor for AesGcmTextEncryptor {
    fn encrypt(&self, plaintext: &str) -> Result<String> {
        encryption::encrypt(plaintext, &self.key)
            .map_err(|e| ConnectError::Encryption(format!("{:#}", e)))
    }

    fn decrypt(&self, encrypted: &str) -> Result<String> {
        encryption::decrypt(encrypted, &self.key)
            .map_err(|e| ConnectError::Encryption(format!("{:#}", e)))
    }
}
