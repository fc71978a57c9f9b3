use crate::crypto::{AesGcmTextEncryptor, NoOpTextEncryptor, TextEncryptor};
use crate::error::{ConnectError, Result};
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;

/// Complete store configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
}

/// SQLite database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite file (":memory:" for a private in-memory database)
    #[serde(default = "default_database_path")]
    pub path: String,
    /// Prepended to the `UserConnection` table name
    #[serde(default)]
    pub table_prefix: String,
}

fn default_database_path() -> String {
    "connections.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            table_prefix: String::new(),
        }
    }
}

/// Encryption of stored secrets
#[derive(Debug, Clone, Deserialize)]
pub struct EncryptionConfig {
    /// Environment variable holding the base64-encoded 32-byte master key.
    /// The key itself never lives in the config file.
    #[serde(default = "default_key_env")]
    pub key_env: String,
}

fn default_key_env() -> String {
    "SOCIAL_CONNECT_ENCRYPTION_KEY".to_string()
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            key_env: default_key_env(),
        }
    }
}

impl EncryptionConfig {
    /// AES-GCM encryptor when the key variable is set, plaintext storage otherwise.
    pub fn encryptor(&self) -> Result<Arc<dyn TextEncryptor>> {
        match std::env::var(&self.key_env) {
            Ok(key) => Ok(Arc::new(AesGcmTextEncryptor::new(&key)?)),
            Err(_) => {
                warn!(
                    key_env = %self.key_env,
                    "No encryption key configured, connection secrets will be stored in plaintext"
                );
                Ok(Arc::new(NoOpTextEncryptor))
            }
        }
    }
}

impl StoreConfig {
    /// Build from env vars, falling back to defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("SOCIAL_CONNECT_DB_PATH") {
            cfg.database.path = v;
        }
        if let Ok(v) = std::env::var("SOCIAL_CONNECT_TABLE_PREFIX") {
            cfg.database.table_prefix = v;
        }

        cfg
    }
}

/// Load configuration from TOML file
pub fn load_config(path: &str) -> Result<StoreConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| ConnectError::Config(format!("failed to read {}: {}", path, e)))?;
    toml::from_str(&contents)
        .map_err(|e| ConnectError::Config(format!("failed to parse {}: {}", path, e)))
}
