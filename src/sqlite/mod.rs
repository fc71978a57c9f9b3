//! SQLite-backed connection storage.
//!
//! One table row per connection; access tokens, secrets and refresh tokens are
//! encrypted at rest through a [`TextEncryptor`].
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │   SqliteUsersConnectionRepository        │
//! │  - reverse lookups, sign-up              │
//! └─────────────────────────────────────────┘
//!          ↓ (one handle per user)
//! ┌─────────────────────────────────────────┐
//! │   SqliteConnectionRepository             │
//! │  - materializes rows via factories       │
//! └─────────────────────────────────────────┘
//!          ↓
//! ┌─────────────────────────────────────────┐
//! │   {prefix}UserConnection table           │
//! │  - transparent encryption/decryption     │
//! │  - transactional rank assignment         │
//! └─────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use social_connect::config::StoreConfig;
//! use social_connect::connection::ConnectionFactoryRegistry;
//! use social_connect::repository::UsersConnectionRepository;
//! use social_connect::sqlite::SqliteUsersConnectionRepository;
//! use std::sync::Arc;
//!
//! # fn main() -> social_connect::Result<()> {
//! let registry = Arc::new(ConnectionFactoryRegistry::new());
//! let users = SqliteUsersConnectionRepository::open(&StoreConfig::from_env(), registry)?;
//!
//! let connections = users.create_connection_repository("1")?;
//! let all = connections.find_all_connections()?;
//! # Ok(())
//! # }
//! ```

mod connections;
mod table;

pub use connections::SqliteConnectionRepository;

use crate::config::StoreConfig;
use crate::connection::{Connection, ConnectionFactoryLocator, ConnectionSignUp};
use crate::crypto::TextEncryptor;
use crate::error::Result;
use crate::repository::{
    sign_up_user, validate_user_id, ConnectionRepository, UsersConnectionRepository,
};
use rusqlite::Connection as SqliteConnection;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use table::ConnectionTable;
use tracing::{debug, info};

/// SQLite [`UsersConnectionRepository`].
pub struct SqliteUsersConnectionRepository {
    table: Arc<ConnectionTable>,
    locator: Arc<dyn ConnectionFactoryLocator>,
    sign_up: Option<Arc<dyn ConnectionSignUp>>,
}

impl SqliteUsersConnectionRepository {
    /// Creates or opens a store using the default `UserConnection` table.
    pub fn new<P: AsRef<Path>>(
        db_path: P,
        locator: Arc<dyn ConnectionFactoryLocator>,
        encryptor: Arc<dyn TextEncryptor>,
    ) -> Result<Self> {
        Self::with_table_prefix(db_path, "", locator, encryptor)
    }

    /// Creates or opens a store whose table is named `{table_prefix}UserConnection`.
    ///
    /// The prefix may only contain ASCII letters, digits and `_`.
    pub fn with_table_prefix<P: AsRef<Path>>(
        db_path: P,
        table_prefix: &str,
        locator: Arc<dyn ConnectionFactoryLocator>,
        encryptor: Arc<dyn TextEncryptor>,
    ) -> Result<Self> {
        let db_path = db_path.as_ref();
        let conn = SqliteConnection::open(db_path)?;
        let table = ConnectionTable::open(conn, table_prefix, encryptor)?;
        info!(db_path = %db_path.display(), table = %table.name(), "Connection store opened");

        Ok(Self {
            table: Arc::new(table),
            locator,
            sign_up: None,
        })
    }

    /// Opens the store described by `config`, encrypting secrets when a key is configured.
    pub fn open(config: &StoreConfig, locator: Arc<dyn ConnectionFactoryLocator>) -> Result<Self> {
        let encryptor = config.encryption.encryptor()?;
        Self::with_table_prefix(
            &config.database.path,
            &config.database.table_prefix,
            locator,
            encryptor,
        )
    }

    /// Sets the policy used to provision a local user for an unlinked
    /// connection. Without one, provider sign-in needs an explicit sign-up.
    pub fn with_connection_sign_up(mut self, sign_up: Arc<dyn ConnectionSignUp>) -> Self {
        self.sign_up = Some(sign_up);
        self
    }

    pub fn set_connection_sign_up(&mut self, sign_up: Arc<dyn ConnectionSignUp>) {
        self.sign_up = Some(sign_up);
    }

    pub fn table_name(&self) -> &str {
        self.table.name()
    }

    /// Returns the user's concrete repository.
    pub fn repository(&self, user_id: &str) -> Result<SqliteConnectionRepository> {
        validate_user_id(user_id)?;
        Ok(SqliteConnectionRepository::new(
            user_id,
            Arc::clone(&self.table),
            Arc::clone(&self.locator),
        ))
    }
}

impl UsersConnectionRepository for SqliteUsersConnectionRepository {
    fn find_user_ids_with_connection(&self, connection: &dyn Connection) -> Result<Vec<String>> {
        let key = connection.key();
        let user_ids = self.table.user_ids_with(&key)?;

        debug!(connection = %key, matches = user_ids.len(), "Resolved users for connection");

        if user_ids.is_empty() {
            return sign_up_user(self, self.sign_up.as_deref(), connection);
        }
        Ok(user_ids)
    }

    fn find_user_ids_connected_to(
        &self,
        provider_id: &str,
        provider_user_ids: &HashSet<String>,
    ) -> Result<HashSet<String>> {
        self.table.user_ids_connected_to(provider_id, provider_user_ids)
    }

    fn create_connection_repository(&self, user_id: &str) -> Result<Arc<dyn ConnectionRepository>> {
        Ok(Arc::new(self.repository(user_id)?))
    }
}
