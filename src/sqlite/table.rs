//! The `UserConnection` table: one row per stored connection.
//!
//! Tokens and secrets are encrypted on the way in and decrypted on the way
//! out; nothing above this module sees ciphertext.

use crate::connection::{ConnectionData, ConnectionKey};
use crate::crypto::TextEncryptor;
use crate::error::{ConnectError, Result};
use crate::repository::validate_rank;
use chrono::{TimeZone, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Params, Row};
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

/// Upper bound on ids bound into one `IN (...)` list; SQLite caps the
/// number of parameters per statement.
const MAX_IDS_PER_QUERY: usize = 500;

/// Columns read back into [`ConnectionData`], in `read_row` order.
const COLUMNS: &str = "providerId, providerUserId, displayName, profileUrl, imageUrl, \
                       accessToken, secret, refreshToken, expireTime";

/// Encrypted connection rows backed by SQLite.
///
/// # Schema
/// ```sql
/// CREATE TABLE {prefix}UserConnection (
///     userId TEXT NOT NULL,
///     providerId TEXT NOT NULL,
///     providerUserId TEXT NOT NULL,
///     rank INTEGER NOT NULL,
///     displayName TEXT,
///     profileUrl TEXT,
///     imageUrl TEXT,
///     accessToken TEXT NOT NULL,   -- Encrypted
///     secret TEXT,                 -- Encrypted (optional)
///     refreshToken TEXT,           -- Encrypted (optional)
///     expireTime INTEGER,          -- Epoch milliseconds (optional)
///     PRIMARY KEY (userId, providerId, providerUserId)
/// );
/// CREATE UNIQUE INDEX {prefix}UserConnectionRank ON {prefix}UserConnection(userId, providerId, rank);
/// ```
///
/// `expireTime` keeps millisecond precision: sub-millisecond parts of
/// [`ConnectionData::expire_time`] are truncated on write.
///
/// # Thread Safety
/// The connection is wrapped in a Mutex; compound writes also run in a
/// transaction while the lock is held.
pub(crate) struct ConnectionTable {
    conn: Mutex<Connection>,
    name: String,
    encryptor: Arc<dyn TextEncryptor>,
}

impl ConnectionTable {
    /// Wraps an open database, creating the table and rank index if missing.
    pub fn open(
        conn: Connection,
        table_prefix: &str,
        encryptor: Arc<dyn TextEncryptor>,
    ) -> Result<Self> {
        if !table_prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(ConnectError::invalid(format!(
                "table prefix '{}' may only contain ASCII letters, digits and '_'",
                table_prefix
            )));
        }
        let name = format!("{}UserConnection", table_prefix);

        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {name} (
                userId         TEXT NOT NULL,
                providerId     TEXT NOT NULL,
                providerUserId TEXT NOT NULL,
                rank           INTEGER NOT NULL,
                displayName    TEXT,
                profileUrl     TEXT,
                imageUrl       TEXT,
                accessToken    TEXT NOT NULL,
                secret         TEXT,
                refreshToken   TEXT,
                expireTime     INTEGER,
                PRIMARY KEY (userId, providerId, providerUserId)
            );
            CREATE UNIQUE INDEX IF NOT EXISTS {name}Rank ON {name}(userId, providerId, rank);",
            name = name
        ))?;
        info!(table = %name, "Connection table ready");

        Ok(Self {
            conn: Mutex::new(conn),
            name,
            encryptor,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A user's rows, ordered by provider then rank.
    pub fn find_all(&self, user_id: &str) -> Result<Vec<ConnectionData>> {
        self.select(
            "userId = ?1 ORDER BY providerId, rank",
            params![user_id],
        )
    }

    /// A user's rows for one provider, ordered by rank.
    pub fn find_by_provider(&self, user_id: &str, provider_id: &str) -> Result<Vec<ConnectionData>> {
        self.select(
            "userId = ?1 AND providerId = ?2 ORDER BY rank",
            params![user_id, provider_id],
        )
    }

    /// Rows matching any of `provider_user_ids`, ordered by rank.
    pub fn find_by_provider_user_ids(
        &self,
        user_id: &str,
        provider_id: &str,
        provider_user_ids: &[String],
    ) -> Result<Vec<ConnectionData>> {
        let unique: BTreeSet<&str> = provider_user_ids.iter().map(String::as_str).collect();
        let unique: Vec<&str> = unique.into_iter().collect();

        let mut ranked = Vec::new();
        for chunk in unique.chunks(MAX_IDS_PER_QUERY) {
            let clause = format!(
                "userId = ?1 AND providerId = ?2 AND providerUserId IN ({})",
                placeholders(3, chunk.len())
            );
            let values = [user_id, provider_id].into_iter().chain(chunk.iter().copied());
            ranked.extend(self.select_ranked(&clause, params_from_iter(values))?);
        }

        ranked.sort_by_key(|(rank, _)| *rank);
        Ok(ranked.into_iter().map(|(_, data)| data).collect())
    }

    pub fn find_by_key(&self, user_id: &str, key: &ConnectionKey) -> Result<Option<ConnectionData>> {
        let mut found = self.select(
            "userId = ?1 AND providerId = ?2 AND providerUserId = ?3",
            params![user_id, key.provider_id, key.provider_user_id],
        )?;
        Ok(found.pop())
    }

    pub fn find_by_rank(
        &self,
        user_id: &str,
        provider_id: &str,
        rank: u32,
    ) -> Result<Option<ConnectionData>> {
        let mut found = self.select(
            "userId = ?1 AND providerId = ?2 AND rank = ?3",
            params![user_id, provider_id, rank],
        )?;
        Ok(found.pop())
    }

    pub fn exists(&self, user_id: &str, key: &ConnectionKey) -> Result<bool> {
        let conn = self.conn();
        let exists: bool = conn.query_row(
            &format!(
                "SELECT EXISTS (SELECT 1 FROM {} WHERE userId = ?1 AND providerId = ?2 AND providerUserId = ?3)",
                self.name
            ),
            params![user_id, key.provider_id, key.provider_user_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    /// Inserts a row at `rank`, or at `max(rank) + 1` for the scope.
    ///
    /// The duplicate check, rank derivation and insert share one transaction.
    /// Returns the rank the row was stored at.
    pub fn insert(&self, user_id: &str, data: &ConnectionData, rank: Option<u32>) -> Result<u32> {
        let access_token = self.encryptor.encrypt(&data.access_token)?;
        let secret = self.encrypt_optional(data.secret.as_deref())?;
        let refresh_token = self.encrypt_optional(data.refresh_token.as_deref())?;

        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let duplicate: bool = tx.query_row(
            &format!(
                "SELECT EXISTS (SELECT 1 FROM {} WHERE userId = ?1 AND providerId = ?2 AND providerUserId = ?3)",
                self.name
            ),
            params![user_id, data.provider_id, data.provider_user_id],
            |row| row.get(0),
        )?;
        if duplicate {
            return Err(ConnectError::DuplicateConnection(data.key()));
        }

        let rank = match rank {
            Some(rank) => {
                validate_rank(rank)?;
                let taken = tx
                    .query_row(
                        &format!(
                            "SELECT 1 FROM {} WHERE userId = ?1 AND providerId = ?2 AND rank = ?3",
                            self.name
                        ),
                        params![user_id, data.provider_id, rank],
                        |_| Ok(()),
                    )
                    .optional()?
                    .is_some();
                if taken {
                    return Err(ConnectError::RankTaken {
                        provider_id: data.provider_id.clone(),
                        rank,
                    });
                }
                rank
            }
            None => tx.query_row(
                &format!(
                    "SELECT COALESCE(MAX(rank), 0) + 1 FROM {} WHERE userId = ?1 AND providerId = ?2",
                    self.name
                ),
                params![user_id, data.provider_id],
                |row| row.get(0),
            )?,
        };

        tx.execute(
            &format!(
                "INSERT INTO {} (userId, providerId, providerUserId, rank, displayName, profileUrl, \
                 imageUrl, accessToken, secret, refreshToken, expireTime) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                self.name
            ),
            params![
                user_id,
                data.provider_id,
                data.provider_user_id,
                rank,
                data.display_name,
                data.profile_url,
                data.image_url,
                access_token,
                secret,
                refresh_token,
                data.expire_time.map(|t| t.timestamp_millis()),
            ],
        )?;
        tx.commit()?;

        debug!(
            user_id = %user_id,
            connection = %data.key(),
            rank = rank,
            "Inserted connection"
        );
        Ok(rank)
    }

    /// Replaces every non-key column of the row with `data`'s key. Rank is untouched.
    ///
    /// Returns false when no row matched.
    pub fn update(&self, user_id: &str, data: &ConnectionData) -> Result<bool> {
        let access_token = self.encryptor.encrypt(&data.access_token)?;
        let secret = self.encrypt_optional(data.secret.as_deref())?;
        let refresh_token = self.encrypt_optional(data.refresh_token.as_deref())?;

        let rows_affected = self.conn().execute(
            &format!(
                "UPDATE {} SET displayName = ?1, profileUrl = ?2, imageUrl = ?3, accessToken = ?4, \
                 secret = ?5, refreshToken = ?6, expireTime = ?7 \
                 WHERE userId = ?8 AND providerId = ?9 AND providerUserId = ?10",
                self.name
            ),
            params![
                data.display_name,
                data.profile_url,
                data.image_url,
                access_token,
                secret,
                refresh_token,
                data.expire_time.map(|t| t.timestamp_millis()),
                user_id,
                data.provider_id,
                data.provider_user_id,
            ],
        )?;

        debug!(
            user_id = %user_id,
            connection = %data.key(),
            rows_affected = rows_affected,
            "Updated connection"
        );
        Ok(rows_affected > 0)
    }

    pub fn delete_provider(&self, user_id: &str, provider_id: &str) -> Result<usize> {
        let rows_affected = self.conn().execute(
            &format!(
                "DELETE FROM {} WHERE userId = ?1 AND providerId = ?2",
                self.name
            ),
            params![user_id, provider_id],
        )?;
        debug!(
            user_id = %user_id,
            provider_id = %provider_id,
            rows_affected = rows_affected,
            "Deleted provider connections"
        );
        Ok(rows_affected)
    }

    pub fn delete(&self, user_id: &str, key: &ConnectionKey) -> Result<bool> {
        let rows_affected = self.conn().execute(
            &format!(
                "DELETE FROM {} WHERE userId = ?1 AND providerId = ?2 AND providerUserId = ?3",
                self.name
            ),
            params![user_id, key.provider_id, key.provider_user_id],
        )?;
        debug!(
            user_id = %user_id,
            connection = %key,
            rows_affected = rows_affected,
            "Deleted connection"
        );
        Ok(rows_affected > 0)
    }

    /// Users holding `key`, ascending.
    pub fn user_ids_with(&self, key: &ConnectionKey) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT userId FROM {} WHERE providerId = ?1 AND providerUserId = ?2 ORDER BY userId",
            self.name
        ))?;
        let user_ids = stmt
            .query_map(params![key.provider_id, key.provider_user_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(user_ids)
    }

    pub fn user_ids_connected_to(
        &self,
        provider_id: &str,
        provider_user_ids: &HashSet<String>,
    ) -> Result<HashSet<String>> {
        let ids: Vec<&str> = provider_user_ids.iter().map(String::as_str).collect();

        let conn = self.conn();
        let mut user_ids = HashSet::new();
        for chunk in ids.chunks(MAX_IDS_PER_QUERY) {
            let mut stmt = conn.prepare(&format!(
                "SELECT DISTINCT userId FROM {} WHERE providerId = ?1 AND providerUserId IN ({})",
                self.name,
                placeholders(2, chunk.len())
            ))?;
            let values = std::iter::once(provider_id).chain(chunk.iter().copied());
            for user_id in stmt.query_map(params_from_iter(values), |row| row.get::<_, String>(0))? {
                user_ids.insert(user_id?);
            }
        }
        Ok(user_ids)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock cannot leave a half-applied
        // transaction behind: uncommitted transactions roll back on drop.
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn select<P: Params>(&self, clause: &str, params: P) -> Result<Vec<ConnectionData>> {
        let rows = {
            let conn = self.conn();
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM {} WHERE {}",
                COLUMNS, self.name, clause
            ))?;
            let rows = stmt
                .query_map(params, read_row)?
                .collect::<rusqlite::Result<Vec<ConnectionData>>>()?;
            rows
        };
        rows.into_iter().map(|data| self.decrypt(data)).collect()
    }

    /// Like `select`, paired with each row's rank.
    fn select_ranked<P: Params>(&self, clause: &str, params: P) -> Result<Vec<(u32, ConnectionData)>> {
        let rows = {
            let conn = self.conn();
            let mut stmt = conn.prepare(&format!(
                "SELECT {}, rank FROM {} WHERE {}",
                COLUMNS, self.name, clause
            ))?;
            let rows = stmt
                .query_map(params, |row| Ok((row.get::<_, u32>(9)?, read_row(row)?)))?
                .collect::<rusqlite::Result<Vec<(u32, ConnectionData)>>>()?;
            rows
        };
        rows.into_iter()
            .map(|(rank, data)| Ok((rank, self.decrypt(data)?)))
            .collect()
    }

    fn decrypt(&self, mut data: ConnectionData) -> Result<ConnectionData> {
        data.access_token = self.encryptor.decrypt(&data.access_token)?;
        data.secret = self.decrypt_optional(data.secret.as_deref())?;
        data.refresh_token = self.decrypt_optional(data.refresh_token.as_deref())?;
        Ok(data)
    }

    fn encrypt_optional(&self, value: Option<&str>) -> Result<Option<String>> {
        value.map(|v| self.encryptor.encrypt(v)).transpose()
    }

    fn decrypt_optional(&self, value: Option<&str>) -> Result<Option<String>> {
        value.map(|v| self.encryptor.decrypt(v)).transpose()
    }
}

/// Reads a row selected with [`COLUMNS`]. Token columns are still encrypted.
fn read_row(row: &Row<'_>) -> rusqlite::Result<ConnectionData> {
    let expire_time: Option<i64> = row.get(8)?;
    Ok(ConnectionData {
        provider_id: row.get(0)?,
        provider_user_id: row.get(1)?,
        display_name: row.get(2)?,
        profile_url: row.get(3)?,
        image_url: row.get(4)?,
        access_token: row.get(5)?,
        secret: row.get(6)?,
        refresh_token: row.get(7)?,
        expire_time: expire_time.and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
    })
}

/// `?first, ?first+1, ...` for `count` parameters.
fn placeholders(first: usize, count: usize) -> String {
    (first..first + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{AesGcmTextEncryptor, NoOpTextEncryptor};
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use chrono::Duration;

    fn create_test_table(prefix: &str) -> ConnectionTable {
        let conn = Connection::open_in_memory().expect("Failed to open database");
        ConnectionTable::open(conn, prefix, Arc::new(NoOpTextEncryptor))
            .expect("Failed to create test table")
    }

    fn facebook(provider_user_id: &str) -> ConnectionData {
        let mut data = ConnectionData::new("facebook", provider_user_id, "access-token");
        data.refresh_token = Some("refresh-token".to_string());
        data.expire_time = Some(Utc.timestamp_millis_opt(1_700_000_000_123).unwrap());
        data
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(3, 2), "?3, ?4");
        assert_eq!(placeholders(1, 1), "?1");
    }

    #[test]
    fn test_table_prefix() {
        let table = create_test_table("app_");
        assert_eq!(table.name(), "app_UserConnection");

        let conn = Connection::open_in_memory().unwrap();
        let result = ConnectionTable::open(conn, "app; DROP TABLE x;", Arc::new(NoOpTextEncryptor));
        assert!(matches!(result, Err(ConnectError::InvalidArgument(_))));
    }

    #[test]
    fn test_insert_and_read_back() {
        let table = create_test_table("");
        let data = facebook("9");

        assert_eq!(table.insert("1", &data, None).unwrap(), 1);

        let stored = table
            .find_by_key("1", &data.key())
            .unwrap()
            .expect("Connection not found");
        assert_eq!(stored, data);
    }

    #[test]
    fn test_rank_derivation() {
        let table = create_test_table("");
        assert_eq!(table.insert("1", &facebook("9"), None).unwrap(), 1);
        assert_eq!(table.insert("1", &facebook("10"), None).unwrap(), 2);
        assert!(table.delete("1", &ConnectionKey::new("facebook", "9")).unwrap());
        assert_eq!(table.insert("1", &facebook("11"), None).unwrap(), 3);

        // Other users start their own sequence
        assert_eq!(table.insert("2", &facebook("9"), None).unwrap(), 1);
    }

    #[test]
    fn test_insert_conflicts() {
        let table = create_test_table("");
        table.insert("1", &facebook("9"), Some(1)).unwrap();

        let result = table.insert("1", &facebook("9"), Some(2));
        assert!(matches!(result, Err(ConnectError::DuplicateConnection(_))));

        let result = table.insert("1", &facebook("10"), Some(1));
        assert!(matches!(result, Err(ConnectError::RankTaken { rank: 1, .. })));

        let result = table.insert("1", &facebook("10"), Some(0));
        assert!(matches!(result, Err(ConnectError::InvalidArgument(_))));

        assert_eq!(table.find_by_provider("1", "facebook").unwrap().len(), 1);
    }

    #[test]
    fn test_update_missing_row() {
        let table = create_test_table("");
        assert!(!table.update("1", &facebook("9")).unwrap());
        assert!(!table.delete("1", &ConnectionKey::new("facebook", "9")).unwrap());
        assert_eq!(table.delete_provider("1", "facebook").unwrap(), 0);
    }

    #[test]
    fn test_user_id_lookups() {
        let table = create_test_table("");
        table.insert("2", &facebook("9"), None).unwrap();
        table.insert("1", &facebook("9"), None).unwrap();
        table.insert("3", &facebook("11"), None).unwrap();

        let user_ids = table
            .user_ids_with(&ConnectionKey::new("facebook", "9"))
            .unwrap();
        assert_eq!(user_ids, vec!["1".to_string(), "2".to_string()]);

        let ids: HashSet<String> = ["9", "11", "12"].iter().map(|s| s.to_string()).collect();
        let connected = table.user_ids_connected_to("facebook", &ids).unwrap();
        assert_eq!(connected.len(), 3);

        let connected = table.user_ids_connected_to("facebook", &HashSet::new()).unwrap();
        assert!(connected.is_empty());
    }

    #[test]
    fn test_id_lookups_span_multiple_queries() {
        let table = create_test_table("");
        table.insert("1", &facebook("9"), None).unwrap();
        table.insert("1", &facebook("10"), None).unwrap();

        // Batched in sorted order: "10" lands in the first batch, "9" in the last
        let mut requested: Vec<String> = (0..MAX_IDS_PER_QUERY * 2)
            .map(|i| format!("5-{}", i))
            .collect();
        requested.insert(0, "10".to_string());
        requested.push("9".to_string());
        requested.push("9".to_string());

        let found = table
            .find_by_provider_user_ids("1", "facebook", &requested)
            .unwrap();
        let ids: Vec<&str> = found.iter().map(|d| d.provider_user_id.as_str()).collect();
        assert_eq!(ids, vec!["9", "10"]);

        let requested: HashSet<String> = requested.into_iter().collect();
        let connected = table.user_ids_connected_to("facebook", &requested).unwrap();
        assert_eq!(connected, HashSet::from(["1".to_string()]));
    }

    #[test]
    fn test_expire_time_truncated_to_millis() {
        let table = create_test_table("");
        let mut data = facebook("9");
        data.expire_time = Some(
            Utc.timestamp_opt(1_700_000_000, 123_456_789)
                .single()
                .unwrap(),
        );
        table.insert("1", &data, None).unwrap();

        let stored = table.find_by_key("1", &data.key()).unwrap().unwrap();
        assert_eq!(
            stored.expire_time,
            Some(Utc.timestamp_millis_opt(1_700_000_000_123).unwrap())
        );
    }

    #[test]
    fn test_secrets_encrypted_at_rest() {
        let key = BASE64.encode([3u8; 32]);
        let encryptor = Arc::new(AesGcmTextEncryptor::new(&key).unwrap());
        let table = ConnectionTable::open(Connection::open_in_memory().unwrap(), "", encryptor)
            .unwrap();

        let mut data = facebook("9");
        data.secret = Some("oauth1-secret".to_string());
        data.expire_time = Some(Utc::now() + Duration::hours(1));
        table.insert("1", &data, None).unwrap();

        let (access_token, secret, refresh_token): (String, String, String) = table
            .conn()
            .query_row(
                "SELECT accessToken, secret, refreshToken FROM UserConnection",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_ne!(access_token, "access-token");
        assert_ne!(secret, "oauth1-secret");
        assert_ne!(refresh_token, "refresh-token");

        let stored = table.find_by_key("1", &data.key()).unwrap().unwrap();
        assert_eq!(stored.access_token, "access-token");
        assert_eq!(stored.secret.as_deref(), Some("oauth1-secret"));
        assert_eq!(stored.refresh_token.as_deref(), Some("refresh-token"));
    }
}
