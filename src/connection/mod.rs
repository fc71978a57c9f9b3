//! Connection model shared by every repository backend.
//!
//! A [`ConnectionData`] is the persisted snapshot of one link between a local
//! user and an external provider account. A [`Connection`] is the live object a
//! provider's [`ConnectionFactory`] builds from that snapshot; it owns the API
//! binding and knows how to refresh itself against the provider.
//!
//! ```text
//!   ConnectionData ──(ConnectionFactory::create_connection)──► Box<dyn Connection>
//!        ▲                                                           │
//!        └──────────────────(Connection::create_data)────────────────┘
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;

mod registry;

pub use registry::{ConnectionFactory, ConnectionFactoryLocator, ConnectionFactoryRegistry};

/// Identity of one external account under one provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionKey {
    pub provider_id: String,
    pub provider_user_id: String,
}

impl ConnectionKey {
    pub fn new(provider_id: impl Into<String>, provider_user_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            provider_user_id: provider_user_id.into(),
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider_id, self.provider_user_id)
    }
}

/// Persisted representation of a connection: credentials plus a profile snapshot.
///
/// Values are never mutated in place by the repositories; an update replaces
/// the stored value wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionData {
    /// Provider the account lives at (e.g. "facebook")
    pub provider_id: String,

    /// Account id at the provider
    pub provider_user_id: String,

    pub display_name: Option<String>,
    pub profile_url: Option<String>,
    pub image_url: Option<String>,

    /// OAuth access token
    pub access_token: String,

    /// OAuth 1 token secret
    pub secret: Option<String>,

    /// OAuth 2 refresh token
    pub refresh_token: Option<String>,

    /// When the access token expires (UTC). The SQLite backend stores it with
    /// millisecond precision.
    pub expire_time: Option<DateTime<Utc>>,
}

impl ConnectionData {
    /// Creates connection data carrying only the key and access token.
    pub fn new(
        provider_id: impl Into<String>,
        provider_user_id: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            provider_user_id: provider_user_id.into(),
            display_name: None,
            profile_url: None,
            image_url: None,
            access_token: access_token.into(),
            secret: None,
            refresh_token: None,
            expire_time: None,
        }
    }

    pub fn key(&self) -> ConnectionKey {
        ConnectionKey::new(self.provider_id.clone(), self.provider_user_id.clone())
    }
}

/// A live, provider-bound connection.
///
/// One concrete type exists per provider. Repositories only ever see this
/// trait: they persist what [`Connection::create_data`] returns and hand back
/// whatever the provider's factory builds.
#[async_trait]
pub trait Connection: Send + Sync {
    fn key(&self) -> ConnectionKey;

    fn display_name(&self) -> Option<&str>;

    fn profile_url(&self) -> Option<&str>;

    fn image_url(&self) -> Option<&str>;

    /// Returns true once the access token is past its expiry time.
    fn has_expired(&self) -> bool {
        self.create_data()
            .expire_time
            .map(|expires| expires <= Utc::now())
            .unwrap_or(false)
    }

    /// Checks that the credentials still work against the provider.
    async fn test(&self) -> bool;

    /// Re-reads the profile fields (display name, urls) from the provider.
    async fn sync(&mut self) -> anyhow::Result<()>;

    /// Obtains fresh credentials from the provider.
    async fn refresh(&mut self) -> anyhow::Result<()>;

    /// Snapshot of the current state, suitable for persisting.
    fn create_data(&self) -> ConnectionData;

    /// The provider API binding this connection wraps.
    fn api(&self) -> &(dyn Any + Send + Sync);
}

impl<'a> dyn Connection + 'a {
    /// Downcasts the API binding to the provider's concrete API type.
    pub fn api_as<A: Any>(&self) -> Option<&A> {
        self.api().downcast_ref::<A>()
    }
}

impl<'a> fmt::Debug for dyn Connection + 'a {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.key())
            .field("display_name", &self.display_name())
            .finish()
    }
}

/// Provisions a new local user for a provider account nobody is linked to yet.
///
/// Returning `None` (or an empty id) means an explicit sign-up is required.
pub trait ConnectionSignUp: Send + Sync {
    fn execute(&self, connection: &dyn Connection) -> Option<String>;
}

impl<F> ConnectionSignUp for F
where
    F: Fn(&dyn Connection) -> Option<String> + Send + Sync,
{
    fn execute(&self, connection: &dyn Connection) -> Option<String> {
        self(connection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_key_display() {
        let key = ConnectionKey::new("facebook", "9");
        assert_eq!(key.to_string(), "facebook:9");
    }

    #[test]
    fn test_data_key() {
        let data = ConnectionData::new("twitter", "1", "token");
        assert_eq!(data.key(), ConnectionKey::new("twitter", "1"));
        assert!(data.secret.is_none());
        assert!(data.expire_time.is_none());
    }

    #[test]
    fn test_key_ordering_by_provider_then_user() {
        let mut keys = vec![
            ConnectionKey::new("twitter", "1"),
            ConnectionKey::new("facebook", "9"),
            ConnectionKey::new("facebook", "10"),
        ];
        keys.sort();
        assert_eq!(keys[0], ConnectionKey::new("facebook", "10"));
        assert_eq!(keys[2], ConnectionKey::new("twitter", "1"));
    }

    #[test]
    fn test_closure_sign_up() {
        struct Dummy(ConnectionData);

        #[async_trait]
        impl Connection for Dummy {
            fn key(&self) -> ConnectionKey {
                self.0.key()
            }
            fn display_name(&self) -> Option<&str> {
                None
            }
            fn profile_url(&self) -> Option<&str> {
                None
            }
            fn image_url(&self) -> Option<&str> {
                None
            }
            async fn test(&self) -> bool {
                true
            }
            async fn sync(&mut self) -> anyhow::Result<()> {
                Ok(())
            }
            async fn refresh(&mut self) -> anyhow::Result<()> {
                Ok(())
            }
            fn create_data(&self) -> ConnectionData {
                self.0.clone()
            }
            fn api(&self) -> &(dyn Any + Send + Sync) {
                &self.0.access_token
            }
        }

        let mut data = ConnectionData::new("facebook", "9", "token");
        data.expire_time = Some(Utc::now() - Duration::minutes(1));
        let connection = Dummy(data);

        let sign_up = |c: &dyn Connection| Some(format!("user-{}", c.key().provider_user_id));
        assert_eq!(sign_up.execute(&connection), Some("user-9".to_string()));

        let dyn_connection: &dyn Connection = &connection;
        assert!(dyn_connection.has_expired());
        assert_eq!(dyn_connection.api_as::<String>().map(String::as_str), Some("token"));
        assert!(dyn_connection.api_as::<u32>().is_none());
    }
}
