// Shared fixtures: test providers and backend harness

#![allow(dead_code)]

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{Duration, Utc};
use social_connect::connection::{
    Connection, ConnectionData, ConnectionFactory, ConnectionFactoryRegistry, ConnectionKey,
    ConnectionSignUp,
};
use social_connect::crypto::{AesGcmTextEncryptor, NoOpTextEncryptor};
use social_connect::memory::InMemoryUsersConnectionRepository;
use social_connect::sqlite::SqliteUsersConnectionRepository;
use social_connect::UsersConnectionRepository;
use std::any::{Any, TypeId};
use std::sync::Arc;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Facebook API binding handed out by test facebook connections
#[derive(Debug)]
pub struct TestFacebookApi {
    pub access_token: String,
}

/// Twitter API binding handed out by test twitter connections
#[derive(Debug)]
pub struct TestTwitterApi {
    pub access_token: String,
    pub secret: Option<String>,
}

/// What the provider reports for the authorized account.
#[derive(Clone)]
struct Profile {
    provider_user_id: &'static str,
    display_name: &'static str,
    profile_url: &'static str,
    image_url: &'static str,
}

const FACEBOOK_PROFILE: Profile = Profile {
    provider_user_id: "9",
    display_name: "Keith Donald",
    profile_url: "http://facebook.com/keith.donald",
    image_url: "http://facebook.com/keith.donald/picture",
};

const TWITTER_PROFILE: Profile = Profile {
    provider_user_id: "1",
    display_name: "@kdonald",
    profile_url: "http://twitter.com/kdonald",
    image_url: "http://twitter.com/kdonald/a_new_picture",
};

/// A connection whose provider is simulated in-process.
pub struct TestConnection {
    data: ConnectionData,
    api: Box<dyn Any + Send + Sync>,
    profile: Profile,
    build_api: fn(&ConnectionData) -> Box<dyn Any + Send + Sync>,
}

impl TestConnection {
    fn new(
        data: ConnectionData,
        profile: Profile,
        build_api: fn(&ConnectionData) -> Box<dyn Any + Send + Sync>,
    ) -> Self {
        Self {
            api: build_api(&data),
            data,
            profile,
            build_api,
        }
    }
}

fn facebook_api(data: &ConnectionData) -> Box<dyn Any + Send + Sync> {
    Box::new(TestFacebookApi {
        access_token: data.access_token.clone(),
    })
}

fn twitter_api(data: &ConnectionData) -> Box<dyn Any + Send + Sync> {
    Box::new(TestTwitterApi {
        access_token: data.access_token.clone(),
        secret: data.secret.clone(),
    })
}

#[async_trait]
impl Connection for TestConnection {
    fn key(&self) -> ConnectionKey {
        self.data.key()
    }

    fn display_name(&self) -> Option<&str> {
        self.data.display_name.as_deref()
    }

    fn profile_url(&self) -> Option<&str> {
        self.data.profile_url.as_deref()
    }

    fn image_url(&self) -> Option<&str> {
        self.data.image_url.as_deref()
    }

    async fn test(&self) -> bool {
        true
    }

    async fn sync(&mut self) -> anyhow::Result<()> {
        self.data.display_name = Some(self.profile.display_name.to_string());
        self.data.profile_url = Some(self.profile.profile_url.to_string());
        self.data.image_url = Some(self.profile.image_url.to_string());
        Ok(())
    }

    async fn refresh(&mut self) -> anyhow::Result<()> {
        // Only the OAuth 2 provider issues refresh tokens
        if self.data.refresh_token.is_some() {
            self.data.access_token = "765432109".to_string();
            self.data.refresh_token = Some("654321098".to_string());
            self.data.expire_time = Some(Utc::now() + Duration::seconds(3600));
            self.api = (self.build_api)(&self.data);
        }
        Ok(())
    }

    fn create_data(&self) -> ConnectionData {
        self.data.clone()
    }

    fn api(&self) -> &(dyn Any + Send + Sync) {
        self.api.as_ref()
    }
}

pub struct TestFacebookConnectionFactory;

impl TestFacebookConnectionFactory {
    /// Simulates a completed OAuth 2 authorization for the facebook test account.
    pub fn connect(
        access_token: &str,
        refresh_token: Option<&str>,
        expires_in_seconds: Option<i64>,
    ) -> TestConnection {
        let mut data = ConnectionData::new("facebook", FACEBOOK_PROFILE.provider_user_id, access_token);
        data.refresh_token = refresh_token.map(str::to_string);
        data.expire_time = expires_in_seconds.map(|s| Utc::now() + Duration::seconds(s));

        let mut connection = TestConnection::new(data, FACEBOOK_PROFILE, facebook_api);
        connection.data.display_name = Some(FACEBOOK_PROFILE.display_name.to_string());
        connection.data.profile_url = Some(FACEBOOK_PROFILE.profile_url.to_string());
        connection.data.image_url = Some(FACEBOOK_PROFILE.image_url.to_string());
        connection
    }
}

impl ConnectionFactory for TestFacebookConnectionFactory {
    fn provider_id(&self) -> &str {
        "facebook"
    }

    fn api_type(&self) -> TypeId {
        TypeId::of::<TestFacebookApi>()
    }

    fn create_connection(&self, data: ConnectionData) -> Box<dyn Connection> {
        Box::new(TestConnection::new(data, FACEBOOK_PROFILE, facebook_api))
    }
}

pub struct TestTwitterConnectionFactory;

impl ConnectionFactory for TestTwitterConnectionFactory {
    fn provider_id(&self) -> &str {
        "twitter"
    }

    fn api_type(&self) -> TypeId {
        TypeId::of::<TestTwitterApi>()
    }

    fn create_connection(&self, data: ConnectionData) -> Box<dyn Connection> {
        Box::new(TestConnection::new(data, TWITTER_PROFILE, twitter_api))
    }
}

pub fn facebook_api_type() -> TypeId {
    TypeId::of::<TestFacebookApi>()
}

pub fn twitter_api_type() -> TypeId {
    TypeId::of::<TestTwitterApi>()
}

#[derive(Debug, Clone, Copy)]
pub enum Backend {
    InMemory,
    Sqlite,
    /// Prefixed table with AES-GCM encrypted secrets
    SqliteEncrypted,
}

/// A users repository plus the registry it resolves factories from.
pub struct Harness {
    pub registry: Arc<ConnectionFactoryRegistry>,
    pub users: Box<dyn UsersConnectionRepository>,
}

impl Harness {
    /// Facebook is always registered; twitter only on demand.
    pub fn new(backend: Backend, sign_up: Option<Arc<dyn ConnectionSignUp>>) -> Self {
        init_tracing();

        let registry = Arc::new(ConnectionFactoryRegistry::new());
        registry
            .add_connection_factory(Arc::new(TestFacebookConnectionFactory))
            .expect("Failed to register facebook");

        let users: Box<dyn UsersConnectionRepository> = match backend {
            Backend::InMemory => {
                let mut users = InMemoryUsersConnectionRepository::new(registry.clone());
                if let Some(sign_up) = sign_up {
                    users.set_connection_sign_up(sign_up);
                }
                Box::new(users)
            }
            Backend::Sqlite | Backend::SqliteEncrypted => {
                let mut users = match backend {
                    Backend::SqliteEncrypted => {
                        let key = BASE64.encode([42u8; 32]);
                        SqliteUsersConnectionRepository::with_table_prefix(
                            ":memory:",
                            "test_",
                            registry.clone(),
                            Arc::new(AesGcmTextEncryptor::new(&key).expect("Invalid test key")),
                        )
                    }
                    _ => SqliteUsersConnectionRepository::new(
                        ":memory:",
                        registry.clone(),
                        Arc::new(NoOpTextEncryptor),
                    ),
                }
                .expect("Failed to create test store");
                if let Some(sign_up) = sign_up {
                    users.set_connection_sign_up(sign_up);
                }
                Box::new(users)
            }
        };

        Self { registry, users }
    }

    pub fn register_twitter(&self) {
        self.registry
            .add_connection_factory(Arc::new(TestTwitterConnectionFactory))
            .expect("Failed to register twitter");
    }

    #[allow(clippy::too_many_arguments)]
    pub fn insert_connection(
        &self,
        user_id: &str,
        provider_id: &str,
        provider_user_id: &str,
        rank: u32,
        display_name: Option<&str>,
        profile_url: Option<&str>,
        image_url: Option<&str>,
        access_token: &str,
        secret: Option<&str>,
        refresh_token: Option<&str>,
        expires_in_seconds: Option<i64>,
    ) {
        let data = ConnectionData {
            provider_id: provider_id.to_string(),
            provider_user_id: provider_user_id.to_string(),
            display_name: display_name.map(str::to_string),
            profile_url: profile_url.map(str::to_string),
            image_url: image_url.map(str::to_string),
            access_token: access_token.to_string(),
            secret: secret.map(str::to_string),
            refresh_token: refresh_token.map(str::to_string),
            expire_time: expires_in_seconds.map(|s| Utc::now() + Duration::seconds(s)),
        };
        self.users
            .create_connection_repository(user_id)
            .expect("Failed to create repository")
            .add_connection_data(data, Some(rank))
            .expect("Failed to insert connection");
    }

    pub fn insert_twitter_connection(&self) {
        self.insert_connection(
            "1",
            "twitter",
            "1",
            1,
            Some("@kdonald"),
            Some("http://twitter.com/kdonald"),
            Some("http://twitter.com/kdonald/picture"),
            "123456789",
            Some("987654321"),
            None,
            None,
        );
    }

    pub fn insert_facebook_connection(&self) {
        self.insert_connection(
            "1", "facebook", "9", 1, None, None, None, "234567890", None,
            Some("345678901"), Some(3600),
        );
    }

    pub fn insert_facebook_connection2(&self) {
        self.insert_connection(
            "1", "facebook", "10", 2, None, None, None, "456789012", None,
            Some("56789012"), Some(3600),
        );
    }

    pub fn insert_facebook_connection3(&self) {
        self.insert_connection(
            "2", "facebook", "11", 2, None, None, None, "456789012", None,
            Some("56789012"), Some(3600),
        );
    }

    pub fn insert_facebook_connection_same_facebook_user(&self) {
        self.insert_connection(
            "2", "facebook", "9", 1, None, None, None, "234567890", None,
            Some("345678901"), Some(3600),
        );
    }
}

pub fn assert_facebook_connection(facebook: &dyn Connection) {
    assert_eq!(facebook.key(), ConnectionKey::new("facebook", "9"));
    assert_eq!(facebook.display_name(), None);
    assert_eq!(facebook.profile_url(), None);
    assert_eq!(facebook.image_url(), None);
    let api = facebook
        .api_as::<TestFacebookApi>()
        .expect("Not a facebook connection");
    assert_eq!(api.access_token, "234567890");
}

pub fn assert_twitter_connection(twitter: &dyn Connection) {
    assert_eq!(twitter.key(), ConnectionKey::new("twitter", "1"));
    assert_eq!(twitter.display_name(), Some("@kdonald"));
    assert_eq!(twitter.profile_url(), Some("http://twitter.com/kdonald"));
    assert_eq!(twitter.image_url(), Some("http://twitter.com/kdonald/picture"));
    let api = twitter
        .api_as::<TestTwitterApi>()
        .expect("Not a twitter connection");
    assert_eq!(api.access_token, "123456789");
    assert_eq!(api.secret.as_deref(), Some("987654321"));
}
