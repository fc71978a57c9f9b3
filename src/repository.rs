//! Repository contracts implemented by the in-memory and SQLite backends.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       UsersConnectionRepository          │
//! │  - user id -> ConnectionRepository       │
//! │  - reverse lookup by connection key      │
//! │  - optional sign-up provisioning         │
//! └─────────────────────────────────────────┘
//!          ↓ (one per user)
//! ┌─────────────────────────────────────────┐
//! │       ConnectionRepository               │
//! │  - provider id -> ranked connections     │
//! │  - cross-provider queries                │
//! └─────────────────────────────────────────┘
//!          ↓
//! ┌─────────────────────────────────────────┐
//! │       ConnectionFactoryLocator           │
//! │  - ConnectionData -> live Connection     │
//! └─────────────────────────────────────────┘
//! ```

use crate::connection::{
    Connection, ConnectionData, ConnectionFactoryLocator, ConnectionKey, ConnectionSignUp,
};
use crate::error::{ConnectError, Result};
use std::any::TypeId;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::info;

/// Connections grouped by provider id, each group in rank order.
pub type ConnectionsByProvider = BTreeMap<String, Vec<Box<dyn Connection>>>;

/// Requested provider user ids grouped by provider id.
pub type ProviderUsers = BTreeMap<String, Vec<String>>;

/// Result of [`ConnectionRepository::find_connections_to_users`]. Each vector is
/// positionally aligned with the request; `None` marks ids with no connection.
pub type ConnectionsToUsers = BTreeMap<String, Vec<Option<Box<dyn Connection>>>>;

/// Connections of one local user, across all providers.
pub trait ConnectionRepository: Send + Sync {
    fn user_id(&self) -> &str;

    /// Every registered provider is present in the result, with an empty
    /// vector when the user has no connection there.
    fn find_all_connections(&self) -> Result<ConnectionsByProvider>;

    fn find_connections(&self, provider_id: &str) -> Result<Vec<Box<dyn Connection>>>;

    fn find_connections_by_api(&self, api_type: TypeId) -> Result<Vec<Box<dyn Connection>>>;

    /// Fails with [`ConnectError::InvalidArgument`] when `provider_users` is empty.
    fn find_connections_to_users(&self, provider_users: &ProviderUsers)
        -> Result<ConnectionsToUsers>;

    fn get_connection(&self, key: &ConnectionKey) -> Result<Box<dyn Connection>>;

    fn get_connection_by_api(
        &self,
        api_type: TypeId,
        provider_user_id: &str,
    ) -> Result<Box<dyn Connection>>;

    /// Fails with [`ConnectError::NotConnected`] when there is no rank 1 connection.
    fn get_primary_connection(&self, api_type: TypeId) -> Result<Box<dyn Connection>>;

    fn find_primary_connection(&self, api_type: TypeId) -> Result<Option<Box<dyn Connection>>>;

    /// Adds the connection at the next free rank.
    fn add_connection(&self, connection: &dyn Connection) -> Result<()> {
        self.add_connection_data(connection.create_data(), None)
    }

    /// Adds raw connection data, at `rank` when given, otherwise at the next free rank.
    fn add_connection_data(&self, data: ConnectionData, rank: Option<u32>) -> Result<()>;

    /// Replaces the stored data for the connection's key, keeping its rank.
    fn update_connection(&self, connection: &dyn Connection) -> Result<()>;

    fn remove_connections(&self, provider_id: &str) -> Result<()>;

    fn remove_connection(&self, key: &ConnectionKey) -> Result<()>;

    fn has_connection(&self, key: &ConnectionKey) -> Result<bool>;
}

/// Registry of every local user's [`ConnectionRepository`].
pub trait UsersConnectionRepository: Send + Sync {
    /// User ids linked to the connection's key, ascending.
    ///
    /// With no match and a sign-up policy configured, the policy may provision
    /// a new user; that user is linked to the connection and returned alone.
    fn find_user_ids_with_connection(&self, connection: &dyn Connection) -> Result<Vec<String>>;

    fn find_user_ids_connected_to(
        &self,
        provider_id: &str,
        provider_user_ids: &HashSet<String>,
    ) -> Result<HashSet<String>>;

    /// Returns the user's repository, creating it on first access.
    fn create_connection_repository(&self, user_id: &str) -> Result<Arc<dyn ConnectionRepository>>;
}

pub(crate) fn validate_user_id(user_id: &str) -> Result<()> {
    if user_id.is_empty() {
        return Err(ConnectError::invalid("user id cannot be empty"));
    }
    Ok(())
}

pub(crate) fn validate_rank(rank: u32) -> Result<()> {
    if rank == 0 {
        return Err(ConnectError::invalid("rank must be a positive integer"));
    }
    Ok(())
}

pub(crate) fn validate_provider_users(provider_users: &ProviderUsers) -> Result<()> {
    if provider_users.is_empty() {
        return Err(ConnectError::invalid(
            "unable to execute find: no provider users provided",
        ));
    }
    Ok(())
}

/// Materializes a record through the factory registered for its provider.
pub(crate) fn create_connection(
    locator: &dyn ConnectionFactoryLocator,
    data: ConnectionData,
) -> Result<Box<dyn Connection>> {
    let factory = locator.connection_factory(&data.provider_id)?;
    Ok(factory.create_connection(data))
}

pub(crate) fn create_connections(
    locator: &dyn ConnectionFactoryLocator,
    data: Vec<ConnectionData>,
) -> Result<Vec<Box<dyn Connection>>> {
    data.into_iter()
        .map(|d| create_connection(locator, d))
        .collect()
}

/// Groups rank-ordered records by provider, seeding an empty group for every
/// registered provider.
pub(crate) fn group_by_provider(
    locator: &dyn ConnectionFactoryLocator,
    data: Vec<ConnectionData>,
) -> Result<ConnectionsByProvider> {
    let mut grouped: ConnectionsByProvider = locator
        .registered_provider_ids()
        .into_iter()
        .map(|provider_id| (provider_id, Vec::new()))
        .collect();

    for connection in create_connections(locator, data)? {
        grouped
            .entry(connection.key().provider_id)
            .or_default()
            .push(connection);
    }
    Ok(grouped)
}

/// Places each connection at the position its provider user id holds in the
/// request. Providers without any match are left out.
pub(crate) fn align_to_requested(
    provider_users: &ProviderUsers,
    connections: Vec<Box<dyn Connection>>,
) -> ConnectionsToUsers {
    let mut aligned = ConnectionsToUsers::new();

    for connection in connections {
        let key = connection.key();
        let Some(requested) = provider_users.get(&key.provider_id) else {
            continue;
        };
        let Some(index) = requested.iter().position(|id| *id == key.provider_user_id) else {
            continue;
        };
        let slots = aligned
            .entry(key.provider_id)
            .or_insert_with(|| requested.iter().map(|_| None).collect());
        slots[index] = Some(connection);
    }
    aligned
}

/// Runs the sign-up policy for a connection nobody is linked to.
///
/// Returns the provisioned user id as a single-element list, or an empty list
/// when no policy is set or it declined.
pub(crate) fn sign_up_user<R>(
    users: &R,
    sign_up: Option<&dyn ConnectionSignUp>,
    connection: &dyn Connection,
) -> Result<Vec<String>>
where
    R: UsersConnectionRepository + ?Sized,
{
    let Some(sign_up) = sign_up else {
        return Ok(Vec::new());
    };

    match sign_up.execute(connection) {
        Some(user_id) if !user_id.is_empty() => {
            info!(
                user_id = %user_id,
                connection = %connection.key(),
                "Provisioned local user from connection sign-up"
            );
            users
                .create_connection_repository(&user_id)?
                .add_connection(connection)?;
            Ok(vec![user_id])
        }
        _ => Ok(Vec::new()),
    }
}
