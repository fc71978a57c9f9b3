use super::ProviderConnections;
use crate::connection::{Connection, ConnectionData, ConnectionFactoryLocator, ConnectionKey};
use crate::error::{ConnectError, Result};
use crate::repository::{
    align_to_requested, create_connection, create_connections, group_by_provider,
    validate_provider_users, ConnectionRepository, ConnectionsByProvider,
    ConnectionsToUsers, ProviderUsers,
};
use dashmap::DashMap;
use std::any::TypeId;
use std::sync::Arc;
use tracing::debug;

/// In-memory connections of one local user.
///
/// Each provider scope lives in its own map entry; writes run under that
/// entry's guard, so check-then-write sequences on one scope never interleave.
pub struct InMemoryConnectionRepository {
    user_id: String,
    locator: Arc<dyn ConnectionFactoryLocator>,
    /// provider_id -> ranked connections
    providers: DashMap<String, ProviderConnections>,
}

impl InMemoryConnectionRepository {
    pub fn new(user_id: &str, locator: Arc<dyn ConnectionFactoryLocator>) -> Self {
        Self {
            user_id: user_id.to_string(),
            locator,
            providers: DashMap::new(),
        }
    }

    /// Number of connections the user holds with a provider.
    pub fn connection_count(&self, provider_id: &str) -> usize {
        self.read_provider(provider_id, ProviderConnections::len)
            .unwrap_or(0)
    }

    pub(crate) fn contains(&self, key: &ConnectionKey) -> bool {
        self.read_provider(&key.provider_id, |p| {
            p.has_provider_user_id(&key.provider_user_id)
        })
        .unwrap_or(false)
    }

    fn read_provider<T>(
        &self,
        provider_id: &str,
        read: impl FnOnce(&ProviderConnections) -> T,
    ) -> Option<T> {
        self.providers.get(provider_id).map(|p| read(p.value()))
    }

    /// Runs `write` on the provider scope, creating the scope on first access.
    fn write_provider<T>(
        &self,
        provider_id: &str,
        write: impl FnOnce(&mut ProviderConnections) -> T,
    ) -> T {
        let mut entry = self
            .providers
            .entry(provider_id.to_string())
            .or_insert_with(|| ProviderConnections::new(&self.user_id, provider_id));
        write(entry.value_mut())
    }

    fn find_data(&self, provider_id: &str) -> Vec<ConnectionData> {
        self.read_provider(provider_id, ProviderConnections::find_all)
            .unwrap_or_default()
    }

    fn find_primary_data(&self, provider_id: &str) -> Option<ConnectionData> {
        self.read_provider(provider_id, |p| p.find_by_rank(1).cloned())
            .flatten()
    }

    fn provider_id_for_api(&self, api_type: TypeId) -> Result<String> {
        Ok(self
            .locator
            .connection_factory_for_api(api_type)?
            .provider_id()
            .to_string())
    }
}

impl ConnectionRepository for InMemoryConnectionRepository {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    fn find_all_connections(&self) -> Result<ConnectionsByProvider> {
        let mut scopes: Vec<(String, Vec<ConnectionData>)> = self
            .providers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().find_all()))
            .collect();
        scopes.sort_by(|a, b| a.0.cmp(&b.0));

        let data = scopes.into_iter().flat_map(|(_, data)| data).collect();
        group_by_provider(self.locator.as_ref(), data)
    }

    fn find_connections(&self, provider_id: &str) -> Result<Vec<Box<dyn Connection>>> {
        create_connections(self.locator.as_ref(), self.find_data(provider_id))
    }

    fn find_connections_by_api(&self, api_type: TypeId) -> Result<Vec<Box<dyn Connection>>> {
        let provider_id = self.provider_id_for_api(api_type)?;
        self.find_connections(&provider_id)
    }

    fn find_connections_to_users(
        &self,
        provider_users: &ProviderUsers,
    ) -> Result<ConnectionsToUsers> {
        validate_provider_users(provider_users)?;

        let mut data = Vec::new();
        for (provider_id, provider_user_ids) in provider_users {
            if let Some(found) = self.read_provider(provider_id, |p| {
                p.find_by_provider_user_ids(provider_user_ids.as_slice())
            }) {
                data.extend(found);
            }
        }

        let connections = create_connections(self.locator.as_ref(), data)?;
        Ok(align_to_requested(provider_users, connections))
    }

    fn get_connection(&self, key: &ConnectionKey) -> Result<Box<dyn Connection>> {
        let data = self
            .read_provider(&key.provider_id, |p| {
                p.find_by_provider_user_id(&key.provider_user_id).cloned()
            })
            .flatten()
            .ok_or_else(|| ConnectError::NoSuchConnection(key.clone()))?;
        create_connection(self.locator.as_ref(), data)
    }

    fn get_connection_by_api(
        &self,
        api_type: TypeId,
        provider_user_id: &str,
    ) -> Result<Box<dyn Connection>> {
        let provider_id = self.provider_id_for_api(api_type)?;
        self.get_connection(&ConnectionKey::new(provider_id, provider_user_id))
    }

    fn get_primary_connection(&self, api_type: TypeId) -> Result<Box<dyn Connection>> {
        let provider_id = self.provider_id_for_api(api_type)?;
        match self.find_primary_data(&provider_id) {
            Some(data) => create_connection(self.locator.as_ref(), data),
            None => Err(ConnectError::NotConnected(provider_id)),
        }
    }

    fn find_primary_connection(&self, api_type: TypeId) -> Result<Option<Box<dyn Connection>>> {
        let provider_id = self.provider_id_for_api(api_type)?;
        self.find_primary_data(&provider_id)
            .map(|data| create_connection(self.locator.as_ref(), data))
            .transpose()
    }

    fn add_connection_data(&self, data: ConnectionData, rank: Option<u32>) -> Result<()> {
        let provider_id = data.provider_id.clone();
        self.write_provider(&provider_id, |p| p.add(data, rank))?;
        Ok(())
    }

    fn update_connection(&self, connection: &dyn Connection) -> Result<()> {
        let data = connection.create_data();
        let provider_id = data.provider_id.clone();
        let provider_user_id = data.provider_user_id.clone();
        let updated = self.write_provider(&provider_id, |p| p.update(data, &provider_user_id));
        if !updated {
            debug!(
                user_id = %self.user_id,
                connection = %connection.key(),
                "Update ignored, no such connection"
            );
        }
        Ok(())
    }

    fn remove_connections(&self, provider_id: &str) -> Result<()> {
        if let Some(mut provider) = self.providers.get_mut(provider_id) {
            provider.remove_all();
        }
        Ok(())
    }

    fn remove_connection(&self, key: &ConnectionKey) -> Result<()> {
        if let Some(mut provider) = self.providers.get_mut(&key.provider_id) {
            provider.remove_by_provider_user_id(&key.provider_user_id);
        }
        Ok(())
    }

    fn has_connection(&self, key: &ConnectionKey) -> Result<bool> {
        Ok(self.contains(key))
    }
}
