use super::table::ConnectionTable;
use crate::connection::{Connection, ConnectionData, ConnectionFactoryLocator, ConnectionKey};
use crate::error::{ConnectError, Result};
use crate::repository::{
    align_to_requested, create_connection, create_connections, group_by_provider,
    validate_provider_users, ConnectionRepository, ConnectionsByProvider, ConnectionsToUsers,
    ProviderUsers,
};
use std::any::TypeId;
use std::sync::Arc;

/// SQLite-backed connections of one local user.
///
/// Cheap to create: it only pairs a user id with the shared table.
pub struct SqliteConnectionRepository {
    user_id: String,
    table: Arc<ConnectionTable>,
    locator: Arc<dyn ConnectionFactoryLocator>,
}

impl SqliteConnectionRepository {
    pub(crate) fn new(
        user_id: &str,
        table: Arc<ConnectionTable>,
        locator: Arc<dyn ConnectionFactoryLocator>,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            table,
            locator,
        }
    }

    fn provider_id_for_api(&self, api_type: TypeId) -> Result<String> {
        Ok(self
            .locator
            .connection_factory_for_api(api_type)?
            .provider_id()
            .to_string())
    }
}

impl ConnectionRepository for SqliteConnectionRepository {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    fn find_all_connections(&self) -> Result<ConnectionsByProvider> {
        let data = self.table.find_all(&self.user_id)?;
        group_by_provider(self.locator.as_ref(), data)
    }

    fn find_connections(&self, provider_id: &str) -> Result<Vec<Box<dyn Connection>>> {
        let data = self.table.find_by_provider(&self.user_id, provider_id)?;
        create_connections(self.locator.as_ref(), data)
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
            data.extend(self.table.find_by_provider_user_ids(
                &self.user_id,
                provider_id,
                provider_user_ids,
            )?);
        }

        let connections = create_connections(self.locator.as_ref(), data)?;
        Ok(align_to_requested(provider_users, connections))
    }

    fn get_connection(&self, key: &ConnectionKey) -> Result<Box<dyn Connection>> {
        let data = self
            .table
            .find_by_key(&self.user_id, key)?
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
        match self.table.find_by_rank(&self.user_id, &provider_id, 1)? {
            Some(data) => create_connection(self.locator.as_ref(), data),
            None => Err(ConnectError::NotConnected(provider_id)),
        }
    }

    fn find_primary_connection(&self, api_type: TypeId) -> Result<Option<Box<dyn Connection>>> {
        let provider_id = self.provider_id_for_api(api_type)?;
        self.table
            .find_by_rank(&self.user_id, &provider_id, 1)?
            .map(|data| create_connection(self.locator.as_ref(), data))
            .transpose()
    }

    fn add_connection_data(&self, data: ConnectionData, rank: Option<u32>) -> Result<()> {
        self.table.insert(&self.user_id, &data, rank)?;
        Ok(())
    }

    fn update_connection(&self, connection: &dyn Connection) -> Result<()> {
        self.table.update(&self.user_id, &connection.create_data())?;
        Ok(())
    }

    fn remove_connections(&self, provider_id: &str) -> Result<()> {
        self.table.delete_provider(&self.user_id, provider_id)?;
        Ok(())
    }

    fn remove_connection(&self, key: &ConnectionKey) -> Result<()> {
        self.table.delete(&self.user_id, key)?;
        Ok(())
    }

    fn has_connection(&self, key: &ConnectionKey) -> Result<bool> {
        self.table.exists(&self.user_id, key)
    }
}
