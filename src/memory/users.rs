use super::InMemoryConnectionRepository;
use crate::connection::{
    Connection, ConnectionData, ConnectionFactoryLocator, ConnectionKey, ConnectionSignUp,
};
use crate::error::Result;
use crate::repository::{
    sign_up_user, validate_user_id, ConnectionRepository, UsersConnectionRepository,
};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

/// In-memory [`UsersConnectionRepository`].
///
/// Lives as long as its owner; nothing expires. Per-user repositories are
/// created on first access and shared through `Arc`.
pub struct InMemoryUsersConnectionRepository {
    locator: Arc<dyn ConnectionFactoryLocator>,
    sign_up: Option<Arc<dyn ConnectionSignUp>>,
    /// user_id -> that user's connections
    repositories: DashMap<String, Arc<InMemoryConnectionRepository>>,
}

impl InMemoryUsersConnectionRepository {
    pub fn new(locator: Arc<dyn ConnectionFactoryLocator>) -> Self {
        Self {
            locator,
            sign_up: None,
            repositories: DashMap::new(),
        }
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

    /// Returns the user's concrete repository, creating it on first access.
    pub fn repository(&self, user_id: &str) -> Result<Arc<InMemoryConnectionRepository>> {
        validate_user_id(user_id)?;

        let repository = self
            .repositories
            .entry(user_id.to_string())
            .or_insert_with(|| {
                info!(user_id = %user_id, "Creating in-memory connection repository");
                Arc::new(InMemoryConnectionRepository::new(
                    user_id,
                    Arc::clone(&self.locator),
                ))
            });
        Ok(Arc::clone(repository.value()))
    }

    /// Seeds a connection for a user at an explicit rank.
    pub fn add_connection_data(&self, user_id: &str, data: ConnectionData, rank: u32) -> Result<()> {
        self.repository(user_id)?.add_connection_data(data, Some(rank))
    }

    /// Known user ids, ascending.
    pub fn user_ids(&self) -> Vec<String> {
        let mut user_ids: Vec<String> = self
            .repositories
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        user_ids.sort();
        user_ids
    }

    fn snapshot(&self) -> Vec<(String, Arc<InMemoryConnectionRepository>)> {
        let mut repositories: Vec<_> = self
            .repositories
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();
        repositories.sort_by(|a, b| a.0.cmp(&b.0));
        repositories
    }
}

impl UsersConnectionRepository for InMemoryUsersConnectionRepository {
    fn find_user_ids_with_connection(&self, connection: &dyn Connection) -> Result<Vec<String>> {
        let key = connection.key();
        let user_ids: Vec<String> = self
            .snapshot()
            .into_iter()
            .filter(|(_, repository)| repository.contains(&key))
            .map(|(user_id, _)| user_id)
            .collect();

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
        let user_ids = self
            .snapshot()
            .into_iter()
            .filter(|(_, repository)| {
                provider_user_ids.iter().any(|provider_user_id| {
                    repository.contains(&ConnectionKey::new(provider_id, provider_user_id.as_str()))
                })
            })
            .map(|(user_id, _)| user_id)
            .collect();
        Ok(user_ids)
    }

    fn create_connection_repository(&self, user_id: &str) -> Result<Arc<dyn ConnectionRepository>> {
        let repository: Arc<dyn ConnectionRepository> = self.repository(user_id)?;
        Ok(repository)
    }
}
