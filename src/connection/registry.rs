//! Connection factory registry - maps provider ids and API types to factories.

use super::{Connection, ConnectionData};
use crate::error::{ConnectError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::any::TypeId;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Builds live connections for one provider.
pub trait ConnectionFactory: Send + Sync {
    /// Unique provider identifier (e.g. "facebook").
    fn provider_id(&self) -> &str;

    /// Token for the provider's API binding type, used for typed lookups.
    fn api_type(&self) -> TypeId;

    /// Materializes a persisted record into a live connection.
    fn create_connection(&self, data: ConnectionData) -> Box<dyn Connection>;
}

/// Resolves the factory responsible for a provider.
///
/// Every lookup failure is an [`ConnectError::InvalidArgument`]: the caller
/// asked for a provider nobody registered.
pub trait ConnectionFactoryLocator: Send + Sync {
    fn connection_factory(&self, provider_id: &str) -> Result<Arc<dyn ConnectionFactory>>;

    fn connection_factory_for_api(&self, api_type: TypeId) -> Result<Arc<dyn ConnectionFactory>>;

    /// All registered provider ids, sorted.
    fn registered_provider_ids(&self) -> BTreeSet<String>;
}

/// Concurrent [`ConnectionFactoryLocator`].
///
/// Factories may be registered while repositories holding the registry are
/// already in use; new providers become visible immediately.
#[derive(Default)]
pub struct ConnectionFactoryRegistry {
    /// Primary storage: provider_id -> factory
    factories: DashMap<String, Arc<dyn ConnectionFactory>>,
    /// Secondary index: api type -> provider_id
    api_types: DashMap<TypeId, String>,
}

impl ConnectionFactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory. Fails if its provider id or API type is already taken.
    ///
    /// Both entries are claimed while their guards are held, so concurrent
    /// registrations of the same provider admit exactly one.
    pub fn add_connection_factory(&self, factory: Arc<dyn ConnectionFactory>) -> Result<()> {
        let provider_id = factory.provider_id().to_string();
        let api_type = factory.api_type();

        let Entry::Vacant(factory_slot) = self.factories.entry(provider_id.clone()) else {
            return Err(ConnectError::invalid(format!(
                "a connection factory for provider '{}' has already been registered",
                provider_id
            )));
        };
        let Entry::Vacant(api_slot) = self.api_types.entry(api_type) else {
            return Err(ConnectError::invalid(format!(
                "a connection factory for the API type of provider '{}' has already been registered",
                provider_id
            )));
        };

        debug!(provider_id = %provider_id, "Registering connection factory");
        factory_slot.insert(factory);
        api_slot.insert(provider_id);
        Ok(())
    }
}

impl ConnectionFactoryLocator for ConnectionFactoryRegistry {
    fn connection_factory(&self, provider_id: &str) -> Result<Arc<dyn ConnectionFactory>> {
        self.factories
            .get(provider_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| {
                ConnectError::invalid(format!(
                    "no connection factory for provider id '{}' registered",
                    provider_id
                ))
            })
    }

    fn connection_factory_for_api(&self, api_type: TypeId) -> Result<Arc<dyn ConnectionFactory>> {
        let provider_id = self
            .api_types
            .get(&api_type)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| {
                ConnectError::invalid(format!(
                    "no connection factory for API type {:?} registered",
                    api_type
                ))
            })?;
        self.connection_factory(&provider_id)
    }

    fn registered_provider_ids(&self) -> BTreeSet<String> {
        self.factories
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }
}
