//! In-memory connection storage.
//!
//! Three nested maps: user id -> provider id -> rank. Nothing is persisted;
//! the store lives exactly as long as the [`InMemoryUsersConnectionRepository`]
//! that owns it.
//!
//! # Usage
//!
//! ```no_run
//! use social_connect::connection::{ConnectionData, ConnectionFactoryRegistry};
//! use social_connect::memory::InMemoryUsersConnectionRepository;
//! use social_connect::repository::UsersConnectionRepository;
//! use std::sync::Arc;
//!
//! # fn main() -> social_connect::Result<()> {
//! let registry = Arc::new(ConnectionFactoryRegistry::new());
//! // registry.add_connection_factory(...) for every provider
//! let users = InMemoryUsersConnectionRepository::new(registry);
//!
//! let connections = users.create_connection_repository("1")?;
//! connections.add_connection_data(ConnectionData::new("facebook", "9", "token"), None)?;
//! let facebook = connections.find_connections("facebook")?;
//! # Ok(())
//! # }
//! ```

mod connections;
mod provider;
mod users;


pub use connections::InMemoryConnectionRepository;
pub use provider::ProviderConnections;
pub use users::InMemoryUsersConnectionRepository;
