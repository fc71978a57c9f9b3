//! Storage for social connections: links between local users and their
//! accounts at external OAuth providers.
//!
//! Connections are kept per user, per provider, in rank order (rank 1 is the
//! primary connection). Two backends implement the same
//! [`repository::UsersConnectionRepository`] / [`repository::ConnectionRepository`]
//! contracts:
//!
//! - [`memory`] - nested in-memory maps
//! - [`sqlite`] - one SQLite row per connection, secrets encrypted at rest
//!
//! OAuth handshakes and provider API calls are not performed here. Provider
//! specific behaviour is plugged in through [`connection::ConnectionFactory`].

// Connection model and factory registry
pub mod connection;

// Repository contracts and shared query shaping
pub mod repository;

// Backends
pub mod memory;
pub mod sqlite;

// Secret encryption
pub mod crypto;

pub mod config;
pub mod error;

pub use connection::{Connection, ConnectionData, ConnectionKey};
pub use error::{ConnectError, Result};
pub use repository::{ConnectionRepository, UsersConnectionRepository};
