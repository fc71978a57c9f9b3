use crate::connection::ConnectionKey;
use thiserror::Error;

/// Failures surfaced by connection repositories.
///
/// None of these are retried inside the crate; the caller decides how to
/// recover (e.g. send the user through sign-up on [`ConnectError::NotConnected`]).
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("connection already exists: {0}")]
    DuplicateConnection(ConnectionKey),

    #[error("rank {rank} is already taken for provider '{provider_id}'")]
    RankTaken { provider_id: String, rank: u32 },

    #[error("no such connection: {0}")]
    NoSuchConnection(ConnectionKey),

    #[error("not connected to provider '{0}'")]
    NotConnected(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("config error: {0}")]
    Config(String),
}

impl ConnectError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}

pub type Result<T> = std::result::Result<T, ConnectError>;
