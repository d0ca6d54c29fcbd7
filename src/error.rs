//! Error types for the Knowledge Object Register.

use thiserror::Error;

/// Errors surfaced by KOR operations.
///
/// All variants are recoverable from the caller's perspective: a failed
/// operation leaves shared state untouched (permission and restriction
/// checks complete before any write lands).
#[derive(Debug, Error)]
pub enum KorError {
    /// The parent of the address being created does not exist.
    #[error("parent of {0} does not exist")]
    ParentMissing(String),

    /// The address being created is already occupied.
    #[error("node {0} already exists")]
    AlreadyExists(String),

    /// The address is absent, or fully inaccessible to the requester.
    #[error("node {0} does not exist")]
    NotExisting(String),

    /// Read or write permission check failed.
    #[error("identity '{identity}' has no permission on {address}")]
    NoPermission { address: String, identity: String },

    /// A candidate value violated the node's restriction.
    #[error("value rejected by restriction on {address}: {reason}")]
    InvalidValue { address: String, reason: String },

    /// Lock acquisition hit an address already participating in a lock.
    #[error("{0} is already locked")]
    AlreadyLocked(String),

    /// Commit or rollback was issued against an address with no lock.
    #[error("{0} is not locked")]
    NotLocked(String),

    /// A write was blocked by somebody else's lock.
    #[error("write to {0} blocked by a foreign lock")]
    Locked(String),

    /// The address string is not a valid absolute KOR path.
    #[error("malformed address: {0}")]
    InvalidAddress(String),

    /// A storage backend failure (connection loss, corrupt record, ...).
    #[error("storage backend failure: {0}")]
    Storage(String),

    /// Configuration loading or validation failure.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<sled::Error> for KorError {
    fn from(e: sled::Error) -> Self {
        KorError::Storage(e.to_string())
    }
}

impl From<config::ConfigError> for KorError {
    fn from(e: config::ConfigError) -> Self {
        KorError::Config(e.to_string())
    }
}
