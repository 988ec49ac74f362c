//! Store-boundary errors shared by all backends.

use uuid::Uuid;

/// Errors surfaced by store backends.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Backend rejected or failed the operation
    Backend(String),
    /// No record with the given id in the collection
    NotFound(Uuid),
    /// Serialization failed
    Serialization(String),
    /// Deserialization failed
    Deserialization(String),
    /// Transport failure talking to a remote backend
    Connection(String),
    /// Remote backend did not answer in time
    Timeout,
    /// The consumer was torn down before the operation completed
    Closed,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backend(e) => write!(f, "Backend error: {e}"),
            Self::NotFound(id) => write!(f, "Record not found: {id}"),
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            Self::Connection(e) => write!(f, "Connection error: {e}"),
            Self::Timeout => write!(f, "Request timeout"),
            Self::Closed => write!(f, "Consumer closed"),
        }
    }
}

impl std::error::Error for StoreError {}
