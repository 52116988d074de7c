//! Error types.
//!
//! The engine favors availability over strict request/response semantics:
//! most of these errors are logged and turned into no-ops at the call site
//! rather than surfaced to clients, which only ever observe eventual
//! corrections.

use thiserror::Error;

/// Common error conditions across the gateway, store and engines.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Malformed bytes on the framed TCP protocol.
    #[error("framing error: {message}")]
    Framing { message: String },

    /// The receive buffer would grow past its limit.
    #[error("buffer overflow: {buffered} + {incoming} > {limit}")]
    BufferOverflow {
        buffered: usize,
        incoming: usize,
        limit: usize,
    },

    /// A message body could not be decoded as an envelope.
    #[error("invalid message: {message}")]
    InvalidMessage { message: String },

    /// The backing relational store is not reachable.
    #[error("storage unavailable: {message}")]
    StorageUnavailable { message: String },

    /// A backing-store query failed.
    #[error("storage query failed: {message}")]
    Storage { message: String },

    /// Referenced entity does not exist in the store.
    #[error("{kind} {id} not found")]
    EntityNotFound { kind: &'static str, id: i64 },

    /// A field write was rejected by an entity setter.
    #[error("invalid field '{field}' on {kind}: {message}")]
    InvalidField {
        kind: &'static str,
        field: String,
        message: String,
    },

    /// A request that cannot be honoured (unknown dimension, bad command text).
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// Addressed client is not connected.
    #[error("client not connected: {client}")]
    ClientNotConnected { client: String },

    /// An actor's channel was closed.
    #[error("channel closed: {name}")]
    ChannelClosed { name: &'static str },

    /// Socket-level failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Create a framing error.
    pub fn framing(message: impl Into<String>) -> Self {
        Self::Framing {
            message: message.into(),
        }
    }

    /// Create a storage query error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create an invalid request error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Whether the connection that produced this error must be torn down.
    pub fn is_fatal_for_connection(&self) -> bool {
        matches!(
            self,
            Self::BufferOverflow { .. } | Self::Io(_) | Self::ChannelClosed { .. }
        )
    }

    /// Whether the failed operation may succeed if retried later.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::StorageUnavailable { .. })
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Storage {
            message: value.to_string(),
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(value: serde_json::Error) -> Self {
        Self::InvalidMessage {
            message: value.to_string(),
        }
    }
}

/// Result type using SyncError.
pub type SyncResult<T> = Result<T, SyncError>;
