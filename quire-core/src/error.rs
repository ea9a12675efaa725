//! Error types shared by the op protocol, the storage contracts and the
//! CRDT capability.
//!
//! `OpError` is the only error that crosses a channel: it is serialized into
//! the `error` side of an `op:return` frame. Backend and CRDT failures are
//! folded into it at the handler boundary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error delivered to the caller of an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum OpError {
    /// No handler is registered under the requested operation name.
    #[error("Handler for operation [{0}] is not registered")]
    NotRegistered(String),
    /// A request id was reused while the first request was still in flight.
    #[error("Request id [{0}] is already in flight")]
    DuplicateRequest(String),
    /// The history entry a rollback targets does not exist.
    #[error("Can not find the version {timestamp} of doc {doc_id} to rollback to")]
    VersionNotFound { doc_id: String, timestamp: i64 },
    /// The document being rolled back has no current content.
    #[error("Can not find the current version of doc {0}")]
    CurrentVersionNotFound(String),
    /// Failure reported by the persistence backend.
    #[error("Storage backend error: {0}")]
    Backend(String),
    /// Failure reported by the CRDT capability.
    #[error("CRDT error: {0}")]
    Crdt(String),
    /// Payload or frame could not be encoded/decoded.
    #[error("Codec error: {0}")]
    Codec(String),
    /// Storage set could not be built from its configuration.
    #[error("Configuration error: {0}")]
    Config(String),
    /// The channel closed before a reply arrived.
    #[error("Channel disconnected")]
    Disconnected,
}

/// Errors raised by concrete storage backends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Storage is not connected")]
    NotConnected,
    #[error("Invalid storage options: {0}")]
    InvalidOptions(String),
    #[error("Invalid key: {0}")]
    InvalidKey(String),
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Io(e.to_string())
    }
}

impl From<StorageError> for OpError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::InvalidOptions(msg) => OpError::Config(msg),
            other => OpError::Backend(other.to_string()),
        }
    }
}

/// Errors raised by the CRDT capability.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CrdtError {
    #[error("Invalid update binary: {0}")]
    InvalidUpdate(String),
    #[error("Invalid state vector: {0}")]
    InvalidStateVector(String),
    #[error("Failed to apply update: {0}")]
    Apply(String),
}

impl From<CrdtError> for OpError {
    fn from(e: CrdtError) -> Self {
        OpError::Crdt(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_registered_message_names_op() {
        let err = OpError::NotRegistered("GetDocOp".into());
        assert!(err.to_string().contains("[GetDocOp]"));
    }

    #[test]
    fn test_storage_error_becomes_backend_error() {
        let err: OpError = StorageError::Database("disk full".into()).into();
        assert_eq!(err, OpError::Backend("Database error: disk full".into()));
    }

    #[test]
    fn test_invalid_options_become_config_error() {
        let err: OpError = StorageError::InvalidOptions("missing path".into()).into();
        assert!(matches!(err, OpError::Config(msg) if msg == "missing path"));
    }
}
