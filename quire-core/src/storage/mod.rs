//! Storage contracts and the services that expose them as operations.
//!
//! A concrete backend implements one of the `*Storage` traits. The matching
//! service wraps it, adds the backend-independent behaviour (squash, diff,
//! rollback, event fan-out) and registers its operations on a consumer.

pub mod awareness;
pub mod blob;
pub mod doc;
pub mod history;
pub mod ops;
pub mod sync;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::StorageError;
use crate::op::OpConsumer;

pub use awareness::{AwarenessService, AwarenessStorage};
pub use blob::{BlobService, BlobStorage};
pub use doc::{DocService, DocStorage};
pub use history::{HistoryService, HistoryStorage};
pub use sync::{SyncService, SyncStorage};

/// Kind of a configured storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Doc,
    Sync,
    Blob,
    History,
    Awareness,
}

impl StorageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageType::Doc => "doc",
            StorageType::Sync => "sync",
            StorageType::Blob => "blob",
            StorageType::History => "history",
            StorageType::Awareness => "awareness",
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection lifecycle shared by every backend.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn connect(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// A storage wired into a consumer.
#[async_trait]
pub trait StorageService: Send + Sync {
    fn kind(&self) -> StorageType;

    async fn connect(&self) -> Result<(), StorageError>;

    async fn disconnect(&self) -> Result<(), StorageError>;

    /// Add this storage's operations to `consumer`.
    fn register(&self, consumer: &OpConsumer);

    /// Remove this storage's operations and stop its subscriptions.
    fn unregister(&self, consumer: &OpConsumer);

    /// Wait for background work started by this storage's subscriptions.
    /// Called after `unregister`, while later storages are still registered.
    async fn settle(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_type_serde_names() {
        let parsed: StorageType = serde_json::from_str("\"history\"").unwrap();
        assert_eq!(parsed, StorageType::History);
        assert_eq!(serde_json::to_string(&StorageType::Doc).unwrap(), "\"doc\"");
        assert_eq!(StorageType::Awareness.to_string(), "awareness");
    }

    #[test]
    fn test_storage_type_order_registers_doc_first() {
        let mut kinds = vec![
            StorageType::History,
            StorageType::Awareness,
            StorageType::Doc,
            StorageType::Blob,
        ];
        kinds.sort();
        assert_eq!(kinds.first(), Some(&StorageType::Doc));
        assert!(kinds.iter().position(|k| *k == StorageType::History)
            > kinds.iter().position(|k| *k == StorageType::Doc));
    }
}
