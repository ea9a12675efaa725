//! Binary attachments keyed by name.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::StorageError;
use crate::model::{BlobRecord, ListedBlobRecord};
use crate::op::{Op, OpConsumer};
use crate::storage::ops::{
    BlobKeyInput, DeleteBlobInput, DeleteBlobOp, GetBlobOp, ListBlobsOp, ReleaseBlobsOp,
    ReleaseResult, SetBlobOp,
};
use crate::storage::{Connection, StorageService, StorageType};

/// Persistence contract of a blob backend.
///
/// A soft-deleted blob is hidden from `get` and `list` until `release`
/// removes it for good, or a `set` on the same key revives it.
#[async_trait]
pub trait BlobStorage: Connection {
    async fn get(&self, key: &str) -> Result<Option<BlobRecord>, StorageError>;

    async fn set(&self, blob: &BlobRecord) -> Result<(), StorageError>;

    async fn delete(&self, key: &str, permanently: bool) -> Result<(), StorageError>;

    /// Remove soft-deleted blobs past the retention policy; returns the count.
    async fn release(&self) -> Result<usize, StorageError>;

    /// Metadata of every live blob.
    async fn list(&self) -> Result<Vec<ListedBlobRecord>, StorageError>;
}

#[derive(Clone)]
pub struct BlobService {
    storage: Arc<dyn BlobStorage>,
}

impl BlobService {
    pub fn new(storage: Arc<dyn BlobStorage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl StorageService for BlobService {
    fn kind(&self) -> StorageType {
        StorageType::Blob
    }

    async fn connect(&self) -> Result<(), StorageError> {
        self.storage.connect().await
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        self.storage.disconnect().await
    }

    fn register(&self, consumer: &OpConsumer) {
        let storage = self.storage.clone();
        consumer.register::<GetBlobOp, _, _>(move |input: BlobKeyInput, _| {
            let storage = storage.clone();
            async move { Ok(storage.get(&input.key).await?) }
        });

        let storage = self.storage.clone();
        consumer.register::<SetBlobOp, _, _>(move |blob: BlobRecord, _| {
            let storage = storage.clone();
            async move { Ok(storage.set(&blob).await?) }
        });

        let storage = self.storage.clone();
        consumer.register::<DeleteBlobOp, _, _>(move |input: DeleteBlobInput, _| {
            let storage = storage.clone();
            async move { Ok(storage.delete(&input.key, input.permanently).await?) }
        });

        let storage = self.storage.clone();
        consumer.register::<ReleaseBlobsOp, _, _>(move |_, _| {
            let storage = storage.clone();
            async move {
                let count = storage.release().await?;
                if count > 0 {
                    log::info!("Released {count} blobs");
                }
                Ok(ReleaseResult { count })
            }
        });

        let storage = self.storage.clone();
        consumer.register::<ListBlobsOp, _, _>(move |_, _| {
            let storage = storage.clone();
            async move { Ok(storage.list().await?) }
        });
    }

    fn unregister(&self, consumer: &OpConsumer) {
        for name in [
            GetBlobOp::NAME,
            SetBlobOp::NAME,
            DeleteBlobOp::NAME,
            ReleaseBlobsOp::NAME,
            ListBlobsOp::NAME,
        ] {
            consumer.unregister(name);
        }
    }
}
