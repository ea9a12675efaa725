use async_trait::async_trait;
use quire_core::model::now_millis;
use quire_core::{BlobRecord, BlobStorage, Connection, ListedBlobRecord, StorageError};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct Blobs {
    records: HashMap<String, BlobRecord>,
    /// Soft-deleted keys and when they were deleted
    deleted: HashMap<String, i64>,
}

/// Blobs held in a map. `release` drops every soft-deleted blob at once.
#[derive(Debug, Default)]
pub struct MemoryBlobStorage {
    blobs: RwLock<Blobs>,
}

impl MemoryBlobStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Connection for MemoryBlobStorage {}

#[async_trait]
impl BlobStorage for MemoryBlobStorage {
    async fn get(&self, key: &str) -> Result<Option<BlobRecord>, StorageError> {
        let blobs = self.blobs.read().await;
        if blobs.deleted.contains_key(key) {
            return Ok(None);
        }
        Ok(blobs.records.get(key).cloned())
    }

    async fn set(&self, blob: &BlobRecord) -> Result<(), StorageError> {
        let mut blobs = self.blobs.write().await;
        blobs.deleted.remove(&blob.key);
        blobs.records.insert(blob.key.clone(), blob.clone());
        Ok(())
    }

    async fn delete(&self, key: &str, permanently: bool) -> Result<(), StorageError> {
        let mut blobs = self.blobs.write().await;
        if permanently {
            blobs.records.remove(key);
            blobs.deleted.remove(key);
        } else if blobs.records.contains_key(key) {
            blobs.deleted.entry(key.to_string()).or_insert_with(now_millis);
        }
        Ok(())
    }

    async fn release(&self) -> Result<usize, StorageError> {
        let mut blobs = self.blobs.write().await;
        let released: Vec<String> = blobs.deleted.drain().map(|(key, _)| key).collect();
        for key in &released {
            blobs.records.remove(key);
        }
        Ok(released.len())
    }

    async fn list(&self) -> Result<Vec<ListedBlobRecord>, StorageError> {
        let blobs = self.blobs.read().await;
        let mut listed: Vec<ListedBlobRecord> = blobs
            .records
            .values()
            .filter(|b| !blobs.deleted.contains_key(&b.key))
            .map(ListedBlobRecord::from)
            .collect();
        listed.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(listed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob(key: &str) -> BlobRecord {
        BlobRecord {
            key: key.into(),
            data: vec![7; 4],
            mime: "application/octet-stream".into(),
            size: 4,
            created_at: 1,
        }
    }

    #[tokio::test]
    async fn test_soft_delete_hides_until_release() {
        let storage = MemoryBlobStorage::new();
        storage.set(&blob("a")).await.unwrap();
        storage.set(&blob("b")).await.unwrap();

        storage.delete("a", false).await.unwrap();
        assert_eq!(storage.get("a").await.unwrap(), None);
        assert_eq!(storage.list().await.unwrap().len(), 1);

        assert_eq!(storage.release().await.unwrap(), 1);
        assert_eq!(storage.release().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_set_revives_soft_deleted_blob() {
        let storage = MemoryBlobStorage::new();
        storage.set(&blob("a")).await.unwrap();
        storage.delete("a", false).await.unwrap();
        storage.set(&blob("a")).await.unwrap();
        assert!(storage.get("a").await.unwrap().is_some());
        assert_eq!(storage.release().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_permanent_delete() {
        let storage = MemoryBlobStorage::new();
        storage.set(&blob("a")).await.unwrap();
        storage.delete("a", true).await.unwrap();
        assert_eq!(storage.get("a").await.unwrap(), None);
        assert_eq!(storage.release().await.unwrap(), 0);
    }
}
