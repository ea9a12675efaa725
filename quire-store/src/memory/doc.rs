use async_trait::async_trait;
use quire_core::{Connection, DocRecord, DocStorage, DocUpdate, StorageError};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use crate::options::MemoryOptions;

/// Snapshots and update logs held in maps.
#[derive(Debug, Default)]
pub struct MemoryDocStorage {
    space_id: String,
    snapshots: RwLock<HashMap<String, DocRecord>>,
    /// Pending updates per document, keyed by timestamp
    updates: RwLock<HashMap<String, BTreeMap<i64, DocUpdate>>>,
}

impl MemoryDocStorage {
    pub fn new(options: MemoryOptions) -> Self {
        Self {
            space_id: options.space_id,
            ..Self::default()
        }
    }

    /// Updates not yet merged into the snapshot of `doc_id`.
    pub async fn pending_updates(&self, doc_id: &str) -> usize {
        self.updates.read().await.get(doc_id).map_or(0, BTreeMap::len)
    }
}

impl Connection for MemoryDocStorage {}

#[async_trait]
impl DocStorage for MemoryDocStorage {
    fn space_id(&self) -> &str {
        &self.space_id
    }

    async fn get_doc_snapshot(&self, doc_id: &str) -> Result<Option<DocRecord>, StorageError> {
        Ok(self.snapshots.read().await.get(doc_id).cloned())
    }

    async fn set_doc_snapshot(
        &self,
        snapshot: &DocRecord,
        _prev: Option<&DocRecord>,
    ) -> Result<bool, StorageError> {
        let mut snapshots = self.snapshots.write().await;
        if let Some(existing) = snapshots.get(&snapshot.doc_id) {
            if existing.timestamp > snapshot.timestamp {
                return Ok(false);
            }
        }
        snapshots.insert(snapshot.doc_id.clone(), snapshot.clone());
        Ok(true)
    }

    async fn get_doc_updates(&self, doc_id: &str) -> Result<Vec<DocUpdate>, StorageError> {
        Ok(self
            .updates
            .read()
            .await
            .get(doc_id)
            .map(|log| log.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn mark_updates_merged(
        &self,
        doc_id: &str,
        updates: &[DocUpdate],
    ) -> Result<usize, StorageError> {
        let mut all = self.updates.write().await;
        let Some(log) = all.get_mut(doc_id) else {
            return Ok(0);
        };
        let merged = updates
            .iter()
            .filter(|u| log.remove(&u.timestamp).is_some())
            .count();
        if log.is_empty() {
            all.remove(doc_id);
        }
        Ok(merged)
    }

    async fn push_doc_update(&self, update: &DocUpdate) -> Result<(), StorageError> {
        self.updates
            .write()
            .await
            .entry(update.doc_id.clone())
            .or_default()
            .insert(update.timestamp, update.clone());
        Ok(())
    }

    async fn get_doc_timestamps(&self) -> Result<HashMap<String, i64>, StorageError> {
        let mut timestamps: HashMap<String, i64> = self
            .snapshots
            .read()
            .await
            .values()
            .map(|s| (s.doc_id.clone(), s.timestamp))
            .collect();
        for (doc_id, log) in self.updates.read().await.iter() {
            if let Some(&latest) = log.keys().next_back() {
                let ts = timestamps.entry(doc_id.clone()).or_insert(latest);
                *ts = (*ts).max(latest);
            }
        }
        Ok(timestamps)
    }

    async fn delete_doc(&self, doc_id: &str) -> Result<(), StorageError> {
        self.snapshots.write().await.remove(doc_id);
        self.updates.write().await.remove(doc_id);
        Ok(())
    }
}
