use async_trait::async_trait;
use quire_core::{Connection, DocRecord, HistoryFilter, HistoryStorage, ListedHistory, StorageError};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// History entries per document, ordered by timestamp.
#[derive(Debug, Default)]
pub struct MemoryHistoryStorage {
    entries: RwLock<HashMap<String, BTreeMap<i64, DocRecord>>>,
}

impl MemoryHistoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Connection for MemoryHistoryStorage {}

#[async_trait]
impl HistoryStorage for MemoryHistoryStorage {
    async fn list(
        &self,
        doc_id: &str,
        filter: &HistoryFilter,
    ) -> Result<Vec<ListedHistory>, StorageError> {
        let entries = self.entries.read().await;
        let Some(doc) = entries.get(doc_id) else {
            return Ok(Vec::new());
        };
        let upper = filter.before.unwrap_or(i64::MAX);
        Ok(doc
            .range(..upper)
            .rev()
            .take(filter.limit.unwrap_or(usize::MAX))
            .map(|(ts, record)| ListedHistory {
                user_id: record.editor.clone(),
                timestamp: *ts,
            })
            .collect())
    }

    async fn get(&self, doc_id: &str, timestamp: i64) -> Result<Option<DocRecord>, StorageError> {
        Ok(self
            .entries
            .read()
            .await
            .get(doc_id)
            .and_then(|doc| doc.get(&timestamp))
            .cloned())
    }

    async fn create(&self, snapshot: &DocRecord) -> Result<(), StorageError> {
        self.entries
            .write()
            .await
            .entry(snapshot.doc_id.clone())
            .or_default()
            .entry(snapshot.timestamp)
            .or_insert_with(|| snapshot.clone());
        Ok(())
    }

    async fn delete(&self, doc_id: &str, timestamp: i64) -> Result<(), StorageError> {
        let mut entries = self.entries.write().await;
        if let Some(doc) = entries.get_mut(doc_id) {
            doc.remove(&timestamp);
            if doc.is_empty() {
                entries.remove(doc_id);
            }
        }
        Ok(())
    }
}
