use async_trait::async_trait;
use quire_core::{Connection, DocRecord, HistoryFilter, HistoryStorage, ListedHistory, StorageError};
use rocksdb::{Direction, IteratorMode, WriteBatch};

use super::{
    cf, db_err, decode_i64, decode_value, encode_value, prefix_key, timestamp_key, RocksHandle,
};
use crate::options::RocksOptions;

const CF_HISTORY: &str = "history";

/// History entries keyed by document and timestamp.
pub struct RocksHistoryStorage {
    handle: RocksHandle,
}

impl RocksHistoryStorage {
    pub fn new(options: RocksOptions) -> Self {
        let path = options.path.join("history");
        Self {
            handle: RocksHandle::new(path, options, &[CF_HISTORY]),
        }
    }
}

#[async_trait]
impl Connection for RocksHistoryStorage {
    async fn connect(&self) -> Result<(), StorageError> {
        self.handle.open()
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        self.handle.close();
        Ok(())
    }
}

#[async_trait]
impl HistoryStorage for RocksHistoryStorage {
    /// Walks the document's range backwards from `before`.
    async fn list(
        &self,
        doc_id: &str,
        filter: &HistoryFilter,
    ) -> Result<Vec<ListedHistory>, StorageError> {
        let db = self.handle.db()?;
        let history = cf(&db, CF_HISTORY)?;
        let prefix = prefix_key(doc_id)?;
        let before = filter.before.unwrap_or(i64::MAX);
        if before <= 0 {
            return Ok(Vec::new());
        }
        let limit = filter.limit.unwrap_or(usize::MAX);
        let start = timestamp_key(doc_id, before)?;
        let mode = IteratorMode::From(start.as_slice(), Direction::Reverse);

        let mut listed = Vec::new();
        for item in db.iterator_cf(history, mode) {
            if listed.len() >= limit {
                break;
            }
            let (key, value) = item.map_err(db_err)?;
            if !key.starts_with(&prefix) {
                break;
            }
            let Some(timestamp) = decode_i64(&key[prefix.len()..]) else {
                continue;
            };
            if timestamp >= before {
                continue;
            }
            let record: DocRecord = decode_value(&value)?;
            listed.push(ListedHistory {
                user_id: record.editor,
                timestamp,
            });
        }
        Ok(listed)
    }

    async fn get(&self, doc_id: &str, timestamp: i64) -> Result<Option<DocRecord>, StorageError> {
        if timestamp < 0 {
            return Ok(None);
        }
        let db = self.handle.db()?;
        let history = cf(&db, CF_HISTORY)?;
        match db
            .get_cf(history, timestamp_key(doc_id, timestamp)?)
            .map_err(db_err)?
        {
            Some(bytes) => Ok(Some(decode_value(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn create(&self, snapshot: &DocRecord) -> Result<(), StorageError> {
        let db = self.handle.db()?;
        let history = cf(&db, CF_HISTORY)?;
        let key = timestamp_key(&snapshot.doc_id, snapshot.timestamp)?;
        if db.get_pinned_cf(history, &key).map_err(db_err)?.is_some() {
            return Ok(());
        }
        let mut batch = WriteBatch::default();
        batch.put_cf(history, key, encode_value(snapshot)?);
        self.handle.write(&db, batch)
    }

    async fn delete(&self, doc_id: &str, timestamp: i64) -> Result<(), StorageError> {
        if timestamp < 0 {
            return Ok(());
        }
        let db = self.handle.db()?;
        let history = cf(&db, CF_HISTORY)?;
        let mut batch = WriteBatch::default();
        batch.delete_cf(history, timestamp_key(doc_id, timestamp)?);
        self.handle.write(&db, batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open() -> (TempDir, RocksHistoryStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = RocksHistoryStorage::new(RocksOptions::for_testing(dir.path()));
        storage.connect().await.unwrap();
        (dir, storage)
    }

    fn snapshot(doc_id: &str, ts: i64) -> DocRecord {
        DocRecord {
            doc_id: doc_id.into(),
            bin: vec![ts as u8],
            timestamp: ts,
            editor: Some(format!("user-{ts}")),
        }
    }

    #[tokio::test]
    async fn test_list_is_newest_first_and_scoped() {
        let (_dir, storage) = open().await;
        for ts in [10, 30, 20] {
            storage.create(&snapshot("doc", ts)).await.unwrap();
        }
        storage.create(&snapshot("doc2", 40)).await.unwrap();

        let listed = storage.list("doc", &HistoryFilter::default()).await.unwrap();
        let ts: Vec<i64> = listed.iter().map(|h| h.timestamp).collect();
        assert_eq!(ts, vec![30, 20, 10]);
        assert_eq!(listed[0].user_id.as_deref(), Some("user-30"));
    }

    #[tokio::test]
    async fn test_list_before_is_exclusive_and_limit_caps() {
        let (_dir, storage) = open().await;
        for ts in [10, 20, 30, 40] {
            storage.create(&snapshot("doc", ts)).await.unwrap();
        }
        let filter = HistoryFilter {
            before: Some(30),
            limit: Some(1),
        };
        let listed = storage.list("doc", &filter).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].timestamp, 20);
    }

    #[tokio::test]
    async fn test_create_keeps_first_entry() {
        let (_dir, storage) = open().await;
        storage.create(&snapshot("doc", 10)).await.unwrap();
        let mut other = snapshot("doc", 10);
        other.bin = vec![99];
        storage.create(&other).await.unwrap();

        assert_eq!(storage.get("doc", 10).await.unwrap().unwrap().bin, vec![10]);
    }

    #[tokio::test]
    async fn test_delete_entry() {
        let (_dir, storage) = open().await;
        storage.create(&snapshot("doc", 10)).await.unwrap();
        storage.delete("doc", 10).await.unwrap();
        assert_eq!(storage.get("doc", 10).await.unwrap(), None);
        assert!(storage
            .list("doc", &HistoryFilter::default())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_negative_timestamp_is_not_clamped_onto_zero() {
        let (_dir, storage) = open().await;
        storage.create(&snapshot("doc", 0)).await.unwrap();

        let err = storage.create(&snapshot("doc", -5)).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey(_)));
        assert_eq!(storage.get("doc", -5).await.unwrap(), None);
        storage.delete("doc", -5).await.unwrap();

        // the entry at 0 is untouched
        assert_eq!(storage.get("doc", 0).await.unwrap().unwrap().bin, vec![0]);
        let before_zero = HistoryFilter {
            before: Some(0),
            limit: None,
        };
        assert!(storage.list("doc", &before_zero).await.unwrap().is_empty());
    }
}
