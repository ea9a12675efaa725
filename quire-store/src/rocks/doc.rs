use async_trait::async_trait;
use quire_core::{Connection, DocRecord, DocStorage, DocUpdate, StorageError};
use rocksdb::WriteBatch;
use std::collections::HashMap;

use super::{
    cf, db_err, decode_i64, decode_value, encode_value, prefix_key, scan_prefix, split_prefix_key,
    timestamp_key, RocksHandle,
};
use crate::options::RocksOptions;

const CF_SNAPSHOTS: &str = "snapshots";
const CF_UPDATES: &str = "updates";

/// Snapshots and update logs in RocksDB.
pub struct RocksDocStorage {
    handle: RocksHandle,
}

impl RocksDocStorage {
    pub fn new(options: RocksOptions) -> Self {
        let path = options.path.join("doc");
        Self {
            handle: RocksHandle::new(path, options, &[CF_SNAPSHOTS, CF_UPDATES]),
        }
    }
}

#[async_trait]
impl Connection for RocksDocStorage {
    async fn connect(&self) -> Result<(), StorageError> {
        self.handle.open()
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        self.handle.close();
        Ok(())
    }
}

#[async_trait]
impl DocStorage for RocksDocStorage {
    fn space_id(&self) -> &str {
        &self.handle.options().space_id
    }

    async fn get_doc_snapshot(&self, doc_id: &str) -> Result<Option<DocRecord>, StorageError> {
        let db = self.handle.db()?;
        let snapshots = cf(&db, CF_SNAPSHOTS)?;
        match db.get_cf(snapshots, prefix_key(doc_id)?).map_err(db_err)? {
            Some(bytes) => Ok(Some(decode_value(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn set_doc_snapshot(
        &self,
        snapshot: &DocRecord,
        _prev: Option<&DocRecord>,
    ) -> Result<bool, StorageError> {
        let db = self.handle.db()?;
        let snapshots = cf(&db, CF_SNAPSHOTS)?;
        let key = prefix_key(&snapshot.doc_id)?;

        if let Some(bytes) = db.get_cf(snapshots, &key).map_err(db_err)? {
            let existing: DocRecord = decode_value(&bytes)?;
            if existing.timestamp > snapshot.timestamp {
                return Ok(false);
            }
        }

        let mut batch = WriteBatch::default();
        batch.put_cf(snapshots, key, encode_value(snapshot)?);
        self.handle.write(&db, batch)?;
        Ok(true)
    }

    async fn get_doc_updates(&self, doc_id: &str) -> Result<Vec<DocUpdate>, StorageError> {
        let db = self.handle.db()?;
        let updates = cf(&db, CF_UPDATES)?;
        scan_prefix(&db, updates, &prefix_key(doc_id)?)?
            .iter()
            .map(|(_, value)| decode_value(value))
            .collect()
    }

    async fn mark_updates_merged(
        &self,
        doc_id: &str,
        updates: &[DocUpdate],
    ) -> Result<usize, StorageError> {
        let db = self.handle.db()?;
        let log = cf(&db, CF_UPDATES)?;

        let mut batch = WriteBatch::default();
        let mut merged = 0;
        for update in updates {
            let key = timestamp_key(doc_id, update.timestamp)?;
            if db.get_pinned_cf(log, &key).map_err(db_err)?.is_some() {
                batch.delete_cf(log, key);
                merged += 1;
            }
        }
        if merged > 0 {
            self.handle.write(&db, batch)?;
        }
        Ok(merged)
    }

    async fn push_doc_update(&self, update: &DocUpdate) -> Result<(), StorageError> {
        let db = self.handle.db()?;
        let log = cf(&db, CF_UPDATES)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(
            log,
            timestamp_key(&update.doc_id, update.timestamp)?,
            encode_value(update)?,
        );
        self.handle.write(&db, batch)
    }

    async fn get_doc_timestamps(&self) -> Result<HashMap<String, i64>, StorageError> {
        let db = self.handle.db()?;
        let mut timestamps = HashMap::new();

        let snapshots = cf(&db, CF_SNAPSHOTS)?;
        for item in db.iterator_cf(snapshots, rocksdb::IteratorMode::Start) {
            let (_, value) = item.map_err(db_err)?;
            let record: DocRecord = decode_value(&value)?;
            timestamps.insert(record.doc_id, record.timestamp);
        }

        // Update timestamps live in the keys, no need to decode values.
        let updates = cf(&db, CF_UPDATES)?;
        for item in db.iterator_cf(updates, rocksdb::IteratorMode::Start) {
            let (key, _) = item.map_err(db_err)?;
            let Some((doc_id, rest)) = split_prefix_key(&key) else {
                log::warn!("Skipping malformed update key ({} bytes)", key.len());
                continue;
            };
            if let Some(ts) = decode_i64(rest) {
                let latest = timestamps.entry(doc_id).or_insert(ts);
                *latest = (*latest).max(ts);
            }
        }

        Ok(timestamps)
    }

    async fn delete_doc(&self, doc_id: &str) -> Result<(), StorageError> {
        let db = self.handle.db()?;
        let snapshots = cf(&db, CF_SNAPSHOTS)?;
        let updates = cf(&db, CF_UPDATES)?;
        let prefix = prefix_key(doc_id)?;

        let mut batch = WriteBatch::default();
        batch.delete_cf(snapshots, &prefix);
        for (key, _) in scan_prefix(&db, updates, &prefix)? {
            batch.delete_cf(updates, key);
        }
        self.handle.write(&db, batch)
    }
}
