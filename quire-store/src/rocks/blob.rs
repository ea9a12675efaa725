use async_trait::async_trait;
use quire_core::model::now_millis;
use quire_core::{BlobRecord, BlobStorage, Connection, ListedBlobRecord, StorageError};
use rocksdb::{IteratorMode, WriteBatch};

use super::{cf, db_err, decode_i64, decode_value, encode_value, RocksHandle};
use crate::options::RocksOptions;

const CF_META: &str = "blob_meta";
const CF_DATA: &str = "blob_data";
const CF_DELETED: &str = "blob_deleted";

/// Blob metadata and payloads in separate column families, so listing
/// never reads payloads.
///
/// Soft-deleted blobs stay on disk until `release` runs after
/// `release_grace_ms`.
pub struct RocksBlobStorage {
    handle: RocksHandle,
}

impl RocksBlobStorage {
    pub fn new(options: RocksOptions) -> Self {
        let path = options.path.join("blob");
        Self {
            handle: RocksHandle::new(path, options, &[CF_META, CF_DATA, CF_DELETED]),
        }
    }
}

#[async_trait]
impl Connection for RocksBlobStorage {
    async fn connect(&self) -> Result<(), StorageError> {
        self.handle.open()
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        self.handle.close();
        Ok(())
    }
}

#[async_trait]
impl BlobStorage for RocksBlobStorage {
    async fn get(&self, key: &str) -> Result<Option<BlobRecord>, StorageError> {
        let db = self.handle.db()?;
        let deleted = cf(&db, CF_DELETED)?;
        if db.get_pinned_cf(deleted, key).map_err(db_err)?.is_some() {
            return Ok(None);
        }

        let meta = cf(&db, CF_META)?;
        let Some(meta_bytes) = db.get_cf(meta, key).map_err(db_err)? else {
            return Ok(None);
        };
        let listed: ListedBlobRecord = decode_value(&meta_bytes)?;

        let data = cf(&db, CF_DATA)?;
        let payload = match db.get_cf(data, key).map_err(db_err)? {
            Some(bytes) => lz4_flex::decompress_size_prepended(&bytes)
                .map_err(|e| StorageError::Compression(e.to_string()))?,
            None => {
                log::warn!("Blob {key} has metadata but no payload");
                return Ok(None);
            }
        };

        Ok(Some(BlobRecord {
            key: listed.key,
            data: payload,
            mime: listed.mime,
            size: listed.size,
            created_at: listed.created_at,
        }))
    }

    async fn set(&self, blob: &BlobRecord) -> Result<(), StorageError> {
        let db = self.handle.db()?;
        let mut batch = WriteBatch::default();
        batch.put_cf(
            cf(&db, CF_META)?,
            &blob.key,
            encode_value(&ListedBlobRecord::from(blob))?,
        );
        batch.put_cf(
            cf(&db, CF_DATA)?,
            &blob.key,
            lz4_flex::compress_prepend_size(&blob.data),
        );
        batch.delete_cf(cf(&db, CF_DELETED)?, &blob.key);
        self.handle.write(&db, batch)
    }

    async fn delete(&self, key: &str, permanently: bool) -> Result<(), StorageError> {
        let db = self.handle.db()?;
        let meta = cf(&db, CF_META)?;
        let deleted = cf(&db, CF_DELETED)?;
        let mut batch = WriteBatch::default();

        if permanently {
            batch.delete_cf(meta, key);
            batch.delete_cf(cf(&db, CF_DATA)?, key);
            batch.delete_cf(deleted, key);
        } else {
            let exists = db.get_pinned_cf(meta, key).map_err(db_err)?.is_some();
            let marked = db.get_pinned_cf(deleted, key).map_err(db_err)?.is_some();
            if !exists || marked {
                return Ok(());
            }
            batch.put_cf(deleted, key, now_millis().to_be_bytes());
        }
        self.handle.write(&db, batch)
    }

    async fn release(&self) -> Result<usize, StorageError> {
        let db = self.handle.db()?;
        let meta = cf(&db, CF_META)?;
        let data = cf(&db, CF_DATA)?;
        let deleted = cf(&db, CF_DELETED)?;
        let cutoff = now_millis() - self.handle.options().release_grace_ms;

        let mut batch = WriteBatch::default();
        let mut released = 0;
        for item in db.iterator_cf(deleted, IteratorMode::Start) {
            let (key, value) = item.map_err(db_err)?;
            let deleted_at = decode_i64(&value).unwrap_or(0);
            if deleted_at > cutoff {
                continue;
            }
            batch.delete_cf(meta, &key);
            batch.delete_cf(data, &key);
            batch.delete_cf(deleted, &key);
            released += 1;
        }

        if released > 0 {
            self.handle.write(&db, batch)?;
            log::info!("Released {released} deleted blobs");
        }
        Ok(released)
    }

    async fn list(&self) -> Result<Vec<ListedBlobRecord>, StorageError> {
        let db = self.handle.db()?;
        let meta = cf(&db, CF_META)?;
        let deleted = cf(&db, CF_DELETED)?;

        let mut listed = Vec::new();
        for item in db.iterator_cf(meta, IteratorMode::Start) {
            let (key, value) = item.map_err(db_err)?;
            if db.get_pinned_cf(deleted, &key).map_err(db_err)?.is_some() {
                continue;
            }
            listed.push(decode_value(&value)?);
        }
        Ok(listed)
    }
}
