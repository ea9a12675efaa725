//! RocksDB-backed storages.
//!
//! Each storage kind owns one database under `<path>/<kind>`:
//! ```text
//! doc/      CF "snapshots"  <doc_key>            → DocRecord
//!           CF "updates"    <doc_key><ts:8 BE>   → DocUpdate
//! history/  CF "history"    <doc_key><ts:8 BE>   → DocRecord
//! blob/     CF "blob_meta"  <key>                → ListedBlobRecord
//!           CF "blob_data"  <key>                → bytes
//!           CF "blob_deleted" <key>              → deleted_at:8 BE
//! sync/     CF "received"   <peer_key><doc_id>   → clock:8 BE
//!           CF "pushed"     <peer_key><doc_id>   → clock:8 BE
//! ```
//! `doc_key` is the doc id prefixed with its length (u16 BE), so the
//! entries of one document form a contiguous, timestamp-ordered range.
//! Record values are bincode, LZ4 compressed.

pub mod blob;
pub mod doc;
pub mod history;
pub mod sync;

pub use blob::RocksBlobStorage;
pub use doc::RocksDocStorage;
pub use history::RocksHistoryStorage;
pub use sync::RocksSyncStorage;

use quire_core::StorageError;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType,
    DBWithThreadMode, Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use crate::options::RocksOptions;

pub(crate) type Db = DBWithThreadMode<SingleThreaded>;

pub(crate) fn db_err(e: rocksdb::Error) -> StorageError {
    StorageError::Database(e.to_string())
}

/// Lazily opened database shared by the methods of one storage.
pub(crate) struct RocksHandle {
    path: PathBuf,
    options: RocksOptions,
    column_families: &'static [&'static str],
    db: RwLock<Option<Arc<Db>>>,
}

impl RocksHandle {
    pub(crate) fn new(
        path: PathBuf,
        options: RocksOptions,
        column_families: &'static [&'static str],
    ) -> Self {
        Self {
            path,
            options,
            column_families,
            db: RwLock::new(None),
        }
    }

    pub(crate) fn options(&self) -> &RocksOptions {
        &self.options
    }

    /// Open the database, creating it and its column families if missing.
    pub(crate) fn open(&self) -> Result<(), StorageError> {
        let mut slot = self.db.write().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Ok(());
        }

        std::fs::create_dir_all(&self.path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(self.options.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let descriptors: Vec<ColumnFamilyDescriptor> = self
            .column_families
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, self.cf_options()))
            .collect();

        let db = Db::open_cf_descriptors(&db_opts, &self.path, descriptors).map_err(db_err)?;
        log::info!("Opened RocksDB at {}", self.path.display());
        *slot = Some(Arc::new(db));
        Ok(())
    }

    pub(crate) fn close(&self) {
        let db = self
            .db
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if db.is_some() {
            log::info!("Closed RocksDB at {}", self.path.display());
        }
    }

    fn cf_options(&self) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(self.options.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(self.options.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024); // 16KB blocks
        opts.set_block_based_table_factory(&block_opts);

        // values are LZ4 compressed already
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(self.options.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        opts
    }

    /// The open database, or `NotConnected`.
    pub(crate) fn db(&self) -> Result<Arc<Db>, StorageError> {
        self.db
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(StorageError::NotConnected)
    }

    pub(crate) fn write(&self, db: &Db, batch: WriteBatch) -> Result<(), StorageError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.options.sync_writes);
        db.write_opt(batch, &write_opts).map_err(db_err)
    }
}

/// Column family handle.
pub(crate) fn cf<'a>(db: &'a Db, name: &str) -> Result<&'a ColumnFamily, StorageError> {
    db.cf_handle(name)
        .ok_or_else(|| StorageError::Database(format!("Column family '{name}' not found")))
}

// ─── Keys ────────────────────────────────────────────────────────────

/// `<len:2 BE><id>`. Ids longer than `u16::MAX` bytes have no key.
pub(crate) fn prefix_key(id: &str) -> Result<Vec<u8>, StorageError> {
    let bytes = id.as_bytes();
    let len = u16::try_from(bytes.len()).map_err(|_| {
        StorageError::InvalidKey(format!(
            "id of {} bytes exceeds {} bytes",
            bytes.len(),
            u16::MAX
        ))
    })?;
    let mut key = Vec::with_capacity(2 + bytes.len() + 8);
    key.extend_from_slice(&len.to_be_bytes());
    key.extend_from_slice(bytes);
    Ok(key)
}

/// `<prefix_key(id)><ts:8 BE>`. Only non-negative timestamps sort correctly
/// as big-endian bytes, so negative ones are rejected.
pub(crate) fn timestamp_key(id: &str, timestamp: i64) -> Result<Vec<u8>, StorageError> {
    if timestamp < 0 {
        return Err(StorageError::InvalidKey(format!(
            "negative timestamp {timestamp}"
        )));
    }
    let mut key = prefix_key(id)?;
    key.extend_from_slice(&timestamp.to_be_bytes());
    Ok(key)
}

/// Split a key built by [`prefix_key`] into the id and the remaining bytes.
pub(crate) fn split_prefix_key(key: &[u8]) -> Option<(String, &[u8])> {
    let len_bytes: [u8; 2] = key.get(..2)?.try_into().ok()?;
    let len = u16::from_be_bytes(len_bytes) as usize;
    let id = key.get(2..2 + len)?;
    let rest = key.get(2 + len..)?;
    Some((String::from_utf8_lossy(id).into_owned(), rest))
}

pub(crate) fn decode_i64(bytes: &[u8]) -> Option<i64> {
    let buf: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
    Some(i64::from_be_bytes(buf))
}

/// Every `(key, value)` whose key starts with `prefix`, ascending.
pub(crate) fn scan_prefix(
    db: &Db,
    cf: &ColumnFamily,
    prefix: &[u8],
) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, StorageError> {
    let mut out = Vec::new();
    for item in db.iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward)) {
        let (key, value) = item.map_err(db_err)?;
        if !key.starts_with(prefix) {
            break;
        }
        out.push((key, value));
    }
    Ok(out)
}

// ─── Values ──────────────────────────────────────────────────────────

pub(crate) fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    let bytes = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&bytes))
}

pub(crate) fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StorageError::Compression(e.to_string()))?;
    let (value, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| StorageError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_keys_do_not_collide() {
        // "ab" must not be a key prefix of "abc"
        let ab = prefix_key("ab").unwrap();
        let abc = prefix_key("abc").unwrap();
        assert!(!abc.starts_with(&ab));
    }

    #[test]
    fn test_timestamp_keys_sort_by_time() {
        let early = timestamp_key("doc", 9).unwrap();
        let late = timestamp_key("doc", 10_000).unwrap();
        assert!(early < late);
        assert!(late.starts_with(&prefix_key("doc").unwrap()));
    }

    #[test]
    fn test_unrepresentable_keys_are_rejected() {
        let long = "x".repeat(u16::MAX as usize + 1);
        assert!(matches!(prefix_key(&long), Err(StorageError::InvalidKey(_))));
        assert!(prefix_key(&long[1..]).is_ok());

        assert!(matches!(
            timestamp_key("doc", -1),
            Err(StorageError::InvalidKey(_))
        ));
        assert!(timestamp_key("doc", 0).is_ok());
    }

    #[test]
    fn test_split_prefix_key() {
        let key = timestamp_key("doc-1", 42).unwrap();
        let (id, rest) = split_prefix_key(&key).unwrap();
        assert_eq!(id, "doc-1");
        assert_eq!(decode_i64(rest), Some(42));
        assert!(split_prefix_key(&[0, 9, b'x']).is_none());
    }

    #[test]
    fn test_value_codec() {
        let value = ("doc".to_string(), vec![1u8, 2, 3], 7i64);
        let encoded = encode_value(&value).unwrap();
        let decoded: (String, Vec<u8>, i64) = decode_value(&encoded).unwrap();
        assert_eq!(decoded, value);
        assert!(matches!(
            decode_value::<i64>(&[1, 2]),
            Err(StorageError::Compression(_) | StorageError::Deserialization(_))
        ));
    }

    #[test]
    fn test_handle_requires_open() {
        let dir = tempfile::tempdir().unwrap();
        let handle = RocksHandle::new(
            dir.path().join("db"),
            RocksOptions::for_testing(dir.path()),
            &["one"],
        );
        assert!(matches!(handle.db(), Err(StorageError::NotConnected)));
        handle.open().unwrap();
        assert!(handle.db().is_ok());
        handle.close();
        assert!(matches!(handle.db(), Err(StorageError::NotConnected)));
    }
}
