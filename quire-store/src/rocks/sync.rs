use async_trait::async_trait;
use quire_core::{Connection, PeerClock, StorageError, SyncStorage};
use rocksdb::WriteBatch;
use std::collections::HashMap;

use super::{cf, decode_i64, prefix_key, scan_prefix, split_prefix_key, RocksHandle};
use crate::options::RocksOptions;

const CF_RECEIVED: &str = "received";
const CF_PUSHED: &str = "pushed";

/// Peer clocks keyed by `<peer_key><doc_id>`.
pub struct RocksSyncStorage {
    handle: RocksHandle,
}

impl RocksSyncStorage {
    pub fn new(options: RocksOptions) -> Self {
        let path = options.path.join("sync");
        Self {
            handle: RocksHandle::new(path, options, &[CF_RECEIVED, CF_PUSHED]),
        }
    }

    fn read(&self, table: &str, peer: &str) -> Result<HashMap<String, i64>, StorageError> {
        let db = self.handle.db()?;
        let clocks = cf(&db, table)?;
        let mut out = HashMap::new();
        for (key, value) in scan_prefix(&db, clocks, &prefix_key(peer)?)? {
            let (Some((_, doc_id)), Some(clock)) = (split_prefix_key(&key), decode_i64(&value))
            else {
                continue;
            };
            out.insert(String::from_utf8_lossy(doc_id).into_owned(), clock);
        }
        Ok(out)
    }

    fn write(&self, table: &str, peer: &str, clock: &PeerClock) -> Result<(), StorageError> {
        let db = self.handle.db()?;
        let clocks = cf(&db, table)?;
        let mut key = prefix_key(peer)?;
        key.extend_from_slice(clock.doc_id.as_bytes());

        let mut batch = WriteBatch::default();
        batch.put_cf(clocks, key, clock.clock.to_be_bytes());
        self.handle.write(&db, batch)
    }
}

#[async_trait]
impl Connection for RocksSyncStorage {
    async fn connect(&self) -> Result<(), StorageError> {
        self.handle.open()
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        self.handle.close();
        Ok(())
    }
}

#[async_trait]
impl SyncStorage for RocksSyncStorage {
    async fn get_peer_clocks(&self, peer: &str) -> Result<HashMap<String, i64>, StorageError> {
        self.read(CF_RECEIVED, peer)
    }

    async fn set_peer_clock(&self, peer: &str, clock: &PeerClock) -> Result<(), StorageError> {
        self.write(CF_RECEIVED, peer, clock)
    }

    async fn get_peer_pushed_clocks(
        &self,
        peer: &str,
    ) -> Result<HashMap<String, i64>, StorageError> {
        self.read(CF_PUSHED, peer)
    }

    async fn set_peer_pushed_clock(
        &self,
        peer: &str,
        clock: &PeerClock,
    ) -> Result<(), StorageError> {
        self.write(CF_PUSHED, peer, clock)
    }
}
