//! Built-in storage implementations and ready-made storage sets.

use quire_core::config::parse_options;
use quire_core::{
    PeerStorageOptions, StorageDescriptor, StorageInstance, StorageRegistry, StorageType,
};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

use crate::memory::{
    AwarenessRooms, MemoryBlobStorage, MemoryDocStorage, MemoryHistoryStorage, MemorySyncStorage,
};
use crate::options::{MemoryOptions, RocksOptions};
use crate::rocks::{RocksBlobStorage, RocksDocStorage, RocksHistoryStorage, RocksSyncStorage};

pub const MEMORY: &str = "memory";
pub const ROCKSDB: &str = "rocksdb";

/// Registry with `memory` for every kind and `rocksdb` for every
/// persistent kind.
pub fn default_registry() -> StorageRegistry {
    let mut registry = StorageRegistry::new();

    registry.register(StorageType::Doc, MEMORY, |opts| {
        let options: MemoryOptions = parse_options(opts)?;
        Ok(StorageInstance::Doc(Arc::new(MemoryDocStorage::new(options))))
    });
    registry.register(StorageType::History, MEMORY, |_| {
        Ok(StorageInstance::History(Arc::new(MemoryHistoryStorage::new())))
    });
    registry.register(StorageType::Blob, MEMORY, |_| {
        Ok(StorageInstance::Blob(Arc::new(MemoryBlobStorage::new())))
    });
    registry.register(StorageType::Sync, MEMORY, |_| {
        Ok(StorageInstance::Sync(Arc::new(MemorySyncStorage::new())))
    });
    registry.register(StorageType::Awareness, MEMORY, |opts| {
        let options: MemoryOptions = parse_options(opts)?;
        Ok(StorageInstance::Awareness(Arc::new(AwarenessRooms::new(
            options,
        ))))
    });

    registry.register(StorageType::Doc, ROCKSDB, |opts| {
        let options: RocksOptions = parse_options(opts)?;
        Ok(StorageInstance::Doc(Arc::new(RocksDocStorage::new(options))))
    });
    registry.register(StorageType::History, ROCKSDB, |opts| {
        let options: RocksOptions = parse_options(opts)?;
        Ok(StorageInstance::History(Arc::new(
            RocksHistoryStorage::new(options),
        )))
    });
    registry.register(StorageType::Blob, ROCKSDB, |opts| {
        let options: RocksOptions = parse_options(opts)?;
        Ok(StorageInstance::Blob(Arc::new(RocksBlobStorage::new(options))))
    });
    registry.register(StorageType::Sync, ROCKSDB, |opts| {
        let options: RocksOptions = parse_options(opts)?;
        Ok(StorageInstance::Sync(Arc::new(RocksSyncStorage::new(options))))
    });

    registry
}

/// Every storage kind, in memory.
pub fn memory_storages() -> PeerStorageOptions {
    PeerStorageOptions::new(
        [
            StorageType::Doc,
            StorageType::History,
            StorageType::Blob,
            StorageType::Sync,
            StorageType::Awareness,
        ]
        .into_iter()
        .map(|kind| StorageDescriptor::new(kind, MEMORY))
        .collect(),
    )
}

/// Persistent kinds in RocksDB under `path`, awareness in memory.
pub fn rocksdb_storages(path: impl AsRef<Path>) -> PeerStorageOptions {
    let options = json!({ "path": path.as_ref() });
    let mut storages: Vec<StorageDescriptor> = [
        StorageType::Doc,
        StorageType::History,
        StorageType::Blob,
        StorageType::Sync,
    ]
    .into_iter()
    .map(|kind| StorageDescriptor::new(kind, ROCKSDB).with_options(options.clone()))
    .collect();
    storages.push(StorageDescriptor::new(StorageType::Awareness, MEMORY));
    PeerStorageOptions::new(storages)
}
