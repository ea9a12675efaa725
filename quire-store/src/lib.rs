//! # quire-store: storage backends for quire-core
//!
//! - [`memory`]: map-backed storages for every kind, plus awareness rooms
//! - [`rocks`]: RocksDB storages for documents, history, blobs and clocks
//! - [`registry`]: the built-in [`StorageRegistry`](quire_core::StorageRegistry)
//!
//! ```no_run
//! use quire_core::PeerStorageClient;
//! use quire_store::{default_registry, rocksdb_storages};
//!
//! # async fn run() -> Result<(), quire_core::OpError> {
//! let client = PeerStorageClient::new(rocksdb_storages("quire_data"), default_registry());
//! client.connect().await?;
//! client.push_doc_update("doc-1", vec![0, 0], None).await?;
//! # Ok(())
//! # }
//! ```

pub mod memory;
pub mod options;
pub mod registry;
pub mod rocks;

pub use options::{MemoryOptions, RocksOptions};
pub use registry::{default_registry, memory_storages, rocksdb_storages, MEMORY, ROCKSDB};
