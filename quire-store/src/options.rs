//! Typed backend options, read from a storage descriptor's `options`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Options of the in-memory backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryOptions {
    /// Workspace the storage belongs to
    pub space_id: String,
    /// Awareness messages buffered per subscriber
    pub awareness_capacity: usize,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            space_id: "default".into(),
            awareness_capacity: 64,
        }
    }
}

/// Options of the RocksDB backends.
///
/// `path` is a root directory; each storage kind opens its own database in
/// a subdirectory named after the kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RocksOptions {
    pub space_id: String,
    /// Database root directory
    pub path: PathBuf,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Block cache size in bytes (default: 256MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 64MB)
    pub write_buffer_size: usize,
    /// How long a soft-deleted blob survives `release` (default: 24h)
    pub release_grace_ms: i64,
}

impl Default for RocksOptions {
    fn default() -> Self {
        Self {
            space_id: "default".into(),
            path: PathBuf::from("quire_data"),
            sync_writes: false,
            block_cache_size: 256 * 1024 * 1024, // 256MB
            bloom_filter_bits: 10,
            max_open_files: 512,
            write_buffer_size: 64 * 1024 * 1024, // 64MB
            release_grace_ms: 24 * 60 * 60 * 1000,
        }
    }
}

impl RocksOptions {
    /// Small caches, no retention, rooted at `path`.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            space_id: "test".into(),
            path: path.into(),
            sync_writes: false,
            block_cache_size: 8 * 1024 * 1024, // 8MB
            bloom_filter_bits: 10,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024, // 4MB
            release_grace_ms: 0,
        }
    }
}
