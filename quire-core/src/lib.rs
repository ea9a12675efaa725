//! # quire-core: CRDT document storage behind an op protocol
//!
//! Storages for documents, their history, blobs, sync clocks and presence,
//! served as named operations over a duplex message channel.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────┐  op / subscribe    ┌────────────────────┐
//! │ PeerStorageClient │ ─────────────────► │ PeerStorageBackend │
//! │   (OpProducer)    │ ◄───────────────── │    (OpConsumer)    │
//! └───────────────────┘  op:return / next  └─────────┬──────────┘
//!                                                    │ register
//!               ┌──────────┬──────────┬──────────┬───┴──────┐
//!               ▼          ▼          ▼          ▼          ▼
//!          DocService  SyncService BlobService History  Awareness
//!          (squash,                            (rollback,
//!           diff, lock)                         capture)
//! ```
//!
//! ## Modules
//!
//! - [`op`]: message frames, channel, consumer and producer
//! - [`lock`]: per-key scoped locks
//! - [`crdt`]: merge/diff/invert capability over yrs binaries
//! - [`storage`]: storage contracts, services and the op catalogue
//! - [`client`]: peer storage backend, registry and client
//! - [`config`]: JSON storage set description

pub mod client;
pub mod config;
pub mod crdt;
pub mod error;
pub mod lock;
pub mod model;
pub mod op;
pub mod storage;

// Re-exports for convenience
pub use client::{PeerStorageBackend, PeerStorageClient, StorageInstance, StorageRegistry};
pub use config::{PeerStorageOptions, StorageDescriptor};
pub use crdt::{is_empty_bin, Crdt, YrsCrdt};
pub use error::{CrdtError, OpError, StorageError};
pub use lock::{Lock, Locker, SingletonLocker};
pub use model::{
    AwarenessRecord, BlobRecord, DocDiff, DocRecord, DocUpdate, HistoryFilter, ListedBlobRecord,
    ListedHistory, MonotonicClock, PeerClock,
};
pub use op::{MessageChannel, Op, OpConsumer, OpProducer, OpSubscription};
pub use storage::{
    AwarenessStorage, BlobStorage, Connection, DocStorage, HistoryStorage, StorageService,
    StorageType, SyncStorage,
};
