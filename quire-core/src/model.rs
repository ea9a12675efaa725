//! Records exchanged with storages.
//!
//! Timestamps are milliseconds since the Unix epoch. `bin` fields carry
//! opaque CRDT binaries (yrs v1 encoding).

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::SystemTime;

/// Full document state at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocRecord {
    pub doc_id: String,
    pub bin: Vec<u8>,
    pub timestamp: i64,
    pub editor: Option<String>,
}

/// Incremental change not yet folded into the snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocUpdate {
    pub doc_id: String,
    pub bin: Vec<u8>,
    pub timestamp: i64,
    pub editor: Option<String>,
}

impl From<DocUpdate> for DocRecord {
    fn from(u: DocUpdate) -> Self {
        Self {
            doc_id: u.doc_id,
            bin: u.bin,
            timestamp: u.timestamp,
            editor: u.editor,
        }
    }
}

impl From<DocRecord> for DocUpdate {
    fn from(r: DocRecord) -> Self {
        Self {
            doc_id: r.doc_id,
            bin: r.bin,
            timestamp: r.timestamp,
            editor: r.editor,
        }
    }
}

/// Answer to an incremental sync request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocDiff {
    /// Delta the requesting peer is missing
    pub missing: Vec<u8>,
    /// State vector of the current document
    pub state: Vec<u8>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryFilter {
    /// Only entries strictly older than this timestamp
    pub before: Option<i64>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedHistory {
    pub user_id: Option<String>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRecord {
    pub key: String,
    pub data: Vec<u8>,
    pub mime: String,
    pub size: u64,
    pub created_at: i64,
}

/// Blob metadata without the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedBlobRecord {
    pub key: String,
    pub mime: String,
    pub size: u64,
    pub created_at: i64,
}

impl From<&BlobRecord> for ListedBlobRecord {
    fn from(b: &BlobRecord) -> Self {
        Self {
            key: b.key.clone(),
            mime: b.mime.clone(),
            size: b.size,
            created_at: b.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerClock {
    pub doc_id: String,
    pub clock: i64,
}

/// Ephemeral presence payload of one client on one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessRecord {
    pub doc_id: String,
    pub client_id: String,
    pub bin: Vec<u8>,
}

/// Current wall-clock time in milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Strictly increasing millisecond clock.
///
/// Two calls never return the same value, even within one millisecond.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: AtomicI64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> i64 {
        let now = now_millis();
        let prev = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        now.max(prev + 1)
    }

    /// Never hand out a value at or below `timestamp` from now on.
    pub fn observe(&self, timestamp: i64) {
        self.last.fetch_max(timestamp, Ordering::SeqCst);
    }
}
