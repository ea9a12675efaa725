//! Operation catalogue. The struct name of each op is its dispatch key.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::define_ops;
use crate::model::{
    AwarenessRecord, BlobRecord, DocDiff, DocRecord, DocUpdate, HistoryFilter, ListedBlobRecord,
    ListedHistory,
};
use crate::op::Op;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocIdInput {
    pub doc_id: String,
}

impl DocIdInput {
    pub fn new(doc_id: impl Into<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetDocDiffInput {
    pub doc_id: String,
    /// State vector of the requesting peer
    pub state: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushDocUpdateInput {
    pub doc_id: String,
    pub bin: Vec<u8>,
    pub editor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListHistoryInput {
    pub doc_id: String,
    pub filter: Option<HistoryFilter>,
}

/// Addresses one history entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryKeyInput {
    pub doc_id: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackDocInput {
    pub doc_id: String,
    pub timestamp: i64,
    pub editor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobKeyInput {
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteBlobInput {
    pub key: String,
    pub permanently: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseResult {
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInput {
    pub peer: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetPeerClockInput {
    pub peer: String,
    pub doc_id: String,
    pub clock: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

define_ops! {
    // Doc
    GetDocOp: DocIdInput => Option<DocRecord>;
    GetDocDiffOp: GetDocDiffInput => Option<DocDiff>;
    PushDocUpdateOp: PushDocUpdateInput => ();
    GetDocTimestampsOp: () => HashMap<String, i64>;
    DeleteDocOp: DocIdInput => ();
    /// Stored snapshot without squashing pending updates.
    GetDocSnapshotOp: DocIdInput => Option<DocRecord>;
    /// Emits every accepted update.
    SubscribeDocUpdateOp: () => DocUpdate;

    // History
    ListHistoryOp: ListHistoryInput => Vec<ListedHistory>;
    GetHistoryOp: HistoryKeyInput => Option<DocRecord>;
    CreateHistoryOp: DocRecord => ();
    DeleteHistoryOp: HistoryKeyInput => ();
    RollbackDocOp: RollbackDocInput => ();

    // Blob
    GetBlobOp: BlobKeyInput => Option<BlobRecord>;
    SetBlobOp: BlobRecord => ();
    DeleteBlobOp: DeleteBlobInput => ();
    ReleaseBlobsOp: () => ReleaseResult;
    ListBlobsOp: () => Vec<ListedBlobRecord>;

    // Sync
    GetPeerClocksOp: PeerInput => HashMap<String, i64>;
    SetPeerClockOp: SetPeerClockInput => ();
    GetPeerPushedClocksOp: PeerInput => HashMap<String, i64>;
    SetPeerPushedClockOp: SetPeerClockInput => ();

    // Awareness
    UpdateAwarenessOp: AwarenessRecord => ();
    /// Emits awareness updates of one document.
    SubscribeAwarenessOp: DocIdInput => AwarenessRecord;

    // Backend
    SubscribeConnectionStatusOp: () => ConnectionStatus;
}

/// Connect every configured storage.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectOp;

impl Op for ConnectOp {
    const NAME: &'static str = "connect";
    type Input = ();
    type Output = ();
}

/// Unregister and tear down every connected storage.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisconnectOp;

impl Op for DisconnectOp {
    const NAME: &'static str = "disconnect";
    type Input = ();
    type Output = ();
}
