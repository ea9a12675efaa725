//! In-process client for a storage set.
//!
//! [`PeerStorageClient`] owns both ends of a [`MessageChannel`]: the backend
//! serves one port, the client's producer speaks on the other. Every call goes
//! through the op protocol exactly as it would across a process boundary.

pub mod backend;

use std::collections::HashMap;

use crate::config::PeerStorageOptions;
use crate::error::OpError;
use crate::model::{
    AwarenessRecord, BlobRecord, DocDiff, DocRecord, HistoryFilter, ListedBlobRecord,
    ListedHistory,
};
use crate::op::{MessageChannel, OpProducer, OpSubscription};
use crate::storage::ops::*;

pub use backend::{PeerStorageBackend, StorageInstance, StorageRegistry};

pub struct PeerStorageClient {
    producer: OpProducer,
    backend: PeerStorageBackend,
}

impl PeerStorageClient {
    /// Must be called inside a tokio runtime.
    pub fn new(options: PeerStorageOptions, registry: StorageRegistry) -> Self {
        let (producer_port, consumer_port) = MessageChannel::pair();
        let backend = PeerStorageBackend::new(consumer_port, options, registry);
        Self {
            producer: OpProducer::new(producer_port),
            backend,
        }
    }

    pub fn producer(&self) -> &OpProducer {
        &self.producer
    }

    pub fn backend(&self) -> &PeerStorageBackend {
        &self.backend
    }

    pub async fn connect(&self) -> Result<(), OpError> {
        self.producer.send::<ConnectOp>(()).await
    }

    pub async fn disconnect(&self) -> Result<(), OpError> {
        self.producer.send::<DisconnectOp>(()).await
    }

    pub fn subscribe_connection_status(
        &self,
    ) -> Result<OpSubscription<SubscribeConnectionStatusOp>, OpError> {
        self.producer.subscribe::<SubscribeConnectionStatusOp>(())
    }

    // ─── Doc ─────────────────────────────────────────────────────────

    pub async fn get_doc(&self, doc_id: &str) -> Result<Option<DocRecord>, OpError> {
        self.producer.send::<GetDocOp>(DocIdInput::new(doc_id)).await
    }

    pub async fn get_doc_diff(
        &self,
        doc_id: &str,
        state: Option<Vec<u8>>,
    ) -> Result<Option<DocDiff>, OpError> {
        self.producer
            .send::<GetDocDiffOp>(GetDocDiffInput {
                doc_id: doc_id.to_string(),
                state,
            })
            .await
    }

    pub async fn push_doc_update(
        &self,
        doc_id: &str,
        bin: Vec<u8>,
        editor: Option<String>,
    ) -> Result<(), OpError> {
        self.producer
            .send::<PushDocUpdateOp>(PushDocUpdateInput {
                doc_id: doc_id.to_string(),
                bin,
                editor,
            })
            .await
    }

    pub async fn get_doc_timestamps(&self) -> Result<HashMap<String, i64>, OpError> {
        self.producer.send::<GetDocTimestampsOp>(()).await
    }

    pub async fn delete_doc(&self, doc_id: &str) -> Result<(), OpError> {
        self.producer.send::<DeleteDocOp>(DocIdInput::new(doc_id)).await
    }

    pub fn subscribe_doc_updates(&self) -> Result<OpSubscription<SubscribeDocUpdateOp>, OpError> {
        self.producer.subscribe::<SubscribeDocUpdateOp>(())
    }

    // ─── History ─────────────────────────────────────────────────────

    pub async fn list_history(
        &self,
        doc_id: &str,
        filter: Option<HistoryFilter>,
    ) -> Result<Vec<ListedHistory>, OpError> {
        self.producer
            .send::<ListHistoryOp>(ListHistoryInput {
                doc_id: doc_id.to_string(),
                filter,
            })
            .await
    }

    pub async fn get_history(
        &self,
        doc_id: &str,
        timestamp: i64,
    ) -> Result<Option<DocRecord>, OpError> {
        self.producer
            .send::<GetHistoryOp>(HistoryKeyInput {
                doc_id: doc_id.to_string(),
                timestamp,
            })
            .await
    }

    pub async fn create_history(&self, snapshot: DocRecord) -> Result<(), OpError> {
        self.producer.send::<CreateHistoryOp>(snapshot).await
    }

    pub async fn delete_history(&self, doc_id: &str, timestamp: i64) -> Result<(), OpError> {
        self.producer
            .send::<DeleteHistoryOp>(HistoryKeyInput {
                doc_id: doc_id.to_string(),
                timestamp,
            })
            .await
    }

    pub async fn rollback_doc(
        &self,
        doc_id: &str,
        timestamp: i64,
        editor: Option<String>,
    ) -> Result<(), OpError> {
        self.producer
            .send::<RollbackDocOp>(RollbackDocInput {
                doc_id: doc_id.to_string(),
                timestamp,
                editor,
            })
            .await
    }

    // ─── Blob ────────────────────────────────────────────────────────

    pub async fn get_blob(&self, key: &str) -> Result<Option<BlobRecord>, OpError> {
        self.producer
            .send::<GetBlobOp>(BlobKeyInput {
                key: key.to_string(),
            })
            .await
    }

    pub async fn set_blob(&self, blob: BlobRecord) -> Result<(), OpError> {
        self.producer.send::<SetBlobOp>(blob).await
    }

    pub async fn delete_blob(&self, key: &str, permanently: bool) -> Result<(), OpError> {
        self.producer
            .send::<DeleteBlobOp>(DeleteBlobInput {
                key: key.to_string(),
                permanently,
            })
            .await
    }

    pub async fn release_blobs(&self) -> Result<ReleaseResult, OpError> {
        self.producer.send::<ReleaseBlobsOp>(()).await
    }

    pub async fn list_blobs(&self) -> Result<Vec<ListedBlobRecord>, OpError> {
        self.producer.send::<ListBlobsOp>(()).await
    }

    // ─── Sync ────────────────────────────────────────────────────────

    pub async fn get_peer_clocks(&self, peer: &str) -> Result<HashMap<String, i64>, OpError> {
        self.producer
            .send::<GetPeerClocksOp>(PeerInput {
                peer: peer.to_string(),
            })
            .await
    }

    pub async fn set_peer_clock(&self, peer: &str, doc_id: &str, clock: i64) -> Result<(), OpError> {
        self.producer
            .send::<SetPeerClockOp>(SetPeerClockInput {
                peer: peer.to_string(),
                doc_id: doc_id.to_string(),
                clock,
            })
            .await
    }

    pub async fn get_peer_pushed_clocks(
        &self,
        peer: &str,
    ) -> Result<HashMap<String, i64>, OpError> {
        self.producer
            .send::<GetPeerPushedClocksOp>(PeerInput {
                peer: peer.to_string(),
            })
            .await
    }

    pub async fn set_peer_pushed_clock(
        &self,
        peer: &str,
        doc_id: &str,
        clock: i64,
    ) -> Result<(), OpError> {
        self.producer
            .send::<SetPeerPushedClockOp>(SetPeerClockInput {
                peer: peer.to_string(),
                doc_id: doc_id.to_string(),
                clock,
            })
            .await
    }

    // ─── Awareness ───────────────────────────────────────────────────

    pub async fn update_awareness(&self, record: AwarenessRecord) -> Result<(), OpError> {
        self.producer.send::<UpdateAwarenessOp>(record).await
    }

    pub fn subscribe_awareness(
        &self,
        doc_id: &str,
    ) -> Result<OpSubscription<SubscribeAwarenessOp>, OpError> {
        self.producer
            .subscribe::<SubscribeAwarenessOp>(DocIdInput::new(doc_id))
    }
}
