//! Per-peer synchronization clocks.
//!
//! "Received" and "pushed" clocks are separate tables: what this storage last
//! received from a peer says nothing about what the peer confirmed receiving.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::StorageError;
use crate::model::PeerClock;
use crate::op::{Op, OpConsumer};
use crate::storage::ops::{
    GetPeerClocksOp, GetPeerPushedClocksOp, PeerInput, SetPeerClockInput, SetPeerClockOp,
    SetPeerPushedClockOp,
};
use crate::storage::{Connection, StorageService, StorageType};

#[async_trait]
pub trait SyncStorage: Connection {
    async fn get_peer_clocks(&self, peer: &str) -> Result<HashMap<String, i64>, StorageError>;

    async fn set_peer_clock(&self, peer: &str, clock: &PeerClock) -> Result<(), StorageError>;

    async fn get_peer_pushed_clocks(
        &self,
        peer: &str,
    ) -> Result<HashMap<String, i64>, StorageError>;

    async fn set_peer_pushed_clock(
        &self,
        peer: &str,
        clock: &PeerClock,
    ) -> Result<(), StorageError>;
}

#[derive(Clone)]
pub struct SyncService {
    storage: Arc<dyn SyncStorage>,
}

impl SyncService {
    pub fn new(storage: Arc<dyn SyncStorage>) -> Self {
        Self { storage }
    }
}

fn split(input: SetPeerClockInput) -> (String, PeerClock) {
    (
        input.peer,
        PeerClock {
            doc_id: input.doc_id,
            clock: input.clock,
        },
    )
}

#[async_trait]
impl StorageService for SyncService {
    fn kind(&self) -> StorageType {
        StorageType::Sync
    }

    async fn connect(&self) -> Result<(), StorageError> {
        self.storage.connect().await
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        self.storage.disconnect().await
    }

    fn register(&self, consumer: &OpConsumer) {
        let storage = self.storage.clone();
        consumer.register::<GetPeerClocksOp, _, _>(move |input: PeerInput, _| {
            let storage = storage.clone();
            async move { Ok(storage.get_peer_clocks(&input.peer).await?) }
        });

        let storage = self.storage.clone();
        consumer.register::<SetPeerClockOp, _, _>(move |input, _| {
            let storage = storage.clone();
            async move {
                let (peer, clock) = split(input);
                Ok(storage.set_peer_clock(&peer, &clock).await?)
            }
        });

        let storage = self.storage.clone();
        consumer.register::<GetPeerPushedClocksOp, _, _>(move |input: PeerInput, _| {
            let storage = storage.clone();
            async move { Ok(storage.get_peer_pushed_clocks(&input.peer).await?) }
        });

        let storage = self.storage.clone();
        consumer.register::<SetPeerPushedClockOp, _, _>(move |input, _| {
            let storage = storage.clone();
            async move {
                let (peer, clock) = split(input);
                Ok(storage.set_peer_pushed_clock(&peer, &clock).await?)
            }
        });
    }

    fn unregister(&self, consumer: &OpConsumer) {
        for name in [
            GetPeerClocksOp::NAME,
            SetPeerClockOp::NAME,
            GetPeerPushedClocksOp::NAME,
            SetPeerPushedClockOp::NAME,
        ] {
            consumer.unregister(name);
        }
    }
}
