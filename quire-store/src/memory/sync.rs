use async_trait::async_trait;
use quire_core::{Connection, PeerClock, StorageError, SyncStorage};
use std::collections::HashMap;
use tokio::sync::RwLock;

type Clocks = HashMap<String, HashMap<String, i64>>;

/// Received and pushed clocks, each keyed by peer then document.
#[derive(Debug, Default)]
pub struct MemorySyncStorage {
    received: RwLock<Clocks>,
    pushed: RwLock<Clocks>,
}

impl MemorySyncStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

async fn read(table: &RwLock<Clocks>, peer: &str) -> HashMap<String, i64> {
    table.read().await.get(peer).cloned().unwrap_or_default()
}

async fn write(table: &RwLock<Clocks>, peer: &str, clock: &PeerClock) {
    table
        .write()
        .await
        .entry(peer.to_string())
        .or_default()
        .insert(clock.doc_id.clone(), clock.clock);
}

impl Connection for MemorySyncStorage {}

#[async_trait]
impl SyncStorage for MemorySyncStorage {
    async fn get_peer_clocks(&self, peer: &str) -> Result<HashMap<String, i64>, StorageError> {
        Ok(read(&self.received, peer).await)
    }

    async fn set_peer_clock(&self, peer: &str, clock: &PeerClock) -> Result<(), StorageError> {
        write(&self.received, peer, clock).await;
        Ok(())
    }

    async fn get_peer_pushed_clocks(
        &self,
        peer: &str,
    ) -> Result<HashMap<String, i64>, StorageError> {
        Ok(read(&self.pushed, peer).await)
    }

    async fn set_peer_pushed_clock(
        &self,
        peer: &str,
        clock: &PeerClock,
    ) -> Result<(), StorageError> {
        write(&self.pushed, peer, clock).await;
        Ok(())
    }
}
