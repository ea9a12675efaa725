//! Per-document presence rooms.
//!
//! Every document with at least one subscriber gets a tokio broadcast channel.
//! A room whose last subscriber is gone is dropped on the next update.

use async_trait::async_trait;
use quire_core::{AwarenessRecord, AwarenessStorage, Connection, StorageError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

use crate::options::MemoryOptions;

/// Statistics for monitoring awareness fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessStats {
    pub messages_sent: u64,
    /// Updates published to a document nobody listens to
    pub messages_dropped: u64,
    pub active_rooms: usize,
}

type Room = broadcast::Sender<Arc<AwarenessRecord>>;

/// Room manager: maps document ids to broadcast channels.
pub struct AwarenessRooms {
    rooms: Mutex<HashMap<String, Room>>,
    capacity: usize,
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AwarenessRooms {
    /// `capacity` is how many updates a lagging subscriber may fall behind.
    pub fn new(options: MemoryOptions) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            capacity: options.awareness_capacity.max(1),
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }

    fn rooms(&self) -> MutexGuard<'_, HashMap<String, Room>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn room_count(&self) -> usize {
        self.rooms().len()
    }

    pub fn stats(&self) -> AwarenessStats {
        AwarenessStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            active_rooms: self.room_count(),
        }
    }
}

impl Default for AwarenessRooms {
    fn default() -> Self {
        Self::new(MemoryOptions::default())
    }
}

impl Connection for AwarenessRooms {}

#[async_trait]
impl AwarenessStorage for AwarenessRooms {
    async fn update(&self, record: &AwarenessRecord) -> Result<(), StorageError> {
        let mut rooms = self.rooms();
        let delivered = match rooms.get(&record.doc_id) {
            Some(room) => room.send(Arc::new(record.clone())).is_ok(),
            None => false,
        };

        if delivered {
            self.messages_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.messages_dropped.fetch_add(1, Ordering::Relaxed);
            if rooms.remove(&record.doc_id).is_some() {
                log::debug!("Dropped empty awareness room {}", record.doc_id);
            }
        }
        Ok(())
    }

    fn subscribe(
        &self,
        doc_id: &str,
    ) -> Result<broadcast::Receiver<Arc<AwarenessRecord>>, StorageError> {
        let mut rooms = self.rooms();
        let room = rooms
            .entry(doc_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
        Ok(room.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(doc_id: &str, client_id: &str) -> AwarenessRecord {
        AwarenessRecord {
            doc_id: doc_id.into(),
            client_id: client_id.into(),
            bin: vec![1, 2, 3],
        }
    }

    #[tokio::test]
    async fn test_fan_out_to_room_subscribers() {
        let rooms = AwarenessRooms::default();
        let mut rx1 = rooms.subscribe("d").unwrap();
        let mut rx2 = rooms.subscribe("d").unwrap();

        rooms.update(&record("d", "alice")).await.unwrap();

        assert_eq!(rx1.recv().await.unwrap().client_id, "alice");
        assert_eq!(rx2.recv().await.unwrap().client_id, "alice");
        assert_eq!(rooms.stats().messages_sent, 1);
    }

    #[tokio::test]
    async fn test_rooms_are_isolated() {
        let rooms = AwarenessRooms::default();
        let mut rx = rooms.subscribe("a").unwrap();
        let _other = rooms.subscribe("b").unwrap();
        assert_eq!(rooms.room_count(), 2);

        rooms.update(&record("b", "bob")).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_empty_room_is_dropped_on_update() {
        let rooms = AwarenessRooms::default();
        let rx = rooms.subscribe("d").unwrap();
        drop(rx);
        assert_eq!(rooms.room_count(), 1);

        rooms.update(&record("d", "alice")).await.unwrap();
        assert_eq!(rooms.room_count(), 0);
        assert_eq!(rooms.stats().messages_dropped, 1);
    }

    #[tokio::test]
    async fn test_update_without_room_is_not_stored() {
        let rooms = AwarenessRooms::default();
        rooms.update(&record("d", "alice")).await.unwrap();
        let mut rx = rooms.subscribe("d").unwrap();
        assert!(rx.try_recv().is_err());
    }
}
