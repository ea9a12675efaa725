//! Ephemeral per-document presence.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::StorageError;
use crate::model::AwarenessRecord;
use crate::op::{Op, OpConsumer, Subscription};
use crate::storage::ops::{DocIdInput, SubscribeAwarenessOp, UpdateAwarenessOp};
use crate::storage::{Connection, StorageService, StorageType};

/// Fan-out contract of an awareness backend. Nothing is persisted.
#[async_trait]
pub trait AwarenessStorage: Connection {
    /// Publish to the current subscribers of `record.doc_id`.
    async fn update(&self, record: &AwarenessRecord) -> Result<(), StorageError>;

    /// Receiver of updates published on `doc_id` from now on.
    fn subscribe(&self, doc_id: &str)
        -> Result<broadcast::Receiver<Arc<AwarenessRecord>>, StorageError>;
}

#[derive(Clone)]
pub struct AwarenessService {
    storage: Arc<dyn AwarenessStorage>,
}

impl AwarenessService {
    pub fn new(storage: Arc<dyn AwarenessStorage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl StorageService for AwarenessService {
    fn kind(&self) -> StorageType {
        StorageType::Awareness
    }

    async fn connect(&self) -> Result<(), StorageError> {
        self.storage.connect().await
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        self.storage.disconnect().await
    }

    fn register(&self, consumer: &OpConsumer) {
        let storage = self.storage.clone();
        consumer.register::<UpdateAwarenessOp, _, _>(move |record: AwarenessRecord, _| {
            let storage = storage.clone();
            async move { Ok(storage.update(&record).await?) }
        });

        let storage = self.storage.clone();
        consumer.register_subscribable::<SubscribeAwarenessOp, _>(
            move |input: DocIdInput, emitter, _| {
                let mut updates = storage.subscribe(&input.doc_id)?;
                let doc_id = input.doc_id;
                let task = tokio::spawn(async move {
                    loop {
                        match updates.recv().await {
                            Ok(record) => emitter.emit(&record),
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                log::debug!("Awareness subscriber of {doc_id} skipped {n} updates");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                });
                Ok(Subscription::new(move || task.abort()))
            },
        );
    }

    fn unregister(&self, consumer: &OpConsumer) {
        consumer.unregister(UpdateAwarenessOp::NAME);
        consumer.unregister(SubscribeAwarenessOp::NAME);
    }
}
