//! Revision history and rollback.
//!
//! The service never holds the doc engine directly; it reaches it through
//! operations on the consumer it is registered on, so it works with any doc
//! backend registered alongside it.
//!
//! Every accepted doc update records the doc engine's stored snapshot as a
//! history entry. Capture runs in the background; [`StorageService::settle`]
//! waits for the captures already started.

use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinSet;

use crate::crdt::{Crdt, YrsCrdt};
use crate::error::{OpError, StorageError};
use crate::model::{DocRecord, HistoryFilter, ListedHistory};
use crate::op::{Op, OpConsumer, Subscription};
use crate::storage::ops::{
    CreateHistoryOp, DeleteHistoryOp, DocIdInput, GetDocOp, GetDocSnapshotOp, GetHistoryOp,
    HistoryKeyInput, ListHistoryOp, PushDocUpdateInput, PushDocUpdateOp, RollbackDocInput,
    RollbackDocOp, SubscribeDocUpdateOp,
};
use crate::storage::{Connection, StorageService, StorageType};

/// Persistence contract of a history backend.
#[async_trait]
pub trait HistoryStorage: Connection {
    /// Entries of a document, newest first. `before` is exclusive.
    async fn list(
        &self,
        doc_id: &str,
        filter: &HistoryFilter,
    ) -> Result<Vec<ListedHistory>, StorageError>;

    async fn get(&self, doc_id: &str, timestamp: i64) -> Result<Option<DocRecord>, StorageError>;

    /// Store `snapshot` as the entry at its timestamp. Existing entries are kept.
    async fn create(&self, snapshot: &DocRecord) -> Result<(), StorageError>;

    async fn delete(&self, doc_id: &str, timestamp: i64) -> Result<(), StorageError>;
}

struct HistoryInner {
    storage: Arc<dyn HistoryStorage>,
    crdt: Arc<dyn Crdt>,
    capture: Mutex<Option<Subscription>>,
    captures: Mutex<JoinSet<()>>,
}

impl HistoryInner {
    fn captures(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.captures.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// History engine over a [`HistoryStorage`].
#[derive(Clone)]
pub struct HistoryService {
    inner: Arc<HistoryInner>,
}

impl HistoryService {
    pub fn new(storage: Arc<dyn HistoryStorage>) -> Self {
        Self::with_crdt(storage, Arc::new(YrsCrdt))
    }

    pub fn with_crdt(storage: Arc<dyn HistoryStorage>, crdt: Arc<dyn Crdt>) -> Self {
        Self {
            inner: Arc::new(HistoryInner {
                storage,
                crdt,
                capture: Mutex::new(None),
                captures: Mutex::new(JoinSet::new()),
            }),
        }
    }

    pub fn storage(&self) -> &Arc<dyn HistoryStorage> {
        &self.inner.storage
    }

    /// Revert `doc_id` to the content it had at `timestamp`.
    ///
    /// The revert is pushed as a regular update, so both the old and the
    /// current state stay reachable as history entries.
    pub async fn rollback_doc(
        &self,
        input: RollbackDocInput,
        consumer: &OpConsumer,
    ) -> Result<(), OpError> {
        let RollbackDocInput {
            doc_id,
            timestamp,
            editor,
        } = input;

        let target = self
            .inner
            .storage
            .get(&doc_id, timestamp)
            .await?
            .ok_or_else(|| OpError::VersionNotFound {
                doc_id: doc_id.clone(),
                timestamp,
            })?;

        let current = consumer
            .call::<GetDocOp>(DocIdInput::new(doc_id.clone()))
            .await?
            .ok_or_else(|| OpError::CurrentVersionNotFound(doc_id.clone()))?;

        let revert = self.inner.crdt.invert(&current.bin, &target.bin)?;
        consumer
            .call::<PushDocUpdateOp>(PushDocUpdateInput {
                doc_id: doc_id.clone(),
                bin: revert,
                editor,
            })
            .await?;

        // the pre-rollback state stays recoverable
        self.inner.storage.create(&current).await?;
        log::info!(
            "Rolled back {doc_id} from @{} to @{timestamp}",
            current.timestamp
        );
        Ok(())
    }

    /// Record the stored snapshot behind every doc update event.
    fn start_capture(&self, consumer: &OpConsumer) -> Result<Subscription, OpError> {
        let inner = Arc::downgrade(&self.inner);
        let weak = consumer.downgrade();

        consumer.subscribe::<SubscribeDocUpdateOp>((), move |update| {
            let (Some(inner), Some(consumer)) = (inner.upgrade(), weak.upgrade()) else {
                return;
            };
            let storage = inner.storage.clone();
            let mut captures = inner.captures();
            while captures.try_join_next().is_some() {}
            captures.spawn(async move {
                let doc_id = update.doc_id;
                let result = async {
                    if let Some(snapshot) = consumer
                        .call::<GetDocSnapshotOp>(DocIdInput::new(doc_id.clone()))
                        .await?
                    {
                        storage.create(&snapshot).await?;
                    }
                    Ok::<_, OpError>(())
                }
                .await;
                if let Err(e) = result {
                    log::error!("Failed to capture history of {doc_id}: {e}");
                }
            });
        })
    }
}

#[async_trait]
impl StorageService for HistoryService {
    fn kind(&self) -> StorageType {
        StorageType::History
    }

    async fn connect(&self) -> Result<(), StorageError> {
        self.inner.storage.connect().await
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        self.inner.storage.disconnect().await
    }

    fn register(&self, consumer: &OpConsumer) {
        let storage = self.inner.storage.clone();
        consumer.register::<ListHistoryOp, _, _>(move |input, _| {
            let storage = storage.clone();
            async move {
                let filter = input.filter.unwrap_or_default();
                Ok(storage.list(&input.doc_id, &filter).await?)
            }
        });

        let storage = self.inner.storage.clone();
        consumer.register::<GetHistoryOp, _, _>(move |input: HistoryKeyInput, _| {
            let storage = storage.clone();
            async move { Ok(storage.get(&input.doc_id, input.timestamp).await?) }
        });

        let storage = self.inner.storage.clone();
        consumer.register::<CreateHistoryOp, _, _>(move |snapshot: DocRecord, _| {
            let storage = storage.clone();
            async move { Ok(storage.create(&snapshot).await?) }
        });

        let storage = self.inner.storage.clone();
        consumer.register::<DeleteHistoryOp, _, _>(move |input: HistoryKeyInput, _| {
            let storage = storage.clone();
            async move { Ok(storage.delete(&input.doc_id, input.timestamp).await?) }
        });

        let this = self.clone();
        consumer.register::<RollbackDocOp, _, _>(move |input, consumer| {
            let this = this.clone();
            async move { this.rollback_doc(input, &consumer).await }
        });

        match self.start_capture(consumer) {
            Ok(subscription) => {
                let previous = self
                    .inner
                    .capture
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .replace(subscription);
                drop(previous);
            }
            Err(e) => log::warn!("History capture disabled: {e}"),
        }
    }

    fn unregister(&self, consumer: &OpConsumer) {
        for name in [
            ListHistoryOp::NAME,
            GetHistoryOp::NAME,
            CreateHistoryOp::NAME,
            DeleteHistoryOp::NAME,
            RollbackDocOp::NAME,
        ] {
            consumer.unregister(name);
        }
        let capture = self
            .inner
            .capture
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(capture);
    }

    async fn settle(&self) {
        let mut captures = std::mem::take(&mut *self.inner.captures());
        let pending = captures.len();
        while let Some(result) = captures.join_next().await {
            if let Err(e) = result {
                log::warn!("History capture task failed: {e}");
            }
        }
        if pending > 0 {
            log::debug!("Settled {pending} history captures");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::MessageChannel;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct TestHistory {
        entries: Mutex<BTreeMap<(String, i64), DocRecord>>,
    }

    impl Connection for TestHistory {}

    #[async_trait]
    impl HistoryStorage for TestHistory {
        async fn list(
            &self,
            doc_id: &str,
            filter: &HistoryFilter,
        ) -> Result<Vec<ListedHistory>, StorageError> {
            let entries = self.entries.lock().unwrap();
            Ok(entries
                .values()
                .rev()
                .filter(|r| r.doc_id == doc_id)
                .filter(|r| filter.before.map_or(true, |b| r.timestamp < b))
                .take(filter.limit.unwrap_or(usize::MAX))
                .map(|r| ListedHistory {
                    user_id: r.editor.clone(),
                    timestamp: r.timestamp,
                })
                .collect())
        }

        async fn get(&self, doc_id: &str, ts: i64) -> Result<Option<DocRecord>, StorageError> {
            Ok(self.entries.lock().unwrap().get(&(doc_id.to_string(), ts)).cloned())
        }

        async fn create(&self, snapshot: &DocRecord) -> Result<(), StorageError> {
            self.entries
                .lock()
                .unwrap()
                .entry((snapshot.doc_id.clone(), snapshot.timestamp))
                .or_insert_with(|| snapshot.clone());
            Ok(())
        }

        async fn delete(&self, doc_id: &str, ts: i64) -> Result<(), StorageError> {
            self.entries.lock().unwrap().remove(&(doc_id.to_string(), ts));
            Ok(())
        }
    }

    fn consumer() -> OpConsumer {
        let (_near, far) = MessageChannel::pair();
        OpConsumer::new(far)
    }

    fn record(ts: i64) -> DocRecord {
        DocRecord {
            doc_id: "d".into(),
            bin: vec![1, 2, 3],
            timestamp: ts,
            editor: Some("bob".into()),
        }
    }

    #[tokio::test]
    async fn test_rollback_unknown_version() {
        let consumer = consumer();
        let history = HistoryService::new(Arc::new(TestHistory::default()));
        history.register(&consumer);

        let err = consumer
            .call::<RollbackDocOp>(RollbackDocInput {
                doc_id: "d".into(),
                timestamp: 5,
                editor: None,
            })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            OpError::VersionNotFound {
                doc_id: "d".into(),
                timestamp: 5
            }
        );
    }

    #[tokio::test]
    async fn test_rollback_without_current_doc() {
        let consumer = consumer();
        let storage = Arc::new(TestHistory::default());
        storage.create(&record(5)).await.unwrap();
        let history = HistoryService::new(storage);
        history.register(&consumer);
        consumer.register::<GetDocOp, _, _>(|_, _| async move { Ok(None) });

        let err = consumer
            .call::<RollbackDocOp>(RollbackDocInput {
                doc_id: "d".into(),
                timestamp: 5,
                editor: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err, OpError::CurrentVersionNotFound("d".into()));
    }

    #[tokio::test]
    async fn test_create_is_noop_for_existing_entry() {
        let consumer = consumer();
        let storage = Arc::new(TestHistory::default());
        let history = HistoryService::new(storage.clone());
        history.register(&consumer);

        consumer.call::<CreateHistoryOp>(record(1)).await.unwrap();
        let mut changed = record(1);
        changed.bin = vec![9];
        consumer.call::<CreateHistoryOp>(changed).await.unwrap();

        let stored = consumer
            .call::<GetHistoryOp>(HistoryKeyInput {
                doc_id: "d".into(),
                timestamp: 1,
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.bin, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_settle_waits_for_captures_after_unregister() {
        use crate::model::DocUpdate;
        use crate::op::Emitter;
        use std::time::Duration;

        let consumer = consumer();
        let emitters: Arc<Mutex<Vec<Emitter<DocUpdate>>>> = Arc::default();
        {
            let emitters = emitters.clone();
            consumer.register_subscribable::<SubscribeDocUpdateOp, _>(move |_, emitter, _| {
                emitters.lock().unwrap().push(emitter);
                Ok(Subscription::noop())
            });
        }
        // only the snapshot op is served; a squash is never requested
        consumer.register::<GetDocSnapshotOp, _, _>(|input: DocIdInput, _| async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(Some(DocRecord {
                doc_id: input.doc_id,
                ..record(7)
            }))
        });

        let storage = Arc::new(TestHistory::default());
        let history = HistoryService::new(storage.clone());
        history.register(&consumer);

        let update = DocUpdate {
            doc_id: "d".into(),
            bin: vec![1],
            timestamp: 7,
            editor: None,
        };
        for emitter in emitters.lock().unwrap().iter() {
            emitter.emit(&update);
        }

        history.unregister(&consumer);
        history.settle().await;
        assert!(storage.get("d", 7).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_capture_without_doc_engine_is_disabled() {
        let consumer = consumer();
        let history = HistoryService::new(Arc::new(TestHistory::default()));
        history.register(&consumer);
        assert!(history.inner.capture.lock().unwrap().is_none());
        assert!(consumer.is_registered(ListHistoryOp::NAME));

        history.unregister(&consumer);
        assert!(!consumer.is_registered(ListHistoryOp::NAME));
    }
}
