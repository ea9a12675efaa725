//! Document storage: snapshot + update log.
//!
//! Pushes append to the update log and never touch the snapshot. Reading a
//! document squashes the pending updates into a new snapshot under the
//! per-document lock, then marks exactly those updates merged. An update
//! pushed while a squash is running stays in the log for the next read.
//!
//! Accepted updates are emitted to `SubscribeDocUpdateOp` subscribers before
//! the push returns.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::crdt::{is_empty_bin, Crdt, YrsCrdt};
use crate::error::{OpError, StorageError};
use crate::lock::{Lock, Locker, SingletonLocker};
use crate::model::{DocDiff, DocRecord, DocUpdate, MonotonicClock};
use crate::op::{Emitter, Op, OpConsumer, Subscription};
use crate::storage::ops::{
    DeleteDocOp, DocIdInput, GetDocDiffInput, GetDocDiffOp, GetDocOp, GetDocSnapshotOp,
    GetDocTimestampsOp, PushDocUpdateInput, PushDocUpdateOp, SubscribeDocUpdateOp,
};
use crate::storage::{Connection, StorageService, StorageType};

/// Persistence contract of a document backend.
#[async_trait]
pub trait DocStorage: Connection {
    /// Workspace this storage belongs to.
    fn space_id(&self) -> &str;

    async fn get_doc_snapshot(&self, doc_id: &str) -> Result<Option<DocRecord>, StorageError>;

    /// Conditional write: stores `snapshot` unless the stored one is newer.
    ///
    /// Returns whether the snapshot was written. `prev` is the snapshot the
    /// caller read before squashing.
    async fn set_doc_snapshot(
        &self,
        snapshot: &DocRecord,
        prev: Option<&DocRecord>,
    ) -> Result<bool, StorageError>;

    /// Pending updates in ascending timestamp order.
    async fn get_doc_updates(&self, doc_id: &str) -> Result<Vec<DocUpdate>, StorageError>;

    /// Remove the given updates from the log; returns how many were removed.
    async fn mark_updates_merged(
        &self,
        doc_id: &str,
        updates: &[DocUpdate],
    ) -> Result<usize, StorageError>;

    async fn push_doc_update(&self, update: &DocUpdate) -> Result<(), StorageError>;

    /// Latest timestamp of every document, snapshot or pending update.
    async fn get_doc_timestamps(&self) -> Result<HashMap<String, i64>, StorageError>;

    /// Drop the snapshot and every pending update of a document.
    async fn delete_doc(&self, doc_id: &str) -> Result<(), StorageError>;
}

struct DocInner {
    storage: Arc<dyn DocStorage>,
    crdt: Arc<dyn Crdt>,
    locker: Arc<dyn Locker>,
    clock: MonotonicClock,
    listeners: Mutex<HashMap<u64, Emitter<DocUpdate>>>,
    next_listener: AtomicU64,
}

impl DocInner {
    fn listeners(&self) -> MutexGuard<'_, HashMap<u64, Emitter<DocUpdate>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Document engine over a [`DocStorage`].
#[derive(Clone)]
pub struct DocService {
    inner: Arc<DocInner>,
}

impl DocService {
    pub fn new(storage: Arc<dyn DocStorage>) -> Self {
        Self::with_parts(storage, Arc::new(YrsCrdt), Arc::new(SingletonLocker::new()))
    }

    pub fn with_parts(
        storage: Arc<dyn DocStorage>,
        crdt: Arc<dyn Crdt>,
        locker: Arc<dyn Locker>,
    ) -> Self {
        Self {
            inner: Arc::new(DocInner {
                storage,
                crdt,
                locker,
                clock: MonotonicClock::new(),
                listeners: Mutex::new(HashMap::new()),
                next_listener: AtomicU64::new(0),
            }),
        }
    }

    pub fn storage(&self) -> &Arc<dyn DocStorage> {
        &self.inner.storage
    }

    async fn lock_doc_for_update(&self, doc_id: &str) -> Lock {
        let namespace = format!("workspace:{}:update", self.inner.storage.space_id());
        self.inner.locker.lock(&namespace, doc_id).await
    }

    /// Current document, squashing pending updates into a new snapshot.
    pub async fn get_doc(&self, doc_id: &str) -> Result<Option<DocRecord>, OpError> {
        let _lock = self.lock_doc_for_update(doc_id).await;
        let storage = &self.inner.storage;

        let snapshot = storage.get_doc_snapshot(doc_id).await?;
        let updates = storage.get_doc_updates(doc_id).await?;

        if updates.is_empty() {
            return Ok(snapshot);
        }

        let squashed = self.squash(snapshot.as_ref(), &updates)?;
        if !storage.set_doc_snapshot(&squashed, snapshot.as_ref()).await? {
            // the updates stay pending until a squash of them is stored
            log::warn!(
                "Snapshot of {doc_id}@{} lost to a newer concurrent write",
                squashed.timestamp
            );
            let stored = storage.get_doc_snapshot(doc_id).await?;
            return Ok(Some(self.squash(stored.as_ref(), &updates)?));
        }

        let merged = storage.mark_updates_merged(doc_id, &updates).await?;
        log::debug!(
            "Squashed {merged} updates of {doc_id} into snapshot @{}",
            squashed.timestamp
        );

        Ok(Some(squashed))
    }

    fn squash(
        &self,
        snapshot: Option<&DocRecord>,
        updates: &[DocUpdate],
    ) -> Result<DocRecord, OpError> {
        let last = updates
            .last()
            .ok_or_else(|| OpError::Backend("No updates to be squashed".into()))?;
        // an update can reach the log after a newer one was squashed
        let timestamp = snapshot.map_or(last.timestamp, |s| s.timestamp.max(last.timestamp));

        let bin = match (snapshot, updates) {
            (None, [only]) => only.bin.clone(),
            _ => {
                let bins: Vec<&[u8]> = snapshot
                    .map(|s| s.bin.as_slice())
                    .into_iter()
                    .chain(updates.iter().map(|u| u.bin.as_slice()))
                    .collect();
                self.inner.crdt.merge(&bins)?
            }
        };

        Ok(DocRecord {
            doc_id: last.doc_id.clone(),
            bin,
            timestamp,
            editor: last.editor.clone(),
        })
    }

    /// Delta a peer at `state` is missing, plus the current state vector.
    pub async fn get_doc_diff(
        &self,
        doc_id: &str,
        state: Option<&[u8]>,
    ) -> Result<Option<DocDiff>, OpError> {
        let Some(doc) = self.get_doc(doc_id).await? else {
            return Ok(None);
        };

        let crdt = &self.inner.crdt;
        Ok(Some(DocDiff {
            missing: crdt.diff(&doc.bin, state)?,
            state: crdt.state_vector(&doc.bin)?,
            timestamp: doc.timestamp,
        }))
    }

    /// Append an update to the log. Empty binaries are dropped.
    pub async fn push_doc_update(
        &self,
        input: PushDocUpdateInput,
    ) -> Result<Option<DocUpdate>, OpError> {
        if is_empty_bin(&input.bin) {
            log::debug!("Dropping empty update for {}", input.doc_id);
            return Ok(None);
        }

        let update = DocUpdate {
            doc_id: input.doc_id,
            bin: input.bin,
            timestamp: self.inner.clock.next(),
            editor: input.editor,
        };
        self.inner.storage.push_doc_update(&update).await?;

        let listeners: Vec<_> = self.inner.listeners().values().cloned().collect();
        for listener in listeners {
            listener.emit(&update);
        }
        Ok(Some(update))
    }

    pub async fn get_doc_timestamps(&self) -> Result<HashMap<String, i64>, OpError> {
        Ok(self.inner.storage.get_doc_timestamps().await?)
    }

    pub async fn delete_doc(&self, doc_id: &str) -> Result<(), OpError> {
        let _lock = self.lock_doc_for_update(doc_id).await;
        self.inner.storage.delete_doc(doc_id).await?;
        Ok(())
    }

    /// Emit every update accepted from now on until the subscription drops.
    pub fn on_update(&self, emitter: Emitter<DocUpdate>) -> Subscription {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners().insert(id, emitter);

        let inner: Weak<DocInner> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = inner.upgrade() {
                inner.listeners().remove(&id);
            }
        })
    }
}

#[async_trait]
impl StorageService for DocService {
    fn kind(&self) -> StorageType {
        StorageType::Doc
    }

    async fn connect(&self) -> Result<(), StorageError> {
        let storage = &self.inner.storage;
        storage.connect().await?;

        // stored timestamps may be ahead of this machine's clock
        if let Some(latest) = storage.get_doc_timestamps().await?.into_values().max() {
            self.inner.clock.observe(latest);
            log::debug!("Doc clock resumes after @{latest}");
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), StorageError> {
        self.inner.storage.disconnect().await
    }

    fn register(&self, consumer: &OpConsumer) {
        let this = self.clone();
        consumer.register::<GetDocOp, _, _>(move |input, _| {
            let this = this.clone();
            async move { this.get_doc(&input.doc_id).await }
        });

        let this = self.clone();
        consumer.register::<GetDocDiffOp, _, _>(move |input: GetDocDiffInput, _| {
            let this = this.clone();
            async move { this.get_doc_diff(&input.doc_id, input.state.as_deref()).await }
        });

        let this = self.clone();
        consumer.register::<PushDocUpdateOp, _, _>(move |input, _| {
            let this = this.clone();
            async move { this.push_doc_update(input).await.map(|_| ()) }
        });

        let this = self.clone();
        consumer.register::<GetDocTimestampsOp, _, _>(move |_, _| {
            let this = this.clone();
            async move { this.get_doc_timestamps().await }
        });

        let this = self.clone();
        consumer.register::<DeleteDocOp, _, _>(move |input, _| {
            let this = this.clone();
            async move { this.delete_doc(&input.doc_id).await }
        });

        let this = self.clone();
        consumer.register::<GetDocSnapshotOp, _, _>(move |input: DocIdInput, _| {
            let this = this.clone();
            async move { Ok(this.inner.storage.get_doc_snapshot(&input.doc_id).await?) }
        });

        let this = self.clone();
        consumer.register_subscribable::<SubscribeDocUpdateOp, _>(move |_, emitter, _| {
            Ok(this.on_update(emitter))
        });
    }

    fn unregister(&self, consumer: &OpConsumer) {
        for name in [
            GetDocOp::NAME,
            GetDocDiffOp::NAME,
            PushDocUpdateOp::NAME,
            GetDocTimestampsOp::NAME,
            DeleteDocOp::NAME,
            GetDocSnapshotOp::NAME,
            SubscribeDocUpdateOp::NAME,
        ] {
            consumer.unregister(name);
        }
    }
}
