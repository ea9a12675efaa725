//! Consumer side of a storage set: builds every configured storage and
//! serves all of their operations over one channel endpoint.

use futures_util::future::{join_all, try_join_all};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::{watch, Mutex};

use crate::config::{PeerStorageOptions, StorageDescriptor};
use crate::error::{OpError, StorageError};
use crate::op::{OpConsumer, Port, Subscription};
use crate::storage::ops::{ConnectOp, ConnectionStatus, DisconnectOp, SubscribeConnectionStatusOp};
use crate::storage::{
    AwarenessService, AwarenessStorage, BlobService, BlobStorage, DocService, DocStorage,
    HistoryService, HistoryStorage, StorageService, StorageType, SyncService, SyncStorage,
};

/// A constructed backend of any storage kind.
#[derive(Clone)]
pub enum StorageInstance {
    Doc(Arc<dyn DocStorage>),
    History(Arc<dyn HistoryStorage>),
    Blob(Arc<dyn BlobStorage>),
    Sync(Arc<dyn SyncStorage>),
    Awareness(Arc<dyn AwarenessStorage>),
}

impl StorageInstance {
    pub fn kind(&self) -> StorageType {
        match self {
            StorageInstance::Doc(_) => StorageType::Doc,
            StorageInstance::History(_) => StorageType::History,
            StorageInstance::Blob(_) => StorageType::Blob,
            StorageInstance::Sync(_) => StorageType::Sync,
            StorageInstance::Awareness(_) => StorageType::Awareness,
        }
    }

    /// Wrap the backend in the service that exposes its operations.
    pub fn into_service(self) -> Box<dyn StorageService> {
        match self {
            StorageInstance::Doc(s) => Box::new(DocService::new(s)),
            StorageInstance::History(s) => Box::new(HistoryService::new(s)),
            StorageInstance::Blob(s) => Box::new(BlobService::new(s)),
            StorageInstance::Sync(s) => Box::new(SyncService::new(s)),
            StorageInstance::Awareness(s) => Box::new(AwarenessService::new(s)),
        }
    }
}

impl fmt::Debug for StorageInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StorageInstance({})", self.kind())
    }
}

type StorageFactory =
    Arc<dyn Fn(&serde_json::Value) -> Result<StorageInstance, StorageError> + Send + Sync>;

/// Implementations available to a backend, keyed by type and name.
#[derive(Clone, Default)]
pub struct StorageRegistry {
    factories: HashMap<(StorageType, String), StorageFactory>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, kind: StorageType, implementation: impl Into<String>, factory: F)
    where
        F: Fn(&serde_json::Value) -> Result<StorageInstance, StorageError> + Send + Sync + 'static,
    {
        self.factories
            .insert((kind, implementation.into()), Arc::new(factory));
    }

    pub fn contains(&self, kind: StorageType, implementation: &str) -> bool {
        self.factories
            .contains_key(&(kind, implementation.to_string()))
    }

    /// Names registered for `kind`, sorted.
    pub fn implementations(&self, kind: StorageType) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .factories
            .keys()
            .filter(|(k, _)| *k == kind)
            .map(|(_, name)| name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    pub fn create(&self, descriptor: &StorageDescriptor) -> Result<StorageInstance, OpError> {
        let key = (descriptor.kind, descriptor.implementation.clone());
        let factory = self.factories.get(&key).ok_or_else(|| {
            OpError::Config(format!(
                "no `{}` implementation of {} storage",
                descriptor.implementation, descriptor.kind
            ))
        })?;

        let instance = factory(&descriptor.options)?;
        if instance.kind() != descriptor.kind {
            return Err(OpError::Config(format!(
                "`{}` built a {} storage where {} was configured",
                descriptor.implementation,
                instance.kind(),
                descriptor.kind
            )));
        }
        Ok(instance)
    }
}

impl fmt::Debug for StorageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.factories.keys().collect();
        keys.sort();
        f.debug_struct("StorageRegistry").field("factories", &keys).finish()
    }
}

struct BackendInner {
    consumer: OpConsumer,
    options: PeerStorageOptions,
    registry: StorageRegistry,
    services: Mutex<Vec<Box<dyn StorageService>>>,
    status: watch::Sender<ConnectionStatus>,
}

/// Hosts a configured storage set behind one [`OpConsumer`].
#[derive(Clone)]
pub struct PeerStorageBackend {
    inner: Arc<BackendInner>,
}

impl PeerStorageBackend {
    /// Serve `port`. Storages are built on `connect`.
    pub fn new(port: Port, options: PeerStorageOptions, registry: StorageRegistry) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        let backend = Self {
            inner: Arc::new(BackendInner {
                consumer: OpConsumer::new(port),
                options,
                registry,
                services: Mutex::new(Vec::new()),
                status,
            }),
        };
        backend.register_lifecycle();
        backend
    }

    fn register_lifecycle(&self) {
        let consumer = &self.inner.consumer;

        let weak = Arc::downgrade(&self.inner);
        consumer.register::<ConnectOp, _, _>(move |_, _| {
            let backend = upgrade(&weak);
            async move { backend?.connect().await }
        });

        let weak = Arc::downgrade(&self.inner);
        consumer.register::<DisconnectOp, _, _>(move |_, _| {
            let backend = upgrade(&weak);
            async move { backend?.disconnect().await }
        });

        let weak = Arc::downgrade(&self.inner);
        consumer.register_subscribable::<SubscribeConnectionStatusOp, _>(move |_, emitter, _| {
            let mut status = upgrade(&weak)?.inner.status.subscribe();
            let task = tokio::spawn(async move {
                let current = *status.borrow_and_update();
                emitter.emit(&current);
                while status.changed().await.is_ok() {
                    let next = *status.borrow_and_update();
                    emitter.emit(&next);
                }
            });
            Ok(Subscription::new(move || task.abort()))
        });
    }

    pub fn consumer(&self) -> &OpConsumer {
        &self.inner.consumer
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    /// Build, connect and register every configured storage.
    ///
    /// Storages register in type order, so the doc engine is dispatchable
    /// before history starts capturing. Connecting twice is a no-op.
    pub async fn connect(&self) -> Result<(), OpError> {
        let mut services = self.inner.services.lock().await;
        if !services.is_empty() {
            log::debug!("Storage backend already connected");
            return Ok(());
        }

        self.inner.options.validate()?;
        let mut descriptors: Vec<&StorageDescriptor> = self.inner.options.storages.iter().collect();
        descriptors.sort_by_key(|d| d.kind);

        let mut built = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            built.push(self.inner.registry.create(descriptor)?.into_service());
        }

        if let Err(e) = try_join_all(built.iter().map(|s| s.connect())).await {
            log::error!("Failed to connect storages: {e}");
            for result in join_all(built.iter().map(|s| s.disconnect())).await {
                if let Err(e) = result {
                    log::warn!("Teardown after failed connect: {e}");
                }
            }
            return Err(e.into());
        }

        for service in &built {
            service.register(&self.inner.consumer);
            log::info!("Registered {} storage", service.kind());
        }
        *services = built;
        self.inner.status.send_replace(ConnectionStatus::Connected);
        Ok(())
    }

    /// Unregister and disconnect every storage. Safe to call repeatedly.
    ///
    /// Storages unregister in reverse type order and settle one by one, so
    /// history captures still reach the doc engine before it goes away.
    pub async fn disconnect(&self) -> Result<(), OpError> {
        let taken = std::mem::take(&mut *self.inner.services.lock().await);
        if taken.is_empty() {
            return Ok(());
        }

        for service in taken.iter().rev() {
            service.unregister(&self.inner.consumer);
            service.settle().await;
        }

        let mut first_error = None;
        for (service, result) in taken
            .iter()
            .zip(join_all(taken.iter().map(|s| s.disconnect())).await)
        {
            if let Err(e) = result {
                log::error!("Failed to disconnect {} storage: {e}", service.kind());
                first_error.get_or_insert(e);
            }
        }

        self.inner.status.send_replace(ConnectionStatus::Disconnected);
        log::info!("Storage backend disconnected");
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// Kinds of the currently registered storages.
    pub async fn connected_kinds(&self) -> Vec<StorageType> {
        self.inner
            .services
            .lock()
            .await
            .iter()
            .map(|s| s.kind())
            .collect()
    }
}

fn upgrade(weak: &Weak<BackendInner>) -> Result<PeerStorageBackend, OpError> {
    weak.upgrade()
        .map(|inner| PeerStorageBackend { inner })
        .ok_or(OpError::Disconnected)
}
