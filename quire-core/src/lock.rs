//! Per-key mutual exclusion.
//!
//! A [`Lock`] is held until it is dropped, so release happens on every exit
//! path of the holder's scope, including `?` propagation and panics.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;

/// Exclusively held token for one `(namespace, key)` pair.
pub struct Lock {
    guard: Option<Box<dyn Send + Sync>>,
    on_release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Lock {
    /// Wrap any RAII guard as a lock.
    pub fn new(guard: impl Send + Sync + 'static) -> Self {
        Self {
            guard: Some(Box::new(guard)),
            on_release: None,
        }
    }

    /// Run `f` right after the guard is released.
    pub fn on_release(mut self, f: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.on_release = Some(Box::new(f));
        self
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        drop(self.guard.take());
        if let Some(f) = self.on_release.take() {
            f();
        }
    }
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("held", &self.guard.is_some())
            .finish()
    }
}

/// Source of [`Lock`]s.
///
/// Multi-process backends provide their own implementation (e.g. a row
/// lock); in-process callers use [`SingletonLocker`].
#[async_trait]
pub trait Locker: Send + Sync {
    async fn lock(&self, namespace: &str, key: &str) -> Lock;
}

type LockKey = (String, String);
type LockTable = Arc<Mutex<HashMap<LockKey, Arc<tokio::sync::Mutex<()>>>>>;

/// In-memory locker with a first-come-first-served queue per key.
///
/// Entries are removed once nobody holds or waits on them.
#[derive(Default, Clone)]
pub struct SingletonLocker {
    table: LockTable,
}

impl SingletonLocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently held or awaited.
    pub fn active_keys(&self) -> usize {
        self.table.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl Locker for SingletonLocker {
    async fn lock(&self, namespace: &str, key: &str) -> Lock {
        let lock_key = (namespace.to_string(), key.to_string());
        let entry = {
            let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
            table.entry(lock_key.clone()).or_default().clone()
        };

        let guard: OwnedMutexGuard<()> = entry.clone().lock_owned().await;

        let table = self.table.clone();
        Lock::new(guard).on_release(move || {
            let mut table = table.lock().unwrap_or_else(PoisonError::into_inner);
            // the table and `entry` are the last two owners
            if Arc::strong_count(&entry) == 2 {
                table.remove(&lock_key);
            }
        })
    }
}
