//! Consumer side of the op protocol: dispatch table + in-flight table.
//!
//! Every `op` and `op:subscribe` id is entered into the in-flight table
//! before its handler runs. A request's result is only posted if its entry
//! is still present when the handler finishes, so an `op:cancel` that lands
//! first suppresses the reply. Subscriptions stay in the table until
//! cancelled or until the channel closes.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use tokio::sync::mpsc;

use crate::error::OpError;
use crate::op::channel::{Port, PortSender};
use crate::op::message::{self, OpMessage};
use crate::op::Op;

/// Sink for the encoded values of a subscription.
pub type NextFn = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

type RawHandler =
    Arc<dyn Fn(Vec<u8>, OpConsumer) -> BoxFuture<'static, Result<Vec<u8>, OpError>> + Send + Sync>;
type RawSubscribableHandler =
    Arc<dyn Fn(Vec<u8>, NextFn, OpConsumer) -> Result<Subscription, OpError> + Send + Sync>;

/// Handle on a running subscription source. Dropping it unsubscribes.
pub struct Subscription {
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Subscription with nothing to release.
    pub fn noop() -> Self {
        Self { release: None }
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.release.is_some())
            .finish()
    }
}

/// Typed push side handed to subscribable handlers.
pub struct Emitter<T> {
    sink: NextFn,
    _marker: PhantomData<fn(&T)>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            sink: self.sink.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Serialize> Emitter<T> {
    pub fn new(sink: NextFn) -> Self {
        Self {
            sink,
            _marker: PhantomData,
        }
    }

    pub fn emit(&self, value: &T) {
        match message::encode(value) {
            Ok(bytes) => (self.sink)(bytes),
            Err(e) => log::warn!("Dropping subscription value that failed to encode: {e}"),
        }
    }
}

/// One dispatch of a request id. `token` tells a reused id apart from the
/// dispatch that first used it.
struct InFlight {
    token: u64,
    subscription: Option<Subscription>,
}

struct ConsumerInner {
    handlers: RwLock<HashMap<String, RawHandler>>,
    subscribable: RwLock<HashMap<String, RawSubscribableHandler>>,
    /// Request ids in flight; `subscription` is set for live subscriptions
    processing: Mutex<HashMap<String, InFlight>>,
    next_token: AtomicU64,
    port: PortSender,
}

/// Hosts registered operations and serves them over one channel endpoint.
///
/// Cheap to clone; all clones share one dispatch table.
#[derive(Clone)]
pub struct OpConsumer {
    inner: Arc<ConsumerInner>,
}

/// Non-owning reference to an [`OpConsumer`].
#[derive(Clone)]
pub struct WeakOpConsumer {
    inner: Weak<ConsumerInner>,
}

impl WeakOpConsumer {
    pub fn upgrade(&self) -> Option<OpConsumer> {
        self.inner.upgrade().map(|inner| OpConsumer { inner })
    }
}

impl OpConsumer {
    /// Start serving `port`. Must be called inside a tokio runtime.
    pub fn new(port: Port) -> Self {
        let (sender, incoming) = port.split();
        let consumer = Self {
            inner: Arc::new(ConsumerInner {
                handlers: RwLock::new(HashMap::new()),
                subscribable: RwLock::new(HashMap::new()),
                processing: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(0),
                port: sender,
            }),
        };
        tokio::spawn(consumer.clone().run(incoming));
        consumer
    }

    pub fn downgrade(&self) -> WeakOpConsumer {
        WeakOpConsumer {
            inner: Arc::downgrade(&self.inner),
        }
    }

    // ─── Registration ────────────────────────────────────────────────

    /// Register a typed request handler under `O::NAME`.
    pub fn register<O, F, Fut>(&self, handler: F)
    where
        O: Op,
        F: Fn(O::Input, OpConsumer) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O::Output, OpError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register_raw(O::NAME, move |payload: Vec<u8>, consumer: OpConsumer| {
            let handler = handler.clone();
            async move {
                let input = message::decode::<O::Input>(&payload)?;
                let output = handler(input, consumer).await?;
                message::encode(&output)
            }
        });
    }

    /// Register a request handler on encoded payloads under any name.
    pub fn register_raw<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Vec<u8>, OpConsumer) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<u8>, OpError>> + Send + 'static,
    {
        let raw: RawHandler = Arc::new(move |payload: Vec<u8>, consumer: OpConsumer| {
            handler(payload, consumer).boxed()
        });
        let name = name.into();
        log::debug!("Registered op handler {name}");
        self.inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, raw);
    }

    /// Register a typed subscription handler under `O::NAME`.
    pub fn register_subscribable<O, F>(&self, handler: F)
    where
        O: Op,
        F: Fn(O::Input, Emitter<O::Output>, OpConsumer) -> Result<Subscription, OpError>
            + Send
            + Sync
            + 'static,
    {
        self.register_subscribable_raw(
            O::NAME,
            move |payload: Vec<u8>, next: NextFn, consumer: OpConsumer| {
                let input = message::decode::<O::Input>(&payload)?;
                handler(input, Emitter::new(next), consumer)
            },
        );
    }

    pub fn register_subscribable_raw<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Vec<u8>, NextFn, OpConsumer) -> Result<Subscription, OpError> + Send + Sync + 'static,
    {
        let name = name.into();
        log::debug!("Registered subscribable op handler {name}");
        self.inner
            .subscribable
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, Arc::new(handler));
    }

    /// Remove every handler registered under `name`.
    pub fn unregister(&self, name: &str) -> bool {
        let a = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some();
        let b = self
            .inner
            .subscribable
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some();
        a || b
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
            || self
                .inner
                .subscribable
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .contains_key(name)
    }

    // ─── Local dispatch ──────────────────────────────────────────────

    /// Run a registered operation in-process, bypassing the channel.
    pub async fn call<O: Op>(&self, input: O::Input) -> Result<O::Output, OpError> {
        let payload = message::encode(&input)?;
        let output = self.call_raw(O::NAME, payload).await?;
        message::decode(&output)
    }

    pub async fn call_raw(&self, name: &str, payload: Vec<u8>) -> Result<Vec<u8>, OpError> {
        let handler = self
            .inner
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned();
        let handler = handler.ok_or_else(|| OpError::NotRegistered(name.to_string()))?;
        handler(payload, self.clone()).await
    }

    /// Start a registered subscription in-process.
    pub fn subscribe<O: Op>(
        &self,
        input: O::Input,
        callback: impl Fn(O::Output) + Send + Sync + 'static,
    ) -> Result<Subscription, OpError> {
        let payload = message::encode(&input)?;
        let next: NextFn = Arc::new(move |bytes: Vec<u8>| match message::decode::<O::Output>(&bytes) {
            Ok(value) => callback(value),
            Err(e) => log::warn!("Dropping undecodable {} value: {e}", O::NAME),
        });
        self.subscribe_raw(O::NAME, payload, next)
    }

    pub fn subscribe_raw(
        &self,
        name: &str,
        payload: Vec<u8>,
        next: NextFn,
    ) -> Result<Subscription, OpError> {
        let handler = self
            .inner
            .subscribable
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned();
        let handler = handler.ok_or_else(|| OpError::NotRegistered(name.to_string()))?;
        handler(payload, next, self.clone())
    }

    /// Number of requests and subscriptions currently in flight.
    pub fn in_flight(&self) -> usize {
        self.processing().len()
    }

    // ─── Channel side ────────────────────────────────────────────────

    async fn run(self, mut incoming: mpsc::UnboundedReceiver<Vec<u8>>) {
        while let Some(bytes) = incoming.recv().await {
            match OpMessage::decode(&bytes) {
                Ok(msg) => self.dispatch(msg),
                Err(e) => log::warn!("Consumer dropped undecodable frame: {e}"),
            }
        }

        let abandoned: Vec<_> = self.processing().drain().collect();
        log::debug!(
            "Consumer channel closed with {} entries in flight",
            abandoned.len()
        );
    }

    fn dispatch(&self, msg: OpMessage) {
        match msg {
            OpMessage::Op { id, name, payload } => self.handle_op(id, name, payload),
            OpMessage::Subscribe { id, name, payload } => self.handle_subscribe(id, name, payload),
            OpMessage::Cancel { id } => self.handle_cancel(&id),
            other => log::debug!("Consumer ignoring {} [{}]", other.kind(), other.id()),
        }
    }

    fn handle_op(&self, id: String, name: String, payload: Vec<u8>) {
        let Some(token) = self.begin(&id, None) else {
            return;
        };

        let this = self.clone();
        tokio::spawn(async move {
            let result = this.call_raw(&name, payload).await;
            if let Err(e) = &result {
                log::debug!("Op {name} [{id}] failed: {e}");
            }
            if !this.finish(&id, token) {
                log::debug!("Op {name} [{id}] was cancelled, dropping its result");
                return;
            }
            this.post(&OpMessage::Return { id, result });
        });
    }

    fn handle_subscribe(&self, id: String, name: String, payload: Vec<u8>) {
        if self.processing().contains_key(&id) {
            self.reject_duplicate(id);
            return;
        }

        let port = self.inner.port.clone();
        let next_id = id.clone();
        let next: NextFn = Arc::new(move |value: Vec<u8>| {
            let msg = OpMessage::Next {
                id: next_id.clone(),
                value,
            };
            if let Err(e) = port.post(&msg) {
                log::debug!("Dropping op:next for [{next_id}]: {e}");
            }
        });

        match self.subscribe_raw(&name, payload, next) {
            Ok(subscription) => {
                self.begin(&id, Some(subscription));
            }
            Err(e) => {
                log::warn!("Subscription {name} [{id}] failed: {e}");
                self.post(&OpMessage::Return { id, result: Err(e) });
            }
        }
    }

    fn handle_cancel(&self, id: &str) {
        let entry = self.processing().remove(id);
        match entry.map(|e| e.subscription) {
            Some(Some(subscription)) => subscription.unsubscribe(),
            Some(None) => log::debug!("Cancelled in-flight op [{id}]"),
            None => log::debug!("Ignoring cancel for unknown id [{id}]"),
        }
    }

    /// Enter `id` into the in-flight table and return its dispatch token.
    /// Rejects ids already present.
    fn begin(&self, id: &str, subscription: Option<Subscription>) -> Option<u64> {
        let mut processing = self.processing();
        if processing.contains_key(id) {
            drop(processing);
            self.reject_duplicate(id.to_string());
            return None;
        }
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        processing.insert(id.to_string(), InFlight { token, subscription });
        Some(token)
    }

    /// Remove `id` if it still belongs to the dispatch holding `token`.
    fn finish(&self, id: &str, token: u64) -> bool {
        let mut processing = self.processing();
        match processing.get(id) {
            Some(entry) if entry.token == token => {
                processing.remove(id);
                true
            }
            _ => false,
        }
    }

    fn reject_duplicate(&self, id: String) {
        log::warn!("Rejecting duplicate request id [{id}]");
        self.post(&OpMessage::Return {
            id: id.clone(),
            result: Err(OpError::DuplicateRequest(id)),
        });
    }

    fn post(&self, msg: &OpMessage) {
        if let Err(e) = self.inner.port.post(msg) {
            log::debug!("Consumer could not post {} [{}]: {e}", msg.kind(), msg.id());
        }
    }

    fn processing(&self) -> MutexGuard<'_, HashMap<String, InFlight>> {
        self.inner
            .processing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::channel::MessageChannel;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    crate::define_ops! {
        EchoOp: String => String;
        FailOp: () => ();
        TickOp: u32 => u32;
        SleepOp: u64 => u64;
    }

    fn consumer() -> (OpConsumer, PortSender, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (near, far) = MessageChannel::pair();
        let consumer = OpConsumer::new(far);
        let (tx, rx) = near.split();
        (consumer, tx, rx)
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> OpMessage {
        let bytes = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("reply within timeout")
            .expect("channel open");
        OpMessage::decode(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_local_call() {
        let (consumer, _tx, _rx) = consumer();
        consumer.register::<EchoOp, _, _>(|input, _| async move { Ok(format!("echo:{input}")) });
        let out = consumer.call::<EchoOp>("hi".into()).await.unwrap();
        assert_eq!(out, "echo:hi");
    }

    #[tokio::test]
    async fn test_unregistered_call_fails() {
        let (consumer, _tx, _rx) = consumer();
        let err = consumer.call::<EchoOp>("hi".into()).await.unwrap_err();
        assert_eq!(err, OpError::NotRegistered("EchoOp".into()));
    }

    #[tokio::test]
    async fn test_op_over_channel() {
        let (consumer, tx, mut rx) = consumer();
        consumer.register::<EchoOp, _, _>(|input, _| async move { Ok(input.to_uppercase()) });

        tx.post(&OpMessage::Op {
            id: "1".into(),
            name: "EchoOp".into(),
            payload: message::encode(&"abc".to_string()).unwrap(),
        })
        .unwrap();

        match recv(&mut rx).await {
            OpMessage::Return { id, result } => {
                assert_eq!(id, "1");
                assert_eq!(message::decode::<String>(&result.unwrap()).unwrap(), "ABC");
            }
            other => panic!("expected op:return, got {other:?}"),
        }
        assert_eq!(consumer.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_unregistered_op_returns_error_frame() {
        let (_consumer, tx, mut rx) = consumer();
        tx.post(&OpMessage::Op {
            id: "7".into(),
            name: "Missing".into(),
            payload: Vec::new(),
        })
        .unwrap();

        match recv(&mut rx).await {
            OpMessage::Return { id, result } => {
                assert_eq!(id, "7");
                assert_eq!(result, Err(OpError::NotRegistered("Missing".into())));
            }
            other => panic!("expected op:return, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handler_error_is_returned() {
        let (consumer, tx, mut rx) = consumer();
        consumer.register::<FailOp, _, _>(|_, _| async move {
            Err::<(), _>(OpError::Backend("disk on fire".into()))
        });
        tx.post(&OpMessage::Op {
            id: "1".into(),
            name: "FailOp".into(),
            payload: message::encode(&()).unwrap(),
        })
        .unwrap();

        match recv(&mut rx).await {
            OpMessage::Return { result, .. } => {
                assert_eq!(result, Err(OpError::Backend("disk on fire".into())))
            }
            other => panic!("expected op:return, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_op_result_is_suppressed() {
        let (consumer, tx, mut rx) = consumer();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));
        let finished = Arc::new(AtomicUsize::new(0));

        {
            let finished = finished.clone();
            consumer.register::<EchoOp, _, _>(move |input, _| {
                let release_rx = release_rx.clone();
                let finished = finished.clone();
                async move {
                    if let Some(rx) = release_rx.lock().await.take() {
                        let _ = rx.await;
                    }
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(input)
                }
            });
        }

        tx.post(&OpMessage::Op {
            id: "slow".into(),
            name: "EchoOp".into(),
            payload: message::encode(&"x".to_string()).unwrap(),
        })
        .unwrap();
        tx.post(&OpMessage::Cancel { id: "slow".into() }).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        release_tx.send(()).unwrap();

        // the handler still runs to completion
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 1);

        // but nothing is delivered for it
        tx.post(&OpMessage::Op {
            id: "next".into(),
            name: "EchoOp".into(),
            payload: message::encode(&"y".to_string()).unwrap(),
        })
        .unwrap();
        match recv(&mut rx).await {
            OpMessage::Return { id, .. } => assert_eq!(id, "next"),
            other => panic!("expected op:return, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_reused_id_after_cancel_gets_only_its_own_result() {
        let (consumer, tx, mut rx) = consumer();
        consumer.register::<SleepOp, _, _>(|ms, _| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(ms)
        });

        let sleep = |ms: u64| OpMessage::Op {
            id: "reused".into(),
            name: "SleepOp".into(),
            payload: message::encode(&ms).unwrap(),
        };
        tx.post(&sleep(50)).unwrap();
        tx.post(&OpMessage::Cancel { id: "reused".into() }).unwrap();
        tx.post(&sleep(150)).unwrap();

        // the cancelled dispatch finishes first and must neither reply nor
        // evict the live one
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(consumer.in_flight(), 1);

        match recv(&mut rx).await {
            OpMessage::Return { id, result } => {
                assert_eq!(id, "reused");
                assert_eq!(message::decode::<u64>(&result.unwrap()).unwrap(), 150);
            }
            other => panic!("expected op:return, got {other:?}"),
        }
        assert_eq!(consumer.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cancel_unknown_id_is_noop() {
        let (consumer, tx, mut rx) = consumer();
        consumer.register::<EchoOp, _, _>(|input, _| async move { Ok(input) });

        tx.post(&OpMessage::Cancel { id: "ghost".into() }).unwrap();
        tx.post(&OpMessage::Op {
            id: "1".into(),
            name: "EchoOp".into(),
            payload: message::encode(&"still alive".to_string()).unwrap(),
        })
        .unwrap();

        match recv(&mut rx).await {
            OpMessage::Return { id, result } => {
                assert_eq!(id, "1");
                assert!(result.is_ok());
            }
            other => panic!("expected op:return, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_subscription_streams_until_cancel() {
        let (consumer, tx, mut rx) = consumer();
        let released = Arc::new(AtomicUsize::new(0));
        {
            let released = released.clone();
            consumer.register_subscribable::<TickOp, _>(move |count, emitter, _| {
                for i in 0..count {
                    emitter.emit(&i);
                }
                let released = released.clone();
                Ok(Subscription::new(move || {
                    released.fetch_add(1, Ordering::SeqCst);
                }))
            });
        }

        tx.post(&OpMessage::Subscribe {
            id: "s".into(),
            name: "TickOp".into(),
            payload: message::encode(&3u32).unwrap(),
        })
        .unwrap();

        for expected in 0..3u32 {
            match recv(&mut rx).await {
                OpMessage::Next { id, value } => {
                    assert_eq!(id, "s");
                    assert_eq!(message::decode::<u32>(&value).unwrap(), expected);
                }
                other => panic!("expected op:next, got {other:?}"),
            }
        }

        tx.post(&OpMessage::Cancel { id: "s".into() }).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(consumer.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_unregistered_subscription_reports_error() {
        let (_consumer, tx, mut rx) = consumer();
        tx.post(&OpMessage::Subscribe {
            id: "s".into(),
            name: "TickOp".into(),
            payload: message::encode(&1u32).unwrap(),
        })
        .unwrap();

        match recv(&mut rx).await {
            OpMessage::Return { id, result } => {
                assert_eq!(id, "s");
                assert_eq!(result, Err(OpError::NotRegistered("TickOp".into())));
            }
            other => panic!("expected op:return, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_local_subscribe_decodes_values() {
        let (consumer, _tx, _rx) = consumer();
        consumer.register_subscribable::<TickOp, _>(|count, emitter, _| {
            for i in 0..count {
                emitter.emit(&(i * 10));
            }
            Ok(Subscription::noop())
        });

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = consumer
            .subscribe::<TickOp>(3, move |v| sink.lock().unwrap().push(v))
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![0, 10, 20]);
    }

    #[tokio::test]
    async fn test_unregister_removes_handler() {
        let (consumer, _tx, _rx) = consumer();
        consumer.register::<EchoOp, _, _>(|input, _| async move { Ok(input) });
        assert!(consumer.is_registered("EchoOp"));
        assert!(consumer.unregister("EchoOp"));
        assert!(!consumer.is_registered("EchoOp"));
        assert!(!consumer.unregister("EchoOp"));
    }

    #[tokio::test]
    async fn test_duplicate_in_flight_id_is_rejected() {
        let (consumer, tx, mut rx) = consumer();
        consumer.register_subscribable::<TickOp, _>(|_, _, _| Ok(Subscription::noop()));

        for _ in 0..2 {
            tx.post(&OpMessage::Subscribe {
                id: "dup".into(),
                name: "TickOp".into(),
                payload: message::encode(&0u32).unwrap(),
            })
            .unwrap();
        }

        match recv(&mut rx).await {
            OpMessage::Return { result, .. } => {
                assert_eq!(result, Err(OpError::DuplicateRequest("dup".into())))
            }
            other => panic!("expected op:return, got {other:?}"),
        }
        assert_eq!(consumer.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_channel_close_releases_subscriptions() {
        let (near, far) = MessageChannel::pair();
        let consumer = OpConsumer::new(far);
        let released = Arc::new(AtomicUsize::new(0));
        {
            let released = released.clone();
            consumer.register_subscribable::<TickOp, _>(move |_, _, _| {
                let released = released.clone();
                Ok(Subscription::new(move || {
                    released.fetch_add(1, Ordering::SeqCst);
                }))
            });
        }
        let (tx, rx) = near.split();
        tx.post(&OpMessage::Subscribe {
            id: "s".into(),
            name: "TickOp".into(),
            payload: message::encode(&0u32).unwrap(),
        })
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(consumer.in_flight(), 1);

        drop(tx);
        drop(rx);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
