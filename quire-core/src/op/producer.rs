//! Producer side of the op protocol.
//!
//! Every outgoing request gets a fresh uuid. Replies are routed back by id to
//! a oneshot (requests) or an unbounded queue (subscriptions). When the
//! channel closes, every waiter resolves with [`OpError::Disconnected`].

use futures_util::Stream;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::OpError;
use crate::op::channel::{Port, PortSender};
use crate::op::message::{self, OpMessage};
use crate::op::Op;

type Reply = Result<Vec<u8>, OpError>;

struct ProducerInner {
    port: PortSender,
    pending: Mutex<HashMap<String, oneshot::Sender<Reply>>>,
    subscriptions: Mutex<HashMap<String, mpsc::UnboundedSender<Reply>>>,
}

impl ProducerInner {
    fn pending(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<Reply>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn subscriptions(&self) -> MutexGuard<'_, HashMap<String, mpsc::UnboundedSender<Reply>>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn route(&self, msg: OpMessage) {
        match msg {
            OpMessage::Return { id, result } => {
                let waiter = self.pending().remove(&id);
                if let Some(tx) = waiter {
                    let _ = tx.send(result);
                    return;
                }
                // a subscription that failed to start ends with its error
                let stream = self.subscriptions().remove(&id);
                match stream {
                    Some(tx) => {
                        let _ = tx.send(result);
                    }
                    None => log::debug!("Dropping op:return for unknown id [{id}]"),
                }
            }
            OpMessage::Next { id, value } => {
                let mut subscriptions = self.subscriptions();
                let closed = match subscriptions.get(&id) {
                    Some(tx) => tx.send(Ok(value)).is_err(),
                    None => {
                        log::debug!("Dropping op:next for unknown id [{id}]");
                        false
                    }
                };
                if closed {
                    subscriptions.remove(&id);
                }
            }
            OpMessage::Cancel { id } => {
                if self.subscriptions().remove(&id).is_some() {
                    log::debug!("Subscription [{id}] ended by consumer");
                }
            }
            other => log::debug!("Producer ignoring {} [{}]", other.kind(), other.id()),
        }
    }

    fn close(&self) {
        let pending: Vec<_> = self.pending().drain().collect();
        let streams: Vec<_> = self.subscriptions().drain().collect();
        log::debug!(
            "Producer channel closed with {} pending requests and {} subscriptions",
            pending.len(),
            streams.len()
        );
        for (_, tx) in pending {
            let _ = tx.send(Err(OpError::Disconnected));
        }
        for (_, tx) in streams {
            let _ = tx.send(Err(OpError::Disconnected));
        }
    }
}

/// Issues operations over one channel endpoint.
#[derive(Clone)]
pub struct OpProducer {
    inner: Arc<ProducerInner>,
}

impl OpProducer {
    /// Start listening on `port`. Must be called inside a tokio runtime.
    pub fn new(port: Port) -> Self {
        let (sender, mut incoming) = port.split();
        let inner = Arc::new(ProducerInner {
            port: sender,
            pending: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
        });

        let reader = inner.clone();
        tokio::spawn(async move {
            while let Some(bytes) = incoming.recv().await {
                match OpMessage::decode(&bytes) {
                    Ok(msg) => reader.route(msg),
                    Err(e) => log::warn!("Producer dropped undecodable frame: {e}"),
                }
            }
            reader.close();
        });

        Self { inner }
    }

    /// Send a request and wait for its result.
    pub async fn send<O: Op>(&self, input: O::Input) -> Result<O::Output, OpError> {
        self.start::<O>(input)?.wait().await
    }

    /// Send a request without waiting; the handle can be awaited or cancelled.
    pub fn start<O: Op>(&self, input: O::Input) -> Result<PendingOp<O>, OpError> {
        let payload = message::encode(&input)?;
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.inner.pending().insert(id.clone(), tx);

        let msg = OpMessage::Op {
            id: id.clone(),
            name: O::NAME.to_string(),
            payload,
        };
        if let Err(e) = self.inner.port.post(&msg) {
            self.inner.pending().remove(&id);
            return Err(e);
        }

        Ok(PendingOp {
            id,
            rx,
            producer: self.clone(),
            _op: PhantomData,
        })
    }

    /// Open a subscription. Values arrive in emission order.
    pub fn subscribe<O: Op>(&self, input: O::Input) -> Result<OpSubscription<O>, OpError> {
        let payload = message::encode(&input)?;
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscriptions().insert(id.clone(), tx);

        let msg = OpMessage::Subscribe {
            id: id.clone(),
            name: O::NAME.to_string(),
            payload,
        };
        if let Err(e) = self.inner.port.post(&msg) {
            self.inner.subscriptions().remove(&id);
            return Err(e);
        }

        Ok(OpSubscription {
            id,
            rx,
            producer: self.clone(),
            cancelled: false,
            _op: PhantomData,
        })
    }

    /// Requests still waiting for `op:return`.
    pub fn pending_count(&self) -> usize {
        self.inner.pending().len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.port.is_closed()
    }

    fn post_cancel(&self, id: &str) {
        let msg = OpMessage::Cancel { id: id.to_string() };
        if let Err(e) = self.inner.port.post(&msg) {
            log::debug!("Could not post op:cancel for [{id}]: {e}");
        }
    }
}

/// An in-flight request.
pub struct PendingOp<O: Op> {
    id: String,
    rx: oneshot::Receiver<Reply>,
    producer: OpProducer,
    _op: PhantomData<fn() -> O>,
}

impl<O: Op> PendingOp<O> {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn wait(mut self) -> Result<O::Output, OpError> {
        let bytes = (&mut self.rx).await.map_err(|_| OpError::Disconnected)??;
        message::decode(&bytes)
    }

    /// Give up on the result. The consumer still runs the handler.
    pub fn cancel(self) {
        self.producer.inner.pending().remove(&self.id);
        self.producer.post_cancel(&self.id);
    }
}

impl<O: Op> Drop for PendingOp<O> {
    fn drop(&mut self) {
        self.producer.inner.pending().remove(&self.id);
    }
}

/// A running subscription. Dropping it cancels it.
pub struct OpSubscription<O: Op> {
    id: String,
    rx: mpsc::UnboundedReceiver<Reply>,
    producer: OpProducer,
    cancelled: bool,
    _op: PhantomData<fn() -> O>,
}

impl<O: Op> OpSubscription<O> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next value, or `None` once the subscription has ended.
    pub async fn next(&mut self) -> Option<Result<O::Output, OpError>> {
        let item = self.rx.recv().await?;
        Some(item.and_then(|bytes| message::decode(&bytes)))
    }

    pub fn cancel(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        self.producer.inner.subscriptions().remove(&self.id);
        if !self.producer.is_closed() {
            self.producer.post_cancel(&self.id);
        }
    }
}

impl<O: Op> Stream for OpSubscription<O> {
    type Item = Result<O::Output, OpError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut()
            .rx
            .poll_recv(cx)
            .map(|item| item.map(|reply| reply.and_then(|bytes| message::decode(&bytes))))
    }
}

impl<O: Op> Drop for OpSubscription<O> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::channel::MessageChannel;
    use crate::op::consumer::{OpConsumer, Subscription};
    use futures_util::StreamExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    crate::define_ops! {
        AddOp: (i64, i64) => i64;
        SlowOp: u64 => u64;
        CountOp: u32 => u32;
        MissingOp: () => ();
    }

    fn connected() -> (OpProducer, OpConsumer) {
        let (a, b) = MessageChannel::pair();
        (OpProducer::new(a), OpConsumer::new(b))
    }

    #[tokio::test]
    async fn test_request_reply() {
        let (producer, consumer) = connected();
        consumer.register::<AddOp, _, _>(|(a, b), _| async move { Ok(a + b) });
        assert_eq!(producer.send::<AddOp>((2, 40)).await.unwrap(), 42);
        assert_eq!(producer.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unregistered_op_rejects() {
        let (producer, _consumer) = connected();
        let err = producer.send::<MissingOp>(()).await.unwrap_err();
        assert_eq!(err, OpError::NotRegistered("MissingOp".into()));
    }

    #[tokio::test]
    async fn test_replies_are_matched_by_id() {
        let (producer, consumer) = connected();
        consumer.register::<SlowOp, _, _>(|ms, _| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(ms)
        });

        let slow = producer.start::<SlowOp>(40).unwrap();
        let fast = producer.start::<SlowOp>(1).unwrap();
        assert_ne!(slow.id(), fast.id());
        assert_eq!(fast.wait().await.unwrap(), 1);
        assert_eq!(slow.wait().await.unwrap(), 40);
    }

    #[tokio::test]
    async fn test_cancelled_request_runs_but_reply_is_dropped() {
        let (producer, consumer) = connected();
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let ran = ran.clone();
            consumer.register::<SlowOp, _, _>(move |ms, _| {
                let ran = ran.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(ms)
                }
            });
        }

        let pending = producer.start::<SlowOp>(30).unwrap();
        pending.cancel();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(consumer.in_flight(), 0);
        assert_eq!(producer.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_subscription_values_in_order() {
        let (producer, consumer) = connected();
        consumer.register_subscribable::<CountOp, _>(|n, emitter, _| {
            let task = tokio::spawn(async move {
                for i in 0..n {
                    emitter.emit(&i);
                    tokio::task::yield_now().await;
                }
            });
            Ok(Subscription::new(move || task.abort()))
        });

        let mut sub = producer.subscribe::<CountOp>(5).unwrap();
        let mut seen = Vec::new();
        for _ in 0..5 {
            let v = timeout(Duration::from_secs(2), sub.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            seen.push(v);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_subscription_as_stream() {
        let (producer, consumer) = connected();
        consumer.register_subscribable::<CountOp, _>(|n, emitter, _| {
            for i in 0..n {
                emitter.emit(&(i + 100));
            }
            Ok(Subscription::noop())
        });

        let sub = producer.subscribe::<CountOp>(3).unwrap();
        let values: Vec<u32> = timeout(
            Duration::from_secs(2),
            sub.take(3).map(|v| v.unwrap()).collect::<Vec<_>>(),
        )
        .await
        .unwrap();
        assert_eq!(values, vec![100, 101, 102]);
    }

    #[tokio::test]
    async fn test_dropping_subscription_unsubscribes() {
        let (producer, consumer) = connected();
        let released = Arc::new(AtomicUsize::new(0));
        {
            let released = released.clone();
            consumer.register_subscribable::<CountOp, _>(move |_, _, _| {
                let released = released.clone();
                Ok(Subscription::new(move || {
                    released.fetch_add(1, Ordering::SeqCst);
                }))
            });
        }

        let sub = producer.subscribe::<CountOp>(0).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(consumer.in_flight(), 1);
        drop(sub);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(consumer.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failed_subscription_yields_error_then_ends() {
        let (producer, _consumer) = connected();
        let mut sub = producer.subscribe::<CountOp>(1).unwrap();
        let first = timeout(Duration::from_secs(2), sub.next()).await.unwrap();
        assert_eq!(first, Some(Err(OpError::NotRegistered("CountOp".into()))));
        assert_eq!(sub.next().await, None);
    }

    #[tokio::test]
    async fn test_pending_requests_fail_when_consumer_goes_away() {
        let (a, b) = MessageChannel::pair();
        let producer = OpProducer::new(a);
        let pending = producer.start::<AddOp>((1, 1)).unwrap();
        drop(b);
        assert_eq!(pending.wait().await, Err(OpError::Disconnected));
        assert!(matches!(
            producer.send::<AddOp>((1, 1)).await,
            Err(OpError::Disconnected)
        ));
    }
}
