//! In-process broker.
//!
//! Implements the full [`Connection`] contract without a network: pub/sub topics acknowledge
//! subscribe and unsubscribe with subscriber counts, work queues hand every item to exactly one
//! blocked consumer in FIFO order, and [`MemoryBroker::sever`] drops every connection at once so
//! failure paths can be exercised. [`MemoryBroker::reject_next`] makes individual commands fail
//! while the connection stays usable. When built with [`MemoryBroker::with_journal`] every command
//! is recorded in order.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{BrokerError, Connection, Connector, PubSubEvent, PubSubReceiver, PubSubSender};
use crate::topic::Topic;

/// Kind of a recorded broker command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JournalOp {
    Subscribe,
    Unsubscribe,
    Publish,
    Push,
    Pop,
}

/// One recorded broker command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub op: JournalOp,
    pub topic: Topic,
    pub payload: Option<Bytes>,
}

struct Subscriber {
    connection_id: u64,
    events: PubSubSender,
}

struct WorkQueue {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    len: AtomicUsize,
}

impl WorkQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            len: AtomicUsize::new(0),
        }
    }
}

struct BrokerState {
    channels: DashMap<Topic, Vec<Subscriber>, ahash::RandomState>,
    queues: DashMap<Topic, Arc<WorkQueue>, ahash::RandomState>,
    severed: CancellationToken,
    next_connection_id: AtomicU64,
    connections_opened: AtomicUsize,
    rejections: DashMap<JournalOp, usize, ahash::RandomState>,
    journal: Option<Mutex<Vec<JournalEntry>>>,
}

impl BrokerState {
    fn reject(&self, op: JournalOp) -> Result<(), BrokerError> {
        match self.rejections.get_mut(&op) {
            Some(mut remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(BrokerError::Rejected(format!("{op:?} rejected")))
            }
            _ => Ok(()),
        }
    }

    fn record(&self, op: JournalOp, topic: &Topic, payload: Option<&Bytes>) {
        if let Some(journal) = &self.journal {
            journal
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(JournalEntry {
                    op,
                    topic: topic.clone(),
                    payload: payload.cloned(),
                });
        }
    }

    fn queue(&self, topic: &Topic) -> Arc<WorkQueue> {
        Arc::clone(
            self.queues
                .entry(topic.clone())
                .or_insert_with(|| Arc::new(WorkQueue::new()))
                .value(),
        )
    }

    fn remove_subscriber(&self, topic: &Topic, connection_id: u64) {
        if let Some(mut subscribers) = self.channels.get_mut(topic) {
            subscribers.retain(|s| s.connection_id != connection_id);
        }
        self.channels.remove_if(topic, |_, subscribers| subscribers.is_empty());
    }
}

/// Shared handle to an in-process broker. Clones refer to the same broker.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::build(false)
    }

    /// A broker that records every command it receives, see [`MemoryBroker::journal`].
    pub fn with_journal() -> Self {
        Self::build(true)
    }

    fn build(journal: bool) -> Self {
        Self {
            state: Arc::new(BrokerState {
                channels: DashMap::default(),
                queues: DashMap::default(),
                severed: CancellationToken::new(),
                next_connection_id: AtomicU64::new(0),
                connections_opened: AtomicUsize::new(0),
                rejections: DashMap::default(),
                journal: journal.then(|| Mutex::new(Vec::new())),
            }),
        }
    }

    /// Open a connection directly, bypassing any pool.
    pub fn connection(&self) -> Result<MemoryConnection, BrokerError> {
        if self.state.severed.is_cancelled() {
            return Err(BrokerError::Dial("broker is down".to_string()));
        }

        self.state.connections_opened.fetch_add(1, Ordering::SeqCst);
        Ok(MemoryConnection {
            id: self.state.next_connection_id.fetch_add(1, Ordering::SeqCst),
            state: Arc::clone(&self.state),
            events: None,
            subscriptions: Vec::new(),
        })
    }

    /// Drop every connection: pending pops fail, subscribers receive an error and all further
    /// commands fail with [`BrokerError::ConnectionClosed`].
    pub fn sever(&self) {
        self.state.severed.cancel();

        for mut entry in self.state.channels.iter_mut() {
            for subscriber in entry.value_mut().drain(..) {
                let _ = subscriber.events.send(Err(BrokerError::ConnectionClosed));
            }
        }
        self.state.channels.clear();
    }

    /// Fail the next `count` commands of kind `op` with [`BrokerError::Rejected`].
    ///
    /// Rejected commands are not recorded in the journal.
    pub fn reject_next(&self, op: JournalOp, count: usize) {
        *self.state.rejections.entry(op).or_default() += count;
    }

    pub fn connections_opened(&self) -> usize {
        self.state.connections_opened.load(Ordering::SeqCst)
    }

    /// Number of subscribers currently attached to `topic`.
    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.state
            .channels
            .get(topic)
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }

    /// Number of items waiting on the work queue `queue`.
    pub fn queue_len(&self, queue: &Topic) -> usize {
        self.state
            .queues
            .get(queue)
            .map(|q| q.len.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Commands recorded so far. Empty unless built with [`MemoryBroker::with_journal`].
    pub fn journal(&self) -> Vec<JournalEntry> {
        self.state
            .journal
            .as_ref()
            .map(|journal| journal.lock().unwrap_or_else(PoisonError::into_inner).clone())
            .unwrap_or_default()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    type Conn = MemoryConnection;

    async fn connect(&self) -> Result<MemoryConnection, BrokerError> {
        self.connection()
    }
}

/// A connection to a [`MemoryBroker`].
pub struct MemoryConnection {
    id: u64,
    state: Arc<BrokerState>,
    events: Option<PubSubSender>,
    subscriptions: Vec<Topic>,
}

impl MemoryConnection {
    fn check(&self) -> Result<(), BrokerError> {
        if self.state.severed.is_cancelled() {
            return Err(BrokerError::ConnectionClosed);
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn publish(&mut self, topic: &Topic, payload: Bytes) -> Result<usize, BrokerError> {
        self.check()?;
        self.state.reject(JournalOp::Publish)?;
        self.state.record(JournalOp::Publish, topic, Some(&payload));

        let receivers = match self.state.channels.get(topic) {
            Some(subscribers) => {
                for subscriber in subscribers.iter() {
                    let _ = subscriber.events.send(Ok(PubSubEvent::Message {
                        topic: topic.clone(),
                        payload: payload.clone(),
                    }));
                }
                subscribers.len()
            }
            None => 0,
        };

        Ok(receivers)
    }

    async fn push(&mut self, queue: &Topic, payload: Bytes) -> Result<usize, BrokerError> {
        self.check()?;
        self.state.reject(JournalOp::Push)?;
        self.state.record(JournalOp::Push, queue, Some(&payload));

        let work_queue = self.state.queue(queue);
        let len = work_queue.len.fetch_add(1, Ordering::SeqCst) + 1;
        work_queue
            .tx
            .send(payload)
            .map_err(|_| BrokerError::ConnectionClosed)?;

        Ok(len)
    }

    async fn pop(&mut self, queue: &Topic) -> Result<Bytes, BrokerError> {
        self.check()?;
        let work_queue = self.state.queue(queue);

        let item = tokio::select! {
            _ = self.state.severed.cancelled() => return Err(BrokerError::ConnectionClosed),
            item = async { work_queue.rx.lock().await.recv().await } => item,
        };

        let payload = item.ok_or(BrokerError::ConnectionClosed)?;
        work_queue.len.fetch_sub(1, Ordering::SeqCst);
        self.state.record(JournalOp::Pop, queue, Some(&payload));
        Ok(payload)
    }

    async fn ping(&mut self) -> Result<(), BrokerError> {
        self.check()?;
        if let Some(events) = &self.events {
            let _ = events.send(Ok(PubSubEvent::Pong));
        }
        Ok(())
    }

    async fn subscribe(&mut self, topic: &Topic) -> Result<PubSubReceiver, BrokerError> {
        self.check()?;
        if self.events.is_some() {
            // A second receiver would split the event stream of this connection
            return Err(BrokerError::Dial(
                "connection is already in pub/sub mode".to_string(),
            ));
        }

        let (events, receiver) = PubSubReceiver::channel();
        self.state.record(JournalOp::Subscribe, topic, None);

        self.state
            .channels
            .entry(topic.clone())
            .or_default()
            .push(Subscriber {
                connection_id: self.id,
                events: events.clone(),
            });
        self.subscriptions.push(topic.clone());

        let _ = events.send(Ok(PubSubEvent::Subscription {
            topic: topic.clone(),
            count: self.subscriptions.len(),
        }));
        self.events = Some(events);

        debug!(connection = self.id, topic = %topic, "Subscribed");
        Ok(receiver)
    }

    async fn unsubscribe(&mut self, topic: &Topic) -> Result<(), BrokerError> {
        self.check()?;
        self.state.record(JournalOp::Unsubscribe, topic, None);

        self.state.remove_subscriber(topic, self.id);
        self.subscriptions.retain(|t| t != topic);

        if let Some(events) = &self.events {
            let _ = events.send(Ok(PubSubEvent::Subscription {
                topic: topic.clone(),
                count: self.subscriptions.len(),
            }));
        }
        if self.subscriptions.is_empty() {
            self.events = None;
        }

        debug!(connection = self.id, topic = %topic, "Unsubscribed");
        Ok(())
    }

    fn is_reusable(&self) -> bool {
        !self.state.severed.is_cancelled() && self.subscriptions.is_empty()
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        for topic in self.subscriptions.drain(..) {
            self.state.remove_subscriber(&topic, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_subscribe_acknowledges_count() {
        let broker = MemoryBroker::new();
        let mut conn = broker.connection().unwrap();
        let topic = Topic::from("news");

        let mut rx = conn.subscribe(&topic).await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            PubSubEvent::Subscription {
                topic: topic.clone(),
                count: 1
            }
        );

        conn.unsubscribe(&topic).await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            PubSubEvent::Subscription { topic, count: 0 }
        );
        assert!(conn.is_reusable());
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let broker = MemoryBroker::new();
        let topic = Topic::from("news");

        let mut a = broker.connection().unwrap();
        let mut b = broker.connection().unwrap();
        let mut rx_a = a.subscribe(&topic).await.unwrap();
        let mut rx_b = b.subscribe(&topic).await.unwrap();
        let _ = rx_a.recv().await;
        let _ = rx_b.recv().await;

        let mut publisher = broker.connection().unwrap();
        let receivers = publisher
            .publish(&topic, Bytes::from_static(b"hello"))
            .await
            .unwrap();
        assert_eq!(receivers, 2);

        for rx in [&mut rx_a, &mut rx_b] {
            assert!(matches!(
                rx.recv().await.unwrap(),
                PubSubEvent::Message { payload, .. } if payload == Bytes::from_static(b"hello")
            ));
        }
    }

    #[tokio::test]
    async fn test_queue_delivers_each_item_once_in_order() {
        let broker = MemoryBroker::new();
        let queue = Topic::from("jobs");
        let mut producer = broker.connection().unwrap();

        producer.push(&queue, Bytes::from_static(b"1")).await.unwrap();
        producer.push(&queue, Bytes::from_static(b"2")).await.unwrap();
        assert_eq!(broker.queue_len(&queue), 2);

        let mut c1 = broker.connection().unwrap();
        let mut c2 = broker.connection().unwrap();
        assert_eq!(c1.pop(&queue).await.unwrap(), Bytes::from_static(b"1"));
        assert_eq!(c2.pop(&queue).await.unwrap(), Bytes::from_static(b"2"));

        // Nothing left: a further pop blocks
        let blocked = tokio::time::timeout(Duration::from_millis(20), c1.pop(&queue)).await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn test_sever_fails_blocked_pop_and_subscribers() {
        let broker = MemoryBroker::new();
        let topic = Topic::from("news");

        let mut sub = broker.connection().unwrap();
        let mut rx = sub.subscribe(&topic).await.unwrap();
        let _ = rx.recv().await;

        let mut consumer = broker.connection().unwrap();
        let pop = tokio::spawn(async move { consumer.pop(&Topic::from("jobs")).await });

        tokio::task::yield_now().await;
        broker.sever();

        assert!(matches!(pop.await.unwrap(), Err(BrokerError::ConnectionClosed)));
        assert!(matches!(rx.recv().await, Err(BrokerError::ConnectionClosed)));
        assert!(sub.ping().await.is_err());
        assert!(broker.connection().is_err());
    }

    #[tokio::test]
    async fn test_dropping_connection_removes_subscriptions() {
        let broker = MemoryBroker::new();
        let topic = Topic::from("news");

        let mut conn = broker.connection().unwrap();
        let _rx = conn.subscribe(&topic).await.unwrap();
        assert_eq!(broker.subscriber_count(&topic), 1);

        drop(conn);
        assert_eq!(broker.subscriber_count(&topic), 0);
    }

    #[tokio::test]
    async fn test_rejected_command_keeps_connection_usable() {
        let broker = MemoryBroker::with_journal();
        let queue = Topic::from("jobs");
        let mut conn = broker.connection().unwrap();

        broker.reject_next(JournalOp::Push, 1);
        let rejected = conn.push(&queue, Bytes::from_static(b"1")).await;
        assert!(matches!(rejected, Err(BrokerError::Rejected(_))));
        assert!(conn.is_reusable());

        assert_eq!(conn.push(&queue, Bytes::from_static(b"2")).await.unwrap(), 1);
        assert_eq!(broker.queue_len(&queue), 1);
        assert_eq!(broker.journal().len(), 1);
    }

    #[tokio::test]
    async fn test_journal_records_in_order() {
        let broker = MemoryBroker::with_journal();
        let topic = Topic::from("news");
        let mut conn = broker.connection().unwrap();

        let _rx = conn.subscribe(&topic).await.unwrap();
        conn.push(&Topic::from("jobs"), Bytes::from_static(b"x"))
            .await
            .unwrap();

        let ops: Vec<JournalOp> = broker.journal().iter().map(|e| e.op).collect();
        assert_eq!(ops, vec![JournalOp::Subscribe, JournalOp::Push]);
    }
}
