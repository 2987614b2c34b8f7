//! Broker transport abstractions.
//!
//! The RPC layer needs two semantically distinct primitives from the broker and keeps them apart:
//!
//! - **pub/sub**: [`Connection::publish`] delivers a payload to every current subscriber of a
//!   topic. Subscribing switches a connection into pub/sub mode and yields a [`PubSubReceiver`]
//!   carrying subscriber-count acknowledgements and messages.
//! - **work queues**: [`Connection::push`] appends to a list and [`Connection::pop`] blocks until
//!   an item is available. Each item is delivered to exactly one consumer.
//!
//! Connections are leased from a [`Pool`](pool::Pool), which dials new ones through a
//! [`Connector`].

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::topic::Topic;

pub mod error;
pub mod memory;
pub mod pool;

pub use error::BrokerError;
pub use memory::MemoryBroker;
pub use pool::{Pool, PoolConfig, PoolStats, PooledConnection};

/// An event received by a connection in pub/sub mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubSubEvent {
    /// Confirmation of a subscribe or unsubscribe command. `count` is the number of topics the
    /// connection is subscribed to after the command took effect.
    Subscription { topic: Topic, count: usize },

    /// A payload published on a subscribed topic.
    Message { topic: Topic, payload: Bytes },

    /// Reply to a liveness ping issued while subscribed.
    Pong,
}

pub type PubSubSender = mpsc::UnboundedSender<Result<PubSubEvent, BrokerError>>;

/// Receiving half of a connection in pub/sub mode.
#[derive(Debug)]
pub struct PubSubReceiver {
    events: mpsc::UnboundedReceiver<Result<PubSubEvent, BrokerError>>,
}

impl PubSubReceiver {
    /// Create a linked sender/receiver pair for a connection implementation to feed.
    pub fn channel() -> (PubSubSender, PubSubReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, PubSubReceiver { events: rx })
    }

    /// Wait for the next event. A closed event stream is reported as
    /// [`BrokerError::ConnectionClosed`].
    pub async fn recv(&mut self) -> Result<PubSubEvent, BrokerError> {
        match self.events.recv().await {
            Some(event) => event,
            None => Err(BrokerError::ConnectionClosed),
        }
    }
}

/// A single connection to the broker.
#[async_trait]
pub trait Connection: Send + 'static {
    /// Publish `payload` to every subscriber of `topic`, returning the number of receivers.
    async fn publish(&mut self, topic: &Topic, payload: Bytes) -> Result<usize, BrokerError>;

    /// Append `payload` to the work queue `queue`, returning the queue length.
    async fn push(&mut self, queue: &Topic, payload: Bytes) -> Result<usize, BrokerError>;

    /// Block until an item is available on `queue` and remove it.
    ///
    /// Implementations must be cancel safe: dropping the future must not lose an item.
    async fn pop(&mut self, queue: &Topic) -> Result<Bytes, BrokerError>;

    /// Liveness check.
    async fn ping(&mut self) -> Result<(), BrokerError>;

    /// Subscribe to `topic`. The first call switches the connection into pub/sub mode and
    /// returns the receiver on which acknowledgements and messages arrive.
    async fn subscribe(&mut self, topic: &Topic) -> Result<PubSubReceiver, BrokerError>;

    /// Unsubscribe from `topic`. The confirmation arrives on the [`PubSubReceiver`].
    async fn unsubscribe(&mut self, topic: &Topic) -> Result<(), BrokerError>;

    /// Whether the connection can be handed to another caller.
    fn is_reusable(&self) -> bool;
}

/// Dials new broker connections for a [`Pool`].
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Conn: Connection;

    async fn connect(&self) -> Result<Self::Conn, BrokerError>;
}
