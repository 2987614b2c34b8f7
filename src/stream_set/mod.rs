//! Broadcast fan-out.
//!
//! A [`StreamSet`] replicates every payload it is given to a changing set of output streams.
//! The registry is owned by a single actor task and only ever touched there; the handle talks
//! to it through four command channels (attach, detach, broadcast, shutdown). Every command
//! carries an acknowledgement that fires once the command has been applied.
//!
//! Broadcast sends to each output in attach order and waits for room in each one before moving
//! on, so one slow consumer delays every consumer attached after it. While it waits the actor
//! still accepts detach commands: detaching the stream it is blocked on abandons that send and
//! closes the stream.
//!
//! A [`driver`] feeds a set from one upstream subscription, and [`sse::SseWriter`] drains an
//! output stream into an `text/event-stream` body.

use bon::Builder;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::correlation::CorrelationId;

pub mod driver;
mod error;
pub mod sse;

pub use driver::{StreamFeed, feed};
pub use error::StreamSetClosed;
pub use sse::SseWriter;

const COMMAND_CAPACITY: usize = 32;

/// Configuration for a [`StreamSet`].
#[derive(Debug, Clone, Builder)]
pub struct StreamSetConfig {
    /// Buffered payloads per output stream before broadcast waits for its consumer.
    #[builder(default = 1)]
    pub output_capacity: usize,
}

impl Default for StreamSetConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

struct Attach {
    id: CorrelationId,
    ack: oneshot::Sender<mpsc::Receiver<Bytes>>,
}

struct Detach {
    id: CorrelationId,
    ack: oneshot::Sender<bool>,
}

struct Broadcast {
    payload: Bytes,
    ack: oneshot::Sender<usize>,
}

struct Shutdown {
    ack: oneshot::Sender<()>,
}

/// Handle to a fan-out actor. Clones share the same actor.
#[derive(Clone)]
pub struct StreamSet {
    attach: mpsc::Sender<Attach>,
    detach: mpsc::Sender<Detach>,
    broadcast: mpsc::Sender<Broadcast>,
    shutdown: mpsc::Sender<Shutdown>,
}

impl StreamSet {
    /// Start the actor on the current runtime.
    pub fn spawn(config: StreamSetConfig) -> Self {
        let (attach_tx, attach_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (detach_tx, detach_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(COMMAND_CAPACITY);
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let actor = Actor {
            streams: Vec::new(),
            output_capacity: config.output_capacity.max(1),
            attach: attach_rx,
            detach: detach_rx,
            broadcast: broadcast_rx,
            shutdown: shutdown_rx,
        };
        tokio::spawn(actor.run());

        Self {
            attach: attach_tx,
            detach: detach_tx,
            broadcast: broadcast_tx,
            shutdown: shutdown_tx,
        }
    }

    /// Register an output stream under `id` and return its receiving end.
    ///
    /// Attaching an id that is already registered replaces the old stream, which is closed and
    /// moves to the end of the delivery order.
    pub async fn attach(
        &self,
        id: CorrelationId,
    ) -> Result<mpsc::Receiver<Bytes>, StreamSetClosed> {
        let (ack, done) = oneshot::channel();
        self.attach
            .send(Attach { id, ack })
            .await
            .map_err(|_| StreamSetClosed)?;
        done.await.map_err(|_| StreamSetClosed)
    }

    /// Remove the stream registered under `id` and close it. Returns whether it was registered.
    pub async fn detach(&self, id: CorrelationId) -> Result<bool, StreamSetClosed> {
        let (ack, done) = oneshot::channel();
        self.detach
            .send(Detach { id, ack })
            .await
            .map_err(|_| StreamSetClosed)?;
        done.await.map_err(|_| StreamSetClosed)
    }

    /// Deliver `payload` to every attached stream. Returns once every stream took it (or was
    /// detached or dropped meanwhile), with the number of streams that received it.
    pub async fn broadcast(&self, payload: Bytes) -> Result<usize, StreamSetClosed> {
        let (ack, done) = oneshot::channel();
        self.broadcast
            .send(Broadcast { payload, ack })
            .await
            .map_err(|_| StreamSetClosed)?;
        done.await.map_err(|_| StreamSetClosed)
    }

    /// Stop the actor. Streams still attached are closed when the registry is dropped.
    pub async fn shutdown(&self) -> Result<(), StreamSetClosed> {
        let (ack, done) = oneshot::channel();
        self.shutdown
            .send(Shutdown { ack })
            .await
            .map_err(|_| StreamSetClosed)?;
        done.await.map_err(|_| StreamSetClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.broadcast.is_closed()
    }
}

struct Actor {
    streams: Vec<(CorrelationId, mpsc::Sender<Bytes>)>,
    output_capacity: usize,
    attach: mpsc::Receiver<Attach>,
    detach: mpsc::Receiver<Detach>,
    broadcast: mpsc::Receiver<Broadcast>,
    shutdown: mpsc::Receiver<Shutdown>,
}

impl Actor {
    async fn run(mut self) {
        debug!("Stream set started");

        loop {
            tokio::select! {
                Some(command) = self.attach.recv() => self.on_attach(command),
                Some(command) = self.detach.recv() => {
                    self.on_detach(command);
                }
                Some(command) = self.broadcast.recv() => self.on_broadcast(command).await,
                command = self.shutdown.recv() => {
                    if let Some(Shutdown { ack }) = command {
                        let _ = ack.send(());
                    }
                    break;
                }
            }
        }

        info!(streams = self.streams.len(), "Stream set shut down");
    }

    fn on_attach(&mut self, Attach { id, ack }: Attach) {
        if let Some(index) = self.position(id) {
            self.streams.remove(index);
        }

        let (tx, rx) = mpsc::channel(self.output_capacity);
        self.streams.push((id, tx));
        debug!(stream = %id, streams = self.streams.len(), "Stream attached");

        let _ = ack.send(rx);
    }

    /// Returns the index the detached stream had.
    fn on_detach(&mut self, Detach { id, ack }: Detach) -> Option<usize> {
        let index = self.position(id);
        if let Some(index) = index {
            self.streams.remove(index);
            debug!(stream = %id, streams = self.streams.len(), "Stream detached");
        }

        let _ = ack.send(index.is_some());
        index
    }

    async fn on_broadcast(&mut self, Broadcast { payload, ack }: Broadcast) {
        let mut delivered = 0;
        let mut next = 0;

        while next < self.streams.len() {
            let (id, output) = &self.streams[next];
            let (id, output) = (*id, output.clone());

            tokio::select! {
                biased;

                Some(command) = self.detach.recv() => {
                    // Removing an earlier stream shifts the current one down; removing the
                    // current one drops this send
                    if let Some(removed) = self.on_detach(command) {
                        if removed < next {
                            next -= 1;
                        }
                    }
                }

                sent = output.send(payload.clone()) => match sent {
                    Ok(()) => {
                        delivered += 1;
                        next += 1;
                    }
                    Err(_) => {
                        debug!(stream = %id, "Output dropped, detaching");
                        self.streams.remove(next);
                    }
                },
            }
        }

        let _ = ack.send(delivered);
    }

    fn position(&self, id: CorrelationId) -> Option<usize> {
        self.streams.iter().position(|(stream, _)| *stream == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ids(n: usize) -> Vec<CorrelationId> {
        (0..n).map(|_| CorrelationId::generate()).collect()
    }

    #[tokio::test]
    async fn test_broadcast_then_detach() {
        let set = StreamSet::spawn(StreamSetConfig::default());
        let ids = ids(3);

        let mut outputs = Vec::new();
        for id in &ids {
            outputs.push(set.attach(*id).await.unwrap());
        }

        let payload = Bytes::from_static(&[0x01, 0x02]);
        assert_eq!(set.broadcast(payload.clone()).await.unwrap(), 3);
        for output in &mut outputs {
            assert_eq!(output.recv().await.unwrap(), payload);
        }

        assert!(set.detach(ids[1]).await.unwrap());
        assert_eq!(set.broadcast(payload.clone()).await.unwrap(), 2);

        assert_eq!(outputs[0].recv().await.unwrap(), payload);
        assert_eq!(outputs[2].recv().await.unwrap(), payload);
        assert!(outputs[1].recv().await.is_none());
    }

    #[tokio::test]
    async fn test_delivery_follows_attach_order() {
        let set = StreamSet::spawn(StreamSetConfig::default());
        let ids = ids(3);

        let mut outputs = Vec::new();
        for id in &ids {
            outputs.push(set.attach(*id).await.unwrap());
        }

        // Fill every buffer, then read from the last stream first: the next broadcast is stuck
        // on the first stream and nothing reaches the others yet
        set.broadcast(Bytes::from_static(b"a")).await.unwrap();
        let second = {
            let set = set.clone();
            tokio::spawn(async move { set.broadcast(Bytes::from_static(b"b")).await })
        };

        assert_eq!(outputs[2].recv().await.unwrap(), Bytes::from_static(b"a"));
        let early = tokio::time::timeout(Duration::from_millis(20), outputs[2].recv()).await;
        assert!(early.is_err());

        for output in &mut outputs[..2] {
            assert_eq!(output.recv().await.unwrap(), Bytes::from_static(b"a"));
        }
        assert_eq!(second.await.unwrap().unwrap(), 3);
        for output in &mut outputs {
            assert_eq!(output.recv().await.unwrap(), Bytes::from_static(b"b"));
        }
    }

    #[tokio::test]
    async fn test_detach_during_stalled_broadcast() {
        let set = StreamSet::spawn(StreamSetConfig::default());
        let ids = ids(2);

        let mut stalled = set.attach(ids[0]).await.unwrap();
        let mut healthy = set.attach(ids[1]).await.unwrap();

        set.broadcast(Bytes::from_static(b"1")).await.unwrap();
        assert_eq!(healthy.recv().await.unwrap(), Bytes::from_static(b"1"));

        // The first stream's buffer is full; this broadcast blocks on it
        let pending = {
            let set = set.clone();
            tokio::spawn(async move { set.broadcast(Bytes::from_static(b"2")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!pending.is_finished());

        let detached = tokio::time::timeout(Duration::from_secs(1), set.detach(ids[0])).await;
        assert!(detached.unwrap().unwrap());

        assert_eq!(pending.await.unwrap().unwrap(), 1);
        assert_eq!(healthy.recv().await.unwrap(), Bytes::from_static(b"2"));

        // Only what was buffered before the detach, then end of stream
        assert_eq!(stalled.recv().await.unwrap(), Bytes::from_static(b"1"));
        assert!(stalled.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_dropped_output_is_pruned() {
        let set = StreamSet::spawn(StreamSetConfig::default());
        let ids = ids(2);

        let gone = set.attach(ids[0]).await.unwrap();
        let mut kept = set.attach(ids[1]).await.unwrap();
        drop(gone);

        assert_eq!(set.broadcast(Bytes::from_static(b"x")).await.unwrap(), 1);
        assert_eq!(kept.recv().await.unwrap(), Bytes::from_static(b"x"));
        assert!(!set.detach(ids[0]).await.unwrap());
    }

    #[tokio::test]
    async fn test_reattach_replaces_stream() {
        let set = StreamSet::spawn(StreamSetConfig::default());
        let id = CorrelationId::generate();

        let mut old = set.attach(id).await.unwrap();
        let mut new = set.attach(id).await.unwrap();
        assert!(old.recv().await.is_none());

        assert_eq!(set.broadcast(Bytes::from_static(b"x")).await.unwrap(), 1);
        assert_eq!(new.recv().await.unwrap(), Bytes::from_static(b"x"));
    }

    #[tokio::test]
    async fn test_commands_fail_after_shutdown() {
        let set = StreamSet::spawn(StreamSetConfig::default());
        let mut output = set.attach(CorrelationId::generate()).await.unwrap();

        set.shutdown().await.unwrap();

        assert!(output.recv().await.is_none());
        assert_eq!(set.broadcast(Bytes::new()).await, Err(StreamSetClosed));
        assert!(set.attach(CorrelationId::generate()).await.is_err());
        assert!(set.is_closed());
    }
}
