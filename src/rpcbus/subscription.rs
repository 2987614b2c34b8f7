use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, warn};

use crate::broker::{
    BrokerError, Connection, Connector, PooledConnection, PubSubEvent, PubSubReceiver,
};
use crate::rpcbus::error::RpcError;
use crate::state_machine::StateMachine;
use crate::state_machine::subscription::{
    SubscriptionInput, SubscriptionMachine, SubscriptionOutput,
};
use crate::topic::Topic;

/// Shortest accepted liveness-ping interval.
const MIN_PING_INTERVAL: Duration = Duration::from_millis(1);

/// The consumer side of a [`Subscription`].
///
/// `subscribed` resolves once the broker confirmed the subscription and `messages` yields every
/// payload published on the topic afterwards. Both are closed once
/// [`Subscription::start`] returns, whichever way it ends.
#[derive(Debug)]
pub struct SubscriptionHandle {
    pub subscribed: oneshot::Receiver<()>,
    pub messages: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
}

impl SubscriptionHandle {
    /// Ask the subscription to unsubscribe and release its connection.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// One pub/sub subscription on a leased connection.
///
/// [`start`](Subscription::start) runs two loops. The receive loop reads broker events, fires the
/// `subscribed` signal and pushes messages to the consumer, blocking until each one is taken.
/// The supervisor forwards a terminal error from the receive loop, pings the connection on every
/// tick and watches the cancellation token.
///
/// Shutdown is two-phase: the supervisor unsubscribes, waits for the receive loop to observe the
/// confirmation and close its channels, and only then releases the connection. A connection is
/// never returned to the pool while still attached to the topic.
pub struct Subscription {
    topic: Topic,
    ping_interval: Duration,
    cancel: CancellationToken,
    subscribed: oneshot::Sender<()>,
    messages: mpsc::Sender<Bytes>,
}

impl Subscription {
    pub fn new(
        topic: impl Into<Topic>,
        ping_interval: Duration,
        cancel: CancellationToken,
    ) -> (Self, SubscriptionHandle) {
        let (subscribed_tx, subscribed_rx) = oneshot::channel();
        let (messages_tx, messages_rx) = mpsc::channel(1);

        let subscription = Self {
            topic: topic.into(),
            ping_interval: ping_interval.max(MIN_PING_INTERVAL),
            cancel: cancel.clone(),
            subscribed: subscribed_tx,
            messages: messages_tx,
        };
        let handle = SubscriptionHandle {
            subscribed: subscribed_rx,
            messages: messages_rx,
            cancel,
        };

        (subscription, handle)
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Subscribe on `conn` and run until cancelled, unsubscribed by the broker, or failed.
    ///
    /// Cancellation and a broker-side unsubscribe return `Ok(())`; a broker or ping failure
    /// returns [`RpcError::Transport`]. The connection is released before this returns.
    pub async fn start<C: Connector>(self, mut conn: PooledConnection<C>) -> Result<(), RpcError> {
        let Subscription {
            topic,
            ping_interval,
            cancel,
            subscribed,
            messages,
        } = self;

        let events = match conn.subscribe(&topic).await {
            Ok(events) => events,
            Err(e) => {
                warn!(topic = %topic, error = %e, "Subscribe failed");
                conn.discard();
                return Err(RpcError::Transport(e));
            }
        };
        debug!(topic = %topic, "Subscribe issued");

        let mut machine = SubscriptionMachine::new();
        machine.process_input(SubscriptionInput::SubscribeIssued);

        let draining = CancellationToken::new();
        let mut receive = tokio::spawn(
            receive_loop(machine, events, subscribed, messages, draining.clone()).in_current_span(),
        );

        let mut ticker = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let (outcome, received) = loop {
            tokio::select! {
                result = &mut receive => break (join_outcome(result), Some(())),

                _ = ticker.tick() => {
                    if let Err(e) = conn.ping().await {
                        warn!(topic = %topic, error = %e, "Liveness ping failed");
                        break (Err(RpcError::Transport(e)), None);
                    }
                }

                _ = cancel.cancelled() => {
                    debug!(topic = %topic, "Subscription cancelled");
                    break (Ok(()), None);
                }
            }
        };

        let mut clean = outcome.is_ok();

        if received.is_none() {
            // Messages still in flight are dropped; nobody is reading them anymore
            draining.cancel();

            if let Err(e) = conn.unsubscribe(&topic).await {
                debug!(topic = %topic, error = %e, "Unsubscribe failed, aborting receive loop");
                receive.abort();
            }

            if join_outcome(receive.await).is_err() {
                clean = false;
            }
        }

        if clean && conn.is_reusable() {
            drop(conn);
        } else {
            conn.discard();
        }
        debug!(topic = %topic, "Subscription closed");

        outcome
    }
}

/// The error to report for a subscription that ended before it was confirmed.
pub(crate) async fn ended_early(task: JoinHandle<Result<(), RpcError>>) -> RpcError {
    match task.await {
        Ok(Err(e)) => e,
        Ok(Ok(())) => RpcError::ConnectionClosed,
        Err(_) => RpcError::SubscriptionPanicked,
    }
}

fn join_outcome(result: Result<Result<(), BrokerError>, JoinError>) -> Result<(), RpcError> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(RpcError::Transport(e)),
        Err(e) if e.is_panic() => Err(RpcError::SubscriptionPanicked),
        Err(_) => Err(RpcError::Transport(BrokerError::ConnectionClosed)),
    }
}

async fn receive_loop(
    mut machine: SubscriptionMachine,
    mut events: PubSubReceiver,
    subscribed: oneshot::Sender<()>,
    messages: mpsc::Sender<Bytes>,
    draining: CancellationToken,
) -> Result<(), BrokerError> {
    let mut subscribed = Some(subscribed);

    loop {
        let input = match events.recv().await? {
            PubSubEvent::Subscription { count, .. } => SubscriptionInput::Acknowledged { count },
            PubSubEvent::Message { payload, .. } => SubscriptionInput::Message(payload),
            PubSubEvent::Pong => SubscriptionInput::Pong,
        };
        machine.process_input(input);

        while let Some(output) = machine.poll_output() {
            match output {
                SubscriptionOutput::Subscribed => {
                    if let Some(signal) = subscribed.take() {
                        let _ = signal.send(());
                    }
                }

                SubscriptionOutput::Deliver(payload) => {
                    tokio::select! {
                        biased;
                        _ = draining.cancelled() => {}
                        _ = messages.send(payload) => {}
                    }
                }

                SubscriptionOutput::Finished => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, Pool, PoolConfig, PoolStats};

    fn setup() -> (MemoryBroker, Pool<MemoryBroker>) {
        let broker = MemoryBroker::new();
        let pool = Pool::new(broker.clone(), PoolConfig::default());
        (broker, pool)
    }

    async fn publish(broker: &MemoryBroker, topic: &str, payload: &'static [u8]) {
        let mut conn = broker.connection().unwrap();
        conn.publish(&Topic::from(topic), Bytes::from_static(payload))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_receives_then_cancels_cleanly() {
        let (broker, pool) = setup();
        let (subscription, mut handle) =
            Subscription::new("news", Duration::from_secs(60), CancellationToken::new());

        let task = tokio::spawn(subscription.start(pool.get().await.unwrap()));

        (&mut handle.subscribed).await.unwrap();
        publish(&broker, "news", b"one").await;
        assert_eq!(handle.messages.recv().await.unwrap(), Bytes::from_static(b"one"));

        handle.cancel();
        assert!(task.await.unwrap().is_ok());

        // Both outward channels are closed and the connection went back to the pool
        assert!(handle.messages.recv().await.is_none());
        assert_eq!(broker.subscriber_count(&Topic::from("news")), 0);
        assert_eq!(pool.stats(), PoolStats { active: 0, idle: 1 });
    }

    #[tokio::test]
    async fn test_cancel_with_undelivered_message_does_not_hang() {
        let (broker, pool) = setup();
        let (subscription, mut handle) =
            Subscription::new("news", Duration::from_secs(60), CancellationToken::new());

        let task = tokio::spawn(subscription.start(pool.get().await.unwrap()));
        (&mut handle.subscribed).await.unwrap();

        // Nobody reads these; the receive loop blocks on the second one
        publish(&broker, "news", b"one").await;
        publish(&broker, "news", b"two").await;
        tokio::task::yield_now().await;

        handle.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), task).await;
        assert!(result.unwrap().unwrap().is_ok());
        assert_eq!(pool.stats().active, 0);
    }

    #[tokio::test]
    async fn test_sever_fails_subscription_and_closes_channels() {
        let (broker, pool) = setup();
        let (subscription, mut handle) =
            Subscription::new("news", Duration::from_secs(60), CancellationToken::new());

        let task = tokio::spawn(subscription.start(pool.get().await.unwrap()));
        (&mut handle.subscribed).await.unwrap();

        broker.sever();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(RpcError::Transport(_))));
        assert!(handle.messages.recv().await.is_none());
        assert_eq!(pool.stats(), PoolStats { active: 0, idle: 0 });
    }

    #[tokio::test]
    async fn test_ping_failure_fails_subscription() {
        let (broker, pool) = setup();
        let (subscription, handle) =
            Subscription::new("news", Duration::from_millis(10), CancellationToken::new());

        let task = tokio::spawn(subscription.start(pool.get().await.unwrap()));
        handle.subscribed.await.unwrap();

        // Several pings succeed while the broker is up
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!task.is_finished());

        broker.sever();
        let result = tokio::time::timeout(Duration::from_secs(1), task).await;
        assert!(matches!(result.unwrap().unwrap(), Err(RpcError::Transport(_))));
    }

    #[tokio::test]
    async fn test_subscribe_failure_closes_signal() {
        let (broker, pool) = setup();
        let conn = pool.get().await.unwrap();
        broker.sever();

        let (subscription, handle) =
            Subscription::new("news", Duration::from_secs(60), CancellationToken::new());
        let result = subscription.start(conn).await;

        assert!(matches!(result, Err(RpcError::Transport(_))));
        assert!(handle.subscribed.await.is_err());
    }
}
