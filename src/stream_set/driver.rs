//! Feeding a [`StreamSet`] from one upstream subscription.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use super::{StreamSet, StreamSetConfig};
use crate::broker::Connector;
use crate::codec::Codec;
use crate::rpcbus::subscription::{SubscriptionHandle, ended_early};
use crate::rpcbus::{RpcClient, RpcError};
use crate::topic::Topic;

/// A stream set fed from a broker topic.
pub struct StreamFeed {
    pub set: StreamSet,
    /// Outcome of the upstream subscription.
    pub subscription: JoinHandle<Result<(), RpcError>>,
    pub driver: JoinHandle<()>,
}

/// Subscribe to `topic` and relay everything published on it into a new [`StreamSet`].
///
/// Returns once the upstream subscription is confirmed. Cancelling `cancel` ends the
/// subscription, after which the driver shuts the set down.
pub async fn feed<C: Connector, K: Codec>(
    client: &RpcClient<C, K>,
    topic: impl Into<Topic>,
    config: StreamSetConfig,
    cancel: CancellationToken,
) -> Result<StreamFeed, RpcError> {
    let topic = topic.into();
    let (mut upstream, subscription) = client.subscribe(topic.clone(), None, cancel).await?;

    if (&mut upstream.subscribed).await.is_err() {
        warn!(topic = %topic, "Upstream subscription ended before it was confirmed");
        return Err(ended_early(subscription).await);
    }

    let set = StreamSet::spawn(config);
    let span = info_span!("stream_feed", topic = %topic);
    let driver = tokio::spawn(forward(upstream, set.clone()).instrument(span));
    info!(topic = %topic, "Stream feed started");

    Ok(StreamFeed {
        set,
        subscription,
        driver,
    })
}

/// Broadcast every upstream message until the upstream closes, then shut the set down.
///
/// The `subscribed` signal of `upstream` must already have been consumed.
pub async fn forward(mut upstream: SubscriptionHandle, set: StreamSet) {
    let mut forwarded = 0u64;

    while let Some(payload) = upstream.messages.recv().await {
        match set.broadcast(payload).await {
            Ok(receivers) => {
                forwarded += 1;
                debug!(receivers, "Forwarded");
            }
            Err(e) => {
                debug!(error = %e, "Stopping upstream");
                break;
            }
        }
    }

    upstream.cancel();
    let _ = set.shutdown().await;
    info!(forwarded, "Stream feed stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{MemoryBroker, Pool, PoolConfig};
    use crate::correlation::CorrelationId;
    use crate::rpcbus::RpcClientConfig;
    use bytes::Bytes;

    fn client(broker: &MemoryBroker) -> RpcClient<MemoryBroker> {
        RpcClient::new(
            Pool::new(broker.clone(), PoolConfig::default()),
            RpcClientConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_feed_relays_until_cancelled() {
        let broker = MemoryBroker::new();
        let client = client(&broker);
        let cancel = CancellationToken::new();

        let feed = feed(&client, "metrics", StreamSetConfig::default(), cancel.clone())
            .await
            .unwrap();
        let mut a = feed.set.attach(CorrelationId::generate()).await.unwrap();
        let mut b = feed.set.attach(CorrelationId::generate()).await.unwrap();

        client.publish("metrics", &1).await.unwrap();
        for output in [&mut a, &mut b] {
            assert_eq!(output.recv().await.unwrap(), Bytes::from_static(b"1"));
        }

        cancel.cancel();
        assert!(feed.subscription.await.unwrap().is_ok());
        feed.driver.await.unwrap();

        assert!(a.recv().await.is_none());
        assert!(b.recv().await.is_none());
        assert!(feed.set.is_closed());
    }

    #[tokio::test]
    async fn test_feed_fails_when_broker_down() {
        let broker = MemoryBroker::new();
        let client = client(&broker);
        broker.sever();

        let result = feed(
            &client,
            "metrics",
            StreamSetConfig::default(),
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(RpcError::Transport(_))));
    }

    #[tokio::test]
    async fn test_upstream_failure_shuts_set_down() {
        let broker = MemoryBroker::new();
        let client = client(&broker);

        let feed = feed(&client, "metrics", StreamSetConfig::default(), CancellationToken::new())
            .await
            .unwrap();
        let mut output = feed.set.attach(CorrelationId::generate()).await.unwrap();

        broker.sever();

        assert!(matches!(feed.subscription.await.unwrap(), Err(RpcError::Transport(_))));
        feed.driver.await.unwrap();
        assert!(output.recv().await.is_none());
    }
}
