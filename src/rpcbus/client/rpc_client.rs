use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::Fuse;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span, warn};

use crate::broker::{Connection, Connector, Pool};
use crate::codec::{Codec, JsonCodec};
use crate::rpcbus::client::config::RpcClientConfig;
use crate::rpcbus::client::request::Request;
use crate::rpcbus::client::response::Response;
use crate::rpcbus::error::RpcError;
use crate::rpcbus::frame::Frame;
use crate::rpcbus::subscription::{Subscription, SubscriptionHandle};
use crate::topic::Topic;

/// An RPC client that talks to handler loops through the broker.
///
/// Each request subscribes to its own reply topic (named after its correlation id), pushes the
/// framed request on the target work queue once that subscription is confirmed, and resolves
/// with the first reply.
///
/// Reply subscriptions lease from the pool given to [`new`](RpcClient::new). Pushes and
/// publishes lease from a [sibling](Pool::sibling) of it, so requests holding every
/// subscription lease can still push.
///
/// # Example
///
/// ```ignore
/// let pool = Pool::new(broker, PoolConfig::default());
/// let client = RpcClient::new(pool, RpcClientConfig::default());
///
/// let response = client.request(Request::new("echo", "ping")).await?;
/// let echoed: String = response.decode()?;
/// ```
pub struct RpcClient<C: Connector, K = JsonCodec> {
    pool: Pool<C>,
    publisher: Pool<C>,
    codec: Arc<K>,
    config: RpcClientConfig,
}

impl<C: Connector, K> Clone for RpcClient<C, K> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            publisher: self.publisher.clone(),
            codec: Arc::clone(&self.codec),
            config: self.config.clone(),
        }
    }
}

impl<C: Connector> RpcClient<C> {
    /// Create a client using the JSON codec.
    pub fn new(pool: Pool<C>, config: RpcClientConfig) -> Self {
        Self::with_codec(pool, JsonCodec, config)
    }
}

impl<C: Connector, K: Codec> RpcClient<C, K> {
    pub fn with_codec(pool: Pool<C>, codec: K, config: RpcClientConfig) -> Self {
        Self {
            publisher: pool.sibling(),
            pool,
            codec: Arc::new(codec),
            config,
        }
    }

    /// Send a correlated request and wait for its reply.
    ///
    /// The request is pushed only after the reply subscription is confirmed, so a reply can never
    /// be published before someone listens for it. If the request is cancelled or times out
    /// before the push went out, it is never pushed at all. Waiting for a pooled connection
    /// counts against the timeout and is abandoned on cancellation.
    ///
    /// Whatever the outcome, the reply subscription is unsubscribed and its connection released
    /// before this returns.
    ///
    /// # Errors
    ///
    /// * [`RpcError::Cancelled`] if the request's token is cancelled first
    /// * [`RpcError::Timeout`] if no reply arrives within the configured timeout
    /// * [`RpcError::Transport`] if the reply subscription fails
    /// * [`RpcError::Publish`] if pushing the request fails
    /// * [`RpcError::Codec`] if the params cannot be encoded
    pub async fn request<P: Serialize>(
        &self,
        request: Request<P>,
    ) -> Result<Response<K>, RpcError> {
        let span = info_span!(
            "rpc_request",
            correlation_id = %request.correlation_id,
            topic = %request.topic,
        );
        self.send(request).instrument(span).await
    }

    async fn send<P: Serialize>(&self, request: Request<P>) -> Result<Response<K>, RpcError> {
        let Request {
            correlation_id,
            topic,
            params,
            ping_interval,
            cancel,
        } = request;

        let frame = Frame::new(correlation_id, self.codec.encode(&params)?).to_bytes();
        let reply_topic = Topic::reply(&correlation_id);

        let deadline = tokio::time::sleep(self.config.timeout);
        tokio::pin!(deadline);

        let conn = tokio::select! {
            biased;

            _ = cancel.cancelled() => return Err(RpcError::Cancelled),
            _ = &mut deadline => return Err(self.timed_out()),
            conn = self.pool.get() => conn.map_err(RpcError::Transport)?,
        };

        let (subscription, mut handle) = Subscription::new(
            reply_topic,
            ping_interval.unwrap_or(self.config.ping_interval),
            cancel.child_token(),
        );
        let mut task = tokio::spawn(subscription.start(conn).in_current_span());

        let push = Fuse::terminated();
        tokio::pin!(push);

        let mut awaiting_subscribed = true;
        let mut pushing = false;
        let mut messages_open = true;

        let (outcome, finished) = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("Request cancelled");
                    break (Err(RpcError::Cancelled), false);
                }

                _ = &mut deadline => break (Err(self.timed_out()), false),

                result = &mut task => {
                    let outcome = match result {
                        Ok(Ok(())) => Err(RpcError::ConnectionClosed),
                        Ok(Err(e)) => Err(e),
                        Err(_) => Err(RpcError::SubscriptionPanicked),
                    };
                    break (outcome, true);
                }

                signal = &mut handle.subscribed, if awaiting_subscribed => {
                    awaiting_subscribed = false;
                    // A dropped signal means the subscription ended; its task reports why
                    if signal.is_ok() && !cancel.is_cancelled() {
                        push.set(self.push(&topic, frame.clone()).fuse());
                        pushing = true;
                    }
                }

                pushed = &mut push, if pushing => {
                    pushing = false;
                    if let Err(e) = pushed {
                        break (Err(e), false);
                    }
                }

                message = handle.messages.recv(), if messages_open => {
                    match message.map(Frame::parse) {
                        Some(Ok(reply)) if reply.correlation_id == correlation_id => {
                            debug!(len = reply.body.len(), "Reply received");
                            let response = Response::new(
                                correlation_id,
                                topic.clone(),
                                reply.body,
                                Arc::clone(&self.codec),
                            );
                            break (Ok(response), false);
                        }
                        Some(Ok(reply)) => {
                            let other = reply.correlation_id;
                            warn!(other = %other, "Ignoring reply for another request");
                        }
                        Some(Err(e)) => warn!(error = %e, "Ignoring malformed reply"),
                        None => messages_open = false,
                    }
                }
            }
        };

        handle.cancel();
        if !finished {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "Reply subscription ended with error"),
                Err(e) => warn!(error = %e, "Reply subscription task failed"),
            }
        }

        outcome
    }

    fn timed_out(&self) -> RpcError {
        warn!(timeout = ?self.config.timeout, "Request timed out");
        RpcError::Timeout(self.config.timeout)
    }

    async fn push(&self, queue: &Topic, frame: Bytes) -> Result<(), RpcError> {
        let mut conn = self
            .publisher
            .get()
            .await
            .map_err(|source| RpcError::Publish {
                topic: queue.clone(),
                source,
            })?;

        match conn.push(queue, frame).await {
            Ok(len) => {
                debug!(queue = %queue, len, "Request pushed");
                Ok(())
            }
            Err(source) => {
                conn.discard();
                Err(RpcError::Publish {
                    topic: queue.clone(),
                    source,
                })
            }
        }
    }

    /// Encode `value` and publish it to every current subscriber of `topic`.
    ///
    /// Returns the number of subscribers that received it.
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        topic: impl Into<Topic>,
        value: &T,
    ) -> Result<usize, RpcError> {
        let topic = topic.into();
        let payload = Bytes::from(self.codec.encode(value)?);

        let mut conn = self.publisher.get().await.map_err(RpcError::Transport)?;
        match conn.publish(&topic, payload).await {
            Ok(receivers) => {
                debug!(topic = %topic, receivers, "Published");
                Ok(receivers)
            }
            Err(source) => {
                conn.discard();
                Err(RpcError::Publish { topic, source })
            }
        }
    }

    /// Subscribe to a broadcast topic on a leased connection.
    ///
    /// The subscription runs on its own task until `cancel` fires or it fails; the task's result
    /// is the subscription's outcome.
    pub async fn subscribe(
        &self,
        topic: impl Into<Topic>,
        ping_interval: Option<Duration>,
        cancel: CancellationToken,
    ) -> Result<(SubscriptionHandle, JoinHandle<Result<(), RpcError>>), RpcError> {
        let topic = topic.into();
        let conn = self.pool.get().await.map_err(RpcError::Transport)?;

        let span = info_span!("subscription", topic = %topic);
        let (subscription, handle) = Subscription::new(
            topic,
            ping_interval.unwrap_or(self.config.ping_interval),
            cancel,
        );
        let task = tokio::spawn(subscription.start(conn).instrument(span));

        Ok((handle, task))
    }

    /// Pool the reply and broadcast subscriptions lease from.
    pub fn pool(&self) -> &Pool<C> {
        &self.pool
    }

    /// Pool pushes and publishes lease from.
    pub fn publish_pool(&self) -> &Pool<C> {
        &self.publisher
    }

    pub fn codec(&self) -> &K {
        &self.codec
    }

    pub fn config(&self) -> &RpcClientConfig {
        &self.config
    }
}
