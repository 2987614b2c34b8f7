use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::broker::{Connection, Connector, Pool};
use crate::codec::{Codec, JsonCodec};
use crate::correlation::CorrelationId;
use crate::rpcbus::error::RpcError;
use crate::rpcbus::frame::Frame;
use crate::rpcbus::reply::Reply;
use crate::rpcbus::server::config::RpcServerConfig;
use crate::topic::Topic;

/// Runs handler loops that serve requests pushed by [`RpcClient`](crate::rpcbus::RpcClient)s.
///
/// Every dequeued request is handled on its own task, detached from the loop that dequeued it,
/// so a slow handler does not hold up the queue and stopping the loop does not abort handlers
/// already running.
///
/// Handler loops hold their lease from the pool given to [`new`](RpcServer::new) for as long as
/// they run. Replies are published from a [sibling](Pool::sibling) of it, so any number of loops
/// can share a pool without starving the replies.
///
/// # Example
///
/// ```ignore
/// let server = RpcServer::new(pool, RpcServerConfig::default());
///
/// server
///     .handle("echo", |_id, params: String| async move { Ok::<_, Infallible>(params) })
///     .await?;
/// ```
pub struct RpcServer<C: Connector, K = JsonCodec> {
    pool: Pool<C>,
    publisher: Pool<C>,
    codec: Arc<K>,
    limiter: Option<Arc<Semaphore>>,
    shutdown: CancellationToken,
    config: RpcServerConfig,
}

impl<C: Connector, K> Clone for RpcServer<C, K> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            publisher: self.publisher.clone(),
            codec: Arc::clone(&self.codec),
            limiter: self.limiter.clone(),
            shutdown: self.shutdown.clone(),
            config: self.config.clone(),
        }
    }
}

impl<C: Connector> RpcServer<C> {
    /// Create a server using the JSON codec.
    pub fn new(pool: Pool<C>, config: RpcServerConfig) -> Self {
        Self::with_codec(pool, JsonCodec, config)
    }
}

impl<C: Connector, K: Codec> RpcServer<C, K> {
    pub fn with_codec(pool: Pool<C>, codec: K, config: RpcServerConfig) -> Self {
        Self {
            publisher: pool.sibling(),
            pool,
            codec: Arc::new(codec),
            limiter: config
                .max_concurrency
                .map(|permits| Arc::new(Semaphore::new(permits))),
            shutdown: CancellationToken::new(),
            config,
        }
    }

    /// Serve requests pushed on `topic` until the server shuts down or dequeuing fails.
    ///
    /// Each request body is decoded as `P` and passed to `handler` together with its correlation
    /// id; the result is published as a [`Reply`] on the requester's reply topic. A request whose
    /// body cannot be decoded gets no reply at all.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Dequeue`] when the work queue becomes unusable. The loop does not
    /// restart itself.
    pub async fn handle<P, R, E, F, Fut>(
        &self,
        topic: impl Into<Topic>,
        handler: F,
    ) -> Result<(), RpcError>
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: Display + Send + 'static,
        F: Fn(CorrelationId, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        let topic = topic.into();
        let handler = Arc::new(handler);

        let leased = tokio::select! {
            _ = self.shutdown.cancelled() => return Ok(()),
            leased = self.pool.get() => leased,
        };
        let mut conn = leased.map_err(|source| RpcError::Dequeue {
            topic: topic.clone(),
            source,
        })?;
        info!(topic = %topic, "Handler loop started");

        loop {
            let permit = match &self.limiter {
                Some(limiter) => tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    permit = Arc::clone(limiter).acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        Err(_) => break,
                    },
                },
                None => None,
            };

            let raw = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                popped = conn.pop(&topic) => match popped {
                    Ok(raw) => raw,
                    Err(source) => {
                        error!(topic = %topic, error = %source, "Dequeue failed, loop exiting");
                        conn.discard();
                        return Err(RpcError::Dequeue { topic, source });
                    }
                },
            };

            let frame = match Frame::parse(raw) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(topic = %topic, error = %e, "Dropping malformed request");
                    continue;
                }
            };

            let span = info_span!(
                "rpc_handle",
                correlation_id = %frame.correlation_id,
                topic = %topic,
            );
            debug!(parent: &span, len = frame.body.len(), "Request dequeued");

            let job = run_job(
                self.publisher.clone(),
                Arc::clone(&self.codec),
                frame,
                Arc::clone(&handler),
            );
            tokio::spawn(
                async move {
                    let _permit = permit;
                    job.await;
                }
                .instrument(span),
            );
        }

        info!(topic = %topic, "Handler loop stopped");
        Ok(())
    }

    /// Stop every handler loop of this server at its next dequeue.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Pool the handler loops lease from.
    pub fn pool(&self) -> &Pool<C> {
        &self.pool
    }

    /// Pool replies are published from.
    pub fn publish_pool(&self) -> &Pool<C> {
        &self.publisher
    }

    pub fn config(&self) -> &RpcServerConfig {
        &self.config
    }
}

async fn run_job<C, K, P, R, E, F, Fut>(
    publisher: Pool<C>,
    codec: Arc<K>,
    frame: Frame,
    handler: Arc<F>,
) where
    C: Connector,
    K: Codec,
    P: DeserializeOwned,
    R: Serialize,
    E: Display,
    F: Fn(CorrelationId, P) -> Fut,
    Fut: Future<Output = Result<R, E>>,
{
    let params: P = match codec.decode(&frame.body) {
        Ok(params) => params,
        Err(e) => {
            warn!(error = %e, "Failed to decode params, no reply sent");
            return;
        }
    };

    let reply: Reply<R> = handler(frame.correlation_id, params).await.into();
    if let Reply::Err(message) = &reply {
        debug!(error = %message, "Handler returned an error");
    }

    let body = match codec.encode(&reply) {
        Ok(body) => body,
        Err(e) => {
            warn!(error = %e, "Failed to encode reply");
            return;
        }
    };

    let reply_topic = Topic::reply(&frame.correlation_id);
    let payload = Frame::new(frame.correlation_id, body).to_bytes();

    let mut conn = match publisher.get().await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(error = %e, "No connection to publish reply");
            return;
        }
    };

    match conn.publish(&reply_topic, payload).await {
        Ok(receivers) => debug!(receivers, "Reply published"),
        Err(e) => {
            warn!(error = %e, "Failed to publish reply");
            conn.discard();
        }
    }
}
