//! System metrics published on the `metrics` broadcast topic.

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::broker::Connector;
use crate::codec::{Codec, JsonCodec};
use crate::rpcbus::subscription::ended_early;
use crate::rpcbus::{RpcClient, RpcError};
use crate::topic::topics;

/// One snapshot of the host's load, memory and network throughput.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub cpu: Cpu,
    pub memory: Memory,
    #[serde(rename = "net")]
    pub network: Vec<NetworkInterface>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cpu {
    /// Load across all cores, in percent.
    pub average: f64,
    /// Load per core, in percent.
    pub averages: Vec<f64>,
    pub count: usize,
}

/// Memory figures in kilobytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Memory {
    pub total: u64,
    pub free: u64,
    pub occupied: u64,
    pub available: u64,
    pub swap_total: u64,
    pub swap_free: u64,
    pub swap_occupied: u64,
}

/// Throughput of one interface since the previous snapshot, in bytes per second.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub name: String,
    pub download: f64,
    pub upload: f64,
}

/// Publishes metrics snapshots for every current watcher.
pub struct MetricsPublisher<C: Connector, K = JsonCodec> {
    client: RpcClient<C, K>,
}

impl<C: Connector, K: Codec> MetricsPublisher<C, K> {
    pub fn new(client: RpcClient<C, K>) -> Self {
        Self { client }
    }

    /// Returns how many subscribers received the snapshot.
    pub async fn send(&self, metrics: &Metrics) -> Result<usize, RpcError> {
        self.client.publish(topics::METRICS, metrics).await
    }
}

/// Subscribe to metrics snapshots.
///
/// Resolves once the subscription is live. The stream yields every snapshot published afterwards
/// and ends when `cancel` fires; a payload that does not decode yields an error item without
/// ending the stream, and a failed subscription yields its error as the last item.
pub async fn watch_metrics<C, K>(
    client: RpcClient<C, K>,
    cancel: CancellationToken,
) -> Result<impl Stream<Item = Result<Metrics, RpcError>>, RpcError>
where
    C: Connector,
    K: Codec,
{
    let (mut handle, task) = client.subscribe(topics::METRICS, None, cancel).await?;
    if (&mut handle.subscribed).await.is_err() {
        return Err(ended_early(task).await);
    }

    let snapshots = ReceiverStream::new(handle.messages)
        .map(move |raw| client.codec().decode::<Metrics>(&raw).map_err(RpcError::from));

    Ok(async_stream::stream! {
        tokio::pin!(snapshots);
        while let Some(snapshot) = snapshots.next().await {
            if let Err(e) = &snapshot {
                warn!(error = %e, "Undecodable metrics snapshot");
            }
            yield snapshot;
        }

        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => yield Err(e),
            Err(_) => yield Err(RpcError::SubscriptionPanicked),
        }
    })
}
