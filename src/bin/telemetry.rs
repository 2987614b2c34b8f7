use std::time::Duration;

use anyhow::Result;
use boxy_bus::services::monitoring::{Cpu, Memory, Metrics, MetricsPublisher, NetworkInterface};
use boxy_bus::stream_set::{self, SseWriter, sse::read_events};
use boxy_bus::{BusConfig, CorrelationId, MemoryBroker, logging, topics};
use futures::StreamExt;
use rand::Rng;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const SESSIONS: usize = 3;

fn sample() -> Metrics {
    let mut rng = rand::rng();
    let averages: Vec<f64> = (0..4).map(|_| rng.random_range(0.0..100.0)).collect();
    let average = averages.iter().sum::<f64>() / averages.len() as f64;

    let total = 16_384_000;
    let free = rng.random_range(1_000_000..total);
    let swap_total = 2_048_000;
    let swap_free = rng.random_range(0..=swap_total);

    Metrics {
        cpu: Cpu {
            count: averages.len(),
            average,
            averages,
        },
        memory: Memory {
            total,
            free,
            occupied: total - free,
            available: free,
            swap_total,
            swap_free,
            swap_occupied: swap_total - swap_free,
        },
        network: vec![NetworkInterface {
            name: "eth0".to_string(),
            download: rng.random_range(0.0..1_000_000.0),
            upload: rng.random_range(0.0..250_000.0),
        }],
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init_from_env();
    let config = BusConfig::from_env()?;
    let ticks: u64 = std::env::var("BOXY_TELEMETRY_TICKS")
        .unwrap_or_else(|_| "5".to_string())
        .parse()?;

    let broker = MemoryBroker::new();
    let (client, _server) = boxy_bus::connect(broker, &config);
    let cancel = CancellationToken::new();

    let feed = stream_set::feed(
        &client,
        topics::METRICS,
        config.stream_set.clone(),
        cancel.clone(),
    )
    .await?;

    let mut sessions = Vec::with_capacity(SESSIONS);
    for session in 0..SESSIONS {
        let id = CorrelationId::generate();
        let output = feed.set.attach(id).await?;
        let (writer, reader) = tokio::io::duplex(4096);

        tokio::spawn(async move {
            let mut sse = SseWriter::new(writer);
            if let Err(e) = sse.run(output).await {
                warn!(session, "Event stream write failed: {e}");
            }
        });

        sessions.push(tokio::spawn(async move {
            let events = read_events(BufReader::new(reader));
            tokio::pin!(events);

            let mut received = 0usize;
            while let Some(event) = events.next().await {
                match event.map(|raw| serde_json::from_slice::<Metrics>(&raw)) {
                    Ok(Ok(metrics)) => {
                        received += 1;
                        info!(
                            session,
                            cpu = metrics.cpu.average,
                            memory_free = metrics.memory.free,
                            "Received metrics"
                        );
                    }
                    Ok(Err(e)) => warn!(session, "Undecodable event: {e}"),
                    Err(e) => {
                        warn!(session, "Event stream read failed: {e}");
                        break;
                    }
                }
            }
            received
        }));
    }

    let publisher = MetricsPublisher::new(client);
    let mut interval = tokio::time::interval(Duration::from_millis(500));
    for tick in 0..ticks {
        interval.tick().await;
        let watchers = publisher.send(&sample()).await?;
        info!(tick, watchers, "Published metrics");
    }

    cancel.cancel();
    feed.subscription.await??;
    feed.driver.await?;

    for session in sessions {
        let received = session.await?;
        info!(received, "Session closed");
    }

    Ok(())
}
