use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use gridpulse::config::AppConfig;
use gridpulse::consumer::{Consumer, ConsumerConfig};
use gridpulse::ingest::SampleIngestor;
use gridpulse::store::questdb::QuestDbRawStore;
use gridpulse::store::redis::RedisLiveCache;
use gridpulse::store::{LiveCache, RawSampleStore};
use gridpulse::stream::{self, StreamState};
use gridpulse::{observability, signals};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;

    if let Some(metrics_cfg) = &cfg.metrics {
        observability::init_metrics(&metrics_cfg.bind_addr)?;
    }

    let questdb_pool = PgPoolOptions::new()
        .max_connections(cfg.questdb.max_connections)
        .connect(&cfg.questdb.pg_uri)
        .await
        .context("connecting to QuestDB over pgwire")?;
    let ilp_addr: SocketAddr = cfg
        .questdb
        .ilp_addr
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid questdb.ilp_addr: {e}"))?;

    let raw: Arc<dyn RawSampleStore> = Arc::new(QuestDbRawStore::new(ilp_addr, questdb_pool));
    let cache: Arc<dyn LiveCache> = Arc::new(
        RedisLiveCache::connect(
            &cfg.redis.url,
            Duration::from_secs(cfg.redis.history_ttl_secs),
        )
        .await
        .context("connecting to Redis")?,
    );

    let ingestor = Arc::new(SampleIngestor::new(
        raw,
        cache.clone(),
        cfg.ingest.clone(),
    ));
    let consumer = Consumer::new(
        ConsumerConfig {
            url: cfg.amqp.url.clone(),
            queue: cfg.amqp.queue.clone(),
            exchange: cfg.amqp.exchange.clone(),
            routing_key: cfg.amqp.routing_key.clone(),
            prefetch: cfg.amqp.prefetch,
            retry_delay: Duration::from_secs(cfg.amqp.retry_delay_secs),
            heartbeat_log_interval: Duration::from_secs(cfg.amqp.heartbeat_log_secs),
        },
        ingestor,
    );

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        signals::shutdown_signal().await;
        tracing::info!("shutdown signal received");
        signal_cancel.cancel();
    });

    let listener = tokio::net::TcpListener::bind(&cfg.stream.bind_addr)
        .await
        .with_context(|| format!("binding stream listener on {}", cfg.stream.bind_addr))?;
    tracing::info!(addr = %cfg.stream.bind_addr, "live stream listening");

    let state = StreamState {
        cache,
        cancel: cancel.clone(),
    };
    let consumer_cancel = cancel.clone();

    tokio::try_join!(
        async {
            consumer.run(consumer_cancel).await;
            Ok::<_, anyhow::Error>(())
        },
        async { stream::serve(listener, state).await.map_err(anyhow::Error::from) },
    )?;

    Ok(())
}
