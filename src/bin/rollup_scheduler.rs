use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use gridpulse::aggregate::Aggregator;
use gridpulse::buckets::BucketClock;
use gridpulse::config::AppConfig;
use gridpulse::scheduler::{RollupScheduler, SchedulerSettings};
use gridpulse::store::postgres::{PgAggregateStore, PgTariffStore};
use gridpulse::store::questdb::QuestDbRawStore;
use gridpulse::store::RawSampleStore;
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

    let clock = BucketClock::new(cfg.time.utc_offset()?);

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

    let pg_pool = PgPoolOptions::new()
        .max_connections(cfg.postgres.max_connections)
        .connect(&cfg.postgres.uri)
        .await
        .context("connecting to PostgreSQL")?;
    let aggregates = Arc::new(PgAggregateStore::new(pg_pool.clone()));
    let tariffs = Arc::new(PgTariffStore::new(pg_pool));

    let aggregator = Aggregator::new(raw.clone(), aggregates, tariffs, clock);
    let scheduler = RollupScheduler::new(
        aggregator,
        raw,
        clock,
        SchedulerSettings {
            default_device: cfg.scheduler.default_device.clone(),
            active_window: Duration::from_secs(cfg.scheduler.active_window_hours * 3600),
            reminder_interval: Duration::from_secs(cfg.scheduler.reminder_interval_secs),
        },
    );

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        signals::shutdown_signal().await;
        tracing::info!("shutdown signal received");
        signal_cancel.cancel();
    });

    scheduler.run(cancel).await;
    Ok(())
}
