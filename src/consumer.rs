use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicQosOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::domain::RealtimeSample;
use crate::ingest::SampleIngestor;

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub url: String,
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
    pub prefetch: u16,
    /// Pause before redialing after a failed session.
    pub retry_delay: Duration,
    /// Cadence of the liveness log line.
    pub heartbeat_log_interval: Duration,
}

#[derive(thiserror::Error, Debug)]
pub enum ConsumeError {
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),
}

fn is_precondition_failed(err: &lapin::Error) -> bool {
    matches!(err, lapin::Error::ProtocolError(e) if e.get_id() == 406)
}

/// Queue consumer feeding the ingestor, one message at a time.
///
/// Deliveries are taken without acks, so a message is owned the moment it
/// arrives; a crash before the raw write loses it. Sessions that fail are
/// torn down and redialed from scratch after a fixed delay, forever.
pub struct Consumer {
    cfg: ConsumerConfig,
    ingestor: Arc<SampleIngestor>,
}

impl Consumer {
    pub fn new(cfg: ConsumerConfig, ingestor: Arc<SampleIngestor>) -> Self {
        Self { cfg, ingestor }
    }

    /// Runs until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            match self.consume_session(&cancel).await {
                Ok(()) if cancel.is_cancelled() => return,
                Ok(()) => {
                    tracing::info!("delivery stream closed, reconnecting");
                }
                Err(e) => {
                    metrics::counter!("amqp_reconnects_total").increment(1);
                    tracing::warn!(
                        error = %e,
                        delay = ?self.cfg.retry_delay,
                        "consumer session failed, reconnecting"
                    );
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.cfg.retry_delay) => {}
            }
        }
    }

    /// One connect-declare-consume session. Returns `Ok` on a clean stream
    /// end or cancellation, `Err` on any transport failure.
    async fn consume_session(&self, cancel: &CancellationToken) -> Result<(), ConsumeError> {
        let conn = Connection::connect(&self.cfg.url, ConnectionProperties::default()).await?;
        let channel = conn.create_channel().await?;

        self.declare_queue(&channel).await?;
        channel
            .queue_bind(
                &self.cfg.queue,
                &self.cfg.exchange,
                &self.cfg.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        channel
            .basic_qos(self.cfg.prefetch, BasicQosOptions::default())
            .await?;

        let mut deliveries = channel
            .basic_consume(
                &self.cfg.queue,
                "gridpulse-ingestor",
                BasicConsumeOptions {
                    no_ack: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        tracing::info!(
            queue = %self.cfg.queue,
            exchange = %self.cfg.exchange,
            routing_key = %self.cfg.routing_key,
            "consuming"
        );

        let mut heartbeat = tokio::time::interval(self.cfg.heartbeat_log_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut received: u64 = 0;
        let mut last_delivery = tokio::time::Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = conn.close(200, "shutting down").await;
                    return Ok(());
                }
                _ = heartbeat.tick() => {
                    tracing::info!(received, idle = ?last_delivery.elapsed(), "consumer heartbeat");
                }
                delivery = deliveries.next() => {
                    match delivery {
                        Some(Ok(delivery)) => {
                            received += 1;
                            last_delivery = tokio::time::Instant::now();
                            metrics::counter!("amqp_messages_received_total").increment(1);
                            self.handle_payload(&delivery.data).await;
                        }
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    /// Declare the durable queue. A 406 precondition-failed (typically a
    /// property mismatch after a broker restart) is retried exactly once
    /// with identical parameters before the session is torn down.
    async fn declare_queue(&self, channel: &Channel) -> Result<(), ConsumeError> {
        let opts = QueueDeclareOptions {
            durable: true,
            ..Default::default()
        };

        match channel
            .queue_declare(&self.cfg.queue, opts, FieldTable::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_precondition_failed(&e) => {
                tracing::warn!(
                    queue = %self.cfg.queue, error = %e,
                    "queue declare precondition failed, retrying once"
                );
                channel
                    .queue_declare(&self.cfg.queue, opts, FieldTable::default())
                    .await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Decode and ingest one delivery. Undecodable payloads are dropped with
    /// a warning; they are never fatal to the session.
    async fn handle_payload(&self, body: &[u8]) {
        let sample = match serde_json::from_slice::<RealtimeSample>(body) {
            Ok(sample) => sample,
            Err(e) => {
                metrics::counter!("amqp_decode_errors_total").increment(1);
                tracing::warn!(error = %e, bytes = body.len(), "dropping undecodable message");
                return;
            }
        };

        self.ingestor.process(sample).await;
    }
}
