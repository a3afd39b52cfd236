use std::net::SocketAddr;

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::domain::RealtimeSample;
use crate::store::{RawSampleStore, StoreError};

/// Append `s` with the ILP escapes applied: `,`, ` ` and `=` in
/// identifiers take a leading backslash.
fn push_escaped(out: &mut String, s: &str) {
    for ch in s.chars() {
        if matches!(ch, ',' | ' ' | '=') {
            out.push('\\');
        }
        out.push(ch);
    }
}

/// Append one symbol column (QuestDB's name for an ILP tag).
fn push_symbol(out: &mut String, key: &str, value: &str) {
    out.push(',');
    push_escaped(out, key);
    out.push('=');
    push_escaped(out, value);
}

/// Append one float field, comma-separating all but the first. The meter
/// schema carries float columns only, so no suffix handling is needed.
fn push_field(out: &mut String, first: &mut bool, key: &str, value: f64) {
    if !*first {
        out.push(',');
    }
    *first = false;
    push_escaped(out, key);
    out.push('=');
    out.push_str(&value.to_string());
}

/// Encode one sample as a `meter_samples` ILP line, without the trailing
/// newline. The designated timestamp is in nanoseconds.
fn write_ilp_line(sample: &RealtimeSample, out: &mut String) {
    out.push_str("meter_samples");
    push_symbol(out, "device_id", &sample.device_id);

    out.push(' ');
    let mut first = true;
    push_field(out, &mut first, "voltage", sample.voltage);
    push_field(out, &mut first, "current", sample.current);
    push_field(out, &mut first, "power", sample.power);
    push_field(out, &mut first, "energy", sample.energy);
    push_field(out, &mut first, "power_factor", sample.power_factor);
    push_field(out, &mut first, "frequency", sample.frequency);
    push_field(out, &mut first, "power_surge", sample.power_surge);
    push_field(out, &mut first, "power_surge_percent", sample.power_surge_percent);

    out.push(' ');
    out.push_str(&sample.recorded_at.unix_timestamp_nanos().to_string());
}

/// Raw sample store backed by QuestDB: ILP over TCP for appends, the
/// PostgreSQL wire protocol for reads.
pub struct QuestDbRawStore {
    ilp_addr: SocketAddr,
    ilp_conn: Mutex<Option<TcpStream>>,
    pool: PgPool,
}

impl QuestDbRawStore {
    pub fn new(ilp_addr: SocketAddr, pool: PgPool) -> Self {
        Self {
            ilp_addr,
            ilp_conn: Mutex::new(None),
            pool,
        }
    }

    async fn connect(&self) -> Result<TcpStream, StoreError> {
        let stream = TcpStream::connect(self.ilp_addr)
            .await
            .map_err(|e| StoreError::Raw(format!("failed to connect to QuestDB ILP: {e}")))?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    /// Write one encoded line, redialing at most once on a failed socket.
    async fn write_line(&self, line: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.ilp_conn.lock().await;

        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }

        if let Some(stream) = guard.as_mut() {
            match stream.write_all(line).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    metrics::counter!("questdb_ilp_redials_total").increment(1);
                    tracing::warn!(error = %e, "QuestDB ILP write failed, redialing");
                }
            }
        }

        let mut stream = self.connect().await?;
        match stream.write_all(line).await {
            Ok(()) => {
                *guard = Some(stream);
                Ok(())
            }
            Err(e) => {
                *guard = None;
                Err(StoreError::Raw(format!("ilp write failed after redial: {e}")))
            }
        }
    }
}

#[async_trait]
impl RawSampleStore for QuestDbRawStore {
    async fn insert(&self, sample: &RealtimeSample) -> Result<(), StoreError> {
        let mut line = String::with_capacity(192);
        write_ilp_line(sample, &mut line);
        line.push('\n');

        self.write_line(line.as_bytes()).await?;
        metrics::counter!("questdb_ilp_bytes_total").increment(line.len() as u64);
        Ok(())
    }

    async fn samples_between(
        &self,
        device_id: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<RealtimeSample>, StoreError> {
        sqlx::query_as::<_, RealtimeSample>(
            r#"
            SELECT
                device_id,
                voltage,
                current,
                power,
                energy,
                power_factor,
                frequency,
                power_surge,
                power_surge_percent,
                timestamp AS recorded_at
            FROM meter_samples
            WHERE device_id = $1
              AND timestamp >= $2
              AND timestamp < $3
            ORDER BY timestamp
            "#,
        )
        .bind(device_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Raw(e.to_string()))
    }

    async fn active_devices(&self, since: OffsetDateTime) -> Result<Vec<String>, StoreError> {
        sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT device_id FROM meter_samples WHERE timestamp >= $1",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Raw(e.to_string()))
    }
}
