use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::domain::RealtimeSample;
use crate::store::{LiveCache, StoreError};

fn latest_key(device_id: &str) -> String {
    format!("latest:{device_id}")
}

fn history_key(sample: &RealtimeSample) -> String {
    format!(
        "history:{}:{}",
        sample.device_id,
        sample.recorded_at.unix_timestamp()
    )
}

/// Live view in Redis: one unexpiring latest entry per device plus
/// short-lived history entries keyed by sample timestamp.
pub struct RedisLiveCache {
    conn: ConnectionManager,
    history_ttl: Duration,
}

impl RedisLiveCache {
    pub async fn connect(url: &str, history_ttl: Duration) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)
            .map_err(|e| StoreError::Cache(format!("invalid redis url: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Cache(format!("redis connect failed: {e}")))?;

        Ok(Self { conn, history_ttl })
    }
}

#[async_trait]
impl LiveCache for RedisLiveCache {
    async fn latest(&self, device_id: &str) -> Result<Option<RealtimeSample>, StoreError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(latest_key(device_id))
            .await
            .map_err(|e| StoreError::Cache(e.to_string()))?;

        match raw {
            Some(payload) => serde_json::from_str(&payload)
                .map(Some)
                .map_err(|e| StoreError::Cache(format!("corrupt latest entry: {e}"))),
            None => Ok(None),
        }
    }

    async fn put_latest(&self, sample: &RealtimeSample) -> Result<(), StoreError> {
        let payload =
            serde_json::to_string(sample).map_err(|e| StoreError::Cache(e.to_string()))?;

        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(latest_key(&sample.device_id), payload)
            .await
            .map_err(|e| StoreError::Cache(e.to_string()))
    }

    async fn push_history(&self, sample: &RealtimeSample) -> Result<(), StoreError> {
        let payload =
            serde_json::to_string(sample).map_err(|e| StoreError::Cache(e.to_string()))?;

        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(history_key(sample), payload, self.history_ttl.as_secs())
            .await
            .map_err(|e| StoreError::Cache(e.to_string()))
    }
}
