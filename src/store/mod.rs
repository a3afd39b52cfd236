//! Storage seams for the pipeline.
//!
//! Each backend concern is a small trait so the ingestion and rollup paths
//! can be exercised against in-memory fakes. Production wiring uses QuestDB
//! for raw samples, PostgreSQL for aggregates and tariffs, and Redis for the
//! live view.

pub mod postgres;
pub mod questdb;
pub mod redis;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::domain::{DailyAggregate, HourlyAggregate, MonthlyAggregate, RealtimeSample, Tariff};

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("raw store error: {0}")]
    Raw(String),

    #[error("aggregate store error: {0}")]
    Aggregate(String),

    #[error("tariff store error: {0}")]
    Tariff(String),

    #[error("cache error: {0}")]
    Cache(String),
}

/// Append-only archive of every accepted sample.
#[async_trait]
pub trait RawSampleStore: Send + Sync {
    async fn insert(&self, sample: &RealtimeSample) -> Result<(), StoreError>;

    /// Samples for a device with `start <= recorded_at < end`, oldest first.
    async fn samples_between(
        &self,
        device_id: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<RealtimeSample>, StoreError>;

    /// Devices with at least one sample since `since`.
    async fn active_devices(&self, since: OffsetDateTime) -> Result<Vec<String>, StoreError>;
}

/// Rollup rows, upserted on (device_id, bucket_start).
#[async_trait]
pub trait AggregateStore: Send + Sync {
    async fn upsert_hourly(&self, row: &HourlyAggregate) -> Result<(), StoreError>;

    async fn hourly_between(
        &self,
        device_id: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<HourlyAggregate>, StoreError>;

    async fn upsert_daily(&self, row: &DailyAggregate) -> Result<(), StoreError>;

    async fn daily_between(
        &self,
        device_id: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<DailyAggregate>, StoreError>;

    async fn upsert_monthly(&self, row: &MonthlyAggregate) -> Result<(), StoreError>;
}

/// Price schedule lookups.
#[async_trait]
pub trait TariffStore: Send + Sync {
    /// The tariff whose effective range contains `at`, if any.
    async fn tariff_at(&self, at: OffsetDateTime) -> Result<Option<Tariff>, StoreError>;
}

/// Latest-value and short-lived history entries backing the live view.
#[async_trait]
pub trait LiveCache: Send + Sync {
    async fn latest(&self, device_id: &str) -> Result<Option<RealtimeSample>, StoreError>;

    async fn put_latest(&self, sample: &RealtimeSample) -> Result<(), StoreError>;

    async fn push_history(&self, sample: &RealtimeSample) -> Result<(), StoreError>;
}
