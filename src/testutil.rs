//! In-memory fakes for the storage traits, shared across module tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::domain::{DailyAggregate, HourlyAggregate, MonthlyAggregate, RealtimeSample, Tariff};
use crate::store::{AggregateStore, LiveCache, RawSampleStore, StoreError, TariffStore};

/// A plausible reading with fixed electrical values; tests override what
/// they care about.
pub fn sample_at(device_id: &str, recorded_at: OffsetDateTime) -> RealtimeSample {
    RealtimeSample {
        device_id: device_id.to_string(),
        voltage: 230.0,
        current: 5.0,
        power: 1150.0,
        energy: 100.0,
        power_factor: 0.95,
        frequency: 50.0,
        power_surge: 0.0,
        power_surge_percent: 0.0,
        recorded_at,
    }
}

pub fn hourly_row(
    device_id: &str,
    bucket_start: OffsetDateTime,
    avg_power: f64,
    min_power: f64,
    max_power: f64,
    energy_kwh: f64,
) -> HourlyAggregate {
    HourlyAggregate {
        device_id: device_id.to_string(),
        bucket_start,
        energy_kwh,
        total_cost: energy_kwh * 1100.0,
        avg_voltage: 230.0,
        avg_current: 5.0,
        avg_power,
        min_power,
        max_power,
        created_at: bucket_start,
    }
}

pub fn daily_row(
    device_id: &str,
    bucket_start: OffsetDateTime,
    energy_kwh: f64,
    total_cost: f64,
) -> DailyAggregate {
    DailyAggregate {
        device_id: device_id.to_string(),
        bucket_start,
        energy_kwh,
        total_cost,
        avg_voltage: 230.0,
        avg_current: 5.0,
        avg_power: 1150.0,
        min_power: 900.0,
        max_power: 1400.0,
        created_at: bucket_start,
    }
}

#[derive(Default)]
pub struct MemoryRawStore {
    pub samples: Mutex<Vec<RealtimeSample>>,
    pub fail_writes: AtomicBool,
    pub fail_active: AtomicBool,
}

#[async_trait]
impl RawSampleStore for MemoryRawStore {
    async fn insert(&self, sample: &RealtimeSample) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Raw("raw writes disabled".into()));
        }
        self.samples.lock().unwrap().push(sample.clone());
        Ok(())
    }

    async fn samples_between(
        &self,
        device_id: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<RealtimeSample>, StoreError> {
        let mut out: Vec<RealtimeSample> = self
            .samples
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.device_id == device_id && s.recorded_at >= start && s.recorded_at < end)
            .cloned()
            .collect();
        out.sort_by_key(|s| s.recorded_at);
        Ok(out)
    }

    async fn active_devices(&self, since: OffsetDateTime) -> Result<Vec<String>, StoreError> {
        if self.fail_active.load(Ordering::SeqCst) {
            return Err(StoreError::Raw("device lookup disabled".into()));
        }
        let mut out: Vec<String> = Vec::new();
        for sample in self.samples.lock().unwrap().iter() {
            if sample.recorded_at >= since && !out.contains(&sample.device_id) {
                out.push(sample.device_id.clone());
            }
        }
        Ok(out)
    }
}

#[derive(Default)]
pub struct MemoryCache {
    pub latest: Mutex<HashMap<String, RealtimeSample>>,
    pub history: Mutex<Vec<RealtimeSample>>,
    pub fail_reads: AtomicBool,
}

#[async_trait]
impl LiveCache for MemoryCache {
    async fn latest(&self, device_id: &str) -> Result<Option<RealtimeSample>, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Cache("cache reads disabled".into()));
        }
        Ok(self.latest.lock().unwrap().get(device_id).cloned())
    }

    async fn put_latest(&self, sample: &RealtimeSample) -> Result<(), StoreError> {
        self.latest
            .lock()
            .unwrap()
            .insert(sample.device_id.clone(), sample.clone());
        Ok(())
    }

    async fn push_history(&self, sample: &RealtimeSample) -> Result<(), StoreError> {
        self.history.lock().unwrap().push(sample.clone());
        Ok(())
    }
}

type BucketKey = (String, OffsetDateTime);

#[derive(Default)]
pub struct MemoryAggregateStore {
    pub hourly: Mutex<HashMap<BucketKey, HourlyAggregate>>,
    pub daily: Mutex<HashMap<BucketKey, DailyAggregate>>,
    pub monthly: Mutex<HashMap<BucketKey, MonthlyAggregate>>,
}

#[async_trait]
impl AggregateStore for MemoryAggregateStore {
    async fn upsert_hourly(&self, row: &HourlyAggregate) -> Result<(), StoreError> {
        self.hourly
            .lock()
            .unwrap()
            .insert((row.device_id.clone(), row.bucket_start), row.clone());
        Ok(())
    }

    async fn hourly_between(
        &self,
        device_id: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<HourlyAggregate>, StoreError> {
        let mut out: Vec<HourlyAggregate> = self
            .hourly
            .lock()
            .unwrap()
            .values()
            .filter(|row| {
                row.device_id == device_id && row.bucket_start >= start && row.bucket_start < end
            })
            .cloned()
            .collect();
        out.sort_by_key(|row| row.bucket_start);
        Ok(out)
    }

    async fn upsert_daily(&self, row: &DailyAggregate) -> Result<(), StoreError> {
        self.daily
            .lock()
            .unwrap()
            .insert((row.device_id.clone(), row.bucket_start), row.clone());
        Ok(())
    }

    async fn daily_between(
        &self,
        device_id: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<DailyAggregate>, StoreError> {
        let mut out: Vec<DailyAggregate> = self
            .daily
            .lock()
            .unwrap()
            .values()
            .filter(|row| {
                row.device_id == device_id && row.bucket_start >= start && row.bucket_start < end
            })
            .cloned()
            .collect();
        out.sort_by_key(|row| row.bucket_start);
        Ok(out)
    }

    async fn upsert_monthly(&self, row: &MonthlyAggregate) -> Result<(), StoreError> {
        self.monthly
            .lock()
            .unwrap()
            .insert((row.device_id.clone(), row.bucket_start), row.clone());
        Ok(())
    }
}

pub struct FixedTariffs {
    tariff: Option<Tariff>,
    fail: bool,
}

impl FixedTariffs {
    pub fn with_price(price_per_kwh: f64) -> Self {
        Self {
            tariff: Some(Tariff {
                tariff_type: "R1".into(),
                power_va: 2200,
                price_per_kwh,
                effective_from: OffsetDateTime::UNIX_EPOCH,
                effective_to: None,
            }),
            fail: false,
        }
    }

    pub fn none() -> Self {
        Self {
            tariff: None,
            fail: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            tariff: None,
            fail: true,
        }
    }
}

#[async_trait]
impl TariffStore for FixedTariffs {
    async fn tariff_at(&self, _at: OffsetDateTime) -> Result<Option<Tariff>, StoreError> {
        if self.fail {
            return Err(StoreError::Tariff("tariff lookups disabled".into()));
        }
        Ok(self.tariff.clone())
    }
}
