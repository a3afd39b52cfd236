use std::sync::Arc;

use time::OffsetDateTime;

use crate::buckets::{BucketClock, Granularity};
use crate::domain::{DailyAggregate, HourlyAggregate, MonthlyAggregate, RealtimeSample, Tariff};
use crate::store::{AggregateStore, RawSampleStore, StoreError, TariffStore};

/// Flat surcharge multiplier applied on top of the tariff price.
pub const COST_SURCHARGE: f64 = 1.10;

#[derive(thiserror::Error, Debug)]
pub enum AggregateError {
    #[error("no data for device {device_id} in bucket starting {bucket_start}")]
    NoData {
        device_id: String,
        bucket_start: OffsetDateTime,
    },

    #[error("no tariff effective at {0}")]
    NoTariff(OffsetDateTime),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Mean voltage/current/power and the power extremes over one bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerSummary {
    pub avg_voltage: f64,
    pub avg_current: f64,
    pub avg_power: f64,
    pub min_power: f64,
    pub max_power: f64,
}

/// Summarize raw samples; `None` when the slice is empty.
pub fn summarize_samples(samples: &[RealtimeSample]) -> Option<PowerSummary> {
    let first = samples.first()?;
    let mut summary = PowerSummary {
        avg_voltage: 0.0,
        avg_current: 0.0,
        avg_power: 0.0,
        min_power: first.power,
        max_power: first.power,
    };

    for sample in samples {
        summary.avg_voltage += sample.voltage;
        summary.avg_current += sample.current;
        summary.avg_power += sample.power;
        summary.min_power = summary.min_power.min(sample.power);
        summary.max_power = summary.max_power.max(sample.power);
    }

    let n = samples.len() as f64;
    summary.avg_voltage /= n;
    summary.avg_current /= n;
    summary.avg_power /= n;
    Some(summary)
}

/// Energy consumed over a bucket of counter readings, in kWh.
///
/// The samples carry a cumulative register, so consumption is the last
/// reading minus the first, clamped at zero for counter resets.
pub fn bucket_energy(samples: &[RealtimeSample]) -> f64 {
    match (samples.first(), samples.last()) {
        (Some(first), Some(last)) => (last.energy - first.energy).max(0.0),
        _ => 0.0,
    }
}

/// Billable cost for `energy_kwh` under `tariff`, surcharge included.
pub fn billable_cost(energy_kwh: f64, tariff: &Tariff) -> f64 {
    energy_kwh * tariff.price_per_kwh * COST_SURCHARGE
}

/// Roll a day's hourly rows up: averages of the hourly averages, overall
/// extremes of the hourly extremes.
fn summarize_hourlies(rows: &[HourlyAggregate]) -> Option<PowerSummary> {
    let first = rows.first()?;
    let mut summary = PowerSummary {
        avg_voltage: 0.0,
        avg_current: 0.0,
        avg_power: 0.0,
        min_power: first.min_power,
        max_power: first.max_power,
    };

    for row in rows {
        summary.avg_voltage += row.avg_voltage;
        summary.avg_current += row.avg_current;
        summary.avg_power += row.avg_power;
        summary.min_power = summary.min_power.min(row.min_power);
        summary.max_power = summary.max_power.max(row.max_power);
    }

    let n = rows.len() as f64;
    summary.avg_voltage /= n;
    summary.avg_current /= n;
    summary.avg_power /= n;
    Some(summary)
}

/// Computes hourly, daily and monthly rollups from the raw archive.
///
/// Rollups are idempotent: rerunning a bucket overwrites the previous row.
/// Empty buckets are an error, never a zero-filled row.
pub struct Aggregator {
    raw: Arc<dyn RawSampleStore>,
    aggregates: Arc<dyn AggregateStore>,
    tariffs: Arc<dyn TariffStore>,
    clock: BucketClock,
}

impl Aggregator {
    pub fn new(
        raw: Arc<dyn RawSampleStore>,
        aggregates: Arc<dyn AggregateStore>,
        tariffs: Arc<dyn TariffStore>,
        clock: BucketClock,
    ) -> Self {
        Self {
            raw,
            aggregates,
            tariffs,
            clock,
        }
    }

    /// Roll the hour containing `target` into `hourly_aggregates`.
    pub async fn hourly_rollup(
        &self,
        device_id: &str,
        target: OffsetDateTime,
    ) -> Result<HourlyAggregate, AggregateError> {
        let (start, end) = self.clock.range(target, Granularity::Hour);
        let samples = self.raw.samples_between(device_id, start, end).await?;

        let summary = summarize_samples(&samples).ok_or_else(|| AggregateError::NoData {
            device_id: device_id.to_string(),
            bucket_start: start,
        })?;
        let energy = bucket_energy(&samples);
        let tariff = self.current_tariff().await?;

        let row = HourlyAggregate {
            device_id: device_id.to_string(),
            bucket_start: start,
            energy_kwh: energy,
            total_cost: billable_cost(energy, &tariff),
            avg_voltage: summary.avg_voltage,
            avg_current: summary.avg_current,
            avg_power: summary.avg_power,
            min_power: summary.min_power,
            max_power: summary.max_power,
            created_at: self.clock.now(),
        };
        self.aggregates.upsert_hourly(&row).await?;
        Ok(row)
    }

    /// Roll the local day containing `target` up from its hourly rows.
    pub async fn daily_rollup(
        &self,
        device_id: &str,
        target: OffsetDateTime,
    ) -> Result<DailyAggregate, AggregateError> {
        let (start, end) = self.clock.range(target, Granularity::Day);
        let hourlies = self.aggregates.hourly_between(device_id, start, end).await?;

        let summary = summarize_hourlies(&hourlies).ok_or_else(|| AggregateError::NoData {
            device_id: device_id.to_string(),
            bucket_start: start,
        })?;
        let energy: f64 = hourlies.iter().map(|row| row.energy_kwh).sum();
        let tariff = self.current_tariff().await?;

        let row = DailyAggregate {
            device_id: device_id.to_string(),
            bucket_start: start,
            energy_kwh: energy,
            total_cost: billable_cost(energy, &tariff),
            avg_voltage: summary.avg_voltage,
            avg_current: summary.avg_current,
            avg_power: summary.avg_power,
            min_power: summary.min_power,
            max_power: summary.max_power,
            created_at: self.clock.now(),
        };
        self.aggregates.upsert_daily(&row).await?;
        Ok(row)
    }

    /// Refresh the month-to-date row from the daily rows up to and including
    /// the local day containing `target`.
    ///
    /// Energy and cost are sums of the daily figures; no tariff lookup
    /// happens here. On the first local day of a month only that single
    /// daily row exists, and it stands in for the whole month.
    pub async fn monthly_rollup(
        &self,
        device_id: &str,
        target: OffsetDateTime,
    ) -> Result<MonthlyAggregate, AggregateError> {
        let day_start = self.clock.truncate(target, Granularity::Day);
        let day_end = day_start + time::Duration::days(1);
        let month_start = self.clock.truncate(target, Granularity::Month);

        let dailies = if self.clock.is_first_of_month(target) {
            self.aggregates
                .daily_between(device_id, day_start, day_end)
                .await?
        } else {
            self.aggregates
                .daily_between(device_id, month_start, day_end)
                .await?
        };

        if dailies.is_empty() {
            return Err(AggregateError::NoData {
                device_id: device_id.to_string(),
                bucket_start: month_start,
            });
        }

        let row = MonthlyAggregate {
            device_id: device_id.to_string(),
            bucket_start: month_start,
            energy_kwh: dailies.iter().map(|row| row.energy_kwh).sum(),
            total_cost: dailies.iter().map(|row| row.total_cost).sum(),
            created_at: self.clock.now(),
        };
        self.aggregates.upsert_monthly(&row).await?;
        Ok(row)
    }

    async fn current_tariff(&self) -> Result<Tariff, AggregateError> {
        let now = self.clock.now();
        self.tariffs
            .tariff_at(now)
            .await?
            .ok_or(AggregateError::NoTariff(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{
        daily_row, hourly_row, sample_at, FixedTariffs, MemoryAggregateStore, MemoryRawStore,
    };
    use time::macros::datetime;

    const PRICE: f64 = 1000.0;

    fn fixture(
        tariffs: FixedTariffs,
    ) -> (
        Arc<MemoryRawStore>,
        Arc<MemoryAggregateStore>,
        Aggregator,
    ) {
        let raw = Arc::new(MemoryRawStore::default());
        let aggregates = Arc::new(MemoryAggregateStore::default());
        let aggregator = Aggregator::new(
            raw.clone(),
            aggregates.clone(),
            Arc::new(tariffs),
            BucketClock::utc(),
        );
        (raw, aggregates, aggregator)
    }

    fn seed_hour(raw: &MemoryRawStore) {
        let mut samples = raw.samples.lock().unwrap();
        for (minute, power, energy) in [(5, 10.0, 100.0), (15, 20.0, 101.0), (25, 15.0, 103.0)] {
            let mut s = sample_at(
                "meter-01",
                datetime!(2024-03-10 14:00:00 UTC) + time::Duration::minutes(minute),
            );
            s.power = power;
            s.energy = energy;
            samples.push(s);
        }
    }

    #[tokio::test]
    async fn hourly_rollup_summarizes_power_and_counter_energy() {
        let (raw, aggregates, aggregator) = fixture(FixedTariffs::with_price(PRICE));
        seed_hour(&raw);

        let row = aggregator
            .hourly_rollup("meter-01", datetime!(2024-03-10 14:00:00 UTC))
            .await
            .unwrap();

        assert_eq!(row.bucket_start, datetime!(2024-03-10 14:00:00 UTC));
        assert_eq!(row.avg_power, 15.0);
        assert_eq!(row.min_power, 10.0);
        assert_eq!(row.max_power, 20.0);
        assert_eq!(row.energy_kwh, 3.0);
        assert!((row.total_cost - 3.0 * PRICE * COST_SURCHARGE).abs() < 1e-9);
        assert_eq!(aggregates.hourly.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn hourly_rollup_is_idempotent() {
        let (raw, aggregates, aggregator) = fixture(FixedTariffs::with_price(PRICE));
        seed_hour(&raw);

        let first = aggregator
            .hourly_rollup("meter-01", datetime!(2024-03-10 14:30:00 UTC))
            .await
            .unwrap();
        let second = aggregator
            .hourly_rollup("meter-01", datetime!(2024-03-10 14:59:59 UTC))
            .await
            .unwrap();

        assert_eq!(aggregates.hourly.lock().unwrap().len(), 1);
        assert_eq!(first.energy_kwh, second.energy_kwh);
        assert_eq!(first.total_cost, second.total_cost);
        assert_eq!(first.avg_power, second.avg_power);
    }

    #[tokio::test]
    async fn empty_bucket_is_an_error_not_a_zero_row() {
        let (_raw, aggregates, aggregator) = fixture(FixedTariffs::with_price(PRICE));

        let err = aggregator
            .hourly_rollup("meter-01", datetime!(2024-03-10 14:00:00 UTC))
            .await
            .unwrap_err();

        assert!(matches!(err, AggregateError::NoData { .. }));
        assert!(aggregates.hourly.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_tariff_fails_the_hourly_rollup() {
        let (raw, _aggregates, aggregator) = fixture(FixedTariffs::none());
        seed_hour(&raw);

        let err = aggregator
            .hourly_rollup("meter-01", datetime!(2024-03-10 14:00:00 UTC))
            .await
            .unwrap_err();
        assert!(matches!(err, AggregateError::NoTariff(_)));
    }

    #[tokio::test]
    async fn daily_rollup_averages_the_hourly_averages() {
        let (_raw, aggregates, aggregator) = fixture(FixedTariffs::with_price(PRICE));
        {
            let mut hourly = aggregates.hourly.lock().unwrap();
            let a = hourly_row("meter-01", datetime!(2024-03-10 10:00:00 UTC), 10.0, 8.0, 22.0, 1.0);
            let b = hourly_row("meter-01", datetime!(2024-03-10 11:00:00 UTC), 20.0, 12.0, 25.0, 2.0);
            hourly.insert((a.device_id.clone(), a.bucket_start), a);
            hourly.insert((b.device_id.clone(), b.bucket_start), b);
        }

        let row = aggregator
            .daily_rollup("meter-01", datetime!(2024-03-10 23:00:00 UTC))
            .await
            .unwrap();

        assert_eq!(row.bucket_start, datetime!(2024-03-10 00:00:00 UTC));
        assert_eq!(row.avg_power, 15.0);
        assert_eq!(row.min_power, 8.0);
        assert_eq!(row.max_power, 25.0);
        assert_eq!(row.energy_kwh, 3.0);
        assert!((row.total_cost - 3.0 * PRICE * COST_SURCHARGE).abs() < 1e-9);
    }

    #[tokio::test]
    async fn monthly_rollup_sums_dailies_without_a_tariff_lookup() {
        // A tariff store that would fail if consulted.
        let (_raw, aggregates, aggregator) = fixture(FixedTariffs::failing());
        {
            let mut daily = aggregates.daily.lock().unwrap();
            let a = daily_row("meter-01", datetime!(2024-03-01 00:00:00 UTC), 1.0, 110.0);
            let b = daily_row("meter-01", datetime!(2024-03-02 00:00:00 UTC), 2.0, 220.0);
            daily.insert((a.device_id.clone(), a.bucket_start), a);
            daily.insert((b.device_id.clone(), b.bucket_start), b);
        }

        let row = aggregator
            .monthly_rollup("meter-01", datetime!(2024-03-02 23:00:00 UTC))
            .await
            .unwrap();

        assert_eq!(row.bucket_start, datetime!(2024-03-01 00:00:00 UTC));
        assert_eq!(row.energy_kwh, 3.0);
        assert!((row.total_cost - 330.0).abs() < 1e-9);
        assert_eq!(aggregates.monthly.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn first_of_month_reuses_the_single_daily_row() {
        let (_raw, aggregates, aggregator) = fixture(FixedTariffs::failing());
        {
            let mut daily = aggregates.daily.lock().unwrap();
            // A leftover row from the previous month must not leak in.
            let old = daily_row("meter-01", datetime!(2024-03-31 00:00:00 UTC), 9.0, 990.0);
            let new = daily_row("meter-01", datetime!(2024-04-01 00:00:00 UTC), 5.0, 550.0);
            daily.insert((old.device_id.clone(), old.bucket_start), old);
            daily.insert((new.device_id.clone(), new.bucket_start), new);
        }

        let row = aggregator
            .monthly_rollup("meter-01", datetime!(2024-04-01 23:00:00 UTC))
            .await
            .unwrap();

        assert_eq!(row.bucket_start, datetime!(2024-04-01 00:00:00 UTC));
        assert_eq!(row.energy_kwh, 5.0);
        assert!((row.total_cost - 550.0).abs() < 1e-9);
    }

    #[test]
    fn counter_resets_clamp_bucket_energy_at_zero() {
        let mut a = sample_at("meter-01", datetime!(2024-03-10 14:00:00 UTC));
        a.energy = 100.0;
        let mut b = sample_at("meter-01", datetime!(2024-03-10 14:30:00 UTC));
        b.energy = 90.0;

        assert_eq!(bucket_energy(&[a, b]), 0.0);
        assert_eq!(bucket_energy(&[]), 0.0);
    }

    #[test]
    fn summaries_of_empty_slices_are_none() {
        assert_eq!(summarize_samples(&[]), None);
        assert_eq!(summarize_hourlies(&[]), None);
    }
}
