use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::domain::{DailyAggregate, HourlyAggregate, MonthlyAggregate, Tariff};
use crate::store::{AggregateStore, StoreError, TariffStore};

/// Rollup rows in PostgreSQL. Reruns for the same bucket overwrite the
/// previous row, keyed on (device_id, bucket_start).
pub struct PgAggregateStore {
    pool: PgPool,
}

impl PgAggregateStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AggregateStore for PgAggregateStore {
    async fn upsert_hourly(&self, row: &HourlyAggregate) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO hourly_aggregates
                (device_id, bucket_start, energy_kwh, total_cost,
                 avg_voltage, avg_current, avg_power, min_power, max_power, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (device_id, bucket_start) DO UPDATE SET
                energy_kwh = EXCLUDED.energy_kwh,
                total_cost = EXCLUDED.total_cost,
                avg_voltage = EXCLUDED.avg_voltage,
                avg_current = EXCLUDED.avg_current,
                avg_power = EXCLUDED.avg_power,
                min_power = EXCLUDED.min_power,
                max_power = EXCLUDED.max_power,
                created_at = EXCLUDED.created_at
            "#,
        )
        .bind(&row.device_id)
        .bind(row.bucket_start)
        .bind(row.energy_kwh)
        .bind(row.total_cost)
        .bind(row.avg_voltage)
        .bind(row.avg_current)
        .bind(row.avg_power)
        .bind(row.min_power)
        .bind(row.max_power)
        .bind(row.created_at)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(|e| StoreError::Aggregate(e.to_string()))
    }

    async fn hourly_between(
        &self,
        device_id: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<HourlyAggregate>, StoreError> {
        sqlx::query_as::<_, HourlyAggregate>(
            r#"
            SELECT device_id, bucket_start, energy_kwh, total_cost,
                   avg_voltage, avg_current, avg_power, min_power, max_power, created_at
            FROM hourly_aggregates
            WHERE device_id = $1
              AND bucket_start >= $2
              AND bucket_start < $3
            ORDER BY bucket_start
            "#,
        )
        .bind(device_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Aggregate(e.to_string()))
    }

    async fn upsert_daily(&self, row: &DailyAggregate) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO daily_aggregates
                (device_id, bucket_start, energy_kwh, total_cost,
                 avg_voltage, avg_current, avg_power, min_power, max_power, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (device_id, bucket_start) DO UPDATE SET
                energy_kwh = EXCLUDED.energy_kwh,
                total_cost = EXCLUDED.total_cost,
                avg_voltage = EXCLUDED.avg_voltage,
                avg_current = EXCLUDED.avg_current,
                avg_power = EXCLUDED.avg_power,
                min_power = EXCLUDED.min_power,
                max_power = EXCLUDED.max_power,
                created_at = EXCLUDED.created_at
            "#,
        )
        .bind(&row.device_id)
        .bind(row.bucket_start)
        .bind(row.energy_kwh)
        .bind(row.total_cost)
        .bind(row.avg_voltage)
        .bind(row.avg_current)
        .bind(row.avg_power)
        .bind(row.min_power)
        .bind(row.max_power)
        .bind(row.created_at)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(|e| StoreError::Aggregate(e.to_string()))
    }

    async fn daily_between(
        &self,
        device_id: &str,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<Vec<DailyAggregate>, StoreError> {
        sqlx::query_as::<_, DailyAggregate>(
            r#"
            SELECT device_id, bucket_start, energy_kwh, total_cost,
                   avg_voltage, avg_current, avg_power, min_power, max_power, created_at
            FROM daily_aggregates
            WHERE device_id = $1
              AND bucket_start >= $2
              AND bucket_start < $3
            ORDER BY bucket_start
            "#,
        )
        .bind(device_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Aggregate(e.to_string()))
    }

    async fn upsert_monthly(&self, row: &MonthlyAggregate) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO monthly_aggregates
                (device_id, bucket_start, energy_kwh, total_cost, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (device_id, bucket_start) DO UPDATE SET
                energy_kwh = EXCLUDED.energy_kwh,
                total_cost = EXCLUDED.total_cost,
                created_at = EXCLUDED.created_at
            "#,
        )
        .bind(&row.device_id)
        .bind(row.bucket_start)
        .bind(row.energy_kwh)
        .bind(row.total_cost)
        .bind(row.created_at)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(|e| StoreError::Aggregate(e.to_string()))
    }
}

/// Tariff schedule in PostgreSQL.
pub struct PgTariffStore {
    pool: PgPool,
}

impl PgTariffStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TariffStore for PgTariffStore {
    async fn tariff_at(&self, at: OffsetDateTime) -> Result<Option<Tariff>, StoreError> {
        sqlx::query_as::<_, Tariff>(
            r#"
            SELECT tariff_type, power_va, price_per_kwh, effective_from, effective_to
            FROM tariffs
            WHERE effective_from <= $1
              AND (effective_to IS NULL OR effective_to >= $1)
            ORDER BY effective_from DESC
            LIMIT 1
            "#,
        )
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Tariff(e.to_string()))
    }
}
