use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// One decoded meter reading.
///
/// `energy` is the meter's cumulative register in kWh, not a per-interval
/// delta; bucket energy is derived from counter differences during rollup.
/// The surge fields are computed during ingestion and default to zero on
/// the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RealtimeSample {
    pub device_id: String,
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub energy: f64,
    pub power_factor: f64,
    pub frequency: f64,
    #[serde(default)]
    pub power_surge: f64,
    #[serde(default)]
    pub power_surge_percent: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
}

impl RealtimeSample {
    /// Exact equality on the six measured fields. Derived surge values and
    /// the timestamp are ignored.
    pub fn same_readings(&self, other: &Self) -> bool {
        self.voltage == other.voltage
            && self.current == other.current
            && self.power == other.power
            && self.energy == other.energy
            && self.power_factor == other.power_factor
            && self.frequency == other.frequency
    }
}

/// One hour of rolled-up readings for a device.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct HourlyAggregate {
    pub device_id: String,
    pub bucket_start: OffsetDateTime,
    pub energy_kwh: f64,
    pub total_cost: f64,
    pub avg_voltage: f64,
    pub avg_current: f64,
    pub avg_power: f64,
    pub min_power: f64,
    pub max_power: f64,
    pub created_at: OffsetDateTime,
}

/// One local day of rolled-up readings, derived from the hourly rows.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct DailyAggregate {
    pub device_id: String,
    pub bucket_start: OffsetDateTime,
    pub energy_kwh: f64,
    pub total_cost: f64,
    pub avg_voltage: f64,
    pub avg_current: f64,
    pub avg_power: f64,
    pub min_power: f64,
    pub max_power: f64,
    pub created_at: OffsetDateTime,
}

/// Month-to-date energy and cost, keyed by the first of the local month.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct MonthlyAggregate {
    pub device_id: String,
    pub bucket_start: OffsetDateTime,
    pub energy_kwh: f64,
    pub total_cost: f64,
    pub created_at: OffsetDateTime,
}

/// Price schedule row. At most one row is effective at any instant.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Tariff {
    pub tariff_type: String,
    pub power_va: i32,
    pub price_per_kwh: f64,
    pub effective_from: OffsetDateTime,
    pub effective_to: Option<OffsetDateTime>,
}
