use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::aggregate::Aggregator;
use crate::buckets::{BucketClock, Granularity};
use crate::store::RawSampleStore;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    /// Device assumed present when discovery finds nothing.
    pub default_device: String,
    /// How far back a sample may lie for its device to count as active.
    pub active_window: Duration,
    /// Cadence of the countdown log line and device refresh.
    pub reminder_interval: Duration,
}

/// Wall-clock-aligned rollup driver.
///
/// The first firing is aligned to the next top of hour; afterwards a steady
/// one-hour timer takes over. Every firing rolls up the hour that just
/// elapsed; when that hour is 23:00 local, the daily and monthly rollups
/// follow. A failed device never stops the batch.
pub struct RollupScheduler {
    aggregator: Aggregator,
    raw: Arc<dyn RawSampleStore>,
    clock: BucketClock,
    settings: SchedulerSettings,
    devices: Vec<String>,
}

impl RollupScheduler {
    pub fn new(
        aggregator: Aggregator,
        raw: Arc<dyn RawSampleStore>,
        clock: BucketClock,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            aggregator,
            raw,
            clock,
            settings,
            devices: Vec::new(),
        }
    }

    /// Runs until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        self.refresh_devices().await;

        let now = self.clock.now();
        let wait = (self.clock.next_hour_boundary(now) - now).unsigned_abs();
        tracing::info!(first_run_in = ?wait, "waiting for the next hour boundary");

        let mut hourly = tokio::time::interval_at(
            tokio::time::Instant::now() + wait,
            Duration::from_secs(3600),
        );
        hourly.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut reminder = tokio::time::interval_at(
            tokio::time::Instant::now() + self.settings.reminder_interval,
            self.settings.reminder_interval,
        );
        reminder.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("rollup scheduler stopped");
                    return;
                }
                _ = hourly.tick() => {
                    self.refresh_devices().await;
                    self.run_hour_at(self.clock.now()).await;
                }
                _ = reminder.tick() => {
                    let now = self.clock.now();
                    let remaining = (self.clock.next_hour_boundary(now) - now).unsigned_abs();
                    tracing::info!(
                        next_run_in = ?remaining,
                        devices = self.devices.len(),
                        "hourly rollup pending"
                    );
                    self.refresh_devices().await;
                }
            }
        }
    }

    /// Roll up for a firing at `fired_at`: the target is the hour that just
    /// elapsed, so small timer drift past the boundary does not matter.
    async fn run_hour_at(&mut self, fired_at: OffsetDateTime) {
        let target_hour = self
            .clock
            .truncate(fired_at - Duration::from_secs(3600), Granularity::Hour);
        let devices = self.devices_or_default();
        tracing::info!(%target_hour, devices = devices.len(), "hourly rollup starting");

        for device_id in &devices {
            match self.aggregator.hourly_rollup(device_id, target_hour).await {
                Ok(row) => {
                    metrics::counter!("rollup_runs_total", "granularity" => "hourly").increment(1);
                    tracing::info!(
                        device = %device_id,
                        energy_kwh = row.energy_kwh,
                        total_cost = row.total_cost,
                        "hourly rollup stored"
                    );
                }
                Err(e) => {
                    metrics::counter!("rollup_failures_total", "granularity" => "hourly")
                        .increment(1);
                    tracing::warn!(device = %device_id, error = %e, "hourly rollup failed");
                }
            }
        }

        if self.clock.local_hour(target_hour) == 23 {
            self.run_day_at(target_hour, &devices).await;
        }
    }

    /// Daily rollup for the local day containing `day_instant`, with the
    /// monthly refresh right behind it.
    async fn run_day_at(&self, day_instant: OffsetDateTime, devices: &[String]) {
        let target_day = self.clock.truncate(day_instant, Granularity::Day);
        tracing::info!(%target_day, "daily rollup starting");

        for device_id in devices {
            match self.aggregator.daily_rollup(device_id, target_day).await {
                Ok(row) => {
                    metrics::counter!("rollup_runs_total", "granularity" => "daily").increment(1);
                    tracing::info!(
                        device = %device_id,
                        energy_kwh = row.energy_kwh,
                        "daily rollup stored"
                    );
                }
                Err(e) => {
                    metrics::counter!("rollup_failures_total", "granularity" => "daily")
                        .increment(1);
                    tracing::warn!(device = %device_id, error = %e, "daily rollup failed");
                }
            }

            match self.aggregator.monthly_rollup(device_id, target_day).await {
                Ok(row) => {
                    metrics::counter!("rollup_runs_total", "granularity" => "monthly").increment(1);
                    tracing::info!(
                        device = %device_id,
                        energy_kwh = row.energy_kwh,
                        "monthly rollup stored"
                    );
                }
                Err(e) => {
                    metrics::counter!("rollup_failures_total", "granularity" => "monthly")
                        .increment(1);
                    tracing::warn!(device = %device_id, error = %e, "monthly rollup failed");
                }
            }
        }
    }

    /// Replace the device set with the recently active ones. A failed lookup
    /// keeps the previous set.
    async fn refresh_devices(&mut self) {
        let since = self.clock.now() - self.settings.active_window;
        match self.raw.active_devices(since).await {
            Ok(devices) => self.devices = devices,
            Err(e) => {
                tracing::warn!(error = %e, "active-device lookup failed, keeping previous set");
            }
        }
    }

    fn devices_or_default(&self) -> Vec<String> {
        if self.devices.is_empty() {
            vec![self.settings.default_device.clone()]
        } else {
            self.devices.clone()
        }
    }
}
