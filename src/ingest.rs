use std::sync::Arc;

use serde::Deserialize;

use crate::domain::RealtimeSample;
use crate::store::{LiveCache, RawSampleStore};

/// Thresholds driving the live-view significance filter.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestSettings {
    /// Minimum previous power for the percentage surge to be computed at all.
    #[serde(default = "default_baseline_power")]
    pub baseline_power: f64,
    /// Absolute power jump (watts) that always counts as significant.
    #[serde(default = "default_surge_threshold")]
    pub surge_threshold: f64,
    /// Percentage power jump that always counts as significant.
    #[serde(default = "default_surge_percent_threshold")]
    pub surge_percent_threshold: f64,
    /// Per-field percentage delta that marks an otherwise small change
    /// significant.
    #[serde(default = "default_field_delta_percent")]
    pub field_delta_percent: f64,
}

fn default_baseline_power() -> f64 {
    50.0
}

fn default_surge_threshold() -> f64 {
    500.0
}

fn default_surge_percent_threshold() -> f64 {
    15.0
}

fn default_field_delta_percent() -> f64 {
    10.0
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            baseline_power: default_baseline_power(),
            surge_threshold: default_surge_threshold(),
            surge_percent_threshold: default_surge_percent_threshold(),
            field_delta_percent: default_field_delta_percent(),
        }
    }
}

/// What happened to one processed sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// No previous reading was cached; surge is zero and the caches were
    /// seeded.
    FirstObservation,
    /// Significant change; archived and pushed to the live view.
    Accepted,
    /// Identical to the previous reading; archived only.
    Unchanged,
    /// Changed, but below every significance threshold; archived only.
    Suppressed,
}

/// Absolute power jump against `previous` and its percentage. The percentage
/// is zero when the previous load sits below `baseline_power`.
fn surge_between(previous: &RealtimeSample, next: &RealtimeSample, baseline_power: f64) -> (f64, f64) {
    let surge = (next.power - previous.power).abs();
    let percent = if previous.power >= baseline_power {
        (surge / previous.power).abs() * 100.0
    } else {
        0.0
    };
    (surge, percent)
}

/// Percentage change from `old` to `new`. A change away from exactly zero has
/// no finite ratio and counts as infinite.
fn pct_delta(old: f64, new: f64) -> f64 {
    if old == 0.0 {
        if new == 0.0 {
            0.0
        } else {
            f64::INFINITY
        }
    } else {
        ((new - old) / old).abs() * 100.0
    }
}

/// Whether `sample` (with its surge fields already derived) differs enough
/// from `previous` to refresh the live view.
fn is_significant(previous: &RealtimeSample, sample: &RealtimeSample, s: &IngestSettings) -> bool {
    if sample.power_surge > s.surge_threshold
        || sample.power_surge_percent > s.surge_percent_threshold
    {
        return true;
    }

    [
        (previous.power, sample.power),
        (previous.voltage, sample.voltage),
        (previous.current, sample.current),
        (previous.energy, sample.energy),
        (previous.power_factor, sample.power_factor),
        (previous.frequency, sample.frequency),
    ]
    .iter()
    .any(|&(old, new)| pct_delta(old, new) > s.field_delta_percent)
}

/// Per-sample pipeline: derive surge, archive unconditionally, then decide
/// whether the live view moves.
///
/// Raw persistence never depends on the change filter, and a raw-store
/// failure never stops the sample from reaching the caches.
pub struct SampleIngestor {
    raw: Arc<dyn RawSampleStore>,
    cache: Arc<dyn LiveCache>,
    settings: IngestSettings,
}

impl SampleIngestor {
    pub fn new(
        raw: Arc<dyn RawSampleStore>,
        cache: Arc<dyn LiveCache>,
        settings: IngestSettings,
    ) -> Self {
        Self {
            raw,
            cache,
            settings,
        }
    }

    pub async fn process(&self, mut sample: RealtimeSample) -> IngestOutcome {
        let previous = match self.cache.latest(&sample.device_id).await {
            Ok(previous) => previous,
            Err(e) => {
                tracing::warn!(
                    device = %sample.device_id, error = %e,
                    "latest-cache read failed, treating sample as a first observation"
                );
                None
            }
        };

        match &previous {
            Some(prev) => {
                let (surge, percent) = surge_between(prev, &sample, self.settings.baseline_power);
                sample.power_surge = surge;
                sample.power_surge_percent = percent;
            }
            None => {
                sample.power_surge = 0.0;
                sample.power_surge_percent = 0.0;
            }
        }

        match self.raw.insert(&sample).await {
            Ok(()) => {
                metrics::counter!("raw_samples_written_total").increment(1);
            }
            Err(e) => {
                metrics::counter!("raw_store_write_errors_total").increment(1);
                tracing::warn!(
                    device = %sample.device_id, error = %e,
                    "raw store write failed, continuing"
                );
            }
        }

        let prev = match previous {
            Some(prev) => prev,
            None => {
                self.update_cache(&sample).await;
                tracing::debug!(device = %sample.device_id, "first observation cached");
                return IngestOutcome::FirstObservation;
            }
        };

        if sample.same_readings(&prev) {
            tracing::debug!(device = %sample.device_id, "readings unchanged");
            return IngestOutcome::Unchanged;
        }

        if !is_significant(&prev, &sample, &self.settings) {
            metrics::counter!("samples_suppressed_total").increment(1);
            tracing::debug!(
                device = %sample.device_id,
                surge = sample.power_surge,
                "insignificant change suppressed"
            );
            return IngestOutcome::Suppressed;
        }

        self.update_cache(&sample).await;
        metrics::counter!("live_view_updates_total").increment(1);
        tracing::debug!(
            device = %sample.device_id,
            surge = sample.power_surge,
            surge_percent = sample.power_surge_percent,
            "sample accepted into the live view"
        );
        IngestOutcome::Accepted
    }

    async fn update_cache(&self, sample: &RealtimeSample) {
        if let Err(e) = self.cache.put_latest(sample).await {
            metrics::counter!("cache_write_errors_total").increment(1);
            tracing::warn!(device = %sample.device_id, error = %e, "latest-cache write failed");
        }
        if let Err(e) = self.cache.push_history(sample).await {
            metrics::counter!("cache_write_errors_total").increment(1);
            tracing::warn!(device = %sample.device_id, error = %e, "history-cache write failed");
        }
    }
}
