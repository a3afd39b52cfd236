use time::{Duration, OffsetDateTime, Time, UtcOffset};

/// Aggregation bucket widths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Hour,
    Day,
    Month,
}

/// Bucket boundary arithmetic under a fixed business UTC offset.
///
/// Instants stay UTC everywhere in the system; the configured offset only
/// decides where local hour/day/month boundaries fall, and therefore which
/// elapsed hour counts as 23:00 for the daily rollup trigger. Fixed offsets
/// have no DST transitions, so truncation is a pure function of the instant.
#[derive(Debug, Clone, Copy)]
pub struct BucketClock {
    offset: UtcOffset,
}

impl BucketClock {
    pub fn new(offset: UtcOffset) -> Self {
        Self { offset }
    }

    pub fn utc() -> Self {
        Self::new(UtcOffset::UTC)
    }

    pub fn offset(&self) -> UtcOffset {
        self.offset
    }

    /// Current instant, in UTC.
    pub fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }

    /// Start of the bucket containing `instant`, as a UTC instant.
    pub fn truncate(&self, instant: OffsetDateTime, granularity: Granularity) -> OffsetDateTime {
        let local = instant.to_offset(self.offset);
        let day_start = local.replace_time(Time::MIDNIGHT);
        let start = match granularity {
            Granularity::Hour => day_start + Duration::hours(i64::from(local.hour())),
            Granularity::Day => day_start,
            Granularity::Month => day_start - Duration::days(i64::from(local.day()) - 1),
        };
        start.to_offset(UtcOffset::UTC)
    }

    /// Half-open `[start, end)` range of the bucket containing `instant`.
    pub fn range(
        &self,
        instant: OffsetDateTime,
        granularity: Granularity,
    ) -> (OffsetDateTime, OffsetDateTime) {
        let start = self.truncate(instant, granularity);
        let end = match granularity {
            Granularity::Hour => start + Duration::hours(1),
            Granularity::Day => start + Duration::days(1),
            Granularity::Month => {
                let local = start.to_offset(self.offset);
                start + Duration::days(i64::from(local.month().length(local.year())))
            }
        };
        (start, end)
    }

    /// First instant of the hour after the one containing `instant`.
    pub fn next_hour_boundary(&self, instant: OffsetDateTime) -> OffsetDateTime {
        self.truncate(instant, Granularity::Hour) + Duration::hours(1)
    }

    /// Hour of day of `instant` in the business timezone.
    pub fn local_hour(&self, instant: OffsetDateTime) -> u8 {
        instant.to_offset(self.offset).hour()
    }

    /// Whether `instant` falls on the first day of its local month.
    pub fn is_first_of_month(&self, instant: OffsetDateTime) -> bool {
        instant.to_offset(self.offset).day() == 1
    }
}
