/// Fixed-width time bucket alignment
use chrono::{DateTime, Duration, TimeZone, Utc};

/// Half-open window `[start, end)` that groups trades into one bar.
///
/// A zero interval collapses the bucket to the single instant of the trade
/// (tick-as-bar mode), so `start == end` and nothing is ever "inside" it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeBucket {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeBucket {
    /// Bucket containing `ts` for the given interval
    pub fn containing(ts: DateTime<Utc>, interval: Duration) -> Self {
        let start = bucket_start(ts, interval);
        TimeBucket {
            start,
            end: start + Duration::milliseconds(step_millis(interval)),
        }
    }

    pub fn interval(&self) -> Duration {
        self.end - self.start
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }

    /// The bucket immediately before this one
    pub fn previous(&self) -> Self {
        let interval = self.interval();
        TimeBucket {
            start: self.start - interval,
            end: self.start,
        }
    }

    pub fn next(&self) -> Self {
        let interval = self.interval();
        TimeBucket {
            start: self.end,
            end: self.end + interval,
        }
    }

    pub fn is_degenerate(&self) -> bool {
        self.start == self.end
    }
}

/// Whole milliseconds in `interval`; anything finer is dropped
fn step_millis(interval: Duration) -> i64 {
    interval.num_milliseconds().max(0)
}

/// True when `interval` is below one millisecond: every trade is its own bar
pub fn is_tick_interval(interval: Duration) -> bool {
    step_millis(interval) == 0
}

/// `floor(unix_millis(ts) / interval_millis) * interval_millis` as a UTC instant.
///
/// For whole-second intervals this is the same as flooring unix seconds.
/// Tick intervals return `ts` unchanged.
pub fn bucket_start(ts: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    let step = step_millis(interval);
    if step == 0 {
        return ts;
    }

    let aligned = ts.timestamp_millis().div_euclid(step) * step;
    Utc.timestamp_millis_opt(aligned).single().unwrap_or(ts)
}

pub fn bucket_end(ts: DateTime<Utc>, interval: Duration) -> DateTime<Utc> {
    bucket_start(ts, interval) + interval
}
