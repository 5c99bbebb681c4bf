/// Bar aggregation from live trades
use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::data::bar::Bar;
use crate::data::bucket::{is_tick_interval, TimeBucket};
use crate::types::Instrument;

/// Tracks the single building bar per instrument and closes it on rollover.
///
/// A zero interval keeps no building state: every trade comes straight back
/// as its own closed one-trade bar.
#[derive(Debug)]
pub struct StreamAggregator {
    interval: Duration,
    building: HashMap<Instrument, Bar>,
}

impl StreamAggregator {
    pub fn new(interval: Duration) -> Self {
        StreamAggregator {
            interval,
            building: HashMap::new(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_degenerate(&self) -> bool {
        is_tick_interval(self.interval)
    }

    /// Push a trade, returning the bar it closed (if any).
    ///
    /// Trades for a bucket older than the building bar are ignored here;
    /// patching closed bars is the caller's job.
    pub fn push_trade(
        &mut self,
        instrument: &Instrument,
        ts: DateTime<Utc>,
        price: f64,
        size: f64,
    ) -> Option<Bar> {
        if self.is_degenerate() {
            return Some(Bar::from_tick(instrument.clone(), ts, price, size));
        }

        let bucket = TimeBucket::containing(ts, self.interval);

        match self.building_bucket(instrument) {
            Some(current) if current == bucket => {
                if let Some(bar) = self.building.get_mut(instrument) {
                    bar.update_with_trade(ts, price, size);
                }
                None
            }
            Some(current) if current > bucket => None,
            _ => {
                let fresh = Bar::building(instrument.clone(), bucket, price, size);
                let closed = self.building.insert(instrument.clone(), fresh).map(|mut bar| {
                    bar.close_out();
                    bar
                });

                match &closed {
                    Some(bar) => debug!(
                        "📊 Bar rolled: {} @ {} - O:{:.2} H:{:.2} L:{:.2} C:{:.2} V:{}",
                        instrument, bar.start, bar.open, bar.high, bar.low, bar.close, bar.volume
                    ),
                    None => debug!("🆕 Started new bar: {} @ {}", instrument, bucket.start),
                }

                closed
            }
        }
    }

    /// Bucket of the bar currently building for `instrument`
    pub fn building_bucket(&self, instrument: &Instrument) -> Option<TimeBucket> {
        self.building.get(instrument).map(Bar::bucket)
    }

    /// Snapshot of the building bar (for monitoring)
    pub fn current_bar(&self, instrument: &Instrument) -> Option<Bar> {
        self.building.get(instrument).cloned()
    }

    /// Close the building bar if wall-clock `now` has passed its end
    pub fn close_if_elapsed(&mut self, instrument: &Instrument, now: DateTime<Utc>) -> Option<Bar> {
        let elapsed = self
            .building
            .get(instrument)
            .map(|bar| bar.end <= now)
            .unwrap_or(false);

        if !elapsed {
            return None;
        }

        self.building.remove(instrument).map(|mut bar| {
            bar.close_out();
            bar
        })
    }

    /// Force-close every building bar (e.g., at shutdown)
    pub fn flush(&mut self) -> Vec<Bar> {
        self.building
            .drain()
            .map(|(_, mut bar)| {
                bar.close_out();
                bar
            })
            .collect()
    }
}
