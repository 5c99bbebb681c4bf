/// OHLCV bar and its status state machine
use std::fmt;

use chrono::{DateTime, Duration, Utc};

use crate::data::bucket::TimeBucket;
use crate::types::{Instrument, Sample};

/// Lifecycle of a bar.
///
/// `Building` -> `Aggregated` on rollover; `NoTrades` -> `Aggregated` when a
/// late trade patches a carry-forward bar. `Official` only comes from the
/// historical source and is never changed by the live path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BarStatus {
    Building,
    Aggregated,
    Official,
    NoTrades,
}

impl BarStatus {
    pub fn as_str(&self) -> &str {
        match self {
            BarStatus::Building => "BUILDING",
            BarStatus::Aggregated => "AGGREGATED",
            BarStatus::Official => "OFFICIAL",
            BarStatus::NoTrades => "NO_TRADES",
        }
    }
}

/// OHLCV aggregate for one instrument over `[start, end)`
#[derive(Debug, Clone, PartialEq)]
pub struct Bar {
    pub instrument: Instrument,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub interval: Duration,

    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,

    /// Sum of trade sizes
    pub volume: f64,
    /// Sum of price * size, VWAP numerator
    pub notional: f64,
    pub trade_count: u64,
    pub last_traded_size: f64,

    pub status: BarStatus,
}

impl Bar {
    /// Bar with no trades yet; the first trade sets the open
    pub fn empty(instrument: Instrument, bucket: TimeBucket, status: BarStatus) -> Self {
        Bar {
            instrument,
            start: bucket.start,
            end: bucket.end,
            interval: bucket.interval(),
            open: 0.0,
            high: 0.0,
            low: 0.0,
            close: 0.0,
            volume: 0.0,
            notional: 0.0,
            trade_count: 0,
            last_traded_size: 0.0,
            status,
        }
    }

    /// New building bar seeded from its first trade
    pub fn building(
        instrument: Instrument,
        bucket: TimeBucket,
        price: f64,
        size: f64,
    ) -> Self {
        let mut bar = Bar::empty(instrument, bucket, BarStatus::Building);
        bar.apply_trade(price, size);
        bar
    }

    /// One-trade bar for the zero-interval mode; closed on creation
    pub fn from_tick(instrument: Instrument, ts: DateTime<Utc>, price: f64, size: f64) -> Self {
        let bucket = TimeBucket { start: ts, end: ts };
        let mut bar = Bar::empty(instrument, bucket, BarStatus::Aggregated);
        bar.apply_trade(price, size);
        bar
    }

    /// Synthetic zero-volume bar carrying the sample price forward
    pub fn carry_forward(sample: &Sample, bucket: TimeBucket) -> Self {
        let price = sample.price;
        Bar {
            open: price,
            high: price,
            low: price,
            close: price,
            last_traded_size: sample.size,
            ..Bar::empty(sample.instrument.clone(), bucket, BarStatus::NoTrades)
        }
    }

    pub fn bucket(&self) -> TimeBucket {
        TimeBucket {
            start: self.start,
            end: self.end,
        }
    }

    /// Apply a trade at `ts`; returns false and leaves the bar untouched when
    /// `ts` is outside `[start, end)`.
    pub fn update_with_trade(&mut self, ts: DateTime<Utc>, price: f64, size: f64) -> bool {
        if !self.in_range(ts) {
            return false;
        }

        self.apply_trade(price, size);

        if self.status == BarStatus::NoTrades {
            self.status = BarStatus::Aggregated;
        }

        true
    }

    pub fn update_with_sample(&mut self, sample: &Sample) -> bool {
        self.update_with_trade(sample.timestamp, sample.price, sample.size)
    }

    fn apply_trade(&mut self, price: f64, size: f64) {
        if self.trade_count == 0 {
            self.open = price;
            self.high = price;
            self.low = price;
            self.close = price;
        } else {
            self.high = self.high.max(price);
            self.low = self.low.min(price);
            self.close = price;
        }
        self.volume += size;
        self.notional += price * size;
        self.trade_count += 1;
        self.last_traded_size = size;
    }

    /// Fold the trades of `later`, a bar for the same bucket, into this one.
    ///
    /// This bar keeps its open; `later` supplies the close. Returns false
    /// for a different bucket.
    pub fn merge(&mut self, later: &Bar) -> bool {
        if self.bucket() != later.bucket() {
            return false;
        }
        if later.trade_count == 0 {
            return true;
        }

        if self.trade_count == 0 {
            self.open = later.open;
            self.high = later.high;
            self.low = later.low;
        } else {
            self.high = self.high.max(later.high);
            self.low = self.low.min(later.low);
        }
        self.close = later.close;
        self.volume += later.volume;
        self.notional += later.notional;
        self.trade_count += later.trade_count;
        self.last_traded_size = later.last_traded_size;

        if self.status == BarStatus::NoTrades {
            self.status = BarStatus::Aggregated;
        }

        true
    }

    /// Mark a building bar as closed
    pub fn close_out(&mut self) {
        if self.status == BarStatus::Building {
            self.status = BarStatus::Aggregated;
        }
    }

    /// Volume weighted average price, zero when nothing traded
    pub fn vwap(&self) -> f64 {
        if self.volume > 0.0 {
            self.notional / self.volume
        } else {
            0.0
        }
    }

    pub fn in_range(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start && ts < self.end
    }

    pub fn is_closed(&self) -> bool {
        self.status != BarStatus::Building
    }

    pub fn is_official(&self) -> bool {
        self.status == BarStatus::Official
    }

    pub fn is_no_trades(&self) -> bool {
        self.status == BarStatus::NoTrades
    }

    pub fn is_thin(&self, min_trades: u64) -> bool {
        self.trade_count < min_trades
    }

    pub fn is_tick_only(&self) -> bool {
        self.trade_count == 1 && self.start == self.end
    }
}

impl fmt::Display for Bar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const LAYOUT: &str = "%Y-%m-%d %H:%M:%S UTC";
        write!(
            f,
            "{} [{} - {}] ({}s)\nOHLC: {:.2} {:.2} {:.2} {:.2}  Volume: {:.2}",
            self.instrument.symbol,
            self.start.format(LAYOUT),
            self.end.format(LAYOUT),
            self.interval.num_seconds(),
            self.open,
            self.high,
            self.low,
            self.close,
            self.volume,
        )
    }
}
