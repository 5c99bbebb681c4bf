pub mod bucket;
pub mod bar;
pub mod bar_aggregator;
pub mod live_cache;
pub mod historical_cache;
pub mod provider;

pub use bucket::{bucket_end, bucket_start, is_tick_interval, TimeBucket};
pub use bar::{Bar, BarStatus};
pub use bar_aggregator::StreamAggregator;
pub use live_cache::{LiveBarCache, TradeRoute};
pub use historical_cache::HistoricalBarCache;
pub use provider::{build_provider, BarProvider};
