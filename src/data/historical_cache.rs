/// Memoizing historical bar cache for backtests
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::broker::rest::BarSource;
use crate::data::bar::Bar;
use crate::data::bucket::bucket_start;
use crate::data::provider::BarProvider;
use crate::error::{BarCacheError, Result};
use crate::types::Instrument;

type BarsByStart = HashMap<DateTime<Utc>, Bar>;

/// Lazily fetches the whole `[start, end)` window per instrument on first
/// access and serves later lookups from memory.
///
/// A failed or cancelled fetch leaves the memo untouched so it can be
/// retried. Concurrent first lookups for the same instrument may fetch
/// twice; the results are identical range fetches.
pub struct HistoricalBarCache {
    source: Arc<dyn BarSource>,
    interval: Duration,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    fetch_timeout: Option<std::time::Duration>,
    bars: RwLock<HashMap<Instrument, Arc<BarsByStart>>>,
}

impl HistoricalBarCache {
    pub fn new(
        source: Arc<dyn BarSource>,
        interval: Duration,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Self> {
        if end <= start {
            return Err(BarCacheError::InvalidWindow(format!(
                "start={} must be before end={}",
                start, end
            )));
        }
        if interval <= Duration::zero() {
            return Err(BarCacheError::InvalidInterval(
                "historical bars need a positive interval".to_string(),
            ));
        }
        source.check_interval(interval)?;

        Ok(HistoricalBarCache {
            source,
            interval,
            start,
            end,
            fetch_timeout: None,
            bars: RwLock::new(HashMap::new()),
        })
    }

    /// Bound each window fetch; a timed-out fetch caches nothing
    pub fn with_fetch_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.fetch_timeout = Some(timeout);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Padded fetch window: aligned start through one interval past end
    pub fn window(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (bucket_start(self.start, self.interval), self.end + self.interval)
    }

    pub async fn is_preloaded(&self, instrument: &Instrument) -> bool {
        self.bars.read().await.contains_key(instrument)
    }

    /// Fetch and memoize the full window for each instrument not yet loaded
    pub async fn preload(&self, instruments: &[Instrument]) -> Result<()> {
        for instrument in instruments {
            if self.is_preloaded(instrument).await {
                continue;
            }
            self.load(instrument).await?;
        }
        Ok(())
    }

    /// Bar for the bucket containing `ts`; `None` means confirmed no data
    pub async fn fetch_bar_at(&self, instrument: &Instrument, ts: DateTime<Utc>) -> Result<Option<Bar>> {
        let aligned = bucket_start(ts, self.interval);

        let cached = self.bars.read().await.get(instrument).cloned();
        let bars = match cached {
            Some(bars) => bars,
            None => self.load(instrument).await?,
        };

        Ok(bars.get(&aligned).cloned())
    }

    async fn load(&self, instrument: &Instrument) -> Result<Arc<BarsByStart>> {
        let (start, end) = self.window();
        info!("📥 Fetching {} bars {} -> {}", instrument, start, end);

        let fetch = self.source.fetch_bars(instrument, start, end, self.interval);
        let fetched = match self.fetch_timeout {
            Some(limit) => tokio::time::timeout(limit, fetch).await.map_err(|_| {
                BarCacheError::FetchTimeout(format!("{} after {:?}", instrument, limit))
            })?,
            None => fetch.await,
        };

        let bars = match fetched {
            Ok(bars) => bars,
            Err(e) => {
                warn!("Historical fetch for {} failed: {}", instrument, e);
                return Err(e);
            }
        };

        let memo: Arc<BarsByStart> = Arc::new(
            bars.into_iter()
                .map(|bar| (bucket_start(bar.start, self.interval), bar))
                .collect(),
        );

        debug!("Cached {} bars for {}", memo.len(), instrument);

        let mut cache = self.bars.write().await;
        Ok(Arc::clone(
            cache.entry(instrument.clone()).or_insert(memo),
        ))
    }
}

#[async_trait]
impl BarProvider for HistoricalBarCache {
    async fn fetch_bar_at(&self, instrument: &Instrument, ts: DateTime<Utc>) -> Result<Option<Bar>> {
        HistoricalBarCache::fetch_bar_at(self, instrument, ts).await
    }

    async fn include_assets(&self, instruments: &[Instrument]) -> Result<()> {
        self.preload(instruments).await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
