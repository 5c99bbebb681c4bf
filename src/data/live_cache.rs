/// Live bar cache fed by the trade stream
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::rest::BarSource;
use crate::broker::websocket::{self, TradeSink, TradeSource};
use crate::data::bar::Bar;
use crate::data::bar_aggregator::StreamAggregator;
use crate::data::bucket::{bucket_start, is_tick_interval, TimeBucket};
use crate::data::provider::BarProvider;
use crate::error::{BarCacheError, Result};
use crate::types::{Config, Instrument, Sample};

/// Upper bound on each shutdown step
const CLOSE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);

/// How far back a warm start looks for the last official bar
const WARM_START_LOOKBACK_DAYS: i64 = 4;

/// What happened to one incoming trade
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeRoute {
    /// Added to the building bar
    Extended,
    /// Opened a new building bar
    Opened,
    /// Closed the building bar and opened the next one
    RolledOver,
    /// Applied to the last closed bar
    Patched,
    /// Zero-interval mode: published as its own closed bar
    Emitted,
    /// Too old for any open or patchable bucket
    Discarded,
}

/// Shared bar state.
///
/// Lock order is aggregator, then last_closed, then last_samples. Every
/// method takes one lock at a time and releases it before the next.
struct LiveState {
    interval: Duration,
    aggregator: Mutex<StreamAggregator>,
    last_closed: RwLock<HashMap<Instrument, Bar>>,
    last_samples: RwLock<HashMap<Instrument, Sample>>,
}

impl LiveState {
    fn new(interval: Duration) -> Self {
        LiveState {
            interval,
            aggregator: Mutex::new(StreamAggregator::new(interval)),
            last_closed: RwLock::new(HashMap::new()),
            last_samples: RwLock::new(HashMap::new()),
        }
    }

    async fn route_trade(&self, sample: Sample) -> TradeRoute {
        let instrument = sample.instrument.clone();
        let (ts, price, size) = (sample.timestamp, sample.price, sample.size);

        self.last_samples.write().await.insert(instrument.clone(), sample);

        let bucket = TimeBucket::containing(ts, self.interval);

        {
            let mut aggregator = self.aggregator.lock().await;
            match aggregator.building_bucket(&instrument) {
                Some(current) if bucket == current => {
                    aggregator.push_trade(&instrument, ts, price, size);
                    return TradeRoute::Extended;
                }
                Some(current) if bucket < current => {
                    drop(aggregator);
                    return self.patch_or_discard(&instrument, ts, price, size).await;
                }
                Some(_) => {
                    let closed = aggregator.push_trade(&instrument, ts, price, size);
                    drop(aggregator);
                    if let Some(bar) = closed {
                        self.publish_closed(bar).await;
                    }
                    return TradeRoute::RolledOver;
                }
                None => {}
            }
        }

        let last_bucket = self.last_closed.read().await.get(&instrument).map(Bar::bucket);
        if let Some(last) = last_bucket {
            if bucket < last {
                debug!("🗑️ Discarded stale trade for {} @ {}", instrument, ts);
                return TradeRoute::Discarded;
            }
            if last.contains(ts) {
                return self.patch_or_discard(&instrument, ts, price, size).await;
            }
        }

        let emitted = self.aggregator.lock().await.push_trade(&instrument, ts, price, size);
        match emitted {
            Some(bar) => {
                self.publish_closed(bar).await;
                TradeRoute::Emitted
            }
            None => TradeRoute::Opened,
        }
    }

    async fn patch_or_discard(&self, instrument: &Instrument, ts: DateTime<Utc>, price: f64, size: f64) -> TradeRoute {
        if self.patch_last_closed(instrument, ts, price, size).await {
            debug!("🩹 Patched closed bar for {} with late trade @ {}", instrument, ts);
            TradeRoute::Patched
        } else {
            debug!("🗑️ Discarded late trade for {} @ {}", instrument, ts);
            TradeRoute::Discarded
        }
    }

    /// Apply a late trade to the last closed bar if its range holds `ts`
    async fn patch_last_closed(&self, instrument: &Instrument, ts: DateTime<Utc>, price: f64, size: f64) -> bool {
        let mut closed = self.last_closed.write().await;
        match closed.get_mut(instrument) {
            Some(bar) if bar.is_official() => false,
            Some(bar) => bar.update_with_trade(ts, price, size),
            None => false,
        }
    }

    /// Store `bar` as the instrument's last closed bar.
    ///
    /// Refuses to move backwards in time or to replace an official bar for
    /// the same bucket. Two traded bars for the same bucket hold disjoint
    /// trades (a force-close raced a late trade), so they are merged.
    async fn publish_closed(&self, bar: Bar) -> bool {
        let mut closed = self.last_closed.write().await;
        match closed.get_mut(&bar.instrument) {
            Some(existing) if existing.start > bar.start => false,
            Some(existing) if existing.start == bar.start && existing.is_official() => false,
            Some(existing)
                if existing.start == bar.start
                    && !bar.is_official()
                    && existing.trade_count > 0
                    && bar.trade_count > 0 =>
            {
                debug!(
                    "🔀 Merged {} trades into closed bar for {} @ {}",
                    bar.trade_count, bar.instrument, bar.start
                );
                existing.merge(&bar)
            }
            _ => {
                debug!(
                    "📊 Bar closed: {} @ {} - O:{:.2} H:{:.2} L:{:.2} C:{:.2} V:{} [{}]",
                    bar.instrument,
                    bar.start,
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close,
                    bar.volume,
                    bar.status.as_str()
                );
                closed.insert(bar.instrument.clone(), bar);
                true
            }
        }
    }

    async fn latest_closed_bar(&self, instrument: &Instrument, now: DateTime<Utc>) -> Option<Bar> {
        let expired = self.aggregator.lock().await.close_if_elapsed(instrument, now);
        if let Some(bar) = expired {
            self.publish_closed(bar).await;
        }

        if is_tick_interval(self.interval) {
            return self.last_closed.read().await.get(instrument).cloned();
        }

        let expected = TimeBucket::containing(now, self.interval).previous();

        let last = self.last_closed.read().await.get(instrument).cloned();
        if let Some(bar) = &last {
            if bar.end >= expected.end {
                return last;
            }
        }

        let sample = self.last_samples.read().await.get(instrument).cloned();
        let seed = match (sample, &last) {
            (Some(sample), _) => sample,
            (None, Some(bar)) => Sample::new(instrument.clone(), bar.end, bar.close, 0.0),
            (None, None) => return None,
        };

        let carry = Bar::carry_forward(&seed, expected);

        let mut closed = self.last_closed.write().await;
        match closed.get(instrument) {
            Some(existing) if existing.end >= expected.end => Some(existing.clone()),
            _ => {
                debug!(
                    "⏩ Carry-forward bar for {} @ {} at {:.2}",
                    instrument, expected.start, carry.close
                );
                closed.insert(instrument.clone(), carry.clone());
                Some(carry)
            }
        }
    }

    async fn flush(&self) -> usize {
        let bars = self.aggregator.lock().await.flush();
        let count = bars.len();
        for bar in bars {
            self.publish_closed(bar).await;
        }
        count
    }
}

/// An established stream and its listener task
struct StreamConnection {
    sink: Arc<Mutex<TradeSink>>,
    listener: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl StreamConnection {
    fn is_alive(&self) -> bool {
        !self.listener.is_finished()
    }

    async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);

        match tokio::time::timeout(CLOSE_TIMEOUT, async { self.sink.lock().await.close().await }).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Stream close: {}", e),
            Err(_) => warn!("Timed out closing trade stream"),
        }

        if tokio::time::timeout(CLOSE_TIMEOUT, &mut self.listener).await.is_err() {
            warn!("Trade listener did not stop in time, aborting");
            self.listener.abort();
        }
    }
}

/// Single reader of the push stream; routes trades one at a time
async fn listen(
    state: Arc<LiveState>,
    symbols: Arc<RwLock<HashMap<String, Instrument>>>,
    mut source: TradeSource,
    sink: Arc<Mutex<TradeSink>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            next = source.next_trades() => match next {
                Some(Ok(trades)) => {
                    for trade in trades {
                        let instrument = symbols.read().await.get(&trade.symbol).cloned();
                        match instrument {
                            Some(instrument) => {
                                let sample = Sample::new(instrument, trade.timestamp, trade.price, trade.size);
                                state.route_trade(sample).await;
                            }
                            None => debug!("Ignoring trade for unsubscribed {}", trade.symbol),
                        }
                    }
                }
                Some(Err(e)) => {
                    error!("❌ Trade stream failed: {}", e);
                    let _ = tokio::time::timeout(CLOSE_TIMEOUT, async { sink.lock().await.close().await }).await;
                    break;
                }
                None => break,
            }
        }
    }

    warn!("Trade listener ended");
}

/// Bar cache over the live trade stream.
///
/// Owns the building bars (through the aggregator), the last closed bar per
/// instrument and the last raw sample per instrument. The stream is opened
/// lazily by the first `include_assets` call and never reconnected on its
/// own: after a failure the caller must include the assets again.
pub struct LiveBarCache {
    state: Arc<LiveState>,
    stream_url: String,
    connect_timeout: std::time::Duration,
    max_sample_staleness: Duration,
    symbols: Arc<RwLock<HashMap<String, Instrument>>>,
    connection: Mutex<Option<StreamConnection>>,
    warm_start: Option<Arc<dyn BarSource>>,
    closed: AtomicBool,
}

impl LiveBarCache {
    pub fn new(interval: Duration, stream_url: String) -> Self {
        LiveBarCache {
            state: Arc::new(LiveState::new(interval)),
            stream_url,
            connect_timeout: std::time::Duration::from_secs(10),
            max_sample_staleness: Duration::seconds(2),
            symbols: Arc::new(RwLock::new(HashMap::new())),
            connection: Mutex::new(None),
            warm_start: None,
            closed: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let url = websocket::stream_url(&config.stream.url, &config.stream.token);
        LiveBarCache::new(config.interval(), url)
            .with_connect_timeout(config.stream.connect_timeout())
            .with_max_sample_staleness(config.stream.max_sample_staleness())
    }

    pub fn with_connect_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_sample_staleness(mut self, staleness: Duration) -> Self {
        self.max_sample_staleness = staleness;
        self
    }

    /// Seed each newly included instrument with its latest official bar
    pub fn with_warm_start(mut self, source: Arc<dyn BarSource>) -> Self {
        self.warm_start = Some(source);
        self
    }

    pub fn interval(&self) -> Duration {
        self.state.interval
    }

    /// Route one trade through the cache
    pub async fn on_trade(&self, sample: Sample) -> TradeRoute {
        self.state.route_trade(sample).await
    }

    /// Latest closed bar as of `now`, synthesizing a carry-forward bar for
    /// the immediately preceding bucket if nothing traded in it.
    /// `None` means no trade or closed bar has been seen yet.
    pub async fn get_latest_closed_bar(&self, instrument: &Instrument, now: DateTime<Utc>) -> Option<Bar> {
        self.state.latest_closed_bar(instrument, now).await
    }

    /// Latest raw sample if it is fresh relative to `now`
    pub async fn fetch_sample(&self, instrument: &Instrument, now: DateTime<Utc>) -> Option<Sample> {
        self.last_sample(instrument)
            .await
            .filter(|s| now - s.timestamp <= self.max_sample_staleness)
    }

    pub async fn last_sample(&self, instrument: &Instrument) -> Option<Sample> {
        self.state.last_samples.read().await.get(instrument).cloned()
    }

    pub async fn last_closed_bar(&self, instrument: &Instrument) -> Option<Bar> {
        self.state.last_closed.read().await.get(instrument).cloned()
    }

    /// Snapshot of the bar currently building (for monitoring)
    pub async fn current_bar(&self, instrument: &Instrument) -> Option<Bar> {
        self.state.aggregator.lock().await.current_bar(instrument)
    }

    /// Install an authoritative closed bar; ignored if a newer bar is held
    pub async fn seed_closed_bar(&self, bar: Bar) -> bool {
        self.state.publish_closed(bar).await
    }

    /// Whether the listener is currently reading the stream
    pub async fn is_streaming(&self) -> bool {
        self.connection
            .lock()
            .await
            .as_ref()
            .map(StreamConnection::is_alive)
            .unwrap_or(false)
    }

    /// Connect if needed and subscribe every instrument not yet subscribed
    pub async fn subscribe(&self, instruments: &[Instrument]) -> Result<Vec<Instrument>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BarCacheError::Closed("live bar cache".to_string()));
        }

        let mut guard = self.connection.lock().await;

        if guard.as_ref().map(|c| !c.is_alive()).unwrap_or(false) {
            warn!("Trade stream is down, reconnecting on re-subscribe");
            if let Some(dead) = guard.take() {
                dead.shutdown().await;
            }
            self.symbols.write().await.clear();
        }

        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }

        let mut added = Vec::new();
        if let Some(connection) = guard.as_ref() {
            for instrument in instruments {
                if self.symbols.read().await.contains_key(&instrument.symbol) {
                    continue;
                }
                // Registered before the request goes out
                self.symbols
                    .write()
                    .await
                    .insert(instrument.symbol.clone(), instrument.clone());
                if let Err(e) = connection.sink.lock().await.subscribe(&instrument.symbol).await {
                    self.symbols.write().await.remove(&instrument.symbol);
                    return Err(e);
                }
                added.push(instrument.clone());
            }
        }

        if self.closed.load(Ordering::SeqCst) {
            if let Some(connection) = guard.take() {
                connection.shutdown().await;
            }
            return Err(BarCacheError::Closed("live bar cache".to_string()));
        }

        if !added.is_empty() {
            info!("📡 Subscribed to {} instruments", added.len());
        }
        Ok(added)
    }

    async fn connect(&self) -> Result<StreamConnection> {
        let (sink, source) = tokio::time::timeout(self.connect_timeout, websocket::connect(&self.stream_url))
            .await
            .map_err(|_| {
                BarCacheError::ConnectionError(format!("Connect timed out after {:?}", self.connect_timeout))
            })??;

        let sink = Arc::new(Mutex::new(sink));
        let (shutdown, shutdown_rx) = watch::channel(false);

        let listener = tokio::spawn(listen(
            Arc::clone(&self.state),
            Arc::clone(&self.symbols),
            source,
            Arc::clone(&sink),
            shutdown_rx,
        ));

        Ok(StreamConnection {
            sink,
            listener,
            shutdown,
        })
    }

    /// Seed instruments with the last official bar before the current bucket
    async fn warm_start(&self, instruments: &[Instrument]) {
        let source = match &self.warm_start {
            Some(source) => Arc::clone(source),
            None => return,
        };
        if source.check_interval(self.interval()).is_err() {
            debug!("Warm start skipped: interval not served upstream");
            return;
        }

        let now = Utc::now();
        let end = bucket_start(now, self.interval());
        let start = bucket_start(now - Duration::days(WARM_START_LOOKBACK_DAYS), self.interval());

        for instrument in instruments {
            match source.fetch_bars(instrument, start, end, self.interval()).await {
                Ok(bars) => {
                    if let Some(bar) = bars.into_iter().filter(|b| b.end <= end).last() {
                        info!("🔥 Warm start {} from official bar @ {}", instrument, bar.start);
                        self.seed_closed_bar(bar).await;
                    }
                }
                Err(e) => warn!("Warm start for {} failed: {}", instrument, e),
            }
        }
    }

    /// Stop the listener, flush building bars and drop the connection.
    /// Safe to call repeatedly and while the listener is running.
    pub async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        match tokio::time::timeout(CLOSE_TIMEOUT, self.connection.lock()).await {
            Ok(mut guard) => {
                if let Some(connection) = guard.take() {
                    connection.shutdown().await;
                }
            }
            Err(_) => warn!("Subscription in flight during close; it will tear down its own connection"),
        }

        let flushed = self.state.flush().await;
        info!("✅ Live bar cache closed, flushed {} building bars", flushed);
        Ok(())
    }
}

#[async_trait]
impl BarProvider for LiveBarCache {
    async fn fetch_bar_at(&self, instrument: &Instrument, ts: DateTime<Utc>) -> Result<Option<Bar>> {
        Ok(self.get_latest_closed_bar(instrument, ts).await)
    }

    async fn include_assets(&self, instruments: &[Instrument]) -> Result<()> {
        let added = self.subscribe(instruments).await?;
        self.warm_start(&added).await;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.shutdown().await
    }
}
