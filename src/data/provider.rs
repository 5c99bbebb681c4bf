/// Common read contract for live and historical bar caches
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::broker::rest::AlpacaBarSource;
use crate::data::bar::Bar;
use crate::data::historical_cache::HistoricalBarCache;
use crate::data::live_cache::LiveBarCache;
use crate::error::{BarCacheError, Result};
use crate::types::{Config, Instrument, ProviderMode};

/// What the runner prices against, once per tick.
///
/// `Ok(None)` means no data for that instant; it is never an error.
#[async_trait]
pub trait BarProvider: Send + Sync {
    async fn fetch_bar_at(&self, instrument: &Instrument, ts: DateTime<Utc>) -> Result<Option<Bar>>;

    /// Subscribe or preload; calling again with the same instruments is a no-op
    async fn include_assets(&self, instruments: &[Instrument]) -> Result<()>;

    /// Release streams and resources; safe to call more than once
    async fn close(&self) -> Result<()>;
}

/// Pick the adapter named by `config.mode`
pub fn build_provider(config: &Config) -> Result<Arc<dyn BarProvider>> {
    match config.mode {
        ProviderMode::Live => {
            let mut cache = LiveBarCache::from_config(config);
            if let Some(historical) = config.historical.as_ref().filter(|h| h.has_credentials()) {
                cache = cache.with_warm_start(Arc::new(AlpacaBarSource::new(historical)?));
            }
            info!("Using live bar cache ({}s bars)", config.interval_secs);
            Ok(Arc::new(cache))
        }
        ProviderMode::Historical => {
            let historical = config.historical.as_ref().ok_or_else(|| {
                BarCacheError::ConfigError("historical mode needs a [historical] section".to_string())
            })?;
            let source = Arc::new(AlpacaBarSource::new(historical)?);
            let cache = HistoricalBarCache::new(source, config.interval(), historical.start, historical.end)?
                .with_fetch_timeout(historical.fetch_timeout());
            info!(
                "Using historical bar cache {} -> {} ({}s bars)",
                historical.start, historical.end, config.interval_secs
            );
            Ok(Arc::new(cache))
        }
    }
}
