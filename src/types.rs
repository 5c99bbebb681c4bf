/// Core type definitions for the bar cache
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BarCacheError;

/// Tradable instrument, compared by value.
/// Serialized in its `SYMBOL:VENUE:KIND` string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Instrument {
    pub symbol: String,
    pub venue: String,
    pub kind: String,
}

impl Instrument {
    pub fn new(symbol: &str, venue: &str, kind: &str) -> Self {
        Instrument {
            symbol: symbol.to_string(),
            venue: venue.to_string(),
            kind: kind.to_string(),
        }
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.symbol, self.venue, self.kind)
    }
}

impl FromStr for Instrument {
    type Err = BarCacheError;

    /// Parse the `SYMBOL:VENUE:KIND` form
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [symbol, venue, kind] if !symbol.is_empty() => Ok(Instrument::new(symbol, venue, kind)),
            _ => Err(BarCacheError::ConfigError(format!(
                "Invalid instrument '{}', expected SYMBOL:VENUE:KIND",
                s
            ))),
        }
    }
}

impl TryFrom<String> for Instrument {
    type Error = BarCacheError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Instrument> for String {
    fn from(instrument: Instrument) -> Self {
        instrument.to_string()
    }
}

/// One instantaneous trade observation
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub instrument: Instrument,
    pub timestamp: DateTime<Utc>,
    pub price: f64,
    pub size: f64,
}

impl Sample {
    pub fn new(instrument: Instrument, timestamp: DateTime<Utc>, price: f64, size: f64) -> Self {
        Sample {
            instrument,
            timestamp,
            price,
            size,
        }
    }
}

/// Which adapter serves bars to the runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderMode {
    Live,
    Historical,
}

/// Configuration for the bar cache
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub mode: ProviderMode,

    // Bar Processing
    pub interval_secs: i64,
    pub instruments: Vec<Instrument>,

    // Logging
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_json: bool,

    #[serde(default)]
    pub stream: StreamConfig,
    pub historical: Option<HistoricalConfig>,
}

/// Push-stream settings
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    pub url: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_max_sample_staleness_secs")]
    pub max_sample_staleness_secs: i64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            url: "wss://ws.finnhub.io".to_string(),
            token: String::new(),
            connect_timeout_secs: default_connect_timeout_secs(),
            max_sample_staleness_secs: default_max_sample_staleness_secs(),
        }
    }
}

/// Historical REST settings and backtest window
#[derive(Debug, Clone, Deserialize)]
pub struct HistoricalConfig {
    #[serde(default = "default_historical_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key_id: String,
    #[serde(default)]
    pub api_secret_key: String,
    #[serde(default = "default_feed")]
    pub feed: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_page_limit")]
    pub page_limit: u32,
}

impl Config {
    pub fn interval(&self) -> Duration {
        Duration::seconds(self.interval_secs)
    }
}

impl StreamConfig {
    pub fn connect_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn max_sample_staleness(&self) -> Duration {
        Duration::seconds(self.max_sample_staleness_secs)
    }
}

impl HistoricalConfig {
    pub fn fetch_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn has_credentials(&self) -> bool {
        !self.api_key_id.is_empty() && !self.api_secret_key.is_empty()
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_max_sample_staleness_secs() -> i64 {
    2
}

fn default_historical_base_url() -> String {
    "https://data.alpaca.markets".to_string()
}

fn default_feed() -> String {
    "iex".to_string()
}

fn default_fetch_timeout_secs() -> u64 {
    30
}

fn default_page_limit() -> u32 {
    10_000
}
