/// Historical bars REST client
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::data::bar::{Bar, BarStatus};
use crate::data::bucket::TimeBucket;
use crate::error::{BarCacheError, Result};
use crate::types::{HistoricalConfig, Instrument};

/// Bulk source of closed bars for a time range
#[async_trait]
pub trait BarSource: Send + Sync {
    /// Bars for `instrument` in `[start, end)` at `interval`, ordered by start
    async fn fetch_bars(
        &self,
        instrument: &Instrument,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: Duration,
    ) -> Result<Vec<Bar>>;

    /// Reject intervals the upstream cannot serve
    fn check_interval(&self, _interval: Duration) -> Result<()> {
        Ok(())
    }
}

/// Map an interval onto the upstream timeframe (`5Min`, `2Hour`, `1Day`)
pub fn timeframe_for(interval: Duration) -> Result<String> {
    const MINUTE: i64 = 60;
    const HOUR: i64 = 60 * MINUTE;
    const DAY: i64 = 24 * HOUR;

    let secs = interval.num_seconds();
    let whole = Duration::seconds(secs) == interval;

    match secs {
        s if !whole || s <= 0 => {}
        s if s % MINUTE == 0 && s < HOUR => return Ok(format!("{}Min", s / MINUTE)),
        s if s % HOUR == 0 && s < DAY => return Ok(format!("{}Hour", s / HOUR)),
        s if s % DAY == 0 => return Ok(format!("{}Day", s / DAY)),
        _ => {}
    }

    Err(BarCacheError::InvalidInterval(format!(
        "{}s is not whole minutes, hours or days",
        interval.num_seconds()
    )))
}

#[derive(Debug, Deserialize)]
struct BarsResponse {
    #[serde(default)]
    bars: Option<Vec<RestBar>>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RestBar {
    #[serde(rename = "t")]
    timestamp: DateTime<Utc>,
    #[serde(rename = "o")]
    open: f64,
    #[serde(rename = "h")]
    high: f64,
    #[serde(rename = "l")]
    low: f64,
    #[serde(rename = "c")]
    close: f64,
    #[serde(rename = "v")]
    volume: f64,
    #[serde(rename = "n")]
    trade_count: Option<u64>,
    #[serde(rename = "vw")]
    vwap: Option<f64>,
}

impl RestBar {
    fn into_bar(self, instrument: &Instrument, interval: Duration) -> Bar {
        let bucket = TimeBucket {
            start: self.timestamp,
            end: self.timestamp + interval,
        };
        // A traded bar has at least one trade even when the count is missing
        let trade_count = match self.trade_count {
            Some(n) => n,
            None if self.volume > 0.0 => {
                debug!("{} bar @ {} has volume but no trade count", instrument, self.timestamp);
                1
            }
            None => 0,
        };
        Bar {
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            notional: self.vwap.map(|vw| vw * self.volume).unwrap_or(0.0),
            trade_count,
            ..Bar::empty(instrument.clone(), bucket, BarStatus::Official)
        }
    }
}

/// Alpaca-style market data client
pub struct AlpacaBarSource {
    client: Client,
    base_url: String,
    api_key_id: String,
    api_secret_key: String,
    feed: String,
    page_limit: u32,
}

impl AlpacaBarSource {
    pub fn new(config: &HistoricalConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.fetch_timeout()).build()?;

        Ok(AlpacaBarSource {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key_id: config.api_key_id.clone(),
            api_secret_key: config.api_secret_key.clone(),
            feed: config.feed.clone(),
            page_limit: config.page_limit,
        })
    }

    fn feed_for(&self, instrument: &Instrument) -> String {
        match instrument.venue.to_lowercase().as_str() {
            venue @ ("iex" | "sip" | "otc") => venue.to_string(),
            _ => self.feed.clone(),
        }
    }
}

#[async_trait]
impl BarSource for AlpacaBarSource {
    async fn fetch_bars(
        &self,
        instrument: &Instrument,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        interval: Duration,
    ) -> Result<Vec<Bar>> {
        if end <= start {
            return Err(BarCacheError::InvalidWindow(format!(
                "start={} end={}",
                start, end
            )));
        }

        let timeframe = timeframe_for(interval)?;
        let url = format!("{}/v2/stocks/{}/bars", self.base_url, instrument.symbol);

        let mut bars = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("timeframe", timeframe.clone()),
                ("start", start.to_rfc3339()),
                ("end", end.to_rfc3339()),
                ("limit", self.page_limit.to_string()),
                ("adjustment", "split".to_string()),
                ("feed", self.feed_for(instrument)),
            ];
            if let Some(token) = &page_token {
                query.push(("page_token", token.clone()));
            }

            let response = self
                .client
                .get(&url)
                .header("APCA-API-KEY-ID", &self.api_key_id)
                .header("APCA-API-SECRET-KEY", &self.api_secret_key)
                .query(&query)
                .send()
                .await?;

            let status = response.status();
            let body = response.text().await?;

            if !status.is_success() {
                return Err(BarCacheError::FetchError(format!(
                    "{} bars: HTTP {}: {}",
                    instrument, status, body
                )));
            }

            let page: BarsResponse = serde_json::from_str(&body)?;
            bars.extend(
                page.bars
                    .unwrap_or_default()
                    .into_iter()
                    .map(|b| b.into_bar(instrument, interval)),
            );

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        debug!("Fetched {} bars for {}", bars.len(), instrument);
        Ok(bars)
    }

    fn check_interval(&self, interval: Duration) -> Result<()> {
        timeframe_for(interval).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timeframe_mapping() {
        assert_eq!(timeframe_for(Duration::minutes(1)).unwrap(), "1Min");
        assert_eq!(timeframe_for(Duration::minutes(15)).unwrap(), "15Min");
        assert_eq!(timeframe_for(Duration::hours(1)).unwrap(), "1Hour");
        assert_eq!(timeframe_for(Duration::hours(4)).unwrap(), "4Hour");
        assert_eq!(timeframe_for(Duration::days(1)).unwrap(), "1Day");
        assert_eq!(timeframe_for(Duration::days(7)).unwrap(), "7Day");
    }

    #[test]
    fn test_invalid_intervals_rejected() {
        for interval in [
            Duration::zero(),
            Duration::seconds(90),
            Duration::seconds(30),
            Duration::minutes(90),
            Duration::hours(36),
            Duration::milliseconds(60_500),
        ] {
            assert!(matches!(
                timeframe_for(interval),
                Err(BarCacheError::InvalidInterval(_))
            ));
        }
    }

    #[test]
    fn test_response_maps_to_official_bars() {
        let body = r#"{"bars":[
            {"t":"2024-01-02T14:30:00Z","o":187.15,"h":188.44,"l":186.9,"c":188.1,"v":1200,"n":42,"vw":187.6}
        ],"symbol":"AAPL","next_page_token":null}"#;

        let page: BarsResponse = serde_json::from_str(body).unwrap();
        let instrument = Instrument::new("AAPL", "IEX", "stock");
        let bars: Vec<Bar> = page
            .bars
            .unwrap()
            .into_iter()
            .map(|b| b.into_bar(&instrument, Duration::minutes(1)))
            .collect();

        let bar = &bars[0];
        assert_eq!(bar.status, BarStatus::Official);
        assert_eq!(bar.start, Utc.with_ymd_and_hms(2024, 1, 2, 14, 30, 0).unwrap());
        assert_eq!(bar.end, Utc.with_ymd_and_hms(2024, 1, 2, 14, 31, 0).unwrap());
        assert_eq!(bar.trade_count, 42);
        assert!((bar.vwap() - 187.6).abs() < 1e-9);
        assert!(page.next_page_token.is_none());
    }

    #[test]
    fn test_missing_trade_count() {
        let body = r#"{"bars":[
            {"t":"2024-01-02T14:30:00Z","o":1,"h":1,"l":1,"c":1,"v":50},
            {"t":"2024-01-02T14:31:00Z","o":1,"h":1,"l":1,"c":1,"v":0}
        ],"next_page_token":""}"#;

        let page: BarsResponse = serde_json::from_str(body).unwrap();
        let instrument = Instrument::new("AAPL", "IEX", "stock");
        let bars: Vec<Bar> = page
            .bars
            .unwrap()
            .into_iter()
            .map(|b| b.into_bar(&instrument, Duration::minutes(1)))
            .collect();

        assert_eq!(bars[0].trade_count, 1);
        assert_eq!(bars[0].vwap(), 0.0);
        assert_eq!(bars[1].trade_count, 0);
    }

    #[test]
    fn test_empty_page() {
        let page: BarsResponse =
            serde_json::from_str(r#"{"bars":null,"symbol":"AAPL","next_page_token":null}"#).unwrap();
        assert!(page.bars.is_none());
    }
}
