/// Push-stream WebSocket client for real-time trades
use chrono::{DateTime, TimeZone, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

use crate::error::{BarCacheError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Serialize)]
struct WsSubscribeRequest<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    symbol: &'a str,
}

#[derive(Debug, Deserialize)]
struct WsMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct WsTradeData {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    price: f64,
    #[serde(rename = "t")]
    timestamp_ms: i64,
    #[serde(rename = "v")]
    volume: f64,
}

/// One trade as delivered by the stream, before symbol resolution
#[derive(Debug, Clone, PartialEq)]
pub struct StreamTrade {
    pub symbol: String,
    pub price: f64,
    pub size: f64,
    pub timestamp: DateTime<Utc>,
}

/// Write half: subscriptions and shutdown
pub struct TradeSink {
    write: SplitSink<WsStream, Message>,
}

/// Read half: yields batches of trades
pub struct TradeSource {
    read: SplitStream<WsStream>,
}

/// Build the stream URL, appending the token when one is configured
pub fn stream_url(base: &str, token: &str) -> String {
    if token.is_empty() {
        base.to_string()
    } else if base.contains('?') {
        format!("{}&token={}", base, token)
    } else {
        format!("{}?token={}", base, token)
    }
}

/// Dial the stream and split it into its write and read halves
pub async fn connect(url: &str) -> Result<(TradeSink, TradeSource)> {
    info!("🔌 Connecting to trade stream...");

    let (ws_stream, _) = connect_async(url)
        .await
        .map_err(|e| BarCacheError::ConnectionError(format!("Connection failed: {}", e)))?;

    let (write, read) = ws_stream.split();

    info!("✅ Trade stream connected");

    Ok((TradeSink { write }, TradeSource { read }))
}

impl TradeSink {
    /// Send one subscribe message for `symbol`
    pub async fn subscribe(&mut self, symbol: &str) -> Result<()> {
        let request = WsSubscribeRequest {
            kind: "subscribe",
            symbol,
        };
        let text = serde_json::to_string(&request)?;

        self.write
            .send(Message::Text(text))
            .await
            .map_err(|e| BarCacheError::ConnectionError(format!("Subscribe {} failed: {}", symbol, e)))?;

        debug!("📡 Subscribed to {}", symbol);
        Ok(())
    }

    pub async fn close(&mut self) -> Result<()> {
        self.write
            .close()
            .await
            .map_err(|e| BarCacheError::Disconnected(format!("Close failed: {}", e)))
    }
}

impl TradeSource {
    /// Next batch of trades.
    ///
    /// Non-trade and unparsable messages are skipped. Returns `None` once the
    /// server closes the stream and `Some(Err(..))` on a read failure.
    pub async fn next_trades(&mut self) -> Option<Result<Vec<StreamTrade>>> {
        while let Some(msg) = self.read.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    let trades = parse_trade_message(&text);
                    if !trades.is_empty() {
                        return Some(Ok(trades));
                    }
                }
                Ok(Message::Binary(data)) => {
                    if let Ok(text) = std::str::from_utf8(&data) {
                        let trades = parse_trade_message(text);
                        if !trades.is_empty() {
                            return Some(Ok(trades));
                        }
                    }
                }
                Ok(Message::Close(_)) => {
                    warn!("Trade stream closed by server");
                    return None;
                }
                Ok(_) => {
                    // Ping/pong are answered by the library
                }
                Err(e) => {
                    return Some(Err(BarCacheError::Disconnected(format!(
                        "Read failed: {}",
                        e
                    ))));
                }
            }
        }

        None
    }
}

/// Parse one inbound message; anything other than a trade message yields nothing
pub fn parse_trade_message(text: &str) -> Vec<StreamTrade> {
    let msg: WsMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(_) => return Vec::new(),
    };

    if msg.kind != "trade" {
        return Vec::new();
    }

    // Entries are decoded one by one so a bad entry only drops itself
    msg.data
        .into_iter()
        .filter_map(|entry| {
            let d: WsTradeData = match serde_json::from_value(entry) {
                Ok(d) => d,
                Err(e) => {
                    debug!("Skipping malformed trade entry: {}", e);
                    return None;
                }
            };
            let timestamp = Utc.timestamp_millis_opt(d.timestamp_ms).single()?;
            Some(StreamTrade {
                symbol: d.symbol,
                price: d.price,
                size: d.volume,
                timestamp,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trade_message_parsing() {
        let text = r#"{"type":"trade","data":[
            {"s":"AAPL","p":187.5,"t":1700000005123,"v":100},
            {"s":"MSFT","p":370.25,"t":1700000005456,"v":2.5,"c":["1"]}
        ]}"#;

        let trades = parse_trade_message(text);
        assert_eq!(trades.len(), 2);

        assert_eq!(trades[0].symbol, "AAPL");
        assert_eq!(trades[0].price, 187.5);
        assert_eq!(trades[0].size, 100.0);
        assert_eq!(trades[0].timestamp.timestamp_millis(), 1_700_000_005_123);
        assert_eq!(trades[1].symbol, "MSFT");
        assert_eq!(trades[1].size, 2.5);
    }

    #[test]
    fn test_malformed_entry_only_drops_itself() {
        let text = r#"{"type":"trade","data":[
            {"s":"AAPL","p":187.5,"t":1700000005123,"v":100},
            {"s":"MSFT","p":"oops","t":1700000005200,"v":1},
            {"s":"MSFT","t":1700000005300},
            {"s":"TSLA","p":240.1,"t":1700000005456,"v":3}
        ]}"#;

        let trades = parse_trade_message(text);
        let symbols: Vec<&str> = trades.iter().map(|t| t.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["AAPL", "TSLA"]);
    }

    #[test]
    fn test_other_messages_are_ignored() {
        assert!(parse_trade_message(r#"{"type":"ping"}"#).is_empty());
        assert!(parse_trade_message(r#"{"type":"error","msg":"bad symbol"}"#).is_empty());
        assert!(parse_trade_message("not json").is_empty());
        assert!(parse_trade_message(r#"{"type":"trade","data":[]}"#).is_empty());
    }

    #[test]
    fn test_subscribe_request_shape() {
        let request = WsSubscribeRequest {
            kind: "subscribe",
            symbol: "AAPL",
        };
        assert_eq!(
            serde_json::to_string(&request).unwrap(),
            r#"{"type":"subscribe","symbol":"AAPL"}"#
        );
    }

    #[test]
    fn test_stream_url() {
        assert_eq!(stream_url("wss://ws.finnhub.io", ""), "wss://ws.finnhub.io");
        assert_eq!(stream_url("wss://ws.finnhub.io", "abc"), "wss://ws.finnhub.io?token=abc");
        assert_eq!(stream_url("wss://x.io/?v=1", "abc"), "wss://x.io/?v=1&token=abc");
    }
}
