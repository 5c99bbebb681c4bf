pub mod rest;
pub mod websocket;

pub use rest::{timeframe_for, AlpacaBarSource, BarSource};
pub use websocket::{StreamTrade, TradeSink, TradeSource};
