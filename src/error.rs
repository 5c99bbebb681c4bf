/// Centralized error types for the bar cache
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BarCacheError {
    // Stream Errors
    #[error("WebSocket connection failed: {0}")]
    ConnectionError(String),

    #[error("WebSocket disconnected: {0}")]
    Disconnected(String),

    // Historical Fetch Errors
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Historical fetch failed: {0}")]
    FetchError(String),

    #[error("Historical fetch timed out: {0}")]
    FetchTimeout(String),

    // Construction Errors
    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    #[error("Invalid time window: {0}")]
    InvalidWindow(String),

    // Data Errors
    #[error("Deserialization failed: {0}")]
    DeserializationError(#[from] serde_json::Error),

    // Configuration Errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("File I/O error: {0}")]
    FileError(#[from] std::io::Error),

    // Lifecycle Errors
    #[error("Provider closed: {0}")]
    Closed(String),
}

pub type Result<T> = std::result::Result<T, BarCacheError>;

impl BarCacheError {
    /// Check if retrying the same call can succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BarCacheError::ConnectionError(_)
                | BarCacheError::Disconnected(_)
                | BarCacheError::HttpError(_)
                | BarCacheError::FetchError(_)
                | BarCacheError::FetchTimeout(_)
        )
    }

    /// Get error code for logging/monitoring
    pub fn error_code(&self) -> &str {
        match self {
            BarCacheError::ConnectionError(_) => "NET_001",
            BarCacheError::Disconnected(_) => "NET_002",
            BarCacheError::HttpError(_) => "NET_003",
            BarCacheError::FetchError(_) => "FETCH_001",
            BarCacheError::FetchTimeout(_) => "FETCH_002",
            BarCacheError::InvalidInterval(_) => "CFG_001",
            BarCacheError::InvalidWindow(_) => "CFG_002",
            BarCacheError::ConfigError(_) => "CFG_003",
            BarCacheError::DeserializationError(_) => "DATA_001",
            BarCacheError::FileError(_) => "FILE_001",
            BarCacheError::Closed(_) => "SYS_001",
        }
    }
}
