/// Configuration loading from TOML file
use std::path::Path;

use tracing::debug;

use crate::broker::rest::timeframe_for;
use crate::error::{BarCacheError, Result};
use crate::types::{Config, ProviderMode};

pub const CONFIG_PATH_VAR: &str = "BARCACHE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

const STREAM_TOKEN_VAR: &str = "BARCACHE_STREAM_TOKEN";
const API_KEY_ID_VAR: &str = "APCA_API_KEY_ID";
const API_SECRET_KEY_VAR: &str = "APCA_API_SECRET_KEY";

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
        BarCacheError::ConfigError(format!(
            "Failed to read config file {}: {}",
            path.as_ref().display(),
            e
        ))
    })?;

    let mut config = parse_config(&content)?;

    // Secrets from the environment win over the file
    apply_overrides(&mut config, |name| std::env::var(name).ok());

    validate_config(&config)?;

    Ok(config)
}

/// Load from `$BARCACHE_CONFIG`, falling back to `config.toml`
pub fn load_config_from_env() -> Result<Config> {
    let path = std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    debug!("Loading config from {}", path);
    load_config(path)
}

fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content)
        .map_err(|e| BarCacheError::ConfigError(format!("Failed to parse config: {}", e)))
}

fn apply_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let lookup = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(token) = lookup(STREAM_TOKEN_VAR) {
        config.stream.token = token;
    }

    if let Some(historical) = config.historical.as_mut() {
        if let Some(key_id) = lookup(API_KEY_ID_VAR) {
            historical.api_key_id = key_id;
        }
        if let Some(secret) = lookup(API_SECRET_KEY_VAR) {
            historical.api_secret_key = secret;
        }
    }
}

fn validate_config(config: &Config) -> Result<()> {
    if config.interval_secs < 0 {
        return Err(BarCacheError::ConfigError(format!(
            "Invalid interval_secs: {}",
            config.interval_secs
        )));
    }

    if config.instruments.is_empty() {
        return Err(BarCacheError::ConfigError("instruments is empty".to_string()));
    }

    if config.instruments.iter().any(|i| i.symbol.is_empty()) {
        return Err(BarCacheError::ConfigError("instrument with empty symbol".to_string()));
    }

    match config.mode {
        ProviderMode::Live => {
            if config.stream.url.is_empty() {
                return Err(BarCacheError::ConfigError("stream.url is empty".to_string()));
            }
        }
        ProviderMode::Historical => {
            let historical = config.historical.as_ref().ok_or_else(|| {
                BarCacheError::ConfigError("historical mode needs a [historical] section".to_string())
            })?;

            if historical.start >= historical.end {
                return Err(BarCacheError::ConfigError(format!(
                    "historical.start={} must be before historical.end={}",
                    historical.start, historical.end
                )));
            }

            timeframe_for(config.interval())
                .map_err(|e| BarCacheError::ConfigError(e.to_string()))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Instrument;
    use std::collections::HashMap;
    use std::io::Write;

    const LIVE: &str = r#"
mode = "live"
interval_secs = 60
instruments = ["AAPL:IEX:stock", "MSFT:IEX:stock"]

[stream]
url = "wss://ws.finnhub.io"
token = "from-file"
"#;

    const HISTORICAL: &str = r#"
mode = "historical"
interval_secs = 300
instruments = ["AAPL:IEX:stock"]
log_json = true

[historical]
start = "2024-01-02T14:30:00Z"
end = "2024-01-02T21:00:00Z"
"#;

    fn write_temp(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_live_config() {
        let file = write_temp(LIVE);
        let config = load_config(file.path()).unwrap();

        assert_eq!(config.mode, ProviderMode::Live);
        assert_eq!(config.interval_secs, 60);
        assert_eq!(config.instruments[1], Instrument::new("MSFT", "IEX", "stock"));
        assert_eq!(config.log_level, "info");
        assert!(!config.log_json);
        assert_eq!(config.stream.connect_timeout_secs, 10);
        assert_eq!(config.stream.max_sample_staleness_secs, 2);
        assert!(config.historical.is_none());
    }

    #[test]
    fn test_load_historical_config_defaults() {
        let file = write_temp(HISTORICAL);
        let config = load_config(file.path()).unwrap();

        let historical = config.historical.unwrap();
        assert_eq!(historical.base_url, "https://data.alpaca.markets");
        assert_eq!(historical.feed, "iex");
        assert_eq!(historical.fetch_timeout_secs, 30);
        assert_eq!(historical.page_limit, 10_000);
        assert!(config.log_json);
    }

    #[test]
    fn test_env_overrides_secrets() {
        let mut config = parse_config(HISTORICAL).unwrap();
        let env: HashMap<&str, &str> = [
            (STREAM_TOKEN_VAR, "tok"),
            (API_KEY_ID_VAR, "key"),
            (API_SECRET_KEY_VAR, ""),
        ]
        .into_iter()
        .collect();

        apply_overrides(&mut config, |name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.stream.token, "tok");
        let historical = config.historical.unwrap();
        assert_eq!(historical.api_key_id, "key");
        // Empty values are ignored
        assert_eq!(historical.api_secret_key, "");
    }

    #[test]
    fn test_invalid_configs_rejected() {
        let cases = [
            LIVE.replace("interval_secs = 60", "interval_secs = -1"),
            LIVE.replace(r#"["AAPL:IEX:stock", "MSFT:IEX:stock"]"#, "[]"),
            LIVE.replace("\"wss://ws.finnhub.io\"", "\"\""),
            HISTORICAL.replace("interval_secs = 300", "interval_secs = 45"),
            HISTORICAL.replace("2024-01-02T21:00:00Z", "2024-01-02T14:30:00Z"),
            HISTORICAL.replace("[historical]", "[other]"),
            LIVE.replace("AAPL:IEX:stock", "AAPL"),
            "not toml at all".to_string(),
        ];

        for case in cases {
            let file = write_temp(&case);
            let err = load_config(file.path()).unwrap_err();
            assert!(matches!(err, BarCacheError::ConfigError(_)), "accepted: {}", case);
        }
    }

    #[test]
    fn test_zero_interval_live_is_allowed() {
        let file = write_temp(&LIVE.replace("interval_secs = 60", "interval_secs = 0"));
        assert!(load_config(file.path()).is_ok());
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            load_config("/nonexistent/barcache.toml"),
            Err(BarCacheError::ConfigError(_))
        ));
    }
}
