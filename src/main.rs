/// Runner: serves bars from the configured provider once per interval
use std::sync::Arc;

use anyhow::Context;
use chrono::{Duration, Utc};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use barcache::{
    config::load_config_from_env,
    data::{bucket_start, build_provider, BarProvider},
    Config, ProviderMode,
};

/// Delay after a bucket boundary before asking for the closed bar
const SETTLE_DELAY_MS: u64 = 250;

pub struct BarCacheApp {
    config: Arc<Config>,
    provider: Arc<dyn BarProvider>,
    shutdown: watch::Receiver<bool>,
}

impl BarCacheApp {
    pub fn new(config: Config, shutdown: watch::Receiver<bool>) -> anyhow::Result<Self> {
        let provider = build_provider(&config).context("Failed to build bar provider")?;
        Ok(BarCacheApp {
            config: Arc::new(config),
            provider,
            shutdown,
        })
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        info!(
            "🚀 Bar cache starting: {:?} mode, {} instruments, {}s bars",
            self.config.mode,
            self.config.instruments.len(),
            self.config.interval_secs
        );

        self.provider
            .include_assets(&self.config.instruments)
            .await
            .context("Failed to include instruments")?;

        let result = match self.config.mode {
            ProviderMode::Live => self.run_live().await,
            ProviderMode::Historical => self.run_historical().await,
        };

        self.provider.close().await?;
        info!("✅ Bar cache stopped");
        result
    }

    /// Log the latest closed bar of every instrument after each boundary
    async fn run_live(&mut self) -> anyhow::Result<()> {
        let interval = self.config.interval();

        loop {
            let now = Utc::now();
            let wait = if interval > Duration::zero() {
                bucket_start(now, interval) + interval - now
            } else {
                Duration::seconds(1)
            };
            let wait = wait.to_std().unwrap_or_default()
                + std::time::Duration::from_millis(SETTLE_DELAY_MS);

            tokio::select! {
                _ = self.shutdown.changed() => {
                    info!("Shutdown signal received");
                    return Ok(());
                }
                _ = tokio::time::sleep(wait) => {}
            }

            let now = Utc::now();
            for instrument in &self.config.instruments {
                match self.provider.fetch_bar_at(instrument, now).await {
                    Ok(Some(bar)) => info!("{} [{}]", bar, bar.status.as_str()),
                    Ok(None) => info!("{}: no data yet", instrument),
                    Err(e) => error!("{}: {} ({})", instrument, e, e.error_code()),
                }
            }
        }
    }

    /// Replay the configured window bucket by bucket
    async fn run_historical(&mut self) -> anyhow::Result<()> {
        let historical = self
            .config
            .historical
            .clone()
            .context("historical mode needs a [historical] section")?;
        let interval = self.config.interval();

        let mut ts = bucket_start(historical.start, interval);
        let mut served = 0usize;
        let mut missing = 0usize;

        while ts < historical.end {
            if *self.shutdown.borrow() {
                warn!("Replay interrupted at {}", ts);
                break;
            }

            for instrument in &self.config.instruments {
                match self.provider.fetch_bar_at(instrument, ts).await {
                    Ok(Some(bar)) => {
                        info!("{}", bar);
                        served += 1;
                    }
                    Ok(None) => missing += 1,
                    Err(e) if e.is_recoverable() => {
                        warn!("{} @ {}: {} - skipping", instrument, ts, e);
                        missing += 1;
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            ts += interval;
        }

        info!("📊 Replay done: {} bars served, {} buckets without data", served, missing);
        Ok(())
    }
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config_from_env().context("Failed to load configuration")?;
    init_logging(&config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl+C received - initiating graceful shutdown");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                error!("Failed to listen for Ctrl+C: {}", e);
                // Keep the sender alive so the runner is not stopped
                std::future::pending::<()>().await;
            }
        }
    });

    let mut app = BarCacheApp::new(config, shutdown_rx)?;
    app.run().await
}
