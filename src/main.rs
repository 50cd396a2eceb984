/// Main entry point: batch pipeline followed by live candle follow
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info};

use rc100::{
    config::load_config,
    exchange::BybitClient,
    pipeline::Pipeline,
    utils::init_logging,
    Config,
};

/// Application state
pub struct IndexApp {
    config: Arc<Config>,
    pipeline: Pipeline<BybitClient>,
    shutdown_tx: watch::Sender<bool>,
}

impl IndexApp {
    pub fn new(config_path: &str) -> anyhow::Result<Self> {
        let config = Arc::new(
            load_config(config_path).with_context(|| format!("loading {}", config_path))?,
        );
        init_logging(&config.log_level);
        info!("Configuration loaded from {}", config_path);

        let client = Arc::new(BybitClient::new(&config.exchange)?);
        let pipeline = Pipeline::new(Arc::clone(&config), client)?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(IndexApp {
            config,
            pipeline,
            shutdown_tx,
        })
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        info!(
            "Starting rc100: {} {} candles under {}",
            self.config.exchange.category.as_str(),
            self.config.exchange.interval_minutes,
            self.config.storage.root
        );

        let (mut registry, series) = self
            .pipeline
            .run_once(Utc::now())
            .await
            .context("batch pass failed")?;

        self.setup_shutdown_handler();

        let book = self
            .pipeline
            .follow_live(&mut registry, series, self.shutdown_tx.subscribe())
            .await?;

        self.shutdown_sequence(&registry, book.snapshot().await.len()).await
    }

    fn setup_shutdown_handler(&self) {
        let shutdown_tx = self.shutdown_tx.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Ctrl+C received - initiating graceful shutdown"),
                Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
            }
            let _ = shutdown_tx.send(true);
        });
    }

    async fn shutdown_sequence(&self, registry: &rc100::data::SyncRegistry, live_series: usize) -> anyhow::Result<()> {
        info!("Starting shutdown sequence...");
        registry
            .persist(&self.pipeline.registry_path())
            .await
            .context("persisting registry")?;
        info!("Registry saved ({} symbols, {} followed live)", registry.len(), live_series);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());

    let app = IndexApp::new(&config_path)?;

    if let Err(e) = app.run().await {
        error!("rc100 stopped: {:#}", e);
        return Err(e);
    }

    Ok(())
}
