/// Standalone utility: refresh the universe, sync candles and report gaps
/// Usage: cargo run --bin sync_storage --release
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};

use rc100::config::load_config;
use rc100::exchange::BybitClient;
use rc100::pipeline::Pipeline;
use rc100::utils::init_logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let config = Arc::new(load_config(&config_path).with_context(|| format!("loading {}", config_path))?);
    init_logging(&config.log_level);

    info!("🚀 Candle Storage Sync");
    info!("======================");

    let client = Arc::new(BybitClient::new(&config.exchange)?);
    let pipeline = Pipeline::new(Arc::clone(&config), client)?;

    info!("🌐 Refreshing tradable universe...");
    let mut registry = pipeline.refresh_universe().await?;
    info!("✅ {} symbols tracked, {} active", registry.len(), registry.active_symbols().len());

    info!("📥 Syncing confirmed candles...");
    let report = pipeline.sync(&mut registry).await?;
    info!(
        "✅ Synced {} symbols ({} skipped), {} candles appended in {} ms",
        report.symbols_synced, report.symbols_skipped, report.candles_appended, report.duration_ms
    );
    for e in &report.errors {
        error!("❌ {}", e);
    }

    info!("📂 Loading series...");
    let mut series = pipeline.load(&mut registry).await?;
    info!("✅ Loaded {} series", series.len());

    info!("🩹 Scanning for gaps...");
    let reports = pipeline.correct_gaps(&mut series).await;

    println!("\n📊 Gap Summary:");
    println!("   Series with gaps: {}", reports.len());
    for report in &reports {
        println!(
            "   {} - continuity: {}, price: {}, repaired: {}, irreducible: {}, fetch failures: {}, write failures: {}",
            report.symbol,
            report.continuity_gaps,
            report.price_gaps,
            report.repaired,
            report.irreducible,
            report.fetch_failures,
            report.write_failures
        );
    }

    println!("\n✅ Storage under {} is up to date", pipeline.storage().root().display());
    Ok(())
}
