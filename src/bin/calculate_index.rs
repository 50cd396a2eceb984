/// Recompute the RC100 index from local storage only (no exchange access)
/// Usage: cargo run --bin calculate_index --release
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tracing::{info, warn};

use rc100::config::load_config;
use rc100::data::{CandleRepository, CandleStorage, SyncRegistry};
use rc100::error::IndexError;
use rc100::index::{write_series, IndexEngine, IndexSettings, SnapshotStore};
use rc100::utils::init_logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let config = load_config(&config_path).with_context(|| format!("loading {}", config_path))?;
    init_logging(&config.log_level);

    println!("📊 RC100 Index Calculation");
    println!("==========================\n");

    let storage = Arc::new(CandleStorage::new(
        &config.storage.root,
        config.exchange.instrument_type,
        config.interval()?,
    ));

    let registry_path = storage.sync_log_path();
    let mut registry = match SyncRegistry::load_required(&registry_path).await {
        Ok(registry) => registry,
        Err(IndexError::MissingState(path)) => {
            println!("❌ No sync registry at {}", path);
            println!("\n💡 To populate storage, run:");
            println!("   cargo run --release --bin sync_storage");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    let repository = CandleRepository::new(Arc::clone(&storage), config.sync.max_concurrent_loads);
    let series = repository.load_all(&mut registry, &registry_path).await?;
    info!("📂 Loaded {} series", series.len());

    let snapshots = SnapshotStore::load_dir(&storage.snapshot_dir()).await?;
    if snapshots.is_empty() {
        warn!("No capitalization snapshots under {}", storage.snapshot_dir().display());
    }

    let engine = IndexEngine::new(IndexSettings::from_config(&config)?);
    let points = engine.run(&series, &snapshots, Utc::now());

    let path = storage.index_dir().join(&config.index.output_file);
    write_series(&path, &points).await?;

    println!("📈 Summary:");
    println!("   Series loaded: {}", series.len());
    println!("   Snapshots: {}", snapshots.dates().len());
    println!("   Index points: {}", points.len());
    if let (Some(first), Some(last)) = (points.first(), points.last()) {
        println!("   First: {} = {:.4}", first.time, first.value);
        println!("   Last:  {} = {:.4}", last.time, last.value);
    }
    println!("\n✅ Written to {}", path.display());
    Ok(())
}
