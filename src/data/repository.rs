/// Candle repository: loads stored series into memory
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::data::registry::SyncRegistry;
use crate::data::storage::CandleStorage;
use crate::error::{IndexError, Result};
use crate::types::CandleSeries;

pub struct CandleRepository {
    storage: Arc<CandleStorage>,
    max_concurrent: usize,
}

impl CandleRepository {
    pub fn new(storage: Arc<CandleStorage>, max_concurrent: usize) -> Self {
        CandleRepository {
            storage,
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Load one symbol; `None` when nothing valid is stored
    pub async fn load_one(&self, symbol: &str) -> Result<Option<CandleSeries>> {
        load_series(&self.storage, symbol).await
    }

    /// Load every active symbol that has a storage file.
    ///
    /// Each loaded symbol's `storage_start` is set to its first candle; the
    /// registry is written back to `registry_path` when any of them changed.
    pub async fn load_all(
        &self,
        registry: &mut SyncRegistry,
        registry_path: &Path,
    ) -> Result<HashMap<String, CandleSeries>> {
        let mut symbols = Vec::new();
        for symbol in registry.active_symbols() {
            if self.storage.has_candles(&symbol).await {
                symbols.push(symbol);
            }
        }

        info!("📂 Loading {} stored series", symbols.len());

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks = Vec::with_capacity(symbols.len());

        for symbol in symbols {
            let storage = self.storage.clone();
            let semaphore = semaphore.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => return (symbol, Err(IndexError::InternalError(e.to_string()))),
                };
                let result = load_series(&storage, &symbol).await;
                (symbol, result)
            }));
        }

        let mut loaded = HashMap::new();
        for joined in join_all(tasks).await {
            match joined {
                Ok((symbol, Ok(Some(series)))) => {
                    loaded.insert(symbol, series);
                }
                Ok((symbol, Ok(None))) => debug!("{}: no valid candles stored", symbol),
                Ok((symbol, Err(e))) => warn!("{}: load failed: {}", symbol, e),
                Err(e) => error!("Load task panicked: {}", e),
            }
        }

        let mut changed = 0;
        for (symbol, series) in &loaded {
            let (Some(state), Some(first)) = (registry.get_mut(symbol), series.first()) else {
                continue;
            };
            if state.storage_start != Some(first.open_time) {
                state.storage_start = Some(first.open_time);
                changed += 1;
            }
        }

        if changed > 0 {
            registry.persist(registry_path).await?;
            debug!("Updated storage start of {} symbols", changed);
        }

        info!("✅ Loaded {} series", loaded.len());
        Ok(loaded)
    }
}

async fn load_series(storage: &CandleStorage, symbol: &str) -> Result<Option<CandleSeries>> {
    let Some(candles) = storage.read_candles(symbol).await? else {
        return Ok(None);
    };
    if candles.is_empty() {
        return Ok(None);
    }
    Ok(Some(CandleSeries::new(symbol, storage.interval(), candles)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::registry::SymbolSyncState;
    use crate::types::{Candle, InstrumentType, Interval};
    use chrono::{Duration, TimeZone, Utc};
    use tempfile::TempDir;

    fn candle(i: i64) -> Candle {
        Candle {
            open_time: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(15 * i),
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1.0,
            value: 1.0,
            confirm: true,
            is_realtime: false,
        }
    }

    #[tokio::test]
    async fn test_load_all_updates_storage_start() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(CandleStorage::new(
            dir.path(),
            InstrumentType::Swap,
            Interval::FifteenMinutes,
        ));
        storage.append_candles("BTCUSDT", &[candle(2), candle(1), candle(3)]).await.unwrap();
        tokio::fs::write(storage.candle_path("BADUSDT"), "broken;line\n").await.unwrap();

        let launch = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let mut registry = SyncRegistry::new();
        registry.update(SymbolSyncState::new("BTCUSDT", launch));
        registry.update(SymbolSyncState::new("BADUSDT", launch));
        registry.update(SymbolSyncState::new("ETHUSDT", launch));

        let repository = CandleRepository::new(storage.clone(), 2);
        let path = storage.sync_log_path();
        let loaded = repository.load_all(&mut registry, &path).await.unwrap();

        assert_eq!(loaded.len(), 1);
        let series = &loaded["BTCUSDT"];
        assert_eq!(series.len(), 3);
        assert_eq!(series.first().unwrap().open_time, candle(1).open_time);
        assert_eq!(registry.get("BTCUSDT").unwrap().storage_start, Some(candle(1).open_time));

        let persisted = SyncRegistry::load_required(&path).await.unwrap();
        assert_eq!(persisted.get("BTCUSDT").unwrap().storage_start, Some(candle(1).open_time));
    }

    #[tokio::test]
    async fn test_load_one() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(CandleStorage::new(
            dir.path(),
            InstrumentType::Swap,
            Interval::FifteenMinutes,
        ));
        let repository = CandleRepository::new(storage.clone(), 1);
        assert!(repository.load_one("BTCUSDT").await.unwrap().is_none());

        storage.append_candles("BTCUSDT", &[candle(1), candle(2)]).await.unwrap();
        let series = repository.load_one("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(series.symbol, "BTCUSDT");
        assert_eq!(series.len(), 2);
    }
}
