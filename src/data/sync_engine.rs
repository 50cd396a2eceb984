/// Incremental candle synchronization
/// Fetches the delta since each symbol's last persisted candle and appends it
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::data::registry::{SymbolSyncState, SyncRegistry};
use crate::data::storage::CandleStorage;
use crate::error::{IndexError, Result};
use crate::exchange::ExchangeClient;
use crate::types::{Candle, Category, Interval};

/// Result of syncing one symbol
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub state: SymbolSyncState,
    pub appended: usize,
}

/// Summary of a full sync pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub started: DateTime<Utc>,
    pub duration_ms: i64,
    pub symbols_synced: usize,
    pub symbols_skipped: usize,
    pub candles_appended: usize,
    pub errors: Vec<String>,
}

impl SyncReport {
    fn new(started: DateTime<Utc>) -> Self {
        SyncReport {
            started,
            duration_ms: 0,
            symbols_synced: 0,
            symbols_skipped: 0,
            candles_appended: 0,
            errors: Vec::new(),
        }
    }
}

pub struct SyncEngine<C: ExchangeClient> {
    client: Arc<C>,
    storage: Arc<CandleStorage>,
    category: Category,
    max_concurrent: usize,
}

impl<C: ExchangeClient + 'static> SyncEngine<C> {
    pub fn new(client: Arc<C>, storage: Arc<CandleStorage>, category: Category, max_concurrent: usize) -> Self {
        SyncEngine {
            client,
            storage,
            category,
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.storage.sync_log_path()
    }

    /// Sync one symbol and return its advanced state
    pub async fn sync_one(&self, state: SymbolSyncState) -> Result<SyncOutcome> {
        sync_symbol(self.client.as_ref(), &self.storage, self.category, state).await
    }

    /// Sync every active symbol with bounded parallelism, then persist the registry.
    ///
    /// A failing symbol keeps its previous state and is reported in `errors`.
    pub async fn sync_all(&self, registry: &mut SyncRegistry) -> Result<SyncReport> {
        let started = Utc::now();
        let mut report = SyncReport::new(started);

        let states: Vec<SymbolSyncState> = registry.iter().filter(|s| s.active).cloned().collect();
        report.symbols_skipped = registry.len() - states.len();

        info!(
            "🔄 Syncing {} active symbols ({} in flight max)",
            states.len(),
            self.max_concurrent
        );

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks = Vec::with_capacity(states.len());

        for state in states {
            let client = self.client.clone();
            let storage = self.storage.clone();
            let semaphore = semaphore.clone();
            let category = self.category;

            tasks.push(tokio::spawn(async move {
                let symbol = state.symbol.clone();
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => return (symbol, Err(IndexError::InternalError(e.to_string()))),
                };
                let result = sync_symbol(client.as_ref(), &storage, category, state).await;
                (symbol, result)
            }));
        }

        for joined in join_all(tasks).await {
            match joined {
                Ok((_, Ok(outcome))) => {
                    report.symbols_synced += 1;
                    report.candles_appended += outcome.appended;
                    registry.update(outcome.state);
                }
                Ok((symbol, Err(e))) => {
                    if e.is_recoverable() {
                        warn!("{}: sync failed [{}], retrying next pass: {}", symbol, e.error_code(), e);
                    } else {
                        error!("{}: sync failed [{}]: {}", symbol, e.error_code(), e);
                    }
                    report.errors.push(format!("{}: {}", symbol, e));
                }
                Err(e) => {
                    error!("Sync task panicked: {}", e);
                    report.errors.push(format!("task: {}", e));
                }
            }
        }

        registry.persist(&self.registry_path()).await?;

        report.duration_ms = (Utc::now() - started).num_milliseconds();
        info!(
            "✅ Sync finished: {} symbols, {} candles appended, {} errors in {} ms",
            report.symbols_synced,
            report.candles_appended,
            report.errors.len(),
            report.duration_ms
        );
        Ok(report)
    }
}

/// Candles safe to persist from one fetch: the newest (forming) candle is
/// dropped, and only candles strictly after `end` are kept, in order.
pub fn confirmed_delta(mut fetched: Vec<Candle>, end: DateTime<Utc>) -> Vec<Candle> {
    if fetched.len() <= 1 {
        return Vec::new();
    }
    fetched.pop();

    let mut last = end;
    fetched.retain(|c| {
        if c.open_time > last {
            last = c.open_time;
            true
        } else {
            false
        }
    });
    fetched
}

async fn sync_symbol<C: ExchangeClient>(
    client: &C,
    storage: &CandleStorage,
    category: Category,
    mut state: SymbolSyncState,
) -> Result<SyncOutcome> {
    if !state.active {
        return Err(IndexError::InactiveSymbol(state.symbol));
    }

    let interval: Interval = storage.interval();
    let since = state.end + interval.duration();
    let fetched = client.fetch_candles(category, &state.symbol, interval, since).await?;
    let fetched_count = fetched.len();

    let delta = confirmed_delta(fetched, state.end);
    if delta.is_empty() {
        debug!("{}: up to date ({} fetched)", state.symbol, fetched_count);
        return Ok(SyncOutcome { state, appended: 0 });
    }

    let appended = storage.append_candles(&state.symbol, &delta).await?;
    if let Some(last) = delta.last() {
        state.end = last.open_time;
    }

    debug!("{}: +{} candles, end = {}", state.symbol, appended, state.end);
    Ok(SyncOutcome { state, appended })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::MemoryExchange;
    use crate::types::InstrumentType;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    fn launch() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    fn candles(from: usize, count: usize) -> Vec<Candle> {
        (from..from + count)
            .map(|i| Candle {
                open_time: launch() + Duration::minutes(15 * i as i64),
                open: 1.0 + i as f64,
                high: 2.0 + i as f64,
                low: 0.5 + i as f64,
                close: 1.5 + i as f64,
                volume: 10.0,
                value: 15.0,
                confirm: true,
                is_realtime: false,
            })
            .collect()
    }

    fn engine(dir: &TempDir, exchange: Arc<MemoryExchange>) -> SyncEngine<MemoryExchange> {
        let storage = Arc::new(CandleStorage::new(
            dir.path(),
            InstrumentType::Swap,
            Interval::FifteenMinutes,
        ));
        SyncEngine::new(exchange, storage, Category::Linear, 4)
    }

    #[test]
    fn test_confirmed_delta_drops_forming_and_stale() {
        let fetched = candles(0, 5);
        let end = fetched[1].open_time;
        let delta = confirmed_delta(fetched, end);
        assert_eq!(delta.len(), 2);
        assert_eq!(delta[0].open_time, launch() + Duration::minutes(30));

        assert!(confirmed_delta(candles(0, 1), launch()).is_empty());
    }

    #[tokio::test]
    async fn test_sync_appends_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let exchange = Arc::new(MemoryExchange::new());
        // Candle 0 sits at the launch time and is never requested
        exchange.set_candles("BTCUSDT", candles(0, 11)).await;
        let engine = engine(&dir, exchange.clone());

        let state = SymbolSyncState::new("BTCUSDT", launch());
        let outcome = engine.sync_one(state).await.unwrap();
        assert_eq!(outcome.appended, 9);
        assert_eq!(outcome.state.end, launch() + Duration::minutes(15 * 9));

        let again = engine.sync_one(outcome.state.clone()).await.unwrap();
        assert_eq!(again.appended, 0);
        assert_eq!(again.state, outcome.state);

        let stored = engine.storage.read_candles("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(stored.len(), 9);
        assert!(stored.windows(2).all(|w| w[0].open_time < w[1].open_time));
    }

    #[tokio::test]
    async fn test_inactive_symbol_rejected() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, Arc::new(MemoryExchange::new()));
        let mut state = SymbolSyncState::new("BTCUSDT", launch());
        state.active = false;
        assert!(matches!(
            engine.sync_one(state).await,
            Err(IndexError::InactiveSymbol(_))
        ));
    }

    #[tokio::test]
    async fn test_sync_all_isolates_failures() {
        let dir = TempDir::new().unwrap();
        let exchange = Arc::new(MemoryExchange::new());
        exchange.set_candles("BTCUSDT", candles(0, 5)).await;
        exchange.set_candles("ETHUSDT", candles(0, 5)).await;
        exchange.fail_symbol("ETHUSDT").await;
        let engine = engine(&dir, exchange);

        let mut registry = SyncRegistry::new();
        registry.update(SymbolSyncState::new("BTCUSDT", launch()));
        registry.update(SymbolSyncState::new("ETHUSDT", launch()));
        let mut dormant = SymbolSyncState::new("XRPUSDT", launch());
        dormant.active = false;
        registry.update(dormant);

        let report = engine.sync_all(&mut registry).await.unwrap();
        assert_eq!(report.symbols_synced, 1);
        assert_eq!(report.symbols_skipped, 1);
        assert_eq!(report.candles_appended, 3);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(registry.get("ETHUSDT").unwrap().end, launch());
        assert_eq!(registry.get("BTCUSDT").unwrap().end, launch() + Duration::minutes(45));

        let persisted = SyncRegistry::load_required(&engine.registry_path()).await.unwrap();
        assert_eq!(persisted.get("BTCUSDT"), registry.get("BTCUSDT"));
    }
}
