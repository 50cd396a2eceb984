/// End-to-end pipeline: universe refresh, sync, load, gap repair, index, live follow
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::data::{
    tradable_universe, CandleRepository, CandleStorage, ConcurrentCandleBook, CorrectionReport, GapCorrector,
    GapDetector, LiveMerge, SyncEngine, SyncRegistry, SyncReport,
};
use crate::error::Result;
use crate::exchange::ExchangeClient;
use crate::index::{write_series, IndexEngine, IndexSettings, SnapshotStore};
use crate::types::{CandleSeries, Config, Interval, TimeSeriesPoint};

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Shared context for every pipeline step
pub struct Pipeline<C: ExchangeClient> {
    config: Arc<Config>,
    client: Arc<C>,
    storage: Arc<CandleStorage>,
    interval: Interval,
}

impl<C: ExchangeClient + 'static> Pipeline<C> {
    pub fn new(config: Arc<Config>, client: Arc<C>) -> Result<Self> {
        let interval = config.interval()?;
        let storage = Arc::new(CandleStorage::new(
            &config.storage.root,
            config.exchange.instrument_type,
            interval,
        ));
        Ok(Pipeline {
            config,
            client,
            storage,
            interval,
        })
    }

    pub fn storage(&self) -> &Arc<CandleStorage> {
        &self.storage
    }

    pub fn registry_path(&self) -> PathBuf {
        self.storage.sync_log_path()
    }

    pub fn index_path(&self) -> PathBuf {
        self.storage.index_dir().join(&self.config.index.output_file)
    }

    /// Reconcile the registry with the exchange's tradable universe and persist it.
    ///
    /// A missing registry file starts an empty registry. When the instrument
    /// listing fails the persisted registry is used as is.
    pub async fn refresh_universe(&self) -> Result<SyncRegistry> {
        let path = self.registry_path();
        let mut registry = match SyncRegistry::load(&path).await? {
            Some(registry) => registry,
            None => {
                info!("No registry at {}, starting empty", path.display());
                SyncRegistry::new()
            }
        };

        let instruments = match self.client.fetch_instruments(self.config.exchange.category).await {
            Ok(instruments) => instruments,
            Err(e) => {
                warn!(
                    "Instrument listing failed [{}], keeping {} registered symbols: {}",
                    e.error_code(),
                    registry.len(),
                    e
                );
                return Ok(registry);
            }
        };
        let universe = tradable_universe(
            &instruments,
            &self.config.exchange.quote_coin,
            &self.config.exchange.excluded_coins,
        );
        info!("🌐 Tradable universe: {} of {} instruments", universe.len(), instruments.len());

        registry.reconcile(&universe);
        registry.persist(&path).await?;
        Ok(registry)
    }

    pub async fn sync(&self, registry: &mut SyncRegistry) -> Result<SyncReport> {
        let engine = SyncEngine::new(
            self.client.clone(),
            self.storage.clone(),
            self.config.exchange.category,
            self.config.sync.max_concurrent_requests,
        );
        engine.sync_all(registry).await
    }

    pub async fn load(&self, registry: &mut SyncRegistry) -> Result<HashMap<String, CandleSeries>> {
        let repository = CandleRepository::new(self.storage.clone(), self.config.sync.max_concurrent_loads);
        repository.load_all(registry, &self.registry_path()).await
    }

    /// Scan every series and repair the price gaps the exchange can confirm
    pub async fn correct_gaps(&self, series: &mut HashMap<String, CandleSeries>) -> Vec<CorrectionReport> {
        let detector = GapDetector::new(self.interval, &self.config.gaps);
        let corrector = GapCorrector::new(
            self.client.clone(),
            self.storage.clone(),
            self.config.exchange.category,
            &self.config.gaps,
        );

        let mut symbols: Vec<String> = series.keys().cloned().collect();
        symbols.sort();

        let mut reports = Vec::new();
        for symbol in symbols {
            let Some(s) = series.get_mut(&symbol) else {
                continue;
            };
            let gaps = detector.scan(s);
            if gaps.is_empty() {
                continue;
            }
            reports.push(corrector.correct(s, &gaps).await);
        }

        let repaired: usize = reports.iter().map(|r| r.repaired).sum();
        info!("🩹 Gap scan: {} series with gaps, {} gaps repaired", reports.len(), repaired);
        reports
    }

    /// Compute the index up to `now` and write it to the index file
    pub async fn compute_index(
        &self,
        series: &HashMap<String, CandleSeries>,
        now: DateTime<Utc>,
    ) -> Result<Vec<TimeSeriesPoint>> {
        let snapshots = SnapshotStore::load_dir(&self.storage.snapshot_dir()).await?;
        if snapshots.is_empty() {
            warn!("No capitalization snapshots found; index stays at its seed");
        }

        let engine = IndexEngine::new(IndexSettings::from_config(&self.config)?);
        let points = engine.run(series, &snapshots, now);

        let path = self.index_path();
        write_series(&path, &points).await?;
        if let Some(last) = points.last() {
            info!("📈 Index: {} points, last {:.4} at {} -> {}", points.len(), last.value, last.time, path.display());
        }
        Ok(points)
    }

    /// One full batch pass
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<(SyncRegistry, HashMap<String, CandleSeries>)> {
        let mut registry = self.refresh_universe().await?;
        let report = self.sync(&mut registry).await?;
        if !report.errors.is_empty() {
            warn!("{} symbols failed to sync; they will be retried next pass", report.errors.len());
        }

        let mut series = self.load(&mut registry).await?;
        self.correct_gaps(&mut series).await;
        self.compute_index(&series, now).await?;
        Ok((registry, series))
    }

    /// Merge pushed candles into memory and run a sync pass whenever a new
    /// candle is confirmed. Returns when `shutdown` flips or the stream ends.
    pub async fn follow_live(
        &self,
        registry: &mut SyncRegistry,
        series: HashMap<String, CandleSeries>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<ConcurrentCandleBook> {
        let symbols = registry.active_symbols();
        let book = ConcurrentCandleBook::new(series);
        let mut rx = self.client.subscribe_candles(&symbols, self.interval).await?;
        info!("📡 Following {} symbols live", symbols.len());

        let mut last_confirmed: Option<DateTime<Utc>> = None;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Live follow stopping");
                        break;
                    }
                }
                received = rx.recv() => {
                    let Some(live) = received else {
                        warn!("Live stream ended, resubscribing");
                        tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                        match self.client.subscribe_candles(&symbols, self.interval).await {
                            Ok(fresh) => rx = fresh,
                            Err(e) => {
                                warn!("Resubscribe failed, live follow stopping: {}", e);
                                break;
                            }
                        }
                        continue;
                    };
                    let open_time = live.candle.open_time;
                    let confirmed = live.candle.confirm;
                    if book.apply(live).await == LiveMerge::Ignored {
                        continue;
                    }

                    if confirmed && last_confirmed.map_or(true, |t| open_time > t) {
                        last_confirmed = Some(open_time);
                        debug!("Candle {} confirmed, syncing", open_time);
                        if let Err(e) = self.sync(registry).await {
                            warn!("Live sync pass failed: {}", e);
                        }
                    }
                }
            }
        }

        Ok(book)
    }
}
