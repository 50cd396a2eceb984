/// In-memory exchange (offline replay and simulation)
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};
use tracing::warn;

use crate::error::{IndexError, Result};
use crate::exchange::ExchangeClient;
use crate::types::{Candle, Category, Instrument, Interval, LiveCandle};

/// Exchange that serves candles held in memory.
///
/// The newest candle of a symbol is reported like any other; callers treat it
/// as the forming one, exactly as with the live exchange.
pub struct MemoryExchange {
    instruments: RwLock<Vec<Instrument>>,
    candles: RwLock<HashMap<String, Vec<Candle>>>,
    failing: RwLock<HashSet<String>>,
    instruments_failing: AtomicBool,
    subscribers: RwLock<Vec<mpsc::Sender<LiveCandle>>>,
    requests: AtomicUsize,
}

impl MemoryExchange {
    pub fn new() -> Self {
        MemoryExchange {
            instruments: RwLock::new(Vec::new()),
            candles: RwLock::new(HashMap::new()),
            failing: RwLock::new(HashSet::new()),
            instruments_failing: AtomicBool::new(false),
            subscribers: RwLock::new(Vec::new()),
            requests: AtomicUsize::new(0),
        }
    }

    pub async fn set_instruments(&self, instruments: Vec<Instrument>) {
        *self.instruments.write().await = instruments;
    }

    /// Replace the full candle history of a symbol
    pub async fn set_candles(&self, symbol: &str, mut candles: Vec<Candle>) {
        candles.sort_by_key(|c| c.open_time);
        self.candles.write().await.insert(symbol.to_string(), candles);
    }

    /// Append newer candles to a symbol's history
    pub async fn extend_candles(&self, symbol: &str, candles: Vec<Candle>) {
        let mut all = self.candles.write().await;
        let history = all.entry(symbol.to_string()).or_default();
        history.extend(candles);
        history.sort_by_key(|c| c.open_time);
    }

    /// Make every request for `symbol` fail
    pub async fn fail_symbol(&self, symbol: &str) {
        self.failing.write().await.insert(symbol.to_string());
    }

    /// Make the instrument listing fail (or succeed again)
    pub fn fail_instruments(&self, failing: bool) {
        self.instruments_failing.store(failing, Ordering::Relaxed);
    }

    /// Broadcast a live candle to all subscribers
    pub async fn push_live(&self, live: LiveCandle) {
        let subscribers = self.subscribers.read().await;
        for tx in subscribers.iter() {
            if tx.send(live.clone()).await.is_err() {
                warn!("Live subscriber dropped");
            }
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::Relaxed)
    }

    async fn check(&self, symbol: &str) -> Result<()> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if self.failing.read().await.contains(symbol) {
            return Err(IndexError::ExchangeApiError {
                code: 10002,
                message: format!("simulated failure for {}", symbol),
            });
        }
        Ok(())
    }
}

impl Default for MemoryExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl ExchangeClient for MemoryExchange {
    async fn fetch_instruments(&self, _category: Category) -> Result<Vec<Instrument>> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if self.instruments_failing.load(Ordering::Relaxed) {
            return Err(IndexError::ExchangeApiError {
                code: 10016,
                message: "simulated instrument listing failure".to_string(),
            });
        }
        Ok(self.instruments.read().await.clone())
    }

    async fn fetch_candles(
        &self,
        _category: Category,
        symbol: &str,
        _interval: Interval,
        since: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        self.check(symbol).await?;
        let all = self.candles.read().await;
        Ok(all
            .get(symbol)
            .map(|c| c.iter().filter(|c| c.open_time >= since).cloned().collect())
            .unwrap_or_default())
    }

    async fn fetch_candles_range(
        &self,
        _category: Category,
        symbol: &str,
        _interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        self.check(symbol).await?;
        let all = self.candles.read().await;
        Ok(all
            .get(symbol)
            .map(|c| {
                c.iter()
                    .filter(|c| c.open_time >= start && c.open_time <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn subscribe_candles(
        &self,
        _symbols: &[String],
        _interval: Interval,
    ) -> Result<mpsc::Receiver<LiveCandle>> {
        let (tx, rx) = mpsc::channel(1024);
        self.subscribers.write().await.push(tx);
        Ok(rx)
    }
}
