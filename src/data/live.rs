/// Live candle merge into in-memory series
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::types::{Candle, CandleSeries, LiveCandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveMerge {
    /// Same open time as the tail: the forming candle was updated
    Replaced,
    Appended,
    /// Older than the tail
    Ignored,
}

/// Merge a pushed candle into a series tail
pub fn apply_live_candle(series: &mut CandleSeries, candle: Candle) -> LiveMerge {
    match series.last().map(|c| c.open_time) {
        Some(tail) if candle.open_time == tail => {
            series.replace_last(candle);
            LiveMerge::Replaced
        }
        Some(tail) if candle.open_time < tail => LiveMerge::Ignored,
        _ => {
            series.push(candle);
            LiveMerge::Appended
        }
    }
}

/// In-memory series per symbol, fed by the live stream
#[derive(Debug, Default)]
pub struct LiveCandleBook {
    series: HashMap<String, CandleSeries>,
}

impl LiveCandleBook {
    pub fn new(series: HashMap<String, CandleSeries>) -> Self {
        LiveCandleBook { series }
    }

    /// Merge a live candle; unknown symbols get a fresh series
    pub fn apply(&mut self, live: LiveCandle) -> LiveMerge {
        let series = self
            .series
            .entry(live.symbol.clone())
            .or_insert_with(|| CandleSeries::new(live.symbol.clone(), live.interval, Vec::new()));
        let merge = apply_live_candle(series, live.candle);
        debug!("{}: live candle {:?}", live.symbol, merge);
        merge
    }

    pub fn last(&self, symbol: &str) -> Option<&Candle> {
        self.series.get(symbol)?.last()
    }

    pub fn series(&self) -> &HashMap<String, CandleSeries> {
        &self.series
    }
}

/// Thread-safe live candle book
#[derive(Clone, Default)]
pub struct ConcurrentCandleBook {
    book: Arc<RwLock<LiveCandleBook>>,
}

impl ConcurrentCandleBook {
    pub fn new(series: HashMap<String, CandleSeries>) -> Self {
        ConcurrentCandleBook {
            book: Arc::new(RwLock::new(LiveCandleBook::new(series))),
        }
    }

    pub async fn apply(&self, live: LiveCandle) -> LiveMerge {
        self.book.write().await.apply(live)
    }

    pub async fn last(&self, symbol: &str) -> Option<Candle> {
        self.book.read().await.last(symbol).cloned()
    }

    pub async fn snapshot(&self) -> HashMap<String, CandleSeries> {
        self.book.read().await.series().clone()
    }
}
