//! Exchange collaborator: candle history, instrument listing and live candle push.

pub mod bybit;
pub mod memory;
pub mod websocket;

use std::future::Future;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::{Candle, Category, Instrument, Interval, LiveCandle};

pub use bybit::BybitClient;
pub use memory::MemoryExchange;
pub use websocket::BybitCandleStream;

/// Candle source used by the sync engine and the gap corrector.
///
/// Returned candles are ordered by ascending open time. The newest candle of
/// `fetch_candles` may still be forming.
pub trait ExchangeClient: Send + Sync {
    /// Instruments currently tradable in `category`
    fn fetch_instruments(
        &self,
        category: Category,
    ) -> impl Future<Output = Result<Vec<Instrument>>> + Send;

    /// Candles with `open_time >= since` up to now
    fn fetch_candles(
        &self,
        category: Category,
        symbol: &str,
        interval: Interval,
        since: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Candle>>> + Send;

    /// Candles with `start <= open_time <= end`
    fn fetch_candles_range(
        &self,
        category: Category,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<Candle>>> + Send;

    /// Latest (possibly forming) candle per subscribed symbol
    fn subscribe_candles(
        &self,
        symbols: &[String],
        interval: Interval,
    ) -> impl Future<Output = Result<mpsc::Receiver<LiveCandle>>> + Send;
}
