/// Core type definitions for the candle pipeline and index engine
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{IndexError, Result};
use crate::utils::time::parse_time;

/// OHLCV candle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Quote-currency turnover
    pub value: f64,
    /// The candle's interval has fully elapsed
    pub confirm: bool,
    pub is_realtime: bool,
}

impl Candle {
    /// Relative range in percent: `100 * (high / low - 1)`
    pub fn per_range(&self) -> f64 {
        100.0 * (self.high / self.low - 1.0)
    }

    pub fn heikin_ashi_close(&self) -> f64 {
        (self.open + self.high + self.low + self.close) / 4.0
    }
}

/// Candle pushed by the live stream, possibly still forming
#[derive(Debug, Clone)]
pub struct LiveCandle {
    pub symbol: String,
    pub interval: Interval,
    pub candle: Candle,
}

/// Candle interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    OneMinute,
    FiveMinutes,
    FifteenMinutes,
    ThirtyMinutes,
    OneHour,
    FourHours,
    OneDay,
}

impl Interval {
    pub fn from_minutes(minutes: u32) -> Option<Self> {
        match minutes {
            1 => Some(Interval::OneMinute),
            5 => Some(Interval::FiveMinutes),
            15 => Some(Interval::FifteenMinutes),
            30 => Some(Interval::ThirtyMinutes),
            60 => Some(Interval::OneHour),
            240 => Some(Interval::FourHours),
            1440 => Some(Interval::OneDay),
            _ => None,
        }
    }

    pub fn minutes(&self) -> i64 {
        match self {
            Interval::OneMinute => 1,
            Interval::FiveMinutes => 5,
            Interval::FifteenMinutes => 15,
            Interval::ThirtyMinutes => 30,
            Interval::OneHour => 60,
            Interval::FourHours => 240,
            Interval::OneDay => 1440,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::minutes(self.minutes())
    }

    /// Interval code used by the exchange API
    pub fn exchange_code(&self) -> &str {
        match self {
            Interval::OneMinute => "1",
            Interval::FiveMinutes => "5",
            Interval::FifteenMinutes => "15",
            Interval::ThirtyMinutes => "30",
            Interval::OneHour => "60",
            Interval::FourHours => "240",
            Interval::OneDay => "D",
        }
    }
}

/// Instrument family, also the top-level storage folder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstrumentType {
    Spot,
    Swap,
    Future,
}

impl InstrumentType {
    pub fn as_str(&self) -> &str {
        match self {
            InstrumentType::Spot => "SPOT",
            InstrumentType::Swap => "SWAP",
            InstrumentType::Future => "FUTURE",
        }
    }
}

/// Exchange product category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Spot,
    Linear,
    Inverse,
}

impl Category {
    pub fn as_str(&self) -> &str {
        match self {
            Category::Spot => "spot",
            Category::Linear => "linear",
            Category::Inverse => "inverse",
        }
    }
}

/// Tradable instrument as listed by the exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    pub base_coin: String,
    pub quote_coin: String,
    /// Earliest time candles are available for
    pub launch_time: DateTime<Utc>,
}

/// Ordered candles for one symbol and interval
#[derive(Debug, Clone, PartialEq)]
pub struct CandleSeries {
    pub symbol: String,
    pub interval: Interval,
    candles: Vec<Candle>,
}

impl CandleSeries {
    /// Build a series; input is sorted and duplicates by open time dropped (first wins)
    pub fn new(symbol: impl Into<String>, interval: Interval, mut candles: Vec<Candle>) -> Self {
        candles.sort_by_key(|c| c.open_time);
        candles.dedup_by_key(|c| c.open_time);
        CandleSeries {
            symbol: symbol.into(),
            interval,
            candles,
        }
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn first(&self) -> Option<&Candle> {
        self.candles.first()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    pub fn position(&self, open_time: DateTime<Utc>) -> Option<usize> {
        self.candles.binary_search_by_key(&open_time, |c| c.open_time).ok()
    }

    pub fn candle_at(&self, open_time: DateTime<Utc>) -> Option<&Candle> {
        self.position(open_time).map(|i| &self.candles[i])
    }

    /// Newest candle with `open_time <= time`
    pub fn last_at_or_before(&self, time: DateTime<Utc>) -> Option<&Candle> {
        let idx = self.candles.partition_point(|c| c.open_time <= time);
        idx.checked_sub(1).map(|i| &self.candles[i])
    }

    /// Candles with `start <= open_time <= end`
    pub fn window(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> &[Candle] {
        let from = self.candles.partition_point(|c| c.open_time < start);
        let to = self.candles.partition_point(|c| c.open_time <= end);
        if from >= to {
            &[]
        } else {
            &self.candles[from..to]
        }
    }

    /// Candles with `start <= open_time < end`
    pub fn window_exclusive(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> &[Candle] {
        let from = self.candles.partition_point(|c| c.open_time < start);
        let to = self.candles.partition_point(|c| c.open_time < end);
        if from >= to {
            &[]
        } else {
            &self.candles[from..to]
        }
    }

    /// Overwrite the candle with the same open time; returns false if none matches
    pub fn replace(&mut self, candle: Candle) -> bool {
        match self.position(candle.open_time) {
            Some(i) => {
                self.candles[i] = candle;
                true
            }
            None => false,
        }
    }

    pub fn push(&mut self, candle: Candle) {
        self.candles.push(candle);
    }

    pub fn replace_last(&mut self, candle: Candle) {
        if let Some(last) = self.candles.last_mut() {
            *last = candle;
        }
    }
}

/// One point of a derived time series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    pub time: DateTime<Utc>,
    pub value: f64,
}

/// How the rebalance continuity factor is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RkMode {
    /// RK stays 1 for every epoch
    #[default]
    Fixed,
    /// RK re-derived at each rebalance as last / recomputed value
    Chained,
}

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub exchange: ExchangeConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub gaps: GapConfig,
    #[serde(default)]
    pub volatility: VolatilityConfig,
    #[serde(default)]
    pub index: IndexConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub root: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub rest_url: String,
    pub ws_url: String,
    pub category: Category,
    pub instrument_type: InstrumentType,
    pub interval_minutes: u32,
    pub quote_coin: String,
    pub excluded_coins: Vec<String>,
    pub rate_limit_per_sec: u32,
    pub request_timeout_sec: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub max_concurrent_requests: usize,
    pub max_concurrent_loads: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GapConfig {
    /// Open vs previous close jump (percent) that flags a price gap
    pub price_gap_threshold_pct: f64,
    /// Re-fetched jump (percent) under which a repair is accepted
    pub repair_tolerance_pct: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VolatilityConfig {
    pub window_days: i64,
    pub depth_bars: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// First rebalance instant, `%Y-%m-%d %H:%M:%S` UTC
    pub epoch: String,
    pub seed_value: f64,
    pub top_n: usize,
    pub rk_mode: RkMode,
    pub output_file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_level: default_log_level(),
            storage: StorageConfig::default(),
            exchange: ExchangeConfig::default(),
            sync: SyncConfig::default(),
            gaps: GapConfig::default(),
            volatility: VolatilityConfig::default(),
            index: IndexConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            root: "data/storage".to_string(),
        }
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        ExchangeConfig {
            rest_url: "https://api.bybit.com".to_string(),
            ws_url: "wss://stream.bybit.com/v5/public/linear".to_string(),
            category: Category::Linear,
            instrument_type: InstrumentType::Swap,
            interval_minutes: 15,
            quote_coin: "USDT".to_string(),
            excluded_coins: vec!["USDC".to_string(), "USDE".to_string()],
            rate_limit_per_sec: 10,
            request_timeout_sec: 30,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            max_concurrent_requests: 8,
            max_concurrent_loads: 16,
        }
    }
}

impl Default for GapConfig {
    fn default() -> Self {
        GapConfig {
            price_gap_threshold_pct: 0.09,
            repair_tolerance_pct: 0.01,
        }
    }
}

impl Default for VolatilityConfig {
    fn default() -> Self {
        VolatilityConfig {
            window_days: 180,
            depth_bars: 17280,
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            epoch: "2024-10-01 11:00:00".to_string(),
            seed_value: 1000.0,
            top_n: 100,
            rk_mode: RkMode::Fixed,
            output_file: "rc100.csv".to_string(),
        }
    }
}

impl Config {
    pub fn interval(&self) -> Result<Interval> {
        Interval::from_minutes(self.exchange.interval_minutes).ok_or_else(|| {
            IndexError::ConfigError(format!(
                "Unsupported interval_minutes: {}",
                self.exchange.interval_minutes
            ))
        })
    }

    pub fn index_epoch(&self) -> Result<DateTime<Utc>> {
        parse_time(&self.index.epoch).ok_or_else(|| {
            IndexError::ConfigError(format!("Invalid index epoch: {}", self.index.epoch))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candle(minute: u32, close: f64) -> Candle {
        Candle {
            open_time: Utc.with_ymd_and_hms(2025, 1, 1, 0, minute, 0).unwrap(),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 1.0,
            value: close,
            confirm: true,
            is_realtime: false,
        }
    }

    #[test]
    fn test_series_sorted_and_deduplicated() {
        let series = CandleSeries::new(
            "BTCUSDT",
            Interval::FifteenMinutes,
            vec![candle(30, 3.0), candle(0, 1.0), candle(15, 2.0), candle(15, 9.0)],
        );
        assert_eq!(series.len(), 3);
        assert_eq!(series.candles()[1].close, 2.0);
        assert_eq!(series.last().unwrap().close, 3.0);
    }

    #[test]
    fn test_series_windows() {
        let series = CandleSeries::new(
            "BTCUSDT",
            Interval::FifteenMinutes,
            vec![candle(0, 1.0), candle(15, 2.0), candle(30, 3.0), candle(45, 4.0)],
        );
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 15, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 1, 1, 0, 45, 0).unwrap();
        assert_eq!(series.window(start, end).len(), 3);
        assert_eq!(series.window_exclusive(start, end).len(), 2);
        assert!(series.window(end, start).is_empty());
        assert_eq!(series.candle_at(end).map(|c| c.close), Some(4.0));

        let between = Utc.with_ymd_and_hms(2025, 1, 1, 0, 20, 0).unwrap();
        assert_eq!(series.last_at_or_before(between).map(|c| c.close), Some(2.0));
        assert_eq!(series.last_at_or_before(start).map(|c| c.close), Some(2.0));
        let before = Utc.with_ymd_and_hms(2024, 12, 31, 23, 0, 0).unwrap();
        assert!(series.last_at_or_before(before).is_none());
    }

    #[test]
    fn test_per_range() {
        let mut c = candle(0, 100.0);
        c.high = 102.0;
        c.low = 100.0;
        assert!((c.per_range() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_interval_codes() {
        assert_eq!(Interval::from_minutes(15), Some(Interval::FifteenMinutes));
        assert_eq!(Interval::FifteenMinutes.exchange_code(), "15");
        assert_eq!(Interval::OneDay.exchange_code(), "D");
        assert!(Interval::from_minutes(7).is_none());
    }
}
