/// Volatility statistics over a trailing window of candles
use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::data::aggregation::to_hourly;
use crate::types::{CandleSeries, VolatilityConfig};
use crate::utils::time::start_of_day;

/// Mean, extremes and sample standard deviation of a sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DescriptiveStats {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    /// Sample standard deviation (n - 1); `NaN` for a single value
    pub sd: f64,
}

impl DescriptiveStats {
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }

        let count = values.len();
        let mean = values.iter().sum::<f64>() / count as f64;
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let sd = if count > 1 {
            let sq: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
            (sq / (count - 1) as f64).sqrt()
        } else {
            f64::NAN
        };

        Some(DescriptiveStats { count, mean, min, max, sd })
    }
}

/// Hourly range statistics of one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolatilityParams {
    pub symbol: String,
    /// Mean hourly range in percent, the symbol's volatility
    pub average: f64,
    pub max: f64,
    pub min: f64,
    pub sd: f64,
}

/// Volatility as of `as_of`.
///
/// Uses the candles of the `window_days` whole days before `as_of`'s date.
/// Returns `None` when fewer than `depth_bars` source candles fall in the window.
pub fn compute(
    series: &CandleSeries,
    as_of: DateTime<Utc>,
    depth_bars: usize,
    window_days: i64,
) -> Option<VolatilityParams> {
    let end = start_of_day(as_of);
    let start = end - Duration::days(window_days);
    let window = series.window_exclusive(start, end);
    if window.len() < depth_bars {
        debug!(
            "{}: {} candles in window, {} required",
            series.symbol,
            window.len(),
            depth_bars
        );
        return None;
    }

    let ranges: Vec<f64> = to_hourly(window).iter().map(|c| c.per_range()).collect();
    let stats = DescriptiveStats::from_values(&ranges)?;

    Some(VolatilityParams {
        symbol: series.symbol.clone(),
        average: stats.mean,
        max: stats.max,
        min: stats.min,
        sd: stats.sd,
    })
}

/// Volatility of every series with enough history, sorted by symbol
pub fn compute_all(
    series: &HashMap<String, CandleSeries>,
    as_of: DateTime<Utc>,
    config: &VolatilityConfig,
) -> Vec<VolatilityParams> {
    let mut params: Vec<VolatilityParams> = series
        .par_iter()
        .filter_map(|(_, s)| compute(s, as_of, config.depth_bars, config.window_days))
        .collect();
    params.sort_by(|a, b| a.symbol.cmp(&b.symbol));
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Candle, Interval};
    use chrono::TimeZone;

    fn as_of() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 3, 11, 0, 0).unwrap()
    }

    /// Two days of 15m candles before `as_of`'s date, with a fixed 1% range
    fn series(symbol: &str) -> CandleSeries {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let candles = (0..4 * 24 * 3)
            .map(|i| Candle {
                open_time: start + Duration::minutes(15 * i),
                open: 100.0,
                high: 101.0,
                low: 100.0,
                close: 100.5,
                volume: 1.0,
                value: 1.0,
                confirm: true,
                is_realtime: false,
            })
            .collect();
        CandleSeries::new(symbol, Interval::FifteenMinutes, candles)
    }

    #[test]
    fn test_descriptive_stats() {
        let stats = DescriptiveStats::from_values(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert_eq!(stats.mean, 5.0);
        assert_eq!(stats.min, 2.0);
        assert_eq!(stats.max, 9.0);
        // Sample SD: sqrt(32 / 7)
        assert!((stats.sd - (32.0f64 / 7.0).sqrt()).abs() < 1e-12);
        assert!(DescriptiveStats::from_values(&[]).is_none());
        assert!(DescriptiveStats::from_values(&[1.0]).unwrap().sd.is_nan());
    }

    #[test]
    fn test_compute_uses_whole_days_before_as_of() {
        let s = series("BTCUSDT");
        // Jan 1 and Jan 2 only: 192 source candles, 48 hourly
        let params = compute(&s, as_of(), 192, 2).unwrap();
        assert!((params.average - 1.0).abs() < 1e-9);
        assert!((params.max - 1.0).abs() < 1e-9);
        assert!(params.sd.abs() < 1e-9);
    }

    #[test]
    fn test_insufficient_history() {
        let s = series("BTCUSDT");
        assert!(compute(&s, as_of(), 193, 2).is_none());
        assert!(compute(&s, as_of(), 17280, 180).is_none());
    }

    #[test]
    fn test_compute_all_sorted() {
        let mut map = HashMap::new();
        map.insert("ETHUSDT".to_string(), series("ETHUSDT"));
        map.insert("BTCUSDT".to_string(), series("BTCUSDT"));
        let config = VolatilityConfig {
            window_days: 2,
            depth_bars: 100,
        };
        let params = compute_all(&map, as_of(), &config);
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].symbol, "BTCUSDT");
    }
}
