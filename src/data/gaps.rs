/// Gap detection and correction for stored candle series
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::data::storage::CandleStorage;
use crate::exchange::ExchangeClient;
use crate::types::{Candle, CandleSeries, Category, GapConfig, Interval};
use crate::utils::time::steps_between;

/// Relative jump in percent between a close and the following open
pub fn jump_pct(from_close: f64, to_open: f64) -> f64 {
    (100.0 * (to_open / from_close - 1.0)).abs()
}

#[derive(Debug, Clone, PartialEq)]
pub enum Gap {
    /// Candle count differs from the count implied by the first and last open time
    Continuity {
        expected: usize,
        actual: usize,
        missing: Vec<DateTime<Utc>>,
    },
    /// Adjacent candles whose open jumps away from the previous close
    Price {
        prev_time: DateTime<Utc>,
        time: DateTime<Utc>,
        prev_close: f64,
        open: f64,
        gap_pct: f64,
    },
}

pub struct GapDetector {
    interval: Interval,
    price_gap_threshold_pct: f64,
}

impl GapDetector {
    pub fn new(interval: Interval, config: &GapConfig) -> Self {
        GapDetector {
            interval,
            price_gap_threshold_pct: config.price_gap_threshold_pct,
        }
    }

    pub fn scan(&self, series: &CandleSeries) -> Vec<Gap> {
        let mut gaps = Vec::new();
        if let Some(gap) = self.continuity_gap(series.candles()) {
            gaps.push(gap);
        }
        gaps.extend(self.price_gaps(series.candles()));
        gaps
    }

    fn continuity_gap(&self, candles: &[Candle]) -> Option<Gap> {
        let (first, last) = (candles.first()?, candles.last()?);
        let step = self.interval.duration();
        let steps = steps_between(first.open_time, last.open_time, step);
        let expected = 1 + steps.max(0) as usize;
        if expected == candles.len() {
            return None;
        }

        let mut missing = Vec::new();
        let mut idx = 0;
        let mut expected_time = first.open_time;
        while expected_time <= last.open_time {
            while idx < candles.len() && candles[idx].open_time < expected_time {
                idx += 1;
            }
            if idx >= candles.len() || candles[idx].open_time != expected_time {
                missing.push(expected_time);
            }
            expected_time += step;
        }

        Some(Gap::Continuity {
            expected,
            actual: candles.len(),
            missing,
        })
    }

    fn price_gaps(&self, candles: &[Candle]) -> Vec<Gap> {
        let step = self.interval.duration();
        candles
            .windows(2)
            .filter(|w| w[1].open_time - w[0].open_time == step && w[0].close > 0.0)
            .filter_map(|w| {
                let gap_pct = jump_pct(w[0].close, w[1].open);
                (gap_pct > self.price_gap_threshold_pct).then(|| Gap::Price {
                    prev_time: w[0].open_time,
                    time: w[1].open_time,
                    prev_close: w[0].close,
                    open: w[1].open,
                    gap_pct,
                })
            })
            .collect()
    }
}

/// Outcome of correcting one series
#[derive(Debug, Clone, Default, Serialize)]
pub struct CorrectionReport {
    pub symbol: String,
    pub continuity_gaps: usize,
    pub price_gaps: usize,
    pub repaired: usize,
    pub irreducible: usize,
    pub fetch_failures: usize,
    /// Repairs spliced in memory whose correction log append failed
    pub write_failures: usize,
}

/// Re-fetches price gaps from the exchange and splices accepted repairs
pub struct GapCorrector<C: ExchangeClient> {
    client: Arc<C>,
    storage: Arc<CandleStorage>,
    category: Category,
    repair_tolerance_pct: f64,
}

impl<C: ExchangeClient> GapCorrector<C> {
    pub fn new(client: Arc<C>, storage: Arc<CandleStorage>, category: Category, config: &GapConfig) -> Self {
        GapCorrector {
            client,
            storage,
            category,
            repair_tolerance_pct: config.repair_tolerance_pct,
        }
    }

    /// Try to repair every price gap in `gaps`.
    ///
    /// Never fails: exchange and correction log errors are counted in the report.
    pub async fn correct(&self, series: &mut CandleSeries, gaps: &[Gap]) -> CorrectionReport {
        let mut report = CorrectionReport {
            symbol: series.symbol.clone(),
            ..CorrectionReport::default()
        };

        for gap in gaps {
            let Gap::Price { prev_time, time, gap_pct, .. } = gap else {
                if let Gap::Continuity { expected, actual, missing } = gap {
                    report.continuity_gaps += 1;
                    warn!(
                        "{}: continuity gap, {} candles expected, {} stored, {} missing",
                        series.symbol,
                        expected,
                        actual,
                        missing.len()
                    );
                }
                continue;
            };
            report.price_gaps += 1;

            let mut fetched = match self
                .client
                .fetch_candles_range(self.category, &series.symbol, series.interval, *prev_time, *time)
                .await
            {
                Ok(candles) => candles,
                Err(e) => {
                    warn!("{}: re-fetch of gap at {} failed: {}", series.symbol, time, e);
                    report.fetch_failures += 1;
                    continue;
                }
            };
            fetched.sort_by_key(|c| c.open_time);

            let (Some(first), Some(last)) = (fetched.first(), fetched.last()) else {
                report.irreducible += 1;
                continue;
            };
            if fetched.len() < 2 || first.close <= 0.0 {
                report.irreducible += 1;
                continue;
            }

            let refetched_pct = jump_pct(first.close, last.open);
            if refetched_pct > self.repair_tolerance_pct {
                info!(
                    "{}: gap at {} is real ({:.4}% stored, {:.4}% at source)",
                    series.symbol, time, gap_pct, refetched_pct
                );
                report.irreducible += 1;
                continue;
            }

            let mut spliced: Vec<Candle> = Vec::with_capacity(fetched.len());
            for candle in fetched {
                if series.replace(candle.clone()) {
                    spliced.push(candle);
                }
            }
            if !spliced.is_empty() {
                if let Err(e) = self.storage.append_corrected(&series.symbol, &spliced).await {
                    warn!("{}: correction log write failed [{}]: {}", series.symbol, e.error_code(), e);
                    report.write_failures += 1;
                }
            }
            debug!("{}: repaired gap at {} ({} candles)", series.symbol, time, spliced.len());
            report.repaired += 1;
        }

        if report.price_gaps > 0 {
            info!(
                "🩹 {}: {} price gaps, {} repaired, {} irreducible, {} fetch failures",
                report.symbol, report.price_gaps, report.repaired, report.irreducible, report.fetch_failures
            );
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::MemoryExchange;
    use crate::types::InstrumentType;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    fn at(i: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(15 * i)
    }

    fn candle(i: i64, open: f64, close: f64) -> Candle {
        Candle {
            open_time: at(i),
            open,
            high: open.max(close),
            low: open.min(close),
            close,
            volume: 1.0,
            value: 1.0,
            confirm: true,
            is_realtime: false,
        }
    }

    fn detector() -> GapDetector {
        GapDetector::new(Interval::FifteenMinutes, &GapConfig::default())
    }

    #[test]
    fn test_price_gap_threshold() {
        // 0.10% jump is flagged, 0.08% is not
        let series = CandleSeries::new(
            "BTCUSDT",
            Interval::FifteenMinutes,
            vec![candle(0, 100.0, 100.0), candle(1, 100.1, 100.1), candle(2, 100.18008, 100.2)],
        );
        let gaps = detector().scan(&series);
        assert_eq!(gaps.len(), 1);
        match &gaps[0] {
            Gap::Price { time, gap_pct, .. } => {
                assert_eq!(*time, at(1));
                assert!((gap_pct - 0.1).abs() < 1e-9);
            }
            other => panic!("unexpected gap {:?}", other),
        }
    }

    #[test]
    fn test_continuity_gap_lists_missing_times() {
        let series = CandleSeries::new(
            "BTCUSDT",
            Interval::FifteenMinutes,
            vec![candle(0, 1.0, 1.0), candle(1, 1.0, 1.0), candle(4, 1.0, 1.0)],
        );
        let gaps = detector().scan(&series);
        // The jump across the hole is not a price gap
        assert_eq!(gaps.len(), 1);
        assert_eq!(
            gaps[0],
            Gap::Continuity {
                expected: 5,
                actual: 3,
                missing: vec![at(2), at(3)],
            }
        );
    }

    #[test]
    fn test_clean_series_has_no_gaps() {
        let series = CandleSeries::new(
            "BTCUSDT",
            Interval::FifteenMinutes,
            (0..10).map(|i| candle(i, 1.0, 1.0)).collect(),
        );
        assert!(detector().scan(&series).is_empty());
    }

    #[tokio::test]
    async fn test_correct_splices_consistent_refetch() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(CandleStorage::new(dir.path(), InstrumentType::Swap, Interval::FifteenMinutes));
        let exchange = Arc::new(MemoryExchange::new());
        exchange
            .set_candles("BTCUSDT", vec![candle(0, 100.0, 100.0), candle(1, 100.0, 101.0)])
            .await;

        let mut series = CandleSeries::new(
            "BTCUSDT",
            Interval::FifteenMinutes,
            vec![candle(0, 100.0, 100.0), candle(1, 105.0, 101.0)],
        );
        let gaps = detector().scan(&series);
        assert_eq!(gaps.len(), 1);

        let corrector = GapCorrector::new(exchange, storage.clone(), Category::Linear, &GapConfig::default());
        let report = corrector.correct(&mut series, &gaps).await;
        assert_eq!(report.repaired, 1);
        assert_eq!(report.irreducible, 0);
        assert_eq!(series.candle_at(at(1)).unwrap().open, 100.0);
        assert!(storage.corrected_path("BTCUSDT").exists());
        assert!(detector().scan(&series).is_empty());
    }

    #[tokio::test]
    async fn test_correct_keeps_real_gap_and_counts_failures() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(CandleStorage::new(dir.path(), InstrumentType::Swap, Interval::FifteenMinutes));
        let exchange = Arc::new(MemoryExchange::new());
        exchange
            .set_candles("BTCUSDT", vec![candle(0, 100.0, 100.0), candle(1, 105.0, 101.0)])
            .await;

        let mut series = CandleSeries::new(
            "BTCUSDT",
            Interval::FifteenMinutes,
            vec![candle(0, 100.0, 100.0), candle(1, 105.0, 101.0)],
        );
        let gaps = detector().scan(&series);
        let corrector = GapCorrector::new(exchange.clone(), storage.clone(), Category::Linear, &GapConfig::default());

        let report = corrector.correct(&mut series, &gaps).await;
        assert_eq!(report.irreducible, 1);
        assert_eq!(series.candle_at(at(1)).unwrap().open, 105.0);
        assert!(!storage.corrected_path("BTCUSDT").exists());

        exchange.fail_symbol("BTCUSDT").await;
        let report = corrector.correct(&mut series, &gaps).await;
        assert_eq!(report.fetch_failures, 1);
    }

    #[tokio::test]
    async fn test_correction_log_failure_is_counted() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(CandleStorage::new(dir.path(), InstrumentType::Swap, Interval::FifteenMinutes));
        // A plain file where the correction directory should go
        tokio::fs::create_dir_all(storage.candles_dir()).await.unwrap();
        tokio::fs::write(storage.candles_dir().join("Correct"), "blocked").await.unwrap();

        let exchange = Arc::new(MemoryExchange::new());
        exchange
            .set_candles("BTCUSDT", vec![candle(0, 100.0, 100.0), candle(1, 100.0, 101.0)])
            .await;
        let mut series = CandleSeries::new(
            "BTCUSDT",
            Interval::FifteenMinutes,
            vec![candle(0, 100.0, 100.0), candle(1, 105.0, 101.0)],
        );
        let gaps = detector().scan(&series);
        let corrector = GapCorrector::new(exchange, storage, Category::Linear, &GapConfig::default());

        let report = corrector.correct(&mut series, &gaps).await;
        assert_eq!(report.repaired, 1);
        assert_eq!(report.write_failures, 1);
        assert_eq!(series.candle_at(at(1)).unwrap().open, 100.0);
    }
}
