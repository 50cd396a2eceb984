/// RC100 index: monthly rebalanced, volatility-weighted composite of the
/// largest coins by capitalization
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::analytics::volatility::{compute_all, VolatilityParams};
use crate::data::storage::{parse_records, write_atomic};
use crate::error::Result;
use crate::index::capitalization::{CapitalizationSnapshot, SnapshotStore};
use crate::index::component::IndexComponent;
use crate::types::{CandleSeries, Config, RkMode, TimeSeriesPoint, VolatilityConfig};
use crate::utils::time::{format_time, monthly_schedule, parse_time};

/// Index parameters resolved from configuration
#[derive(Debug, Clone)]
pub struct IndexSettings {
    pub epoch: DateTime<Utc>,
    pub seed_value: f64,
    pub top_n: usize,
    pub rk_mode: RkMode,
    /// Suffix joining a snapshot coin to its instrument, e.g. `USDT`
    pub quote_coin: String,
    pub volatility: VolatilityConfig,
}

impl IndexSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(IndexSettings {
            epoch: config.index_epoch()?,
            seed_value: config.index.seed_value,
            top_n: config.index.top_n,
            rk_mode: config.index.rk_mode,
            quote_coin: config.exchange.quote_coin.clone(),
            volatility: config.volatility.clone(),
        })
    }
}

pub struct IndexEngine {
    settings: IndexSettings,
}

impl IndexEngine {
    pub fn new(settings: IndexSettings) -> Self {
        IndexEngine { settings }
    }

    pub fn settings(&self) -> &IndexSettings {
        &self.settings
    }

    /// Compute the index from the epoch up to `now`.
    ///
    /// The first point is the seed at the epoch. Each rebalance epoch walks
    /// the candles after it up to the next rebalance; the last one walks to
    /// the newest candle of its components. A rebalance that selects nothing
    /// keeps the previous components.
    pub fn run(
        &self,
        series: &HashMap<String, CandleSeries>,
        snapshots: &SnapshotStore,
        now: DateTime<Utc>,
    ) -> Vec<TimeSeriesPoint> {
        let settings = &self.settings;
        let mut points = vec![TimeSeriesPoint {
            time: settings.epoch,
            value: settings.seed_value,
        }];

        let rebalances = monthly_schedule(settings.epoch, now);
        info!(
            "📈 Computing index over {} rebalance epochs from {}",
            rebalances.len(),
            format_time(settings.epoch)
        );

        let mut rk = 1.0;
        let mut held: Vec<IndexComponent> = Vec::new();
        for (i, &rebalance) in rebalances.iter().enumerate() {
            let selected = match snapshots.for_time(rebalance) {
                Some(snapshot) => {
                    let volatility = compute_all(series, rebalance, &settings.volatility);
                    self.select(&volatility, snapshot, series, rebalance)
                }
                None => {
                    warn!("No capitalization snapshot for {}", format_time(rebalance));
                    Vec::new()
                }
            };

            let rebalanced = !selected.is_empty();
            if rebalanced {
                held = selected;
            } else if held.is_empty() {
                warn!("Empty selection at {}, epoch skipped", format_time(rebalance));
                continue;
            } else {
                warn!(
                    "Empty selection at {}, keeping {} components",
                    format_time(rebalance),
                    held.len()
                );
            }

            let last_value = points.last().map_or(settings.seed_value, |p| p.value);
            if settings.rk_mode == RkMode::Chained && rebalanced && i > 0 {
                let recomputed = last_value * (1.0 + weighted_change(&held) / 100.0) * rk;
                if recomputed != 0.0 && recomputed.is_finite() {
                    rk = last_value / recomputed;
                }
                debug!("RK at {} = {}", format_time(rebalance), rk);
            }

            let end = match rebalances.get(i + 1) {
                Some(&next) => next,
                None => latest_candle(&held, series).unwrap_or(rebalance),
            };

            info!(
                "⚖️  Rebalance {}: {} components, walking to {}",
                format_time(rebalance),
                held.len(),
                format_time(end)
            );
            points.extend(walk(&mut held, series, rebalance, end, last_value, rk));
        }

        points
    }

    /// Pick the top components by capitalization and set their weights
    pub fn select(
        &self,
        volatility: &[VolatilityParams],
        snapshot: &[CapitalizationSnapshot],
        series: &HashMap<String, CandleSeries>,
        at: DateTime<Utc>,
    ) -> Vec<IndexComponent> {
        let by_instrument: HashMap<String, &CapitalizationSnapshot> = snapshot
            .iter()
            .map(|s| (format!("{}{}", s.symbol, self.settings.quote_coin), s))
            .collect();

        let mut candidates: Vec<IndexComponent> = volatility
            .iter()
            .filter_map(|v| {
                let cap = by_instrument.get(&v.symbol)?;
                let supply = cap.circulating_supply?;
                let s = series.get(&v.symbol)?;
                let rebal_price = s.last_at_or_before(at)?.close;
                if !(v.average.is_finite() && v.average > 0.0) {
                    debug!("{}: unusable volatility {}", v.symbol, v.average);
                    return None;
                }
                let prev_price = s.last_at_or_before(at - s.interval.duration()).map(|c| c.close);
                Some(IndexComponent::new(v.symbol.clone(), rebal_price, prev_price, supply, v.average))
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.capitalization()
                .total_cmp(&a.capitalization())
                .then_with(|| a.symbol.cmp(&b.symbol))
        });
        candidates.truncate(self.settings.top_n);

        if candidates.is_empty() {
            return candidates;
        }

        let avg_volat = candidates.iter().map(|c| c.volat).sum::<f64>() / candidates.len() as f64;
        for component in candidates.iter_mut() {
            component.corrected_volat = avg_volat / component.volat;
        }
        candidates
    }
}

fn weighted_change(components: &[IndexComponent]) -> f64 {
    components.iter().map(|c| c.relative_price_change()).sum()
}

fn latest_candle(components: &[IndexComponent], series: &HashMap<String, CandleSeries>) -> Option<DateTime<Utc>> {
    components
        .iter()
        .filter_map(|c| series.get(&c.symbol)?.last().map(|l| l.open_time))
        .max()
}

/// Step the index over every candle time in `(from, to]` of the components
fn walk(
    components: &mut [IndexComponent],
    series: &HashMap<String, CandleSeries>,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    start_value: f64,
    rk: f64,
) -> Vec<TimeSeriesPoint> {
    if to <= from {
        return Vec::new();
    }

    let grid: BTreeSet<DateTime<Utc>> = components
        .iter()
        .filter_map(|c| series.get(&c.symbol))
        .flat_map(|s| s.window(from, to).iter().map(|c| c.open_time))
        .filter(|t| *t > from)
        .collect();

    let mut value = start_value;
    let mut points = Vec::with_capacity(grid.len());
    for tick in grid {
        for component in components.iter_mut() {
            let close = series
                .get(&component.symbol)
                .and_then(|s| s.candle_at(tick))
                .map(|c| c.close);
            component.advance(close);
        }
        value *= (1.0 + weighted_change(components) / 100.0) * rk;
        points.push(TimeSeriesPoint { time: tick, value });
    }
    points
}

/// Write index points as `Time;Value` lines
pub async fn write_series(path: &Path, points: &[TimeSeriesPoint]) -> Result<()> {
    let mut contents = String::with_capacity(points.len() * 32);
    for point in points {
        contents.push_str(&format!("{};{}\n", format_time(point.time), point.value));
    }
    write_atomic(path, &contents).await
}

/// Read a previously written index file; malformed lines are skipped
pub async fn read_series(path: &Path) -> Result<Vec<TimeSeriesPoint>> {
    let bytes = tokio::fs::read(path).await?;
    let (points, dropped) = parse_records(&bytes, |record| {
        Some(TimeSeriesPoint {
            time: parse_time(record.get(0)?)?,
            value: record.get(1)?.parse().ok()?,
        })
    });
    if dropped > 0 {
        warn!("{}: dropped {} malformed index lines", path.display(), dropped);
    }
    Ok(points)
}
