/// Price extremes over trailing whole-day windows
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Candle;
use crate::utils::time::start_of_day;

/// Preset trailing windows, in days
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RangeInterval {
    Day,
    Three,
    Week,
    Month,
}

impl RangeInterval {
    pub fn days(&self) -> i64 {
        match self {
            RangeInterval::Day => 1,
            RangeInterval::Three => 3,
            RangeInterval::Week => 7,
            RangeInterval::Month => 30,
        }
    }

    pub fn span(&self) -> Duration {
        Duration::days(self.days())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntervalRange {
    pub span: Duration,
    /// Open time of the first candle in the range
    pub start: DateTime<Utc>,
    /// Open time of the last candle in the range
    pub end: DateTime<Utc>,
    pub max: f64,
    pub max_time: DateTime<Utc>,
    pub min: f64,
    pub min_time: DateTime<Utc>,
}

impl IntervalRange {
    /// Extremes of `candles`; the earliest candle wins ties
    pub fn from_candles(candles: &[Candle]) -> Option<Self> {
        if candles.len() < 2 {
            return None;
        }
        let (first, last) = (&candles[0], &candles[candles.len() - 1]);
        let frame = candles[1].open_time - first.open_time;

        let mut max = first;
        let mut min = first;
        for candle in &candles[1..] {
            if candle.high > max.high {
                max = candle;
            }
            if candle.low < min.low {
                min = candle;
            }
        }

        Some(IntervalRange {
            span: last.open_time - first.open_time + frame,
            start: first.open_time,
            end: last.open_time,
            max: max.high,
            max_time: max.open_time,
            min: min.low,
            min_time: min.open_time,
        })
    }

    /// Range of the whole days preceding `at`'s date.
    ///
    /// In exact mode `None` is returned unless `candles` starts at or before
    /// the window's first day.
    pub fn trailing(candles: &[Candle], interval: RangeInterval, exact: bool, at: DateTime<Utc>) -> Option<Self> {
        if candles.len() < 2 {
            return None;
        }
        let today = start_of_day(at);
        let window_start = today - interval.span();
        if exact && candles[0].open_time > window_start {
            return None;
        }

        let window: Vec<Candle> = candles
            .iter()
            .filter(|c| c.open_time >= window_start && c.open_time < today)
            .cloned()
            .collect();

        let mut range = match window.len() {
            0 => return None,
            1 => single(&window[0]),
            _ => Self::from_candles(&window)?,
        };
        range.span = interval.span();
        Some(range)
    }
}

fn single(candle: &Candle) -> IntervalRange {
    IntervalRange {
        span: Duration::zero(),
        start: candle.open_time,
        end: candle.open_time,
        max: candle.high,
        max_time: candle.open_time,
        min: candle.low,
        min_time: candle.open_time,
    }
}

/// Highest high of the day before `at`'s date
pub fn prior_day_high(candles: &[Candle], at: DateTime<Utc>) -> Option<f64> {
    prior_day(candles, at).map(|c| c.high).reduce(f64::max)
}

/// Lowest low of the day before `at`'s date
pub fn prior_day_low(candles: &[Candle], at: DateTime<Utc>) -> Option<f64> {
    prior_day(candles, at).map(|c| c.low).reduce(f64::min)
}

fn prior_day(candles: &[Candle], at: DateTime<Utc>) -> impl Iterator<Item = &Candle> {
    let today = start_of_day(at);
    let yesterday = today - Duration::days(1);
    candles
        .iter()
        .filter(move |c| c.open_time >= yesterday && c.open_time < today)
}
