/// Timeframe aggregation of stored candles
use chrono::{DateTime, Utc};

use crate::types::Candle;
use crate::utils::time::truncate_to_hour;

/// Candle being accumulated from finer candles
#[derive(Debug, Clone)]
struct PartialCandle {
    open_time: DateTime<Utc>,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    value: f64,
    confirm: bool,
    is_realtime: bool,
}

impl PartialCandle {
    fn new(open_time: DateTime<Utc>, first: &Candle) -> Self {
        PartialCandle {
            open_time,
            open: first.open,
            high: first.high,
            low: first.low,
            close: first.close,
            volume: first.volume,
            value: first.value,
            confirm: first.confirm,
            is_realtime: first.is_realtime,
        }
    }

    fn update(&mut self, candle: &Candle) {
        self.high = self.high.max(candle.high);
        self.low = self.low.min(candle.low);
        self.close = candle.close;
        self.volume += candle.volume;
        self.value += candle.value;
        self.confirm &= candle.confirm;
        self.is_realtime |= candle.is_realtime;
    }

    fn to_candle(&self) -> Candle {
        Candle {
            open_time: self.open_time,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            value: self.value,
            confirm: self.confirm,
            is_realtime: self.is_realtime,
        }
    }
}

/// Roll consecutive candles of the same clock hour into one hourly candle.
///
/// Groups are consecutive runs; a later candle of an hour already closed
/// starts a new group.
pub fn to_hourly(candles: &[Candle]) -> Vec<Candle> {
    let mut hourly = Vec::with_capacity(candles.len() / 4 + 1);
    let mut current: Option<PartialCandle> = None;

    for candle in candles {
        let hour = truncate_to_hour(candle.open_time);
        match current.as_mut() {
            Some(partial) if partial.open_time == hour => partial.update(candle),
            _ => {
                if let Some(done) = current.take() {
                    hourly.push(done.to_candle());
                }
                current = Some(PartialCandle::new(hour, candle));
            }
        }
    }

    if let Some(done) = current {
        hourly.push(done.to_candle());
    }
    hourly
}

/// Heikin-Ashi transform. The first candle is copied unchanged.
pub fn to_heikin_ashi(candles: &[Candle]) -> Vec<Candle> {
    let mut result: Vec<Candle> = Vec::with_capacity(candles.len());

    for candle in candles {
        let next = match result.last() {
            None => candle.clone(),
            Some(prev) => {
                let open = (prev.open + prev.close) / 2.0;
                let close = candle.heikin_ashi_close();
                Candle {
                    open,
                    close,
                    high: candle.high.max(open).max(close),
                    low: candle.low.min(open).min(close),
                    ..candle.clone()
                }
            }
        };
        result.push(next);
    }

    result
}
