/// Index constituent and its per-tick price state
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexComponent {
    pub symbol: String,
    /// Latest close at or before the rebalance instant
    pub rebal_price: f64,
    pub prev_price: Option<f64>,
    pub now_price: Option<f64>,
    pub circ_supply: f64,
    /// Mean hourly range over the volatility window
    pub volat: f64,
    /// Weight: average volatility of the selection divided by `volat`
    pub corrected_volat: f64,
}

impl IndexComponent {
    pub fn new(symbol: impl Into<String>, rebal_price: f64, prev_price: Option<f64>, circ_supply: f64, volat: f64) -> Self {
        IndexComponent {
            symbol: symbol.into(),
            rebal_price,
            prev_price,
            now_price: Some(rebal_price),
            circ_supply,
            volat,
            corrected_volat: 1.0,
        }
    }

    pub fn capitalization(&self) -> f64 {
        self.rebal_price * self.circ_supply
    }

    /// Weighted fractional price change of the last tick; zero while a price is unknown
    pub fn relative_price_change(&self) -> f64 {
        match (self.prev_price, self.now_price) {
            (Some(prev), Some(now)) if prev != 0.0 => self.corrected_volat * (now / prev - 1.0),
            _ => 0.0,
        }
    }

    /// Advance to a new tick: `Some(close)` moves the price, `None` holds it
    pub fn advance(&mut self, close: Option<f64>) {
        self.prev_price = self.now_price;
        if let Some(close) = close {
            self.now_price = Some(close);
        }
    }
}
