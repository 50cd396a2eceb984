pub mod interval_range;
pub mod volatility;

pub use interval_range::{prior_day_high, prior_day_low, IntervalRange, RangeInterval};
pub use volatility::{compute_all, DescriptiveStats, VolatilityParams};
