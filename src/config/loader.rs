/// Configuration loading from TOML file
use std::path::Path;
use crate::error::{IndexError, Result};
use crate::types::Config;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| IndexError::ConfigError(format!("Failed to read config file: {}", e)))?;

    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content)
        .map_err(|e| IndexError::ConfigError(format!("Failed to parse config: {}", e)))?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_config(config: &Config) -> Result<()> {
    config.interval()?;
    config.index_epoch()?;

    if config.storage.root.trim().is_empty() {
        return Err(IndexError::ConfigError("storage.root is empty".to_string()));
    }

    if config.gaps.price_gap_threshold_pct <= 0.0 || config.gaps.repair_tolerance_pct <= 0.0 {
        return Err(IndexError::ConfigError("Gap thresholds must be positive".to_string()));
    }

    if config.gaps.repair_tolerance_pct >= config.gaps.price_gap_threshold_pct {
        return Err(IndexError::ConfigError(format!(
            "repair_tolerance_pct ({}) must be below price_gap_threshold_pct ({})",
            config.gaps.repair_tolerance_pct, config.gaps.price_gap_threshold_pct
        )));
    }

    if config.sync.max_concurrent_requests == 0 || config.sync.max_concurrent_loads == 0 {
        return Err(IndexError::ConfigError("Concurrency limits must be >= 1".to_string()));
    }

    if config.volatility.window_days <= 0 {
        return Err(IndexError::ConfigError(format!(
            "Invalid volatility.window_days: {}",
            config.volatility.window_days
        )));
    }

    if config.index.top_n == 0 {
        return Err(IndexError::ConfigError("index.top_n must be >= 1".to_string()));
    }

    if config.index.seed_value <= 0.0 {
        return Err(IndexError::ConfigError(format!(
            "Invalid index.seed_value: {}",
            config.index.seed_value
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InstrumentType, RkMode};

    #[test]
    fn test_defaults_fill_missing_sections() {
        let config = parse_config("log_level = \"debug\"\n").unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.exchange.interval_minutes, 15);
        assert_eq!(config.exchange.instrument_type, InstrumentType::Swap);
        assert_eq!(config.index.top_n, 100);
        assert_eq!(config.index.rk_mode, RkMode::Fixed);
        assert_eq!(config.volatility.depth_bars, 17280);
    }

    #[test]
    fn test_overrides() {
        let toml = r#"
            [gaps]
            price_gap_threshold_pct = 0.2
            repair_tolerance_pct = 0.05

            [index]
            epoch = "2025-01-01 00:00:00"
            top_n = 20
            rk_mode = "chained"
        "#;
        let config = parse_config(toml).unwrap();
        assert_eq!(config.gaps.price_gap_threshold_pct, 0.2);
        assert_eq!(config.index.top_n, 20);
        assert_eq!(config.index.rk_mode, RkMode::Chained);
    }

    #[test]
    fn test_rejects_inverted_gap_thresholds() {
        let toml = "[gaps]\nprice_gap_threshold_pct = 0.01\nrepair_tolerance_pct = 0.09\n";
        assert!(matches!(parse_config(toml), Err(IndexError::ConfigError(_))));
    }

    #[test]
    fn test_rejects_unknown_interval() {
        let toml = "[exchange]\ninterval_minutes = 7\n";
        assert!(parse_config(toml).is_err());
    }
}
