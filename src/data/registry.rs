/// Sync registry: per-symbol sync state persisted in the `loadlog` file
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::data::storage::{format_bool, parse_bool, parse_records, write_atomic};
use crate::error::{IndexError, Result};
use crate::types::Instrument;
use crate::utils::time::{format_optional_time, format_time, parse_optional_time, parse_time};

/// Sync bookkeeping for one symbol. Entries are never removed, only deactivated.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolSyncState {
    pub symbol: String,
    pub start: DateTime<Utc>,
    /// Open time of the last persisted candle
    pub end: DateTime<Utc>,
    /// First open time found in storage, once loaded
    pub storage_start: Option<DateTime<Utc>>,
    pub active: bool,
}

impl SymbolSyncState {
    pub fn new(symbol: impl Into<String>, launch_time: DateTime<Utc>) -> Self {
        SymbolSyncState {
            symbol: symbol.into(),
            start: launch_time,
            end: launch_time,
            storage_start: None,
            active: true,
        }
    }

    /// `Symbol;Start;End;StorageStart;Active`
    pub fn to_line(&self) -> String {
        format!(
            "{};{};{};{};{}",
            self.symbol,
            format_time(self.start),
            format_time(self.end),
            format_optional_time(self.storage_start),
            format_bool(self.active),
        )
    }

    pub fn from_record(record: &csv::StringRecord) -> Option<Self> {
        let symbol = record.get(0).filter(|s| !s.is_empty())?;
        Some(SymbolSyncState {
            symbol: symbol.to_string(),
            start: parse_time(record.get(1)?)?,
            end: parse_time(record.get(2)?)?,
            storage_start: parse_optional_time(record.get(3)?)?,
            active: parse_bool(record.get(4)?)?,
        })
    }
}

/// What `reconcile` changed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileSummary {
    pub added: usize,
    pub reactivated: usize,
    pub deactivated: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SyncRegistry {
    entries: BTreeMap<String, SymbolSyncState>,
}

impl SyncRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the registry; `None` when the file does not exist
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        if !tokio::fs::try_exists(path).await? {
            return Ok(None);
        }

        let bytes = tokio::fs::read(path).await?;
        let (states, dropped) = parse_records(&bytes, SymbolSyncState::from_record);
        let mut registry = SyncRegistry::new();
        for state in states {
            registry.entries.insert(state.symbol.clone(), state);
        }

        if dropped > 0 {
            warn!("{}: dropped {} malformed registry lines", path.display(), dropped);
        }
        Ok(Some(registry))
    }

    /// Load the registry, failing when it has never been created
    pub async fn load_required(path: &Path) -> Result<Self> {
        Self::load(path)
            .await?
            .ok_or_else(|| IndexError::MissingState(path.display().to_string()))
    }

    /// Overwrite the registry file atomically
    pub async fn persist(&self, path: &Path) -> Result<()> {
        let mut contents = String::with_capacity(self.entries.len() * 80);
        for state in self.entries.values() {
            contents.push_str(&state.to_line());
            contents.push('\n');
        }
        write_atomic(path, &contents).await
    }

    /// Align the registry with the exchange's current tradable universe
    pub fn reconcile(&mut self, universe: &[Instrument]) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();
        let listed: HashSet<&str> = universe.iter().map(|i| i.symbol.as_str()).collect();

        for instrument in universe {
            match self.entries.get_mut(&instrument.symbol) {
                Some(state) => {
                    if !state.active {
                        state.active = true;
                        summary.reactivated += 1;
                    }
                }
                None => {
                    self.entries.insert(
                        instrument.symbol.clone(),
                        SymbolSyncState::new(instrument.symbol.clone(), instrument.launch_time),
                    );
                    summary.added += 1;
                }
            }
        }

        for state in self.entries.values_mut() {
            if state.active && !listed.contains(state.symbol.as_str()) {
                state.active = false;
                summary.deactivated += 1;
            }
        }

        info!(
            "Registry reconciled: {} added, {} reactivated, {} deactivated, {} total",
            summary.added,
            summary.reactivated,
            summary.deactivated,
            self.entries.len()
        );
        summary
    }

    pub fn get(&self, symbol: &str) -> Option<&SymbolSyncState> {
        self.entries.get(symbol)
    }

    pub fn get_mut(&mut self, symbol: &str) -> Option<&mut SymbolSyncState> {
        self.entries.get_mut(symbol)
    }

    /// Replace a symbol's state with one returned by a worker
    pub fn update(&mut self, state: SymbolSyncState) {
        self.entries.insert(state.symbol.clone(), state);
    }

    pub fn active_symbols(&self) -> Vec<String> {
        self.entries
            .values()
            .filter(|s| s.active)
            .map(|s| s.symbol.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SymbolSyncState> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Instruments quoted in `quote_coin` whose base coin is not excluded
pub fn tradable_universe(instruments: &[Instrument], quote_coin: &str, excluded: &[String]) -> Vec<Instrument> {
    instruments
        .iter()
        .filter(|i| i.quote_coin.eq_ignore_ascii_case(quote_coin))
        .filter(|i| !excluded.iter().any(|e| e.eq_ignore_ascii_case(&i.base_coin)))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn parse_line(line: &str) -> Option<SymbolSyncState> {
        parse_records(line.as_bytes(), SymbolSyncState::from_record).0.pop()
    }

    fn instrument(symbol: &str, base: &str) -> Instrument {
        Instrument {
            symbol: symbol.to_string(),
            base_coin: base.to_string(),
            quote_coin: "USDT".to_string(),
            launch_time: Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_line_round_trip_with_absent_storage_start() {
        let state = SymbolSyncState::new("BTCUSDT", Utc.with_ymd_and_hms(2020, 3, 25, 10, 0, 0).unwrap());
        let line = state.to_line();
        assert_eq!(line, "BTCUSDT;2020-03-25 10:00:00;2020-03-25 10:00:00;;True");
        assert_eq!(parse_line(&line), Some(state));
    }

    #[test]
    fn test_legacy_sentinel_is_absent() {
        let line = "ETHUSDT;2021-01-01 00:00:00;2025-01-01 00:00:00;0001-01-01 00:00:00;False";
        let state = parse_line(line).unwrap();
        assert_eq!(state.storage_start, None);
        assert!(!state.active);
    }

    #[test]
    fn test_reconcile() {
        let mut registry = SyncRegistry::new();
        registry.reconcile(&[instrument("BTCUSDT", "BTC"), instrument("ETHUSDT", "ETH")]);
        assert_eq!(registry.len(), 2);

        let summary = registry.reconcile(&[instrument("BTCUSDT", "BTC"), instrument("SOLUSDT", "SOL")]);
        assert_eq!(summary.added, 1);
        assert_eq!(summary.deactivated, 1);
        assert_eq!(registry.len(), 3);
        assert!(!registry.get("ETHUSDT").unwrap().active);

        let summary = registry.reconcile(&[instrument("ETHUSDT", "ETH")]);
        assert_eq!(summary.reactivated, 1);
        assert_eq!(registry.active_symbols(), vec!["ETHUSDT".to_string()]);
    }

    #[test]
    fn test_new_entry_starts_at_launch() {
        let mut registry = SyncRegistry::new();
        registry.reconcile(&[instrument("BTCUSDT", "BTC")]);
        let state = registry.get("BTCUSDT").unwrap();
        assert_eq!(state.start, state.end);
        assert!(state.active);
        assert!(state.storage_start.is_none());
    }

    #[test]
    fn test_tradable_universe_filter() {
        let mut usdc = instrument("USDCUSDT", "USDC");
        usdc.quote_coin = "USDT".to_string();
        let mut perp = instrument("BTCPERP", "BTC");
        perp.quote_coin = "USDC".to_string();

        let universe = tradable_universe(
            &[instrument("BTCUSDT", "BTC"), usdc, perp],
            "USDT",
            &["USDC".to_string()],
        );
        assert_eq!(universe.len(), 1);
        assert_eq!(universe[0].symbol, "BTCUSDT");
    }

    #[tokio::test]
    async fn test_persist_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("loadlog15.txt");

        assert!(SyncRegistry::load(&path).await.unwrap().is_none());
        assert!(matches!(
            SyncRegistry::load_required(&path).await,
            Err(IndexError::MissingState(_))
        ));

        let mut registry = SyncRegistry::new();
        registry.reconcile(&[instrument("BTCUSDT", "BTC"), instrument("ETHUSDT", "ETH")]);
        registry.get_mut("ETHUSDT").unwrap().storage_start =
            Some(Utc.with_ymd_and_hms(2023, 1, 1, 0, 15, 0).unwrap());
        registry.persist(&path).await.unwrap();

        tokio::fs::write(
            &path,
            format!("{}garbage line\n", tokio::fs::read_to_string(&path).await.unwrap()),
        )
        .await
        .unwrap();

        let loaded = SyncRegistry::load(&path).await.unwrap().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.get("ETHUSDT"), registry.get("ETHUSDT"));
        assert_eq!(loaded.get("BTCUSDT"), registry.get("BTCUSDT"));
    }

    #[tokio::test]
    async fn test_load_hand_edited_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("loadlog15.txt");
        tokio::fs::write(
            &path,
            " BTCUSDT ; 2023-01-01 00:00:00 ;2024-01-01 00:00:00; ; true \n\n\
             ETHUSDT;2023-01-01 00:00:00\n\
             ;2023-01-01 00:00:00;2024-01-01 00:00:00;;True\n",
        )
        .await
        .unwrap();

        let loaded = SyncRegistry::load(&path).await.unwrap().unwrap();
        assert_eq!(loaded.len(), 1);
        let btc = loaded.get("BTCUSDT").unwrap();
        assert!(btc.active);
        assert_eq!(btc.storage_start, None);
        assert_eq!(btc.end, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
    }
}
