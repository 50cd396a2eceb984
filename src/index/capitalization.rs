/// Market capitalization snapshots stored as monthly semicolon files
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::data::storage::{parse_records, write_atomic};
use crate::error::Result;
use crate::utils::time::{format_time, parse_time};

const FILE_PREFIX: &str = "CoinMarketCap";
/// Prefix found on snapshot files written by older tooling
const LEGACY_FILE_PREFIX: &str = "CoinMarketCup";

/// Market data of one coin at snapshot time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapitalizationSnapshot {
    /// Base coin, e.g. `BTC`
    pub symbol: String,
    pub added_time: DateTime<Utc>,
    pub last_updated_time: DateTime<Utc>,
    pub rank: u32,
    pub max_supply: Option<f64>,
    pub circulating_supply: Option<f64>,
    pub total_supply: Option<f64>,
    pub price: f64,
    pub market_cap: f64,
    pub market_cap_dominance: f64,
}

fn format_optional(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn parse_optional(value: &str) -> Option<Option<f64>> {
    let value = value.trim();
    if value.is_empty() {
        return Some(None);
    }
    value.parse().ok().map(Some)
}

fn parse_or_zero(value: &str) -> Option<f64> {
    let value = value.trim();
    if value.is_empty() {
        return Some(0.0);
    }
    value.parse().ok()
}

impl CapitalizationSnapshot {
    /// `Symbol;AddedTime;LastUpdatedTime;Rank;MaxSupply;CirculatingSupply;TotalSupply;Price;MarketCap;MarketCapDominance`
    pub fn to_line(&self) -> String {
        format!(
            "{};{};{};{};{};{};{};{};{};{}",
            self.symbol,
            format_time(self.added_time),
            format_time(self.last_updated_time),
            self.rank,
            format_optional(self.max_supply),
            format_optional(self.circulating_supply),
            format_optional(self.total_supply),
            self.price,
            self.market_cap,
            self.market_cap_dominance,
        )
    }

    pub fn from_record(record: &csv::StringRecord) -> Option<Self> {
        if record.len() < 10 {
            return None;
        }
        let field = |i: usize| record.get(i).unwrap_or_default();
        let symbol = field(0);
        if symbol.is_empty() {
            return None;
        }

        let rank = match field(3) {
            "" => 0,
            r => r.parse().ok()?,
        };

        Some(CapitalizationSnapshot {
            symbol: symbol.to_string(),
            added_time: parse_time(field(1))?,
            last_updated_time: parse_time(field(2))?,
            rank,
            max_supply: parse_optional(field(4))?,
            circulating_supply: parse_optional(field(5))?,
            total_supply: parse_optional(field(6))?,
            price: parse_or_zero(field(7))?,
            market_cap: parse_or_zero(field(8))?,
            market_cap_dominance: parse_or_zero(field(9))?,
        })
    }
}

/// Snapshot file name for the month of `date`
pub fn snapshot_file_name(date: NaiveDate) -> String {
    format!("{}{}.csv", FILE_PREFIX, date.format("%y%m01"))
}

fn snapshot_date(file_name: &str) -> Option<NaiveDate> {
    let stem = file_name.strip_suffix(".csv")?;
    let digits = stem
        .strip_prefix(FILE_PREFIX)
        .or_else(|| stem.strip_prefix(LEGACY_FILE_PREFIX))?;
    NaiveDate::parse_from_str(digits, "%y%m%d").ok()
}

/// Monthly snapshots keyed by snapshot date
#[derive(Debug, Clone, Default)]
pub struct SnapshotStore {
    snapshots: BTreeMap<NaiveDate, Vec<CapitalizationSnapshot>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every snapshot file in `dir`; a missing directory yields an empty store
    pub async fn load_dir(dir: &Path) -> Result<Self> {
        let mut store = SnapshotStore::new();
        if !tokio::fs::try_exists(dir).await? {
            warn!("Snapshot directory {} not found", dir.display());
            return Ok(store);
        }

        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(date) = snapshot_date(&name) else {
                continue;
            };

            let bytes = tokio::fs::read(entry.path()).await?;
            let (parsed, dropped) = parse_records(&bytes, CapitalizationSnapshot::from_record);
            if dropped > 0 {
                warn!("{}: dropped {} malformed lines", name, dropped);
            }

            debug!("Loaded {} snapshot entries from {}", parsed.len(), name);
            store.insert(date, parsed);
        }

        Ok(store)
    }

    pub fn insert(&mut self, date: NaiveDate, entries: Vec<CapitalizationSnapshot>) {
        self.snapshots.insert(date, entries);
    }

    /// Latest snapshot dated at or before `time`, else the earliest one
    pub fn for_time(&self, time: DateTime<Utc>) -> Option<&[CapitalizationSnapshot]> {
        let day = time.date_naive();
        self.snapshots
            .range(..=day)
            .next_back()
            .or_else(|| self.snapshots.iter().next())
            .map(|(_, entries)| entries.as_slice())
    }

    pub fn dates(&self) -> Vec<NaiveDate> {
        self.snapshots.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

/// Write a monthly snapshot file into `dir`, returning its path
pub async fn write_snapshot(dir: &Path, date: NaiveDate, entries: &[CapitalizationSnapshot]) -> Result<PathBuf> {
    let path = dir.join(snapshot_file_name(date));
    let mut contents = String::with_capacity(entries.len() * 120);
    for entry in entries {
        contents.push_str(&entry.to_line());
        contents.push('\n');
    }
    write_atomic(&path, &contents).await?;
    Ok(path)
}
