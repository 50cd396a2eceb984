/// On-disk candle storage: per-symbol semicolon files, append-only
use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::Result;
use crate::types::{Candle, InstrumentType, Interval};
use crate::utils::time::{format_time, parse_time};

/// File layout and candle codec for one instrument type and interval.
///
/// ```text
/// <root>/<TYPE>/Candles/<n>min/<SYMBOL>.csv
/// <root>/<TYPE>/Candles/<n>min/Correct/<SYMBOL>.csv
/// <root>/<TYPE>/Candles/loadlog<n>.txt
/// ```
#[derive(Debug, Clone)]
pub struct CandleStorage {
    root: PathBuf,
    instrument_type: InstrumentType,
    interval: Interval,
}

impl CandleStorage {
    pub fn new(root: impl Into<PathBuf>, instrument_type: InstrumentType, interval: Interval) -> Self {
        CandleStorage {
            root: root.into(),
            instrument_type,
            interval,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    fn candles_root(&self) -> PathBuf {
        self.root.join(self.instrument_type.as_str()).join("Candles")
    }

    pub fn candles_dir(&self) -> PathBuf {
        self.candles_root().join(format!("{}min", self.interval.minutes()))
    }

    pub fn candle_path(&self, symbol: &str) -> PathBuf {
        self.candles_dir().join(format!("{}.csv", symbol))
    }

    pub fn corrected_path(&self, symbol: &str) -> PathBuf {
        self.candles_dir().join("Correct").join(format!("{}.csv", symbol))
    }

    /// Sync registry file
    pub fn sync_log_path(&self) -> PathBuf {
        self.candles_root().join(format!("loadlog{}.txt", self.interval.minutes()))
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.root.join("CoinMarketCap")
    }

    pub fn index_dir(&self) -> PathBuf {
        self.root.join("Index")
    }

    pub async fn has_candles(&self, symbol: &str) -> bool {
        tokio::fs::try_exists(self.candle_path(symbol)).await.unwrap_or(false)
    }

    /// Append candles to the symbol's file, creating it if needed
    pub async fn append_candles(&self, symbol: &str, candles: &[Candle]) -> Result<usize> {
        append_lines(&self.candle_path(symbol), candles).await?;
        debug!("{}: appended {} candles", symbol, candles.len());
        Ok(candles.len())
    }

    /// Append repaired candles to the symbol's correction log
    pub async fn append_corrected(&self, symbol: &str, candles: &[Candle]) -> Result<usize> {
        append_lines(&self.corrected_path(symbol), candles).await?;
        Ok(candles.len())
    }

    /// Read a symbol's candles; `None` when there is no file.
    ///
    /// Malformed records are dropped.
    pub async fn read_candles(&self, symbol: &str) -> Result<Option<Vec<Candle>>> {
        let path = self.candle_path(symbol);
        if !tokio::fs::try_exists(&path).await? {
            return Ok(None);
        }

        let bytes = tokio::fs::read(&path).await?;
        let (candles, dropped) = parse_candles(&bytes);
        if dropped > 0 {
            warn!("{}: dropped {} malformed candle records", symbol, dropped);
        }
        Ok(Some(candles))
    }
}

async fn append_lines(path: &Path, candles: &[Candle]) -> Result<()> {
    if candles.is_empty() {
        return Ok(());
    }
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }

    let mut buffer = String::with_capacity(candles.len() * 96);
    for candle in candles {
        buffer.push_str(&format_candle(candle));
        buffer.push('\n');
    }

    let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(buffer.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

/// Replace a file's contents through a temporary sibling and a rename
pub async fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir).await?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(contents.as_bytes()).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

pub(crate) fn format_bool(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

/// `OpenTime;Open;High;Low;Close;Volume;Value;Confirm;IsRealtime`
pub fn format_candle(candle: &Candle) -> String {
    format!(
        "{};{};{};{};{};{};{};{};{}",
        format_time(candle.open_time),
        candle.open,
        candle.high,
        candle.low,
        candle.close,
        candle.volume,
        candle.value,
        format_bool(candle.confirm),
        format_bool(candle.is_realtime),
    )
}

/// Parse one candle record. The two flags are optional.
pub fn parse_candle(record: &csv::StringRecord) -> Option<Candle> {
    if record.len() < 7 {
        return None;
    }

    let number = |i: usize| record.get(i).and_then(|v| v.parse::<f64>().ok());
    let flag = |i: usize, default: bool| match record.get(i) {
        None => Some(default),
        Some(v) if v.is_empty() => Some(default),
        Some(v) => parse_bool(v),
    };

    Some(Candle {
        open_time: parse_time(record.get(0)?)?,
        open: number(1)?,
        high: number(2)?,
        low: number(3)?,
        close: number(4)?,
        volume: number(5)?,
        value: number(6)?,
        confirm: flag(7, true)?,
        is_realtime: flag(8, false)?,
    })
}

/// Reader for headerless `;` files with ragged rows and trimmed fields
fn semicolon_reader(bytes: &[u8]) -> csv::Reader<&[u8]> {
    csv::ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes)
}

/// Parse every record of a `;` file; returns the parsed values and the dropped count
pub fn parse_records<T>(bytes: &[u8], parse: impl Fn(&csv::StringRecord) -> Option<T>) -> (Vec<T>, usize) {
    let mut values = Vec::new();
    let mut dropped = 0;
    for record in semicolon_reader(bytes).records() {
        match record.ok().as_ref().and_then(&parse) {
            Some(value) => values.push(value),
            None => dropped += 1,
        }
    }
    (values, dropped)
}

/// Parse a whole candle file; returns the valid candles and the dropped count
pub fn parse_candles(bytes: &[u8]) -> (Vec<Candle>, usize) {
    parse_records(bytes, parse_candle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn candle(minute: u32, close: f64) -> Candle {
        Candle {
            open_time: Utc.with_ymd_and_hms(2024, 10, 1, 11, minute, 0).unwrap(),
            open: 100.0,
            high: 101.5,
            low: 99.25,
            close,
            volume: 1234.5,
            value: 123456.78,
            confirm: true,
            is_realtime: false,
        }
    }

    #[test]
    fn test_candle_line_format() {
        assert_eq!(
            format_candle(&candle(0, 100.5)),
            "2024-10-01 11:00:00;100;101.5;99.25;100.5;1234.5;123456.78;True;False"
        );
    }

    #[test]
    fn test_parse_accepts_seven_fields_and_drops_garbage() {
        let text = "2024-10-01 11:00:00;1;2;0.5;1.5;10;15\n\
                    not a candle\n\
                    2024-10-01 11:15:00;1.5;2;1;1.8;5;9;False;True\n\
                    2024-10-01 11:30:00;x;2;1;1.8;5;9\n";
        let (candles, dropped) = parse_candles(text.as_bytes());
        assert_eq!(candles.len(), 2);
        assert_eq!(dropped, 2);
        assert!(candles[0].confirm);
        assert!(!candles[0].is_realtime);
        assert!(!candles[1].confirm);
        assert!(candles[1].is_realtime);
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let storage = CandleStorage::new(dir.path(), InstrumentType::Swap, Interval::FifteenMinutes);

        assert!(storage.read_candles("BTCUSDT").await.unwrap().is_none());

        storage.append_candles("BTCUSDT", &[candle(0, 1.0), candle(15, 2.0)]).await.unwrap();
        storage.append_candles("BTCUSDT", &[candle(30, 3.0)]).await.unwrap();

        let candles = storage.read_candles("BTCUSDT").await.unwrap().unwrap();
        assert_eq!(candles.len(), 3);
        assert_eq!(candles[2].close, 3.0);
        assert!(storage
            .candle_path("BTCUSDT")
            .ends_with("SWAP/Candles/15min/BTCUSDT.csv"));
        assert!(storage.sync_log_path().ends_with("SWAP/Candles/loadlog15.txt"));
    }

    #[tokio::test]
    async fn test_write_atomic_overwrites() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("file.txt");
        write_atomic(&path, "first").await.unwrap();
        write_atomic(&path, "second").await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "second");
        assert!(!dir.path().join("nested").join("file.txt.tmp").exists());
    }

    #[tokio::test]
    async fn test_has_candles_follows_the_file() {
        let dir = TempDir::new().unwrap();
        let storage = CandleStorage::new(dir.path(), InstrumentType::Swap, Interval::FifteenMinutes);
        assert!(!storage.has_candles("BTCUSDT").await);
        storage.append_candles("BTCUSDT", &[candle(0, 1.0)]).await.unwrap();
        assert!(storage.has_candles("BTCUSDT").await);
    }

    #[test]
    fn test_records_are_trimmed_and_blank_lines_skipped() {
        let text = " a ; 1 \n\nb;2;extra\nc\n";
        let (pairs, dropped) = parse_records(text.as_bytes(), |r| {
            Some((r.get(0)?.to_string(), r.get(1)?.parse::<u32>().ok()?))
        });
        assert_eq!(pairs, vec![("a".to_string(), 1), ("b".to_string(), 2)]);
        assert_eq!(dropped, 1);
    }
}
