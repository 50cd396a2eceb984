/// Time utilities for storage timestamps and rebalance calendars
use chrono::{DateTime, Duration, Months, NaiveDateTime, TimeZone, Timelike, Utc};

/// Timestamp layout used in every storage file
pub const STORAGE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Layouts accepted when reading files written by other tools
const LEGACY_TIME_FORMATS: [&str; 5] = [
    "%Y-%m-%dT%H:%M:%S",
    "%d.%m.%Y %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %I:%M:%S %p",
    "%Y-%m-%d %H:%M",
];

/// Minimum-value sentinel older files use for "no timestamp"
const ABSENT_SENTINEL: &str = "0001-01-01 00:00:00";

pub fn format_time(time: DateTime<Utc>) -> String {
    time.format(STORAGE_TIME_FORMAT).to_string()
}

pub fn format_optional_time(time: Option<DateTime<Utc>>) -> String {
    time.map(format_time).unwrap_or_default()
}

/// Parse a storage timestamp (UTC)
pub fn parse_time(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, STORAGE_TIME_FORMAT) {
        return Some(Utc.from_utc_datetime(&naive));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    LEGACY_TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

/// Parse a timestamp that may be absent.
///
/// Returns `Some(None)` for an empty field or the minimum-value sentinel,
/// `None` when the field is present but malformed.
pub fn parse_optional_time(value: &str) -> Option<Option<DateTime<Utc>>> {
    let value = value.trim();
    if value.is_empty() || value == ABSENT_SENTINEL {
        return Some(None);
    }
    parse_time(value).map(Some)
}

/// Add calendar months, clamping to the end of shorter months
pub fn add_months(time: DateTime<Utc>, months: u32) -> DateTime<Utc> {
    time.checked_add_months(Months::new(months)).unwrap_or(time)
}

pub fn truncate_to_hour(time: DateTime<Utc>) -> DateTime<Utc> {
    time.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(time)
}

pub fn start_of_day(time: DateTime<Utc>) -> DateTime<Utc> {
    Utc.from_utc_datetime(&time.date_naive().and_hms_opt(0, 0, 0).unwrap_or_default())
}

pub fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// Rebalance instants `start, start+1mo, ...` not later than `until`
pub fn monthly_schedule(start: DateTime<Utc>, until: DateTime<Utc>) -> Vec<DateTime<Utc>> {
    let mut times = Vec::new();
    let mut months = 0;
    loop {
        let t = add_months(start, months);
        if t > until {
            break;
        }
        times.push(t);
        months += 1;
    }
    times
}

/// Number of whole `step` intervals between two instants
pub fn steps_between(start: DateTime<Utc>, end: DateTime<Utc>, step: Duration) -> i64 {
    let step_secs = step.num_seconds();
    if step_secs <= 0 {
        return 0;
    }
    (end - start).num_seconds() / step_secs
}
