/// Bybit v5 REST client (public market endpoints)
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{IndexError, Result};
use crate::exchange::websocket::BybitCandleStream;
use crate::exchange::ExchangeClient;
use crate::types::{Candle, Category, ExchangeConfig, Instrument, Interval, LiveCandle};
use crate::utils::time::from_millis;
use crate::utils::RateLimiter;

/// Maximum bars the kline endpoint returns per request
const KLINE_PAGE_LIMIT: i64 = 1000;
const WS_CONNECT_ATTEMPTS: u32 = 5;
/// "Too many visits"
const RATE_LIMIT_RET_CODE: i64 = 10006;

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg")]
    ret_msg: String,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct KlineResult {
    #[serde(default)]
    list: Vec<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct InstrumentsResult {
    #[serde(default)]
    list: Vec<InstrumentInfo>,
    #[serde(rename = "nextPageCursor", default)]
    next_page_cursor: String,
}

#[derive(Debug, Deserialize)]
struct InstrumentInfo {
    symbol: String,
    #[serde(rename = "contractType", default)]
    contract_type: String,
    #[serde(default)]
    status: String,
    #[serde(rename = "baseCoin")]
    base_coin: String,
    #[serde(rename = "quoteCoin")]
    quote_coin: String,
    #[serde(rename = "launchTime", default)]
    launch_time: String,
}

/// Bybit REST client
pub struct BybitClient {
    client: Client,
    base_url: String,
    ws_url: String,
    limiter: Arc<RateLimiter>,
}

impl BybitClient {
    pub fn new(config: &ExchangeConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(StdDuration::from_secs(config.request_timeout_sec))
            .build()?;

        Ok(BybitClient {
            client,
            base_url: config.rest_url.trim_end_matches('/').to_string(),
            ws_url: config.ws_url.clone(),
            limiter: Arc::new(RateLimiter::new(config.rate_limit_per_sec)),
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        self.limiter.acquire().await;

        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .query(query)
            .send()
            .await?;

        let body = response.text().await?;
        let parsed: ApiResponse<T> = serde_json::from_str(&body)?;

        if parsed.ret_code != 0 {
            return Err(api_error(parsed.ret_code, parsed.ret_msg));
        }

        parsed
            .result
            .ok_or_else(|| IndexError::MissingData(format!("Empty result from {}", path)))
    }

    /// One kline page, at most `KLINE_PAGE_LIMIT` bars
    async fn kline_page(
        &self,
        category: Category,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let query = [
            ("category", category.as_str().to_string()),
            ("symbol", symbol.to_string()),
            ("interval", interval.exchange_code().to_string()),
            ("start", start.timestamp_millis().to_string()),
            ("end", end.timestamp_millis().to_string()),
            ("limit", KLINE_PAGE_LIMIT.to_string()),
        ];

        debug!("Fetching klines: {} {} {} -> {}", symbol, interval.exchange_code(), start, end);

        let result: KlineResult = self.get("/v5/market/kline", &query).await?;

        let mut candles: Vec<Candle> = result.list.iter().filter_map(|row| parse_kline_row(row)).collect();
        if candles.len() != result.list.len() {
            warn!(
                "{}: dropped {} malformed kline rows",
                symbol,
                result.list.len() - candles.len()
            );
        }

        // The endpoint answers newest first
        candles.sort_by_key(|c| c.open_time);
        Ok(candles)
    }

    /// Walk `[start, end]` forward in page-sized windows
    async fn paged_klines(
        &self,
        category: Category,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        let step = interval.duration();
        let page_span = step * (KLINE_PAGE_LIMIT as i32 - 1);

        let mut candles: Vec<Candle> = Vec::new();
        let mut cursor = start;

        while cursor <= end {
            let page_end = (cursor + page_span).min(end);
            let page = self.kline_page(category, symbol, interval, cursor, page_end).await?;

            for candle in page {
                if candles.last().map_or(true, |last| candle.open_time > last.open_time) {
                    candles.push(candle);
                }
            }

            cursor = page_end + step;
        }

        Ok(candles)
    }
}

/// `[startTime, open, high, low, close, volume, turnover]`
fn parse_kline_row(row: &[String]) -> Option<Candle> {
    if row.len() < 7 {
        return None;
    }

    Some(Candle {
        open_time: from_millis(row[0].parse().ok()?)?,
        open: row[1].parse().ok()?,
        high: row[2].parse().ok()?,
        low: row[3].parse().ok()?,
        close: row[4].parse().ok()?,
        volume: row[5].parse().ok()?,
        value: row[6].parse().ok()?,
        confirm: true,
        is_realtime: false,
    })
}

impl ExchangeClient for BybitClient {
    async fn fetch_instruments(&self, category: Category) -> Result<Vec<Instrument>> {
        let mut instruments = Vec::new();
        let mut cursor = String::new();

        loop {
            let mut query = vec![
                ("category", category.as_str().to_string()),
                ("limit", "1000".to_string()),
            ];
            if !cursor.is_empty() {
                query.push(("cursor", cursor.clone()));
            }

            let page: InstrumentsResult = self.get("/v5/market/instruments-info", &query).await?;

            for info in page.list {
                if info.status != "Trading" {
                    continue;
                }
                if category == Category::Linear && info.contract_type != "LinearPerpetual" {
                    continue;
                }
                let Some(launch_time) = info.launch_time.parse().ok().and_then(from_millis) else {
                    warn!("{}: missing launch time, skipped", info.symbol);
                    continue;
                };
                instruments.push(Instrument {
                    symbol: info.symbol,
                    base_coin: info.base_coin,
                    quote_coin: info.quote_coin,
                    launch_time,
                });
            }

            if page.next_page_cursor.is_empty() {
                break;
            }
            cursor = page.next_page_cursor;
        }

        debug!("Fetched {} {} instruments", instruments.len(), category.as_str());
        Ok(instruments)
    }

    async fn fetch_candles(
        &self,
        category: Category,
        symbol: &str,
        interval: Interval,
        since: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        self.paged_klines(category, symbol, interval, since, Utc::now()).await
    }

    async fn fetch_candles_range(
        &self,
        category: Category,
        symbol: &str,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        self.paged_klines(category, symbol, interval, start, end).await
    }

    async fn subscribe_candles(
        &self,
        symbols: &[String],
        interval: Interval,
    ) -> Result<mpsc::Receiver<LiveCandle>> {
        let stream = BybitCandleStream::new(self.ws_url.clone());
        stream
            .connect_with_retry(symbols.to_vec(), interval, WS_CONNECT_ATTEMPTS)
            .await
    }
}

fn api_error(code: i64, message: String) -> IndexError {
    if code == RATE_LIMIT_RET_CODE {
        IndexError::RateLimitExceeded(message)
    } else {
        IndexError::ExchangeApiError { code, message }
    }
}
