/// Bybit public WebSocket stream for live candles
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};

use crate::error::{IndexError, Result};
use crate::types::{Candle, Interval, LiveCandle};
use crate::utils::time::from_millis;

/// Topics per subscribe request accepted by the public stream
const TOPICS_PER_REQUEST: usize = 10;
const PING_INTERVAL: Duration = Duration::from_secs(20);
const CHANNEL_CAPACITY: usize = 4096;
/// Seconds to wait before each reconnect attempt
const RECONNECT_BACKOFF_SECS: [u64; 5] = [1, 2, 4, 8, 16];

#[derive(Debug, Serialize)]
struct WsRequest {
    op: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    args: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WsKlineMessage {
    topic: String,
    #[serde(default)]
    data: Vec<WsKline>,
}

#[derive(Debug, Deserialize)]
struct WsKline {
    start: i64,
    open: String,
    high: String,
    low: String,
    close: String,
    volume: String,
    turnover: String,
    confirm: bool,
}

impl WsKline {
    fn to_candle(&self) -> Option<Candle> {
        Some(Candle {
            open_time: from_millis(self.start)?,
            open: self.open.parse().ok()?,
            high: self.high.parse().ok()?,
            low: self.low.parse().ok()?,
            close: self.close.parse().ok()?,
            volume: self.volume.parse().ok()?,
            value: self.turnover.parse().ok()?,
            confirm: self.confirm,
            is_realtime: true,
        })
    }
}

fn kline_topic(interval: Interval, symbol: &str) -> String {
    format!("kline.{}.{}", interval.exchange_code(), symbol)
}

/// Decode one text frame into live candles; non-kline frames yield nothing
fn parse_kline_frame(text: &str, interval: Interval) -> Vec<LiveCandle> {
    let Ok(msg) = serde_json::from_str::<WsKlineMessage>(text) else {
        return Vec::new();
    };
    let Some(symbol) = msg.topic.rsplit('.').next().map(str::to_string) else {
        return Vec::new();
    };

    msg.data
        .iter()
        .filter_map(WsKline::to_candle)
        .map(|candle| LiveCandle {
            symbol: symbol.clone(),
            interval,
            candle,
        })
        .collect()
}

pub struct BybitCandleStream {
    url: String,
}

impl BybitCandleStream {
    pub fn new(url: String) -> Self {
        BybitCandleStream { url }
    }

    /// Connect, subscribe and return the receiving end of the candle channel.
    ///
    /// The channel closes when the server drops the connection.
    pub async fn connect(&self, symbols: Vec<String>, interval: Interval) -> Result<mpsc::Receiver<LiveCandle>> {
        info!("🔌 Connecting to {} for {} symbols...", self.url, symbols.len());

        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| IndexError::WebSocketError(format!("Connection failed: {}", e)))?;

        let (mut write, mut read) = ws_stream.split();

        let topics: Vec<String> = symbols.iter().map(|s| kline_topic(interval, s)).collect();
        for chunk in topics.chunks(TOPICS_PER_REQUEST) {
            let request = WsRequest {
                op: "subscribe",
                args: chunk.to_vec(),
            };
            write
                .send(Message::Text(serde_json::to_string(&request)?))
                .await
                .map_err(|e| IndexError::WebSocketError(format!("Subscribe failed: {}", e)))?;
        }

        info!("📡 Subscribed to {} kline topics", topics.len());

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        // Keepalive
        let ping_tx = tx.clone();
        tokio::spawn(async move {
            let ping = match serde_json::to_string(&WsRequest { op: "ping", args: Vec::new() }) {
                Ok(p) => p,
                Err(_) => return,
            };
            let mut ticker = tokio::time::interval(PING_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if ping_tx.is_closed() {
                    break;
                }
                if let Err(e) = write.send(Message::Text(ping.clone())).await {
                    warn!("WebSocket ping failed: {}", e);
                    break;
                }
            }
        });

        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        for live in parse_kline_frame(&text, interval) {
                            if tx.send(live).await.is_err() {
                                debug!("Live candle receiver dropped");
                                return;
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        warn!("WebSocket closed by server");
                        break;
                    }
                    Err(e) => {
                        error!("WebSocket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            warn!("WebSocket reader task ended");
        });

        Ok(rx)
    }

    /// Connect, retrying with exponential backoff
    pub async fn connect_with_retry(
        &self,
        symbols: Vec<String>,
        interval: Interval,
        max_attempts: u32,
    ) -> Result<mpsc::Receiver<LiveCandle>> {
        let mut attempt = 0;
        loop {
            match self.connect(symbols.clone(), interval).await {
                Ok(rx) => return Ok(rx),
                Err(e) => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        return Err(IndexError::WebSocketError(format!(
                            "Failed to connect after {} attempts: {}",
                            attempt, e
                        )));
                    }
                    let backoff = RECONNECT_BACKOFF_SECS
                        .get(attempt as usize - 1)
                        .copied()
                        .unwrap_or(16);
                    warn!("Reconnecting (attempt {}/{}), waiting {}s: {}", attempt + 1, max_attempts, backoff, e);
                    tokio::time::sleep(Duration::from_secs(backoff)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kline_frame() {
        let text = r#"{"topic":"kline.15.BTCUSDT","type":"snapshot","ts":1727781299000,
            "data":[{"start":1727780400000,"end":1727781299999,"interval":"15","open":"63000","close":"63050",
            "high":"63100","low":"62950","volume":"12.5","turnover":"788000","confirm":false,"timestamp":1727781299000}]}"#;
        let candles = parse_kline_frame(text, Interval::FifteenMinutes);
        assert_eq!(candles.len(), 1);
        assert_eq!(candles[0].symbol, "BTCUSDT");
        assert!(!candles[0].candle.confirm);
        assert!(candles[0].candle.is_realtime);
        assert_eq!(candles[0].candle.close, 63050.0);
    }

    #[test]
    fn test_non_kline_frames_ignored() {
        let pong = r#"{"success":true,"ret_msg":"pong","conn_id":"abc","op":"ping"}"#;
        assert!(parse_kline_frame(pong, Interval::FifteenMinutes).is_empty());
    }

    #[test]
    fn test_topic_format() {
        assert_eq!(kline_topic(Interval::FifteenMinutes, "ETHUSDT"), "kline.15.ETHUSDT");
    }
}
