use crate::models::{Candle, StreamKey, Timeframe};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Capacity of the per-stream channel between a feed and its buffer task
pub const FEED_CHANNEL_CAPACITY: usize = 1024;

/// One normalized kline tick from a live feed
#[derive(Debug, Clone, PartialEq)]
pub struct KlineUpdate {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// True on the final tick of a bar
    pub is_closed: bool,
}

impl KlineUpdate {
    pub fn into_candle(self) -> Candle {
        Candle::new(
            self.open_time,
            self.open,
            self.high,
            self.low,
            self.close,
            self.volume,
            self.is_closed,
        )
    }

    fn is_finite(&self) -> bool {
        [self.open, self.high, self.low, self.close, self.volume]
            .iter()
            .all(|v| v.is_finite())
    }
}

/// What a live feed delivers to a stream
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Kline(KlineUpdate),
    /// The upstream connection dropped; the stream goes stale until ticks resume
    Disconnected(String),
}

/// Source of closed historical candles used to seed a stream
#[async_trait]
pub trait HistoricalProvider: Send + Sync {
    /// Fetch up to `limit` closed candles, ascending by open time
    async fn fetch_historical_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>>;
}

/// Source of live kline updates
///
/// Reconnection and backoff belong to the implementation; the stream only
/// reacts to `FeedEvent::Disconnected` by marking itself stale.
#[async_trait]
pub trait LiveFeed: Send + Sync {
    async fn attach(&self, key: &StreamKey) -> Result<mpsc::Receiver<FeedEvent>>;
}

/// In-process feed: callers push events through the sender returned by `sender`
///
/// Used for replays and tests.
#[derive(Default)]
pub struct ChannelFeed {
    pending: Mutex<HashMap<StreamKey, mpsc::Receiver<FeedEvent>>>,
}

impl ChannelFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the channel for `key`; the next `attach` for that key consumes it
    pub fn sender(&self, key: &StreamKey) -> mpsc::Sender<FeedEvent> {
        let (tx, rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.clone(), rx);
        tx
    }
}

#[async_trait]
impl LiveFeed for ChannelFeed {
    async fn attach(&self, key: &StreamKey) -> Result<mpsc::Receiver<FeedEvent>> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key)
            .with_context(|| format!("No live channel registered for {}", key))
    }
}

#[derive(Debug, Deserialize)]
struct KlineEvent {
    #[serde(rename = "k")]
    kline: RawKline,
}

#[derive(Debug, Deserialize)]
struct RawKline {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "x")]
    is_closed: bool,
}

fn parse_decimal(field: &str, value: &str) -> Result<f64> {
    value
        .parse::<f64>()
        .with_context(|| format!("Invalid kline {} value '{}'", field, value))
}

pub(crate) fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .with_context(|| format!("Invalid timestamp {}", ms))
}

/// Parse an exchange kline message
///
/// Accepts the plain event or the combined-stream `{"stream", "data"}` envelope.
/// Returns `Ok(None)` for well-formed non-kline events.
pub fn parse_kline_message(text: &str) -> Result<Option<KlineUpdate>> {
    let value: serde_json::Value = serde_json::from_str(text).context("Invalid JSON message")?;
    let payload = match value.get("data") {
        Some(data) => data.clone(),
        None => value,
    };

    if payload.get("e").and_then(|e| e.as_str()) != Some("kline") {
        return Ok(None);
    }

    let event: KlineEvent = serde_json::from_value(payload).context("Malformed kline event")?;
    let k = event.kline;

    let update = KlineUpdate {
        open_time: millis_to_datetime(k.open_time)?,
        open: parse_decimal("open", &k.open)?,
        high: parse_decimal("high", &k.high)?,
        low: parse_decimal("low", &k.low)?,
        close: parse_decimal("close", &k.close)?,
        volume: parse_decimal("volume", &k.volume)?,
        is_closed: k.is_closed,
    };

    if !update.is_finite() {
        anyhow::bail!("Kline contains non-finite values");
    }

    Ok(Some(update))
}
