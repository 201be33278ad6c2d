use crate::models::{Candle, Timeframe};
use crate::stream::feed::{millis_to_datetime, HistoricalProvider};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use governor::{Quota, RateLimiter};
use reqwest::Client;
use std::num::NonZeroU32;
use std::sync::Arc;

pub const BINANCE_FUTURES_REST: &str = "https://fapi.binance.com";
const RATE_LIMIT_RPM: u32 = 1200;
const MAX_RETRIES: u32 = 3;
/// Largest page the klines endpoint serves
const MAX_KLINES_PER_REQUEST: usize = 1500;

type BinanceRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Binance USD-M futures REST client for historical klines
///
/// Cloneable; clones share the rate limiter.
#[derive(Clone)]
pub struct BinanceClient {
    client: Client,
    base_url: String,
    rate_limiter: Arc<BinanceRateLimiter>,
}

/// `BTC/USDT:USDT` or `BTC/USDT` -> `BTCUSDT`
pub fn exchange_symbol(symbol: &str) -> String {
    let pair = symbol.split(':').next().unwrap_or(symbol);
    pair.replace('/', "").to_uppercase()
}

impl BinanceClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        let quota = Quota::per_minute(
            NonZeroU32::new(RATE_LIMIT_RPM).context("Rate limit must be non-zero")?,
        );

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
        })
    }

    /// Make a rate-limited GET with retry on 429, 5xx and network errors
    async fn make_request(&self, url: &str, query: &[(&str, String)]) -> Result<reqwest::Response> {
        for attempt in 1..=MAX_RETRIES {
            self.rate_limiter.until_ready().await;

            match self.client.get(url).query(query).send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let backoff_secs = 2u64.pow(attempt);
                        tracing::warn!(
                            "Binance returned {}, retrying in {}s (attempt {}/{})",
                            status,
                            backoff_secs,
                            attempt,
                            MAX_RETRIES
                        );
                        tokio::time::sleep(std::time::Duration::from_secs(backoff_secs)).await;
                        continue;
                    }

                    // Other errors (4xx) - don't retry
                    let error_text = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "Unknown error".to_string());
                    anyhow::bail!("Binance API error ({}): {}", status, error_text);
                }
                Err(e) if attempt < MAX_RETRIES => {
                    let backoff_secs = 2u64.pow(attempt);
                    tracing::warn!(
                        "Network error: {}, retrying in {}s (attempt {}/{})",
                        e,
                        backoff_secs,
                        attempt,
                        MAX_RETRIES
                    );
                    tokio::time::sleep(std::time::Duration::from_secs(backoff_secs)).await;
                }
                Err(e) => anyhow::bail!("Network error after {} retries: {}", MAX_RETRIES, e),
            }
        }

        anyhow::bail!("Failed after {} retries", MAX_RETRIES)
    }

    /// Closed klines, oldest first. The bar still in progress is dropped.
    pub async fn get_klines(&self, symbol: &str, timeframe: Timeframe, limit: usize) -> Result<Vec<Candle>> {
        let market = exchange_symbol(symbol);
        // one extra row covers the in-progress bar that gets dropped
        let request_limit = (limit + 1).min(MAX_KLINES_PER_REQUEST);
        let url = format!("{}/fapi/v1/klines", self.base_url);

        let response = self
            .make_request(
                &url,
                &[
                    ("symbol", market.clone()),
                    ("interval", timeframe.as_str().to_string()),
                    ("limit", request_limit.to_string()),
                ],
            )
            .await?;

        let rows: Vec<Vec<serde_json::Value>> = response
            .json()
            .await
            .context("Failed to parse klines response")?;

        let now_ms = Utc::now().timestamp_millis();
        let mut candles = Vec::with_capacity(rows.len());
        for row in &rows {
            let close_time = row.get(6).and_then(|v| v.as_i64()).context("Kline row missing close time")?;
            if close_time >= now_ms {
                continue;
            }
            candles.push(parse_rest_kline(row)?);
        }

        if candles.len() > limit {
            candles.drain(..candles.len() - limit);
        }

        tracing::debug!("Fetched {} closed {} klines for {}", candles.len(), timeframe, market);
        Ok(candles)
    }
}

/// `[openTime, "open", "high", "low", "close", "volume", closeTime, ...]`
fn parse_rest_kline(row: &[serde_json::Value]) -> Result<Candle> {
    let number = |idx: usize, field: &str| -> Result<f64> {
        let value = row
            .get(idx)
            .with_context(|| format!("Kline row missing {}", field))?;
        let parsed = match value {
            serde_json::Value::String(s) => s.parse::<f64>().ok(),
            other => other.as_f64(),
        };
        parsed
            .filter(|v| v.is_finite())
            .with_context(|| format!("Invalid kline {} value {}", field, value))
    };

    let open_time = row
        .first()
        .and_then(|v| v.as_i64())
        .context("Kline row missing open time")?;

    Ok(Candle::new(
        millis_to_datetime(open_time)?,
        number(1, "open")?,
        number(2, "high")?,
        number(3, "low")?,
        number(4, "close")?,
        number(5, "volume")?,
        true,
    ))
}

#[async_trait]
impl HistoricalProvider for BinanceClient {
    async fn fetch_historical_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        self.get_klines(symbol, timeframe, limit).await
    }
}
