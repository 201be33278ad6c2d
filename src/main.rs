use cryptoai::api::{BinanceClient, BinanceKlineFeed};
use cryptoai::config::Settings;
use cryptoai::stream::{ForwardingSubscriber, StreamRegistry};
use cryptoai::{Candle, Result, StreamKey};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// How long each stream gets to collect its warm-up candles
const READY_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    tracing::info!("🚀 cryptoai live streams starting");

    let config_path =
        std::env::var("CRYPTOAI_CONFIG").unwrap_or_else(|_| "config/cryptoai.toml".to_string());
    let settings = Settings::load(&config_path)?;

    if settings.streams.is_empty() {
        tracing::warn!("No streams configured in {}, nothing to do", config_path);
        return Ok(());
    }

    let historical = Arc::new(BinanceClient::new(settings.binance.rest_base_url.clone())?);
    let feed = Arc::new(BinanceKlineFeed::new(settings.binance.ws_base_url.clone()));
    let registry = StreamRegistry::with_atr_period(historical, feed, settings.atr_period);

    // Subscribers only forward; the worker below does the real work off the stream tasks
    let (tx, rx) = mpsc::unbounded_channel();
    let worker = tokio::spawn(log_closed_candles(rx));

    for stream in &settings.streams {
        match registry
            .open(&stream.symbol, stream.timeframe, stream.max_len)
            .await
        {
            Ok(key) => {
                registry.subscribe(&key, Arc::new(ForwardingSubscriber::new(tx.clone())))?;

                let min_len = (settings.atr_period + 1).min(stream.max_len);
                if registry.wait_until_ready(&key, min_len, READY_TIMEOUT).await {
                    let buffer = registry.buffer(&key)?;
                    match buffer.recent(1).pop() {
                        Some(last) => tracing::info!(
                            stream = %key,
                            "✓ Ready with {} candles, last close {:.4} at {}",
                            buffer.len(),
                            last.close,
                            last.open_time
                        ),
                        None => tracing::info!(stream = %key, "✓ Ready with 0 candles"),
                    }
                } else {
                    tracing::warn!(
                        stream = %key,
                        "Not ready after {:?} (status {:?})",
                        READY_TIMEOUT,
                        registry.status(&key)
                    );
                }
            }
            Err(e) => tracing::error!("Failed to open {} {}: {}", stream.symbol, stream.timeframe, e),
        }
    }
    drop(tx);

    tracing::info!("Streaming {} feeds, press Ctrl-C to stop", registry.keys().len());
    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down...");
    registry.close_all();
    worker.abort();

    Ok(())
}

async fn log_closed_candles(mut rx: mpsc::UnboundedReceiver<(StreamKey, Candle)>) {
    while let Some((key, candle)) = rx.recv().await {
        match candle.atr {
            Some(atr) => tracing::info!(
                stream = %key,
                "Closed {} O={:.4} H={:.4} L={:.4} C={:.4} ATR={:.4}",
                candle.open_time,
                candle.open,
                candle.high,
                candle.low,
                candle.close,
                atr
            ),
            None => tracing::info!(
                stream = %key,
                "Closed {} O={:.4} H={:.4} L={:.4} C={:.4}",
                candle.open_time,
                candle.open,
                candle.high,
                candle.low,
                candle.close
            ),
        }
    }
}

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("cryptoai=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
