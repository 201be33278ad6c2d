use crate::api::binance::exchange_symbol;
use crate::models::StreamKey;
use crate::stream::feed::{parse_kline_message, FeedEvent, LiveFeed, FEED_CHANNEL_CAPACITY};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

pub const BINANCE_FUTURES_WS: &str = "wss://fstream.binance.com";

/// Live kline feed over the exchange websocket, one connection per stream
///
/// When the socket ends the feed sends a single `Disconnected` and stops.
/// Reconnecting is left to whoever owns the registry.
#[derive(Debug, Clone)]
pub struct BinanceKlineFeed {
    ws_base_url: String,
}

impl BinanceKlineFeed {
    pub fn new(ws_base_url: impl Into<String>) -> Self {
        Self {
            ws_base_url: ws_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn stream_url(&self, key: &StreamKey) -> String {
        format!(
            "{}/ws/{}@kline_{}",
            self.ws_base_url,
            exchange_symbol(&key.symbol).to_lowercase(),
            key.timeframe.as_str()
        )
    }
}

#[async_trait]
impl LiveFeed for BinanceKlineFeed {
    async fn attach(&self, key: &StreamKey) -> Result<mpsc::Receiver<FeedEvent>> {
        let url = self.stream_url(key);
        let (mut ws_stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("Failed to connect to {}", url))?;

        tracing::info!(stream = %key, "Connected to {}", url);

        let (tx, rx) = mpsc::channel(FEED_CHANNEL_CAPACITY);
        let key = key.clone();

        tokio::spawn(async move {
            let reason = loop {
                match ws_stream.next().await {
                    Some(Ok(Message::Text(text))) => match parse_kline_message(text.as_str()) {
                        Ok(Some(update)) => {
                            if tx.send(FeedEvent::Kline(update)).await.is_err() {
                                // stream closed on our side
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => tracing::warn!(stream = %key, "Dropping bad kline message: {:#}", e),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        break format!("server closed connection: {:?}", frame);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break format!("websocket error: {}", e),
                    None => break "websocket stream ended".to_string(),
                }
            };

            tracing::warn!(stream = %key, "Live feed disconnected: {}", reason);
            let _ = tx.send(FeedEvent::Disconnected(reason)).await;
        });

        Ok(rx)
    }
}
