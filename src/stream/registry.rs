use super::buffer::{CandleSubscriber, StreamBuffer, StreamStatus, SubscriptionId};
use super::feed::{FeedEvent, HistoricalProvider, KlineUpdate, LiveFeed};
use crate::error::StreamError;
use crate::models::{Candle, StreamKey, Timeframe};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Default ATR period for stream candles
pub const DEFAULT_ATR_PERIOD: usize = 14;

struct StreamHandle {
    buffer: StreamBuffer,
    task: Option<JoinHandle<()>>,
}

/// Owns every live stream and routes feed events to the right buffer
///
/// Each open stream runs on its own task, so subscriber work on one stream
/// never holds up another. Cloning shares the same registry.
#[derive(Clone)]
pub struct StreamRegistry {
    streams: Arc<RwLock<HashMap<StreamKey, StreamHandle>>>,
    historical: Arc<dyn HistoricalProvider>,
    feed: Arc<dyn LiveFeed>,
    atr_period: usize,
}

impl StreamRegistry {
    pub fn new(historical: Arc<dyn HistoricalProvider>, feed: Arc<dyn LiveFeed>) -> Self {
        Self::with_atr_period(historical, feed, DEFAULT_ATR_PERIOD)
    }

    pub fn with_atr_period(
        historical: Arc<dyn HistoricalProvider>,
        feed: Arc<dyn LiveFeed>,
        atr_period: usize,
    ) -> Self {
        Self {
            streams: Arc::new(RwLock::new(HashMap::new())),
            historical,
            feed,
            atr_period,
        }
    }

    /// Backfill a stream and attach it to the live feed
    ///
    /// A short or failed backfill is tolerated as long as the live feed attaches,
    /// and vice versa; the stream starts stale when there is no live feed.
    pub async fn open(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        max_len: usize,
    ) -> Result<StreamKey, StreamError> {
        let key = StreamKey::new(symbol, timeframe);
        if max_len == 0 {
            return Err(StreamError::ZeroCapacity(key));
        }
        if self.contains(&key) {
            return Err(StreamError::AlreadyOpen(key));
        }

        let buffer = StreamBuffer::new(key.clone(), max_len, self.atr_period);

        let backfill = self
            .historical
            .fetch_historical_candles(symbol, timeframe, max_len)
            .await;
        let backfill_error = match backfill {
            Ok(candles) => {
                let fetched = candles.len();
                let kept = buffer.seed(candles);
                tracing::info!(stream = %key, fetched, kept, "Backfill complete");
                None
            }
            Err(e) => {
                tracing::warn!(stream = %key, "Backfill failed: {:#}", e);
                Some(e.to_string())
            }
        };

        let live = match self.feed.attach(&key).await {
            Ok(rx) => Ok(rx),
            Err(e) => {
                tracing::warn!(stream = %key, "Live feed attach failed: {:#}", e);
                Err(e.to_string())
            }
        };

        let task = match (live, backfill_error) {
            (Ok(rx), _) => {
                buffer.mark_live();
                Some(tokio::spawn(run_stream(buffer.clone(), rx)))
            }
            (Err(live), Some(backfill)) => {
                return Err(StreamError::Connection {
                    key,
                    backfill,
                    live,
                });
            }
            (Err(live), None) => {
                buffer.mark_stale(&live);
                None
            }
        };

        let mut streams = self.streams.write().unwrap_or_else(|e| e.into_inner());
        if streams.contains_key(&key) {
            // Lost a race with a concurrent open of the same key
            if let Some(task) = task {
                task.abort();
            }
            return Err(StreamError::AlreadyOpen(key));
        }
        streams.insert(key.clone(), StreamHandle { buffer, task });

        tracing::info!(stream = %key, max_len, "Stream opened");
        Ok(key)
    }

    pub fn contains(&self, key: &StreamKey) -> bool {
        self.streams
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(key)
    }

    /// Shared handle to a stream's buffer
    pub fn buffer(&self, key: &StreamKey) -> Result<StreamBuffer, StreamError> {
        self.streams
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map(|h| h.buffer.clone())
            .ok_or_else(|| StreamError::UnknownStream(key.clone()))
    }

    pub fn keys(&self) -> Vec<StreamKey> {
        self.streams
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn subscribe(
        &self,
        key: &StreamKey,
        subscriber: Arc<dyn CandleSubscriber>,
    ) -> Result<SubscriptionId, StreamError> {
        Ok(self.buffer(key)?.subscribe(subscriber))
    }

    /// Returns false if the subscription was not registered on this stream
    pub fn unsubscribe(&self, key: &StreamKey, id: SubscriptionId) -> Result<bool, StreamError> {
        Ok(self.buffer(key)?.unsubscribe(id))
    }

    /// Consistent copy of the closed candles (plus the in-progress one if asked)
    pub fn snapshot(
        &self,
        key: &StreamKey,
        include_current: bool,
    ) -> Result<Vec<Candle>, StreamError> {
        Ok(self.buffer(key)?.snapshot(include_current))
    }

    pub fn status(&self, key: &StreamKey) -> Option<StreamStatus> {
        self.buffer(key).ok().map(|b| b.status())
    }

    /// Wait for `min_len` closed candles; false on timeout, close, or unknown stream
    pub async fn wait_until_ready(&self, key: &StreamKey, min_len: usize, timeout: Duration) -> bool {
        match self.buffer(key) {
            Ok(buffer) => buffer.wait_until_ready(min_len, timeout).await,
            Err(_) => false,
        }
    }

    /// Detach a stream from the feed. Idempotent.
    pub fn close(&self, key: &StreamKey) {
        let handle = self
            .streams
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);

        if let Some(handle) = handle {
            if let Some(task) = handle.task {
                task.abort();
            }
            handle.buffer.mark_closed();
            tracing::info!(stream = %key, "Stream closed");
        }
    }

    pub fn close_all(&self) {
        let handles: Vec<(StreamKey, StreamHandle)> = self
            .streams
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();

        for (key, handle) in handles {
            if let Some(task) = handle.task {
                task.abort();
            }
            handle.buffer.mark_closed();
            tracing::info!(stream = %key, "Stream closed");
        }
    }
}

/// Single writer loop for one stream
async fn run_stream(buffer: StreamBuffer, mut rx: mpsc::Receiver<FeedEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            FeedEvent::Kline(update) => deliver(&buffer, update),
            FeedEvent::Disconnected(reason) => buffer.mark_stale(&reason),
        }
    }

    if buffer.status() != StreamStatus::Closed {
        buffer.mark_stale("feed channel ended");
    }
}

/// Apply a tick, running subscriber callbacks where blocking is allowed
///
/// On the multi-thread runtime the worker hands its other tasks (and the
/// timer) to another thread while callbacks run, so a blocking subscriber
/// stalls only this stream. A current-thread runtime has nowhere to hand
/// them, so callbacks run inline there.
fn deliver(buffer: &StreamBuffer, update: KlineUpdate) {
    match Handle::current().runtime_flavor() {
        RuntimeFlavor::CurrentThread => {
            buffer.on_tick(update);
        }
        _ => {
            tokio::task::block_in_place(|| buffer.on_tick(update));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::feed::ChannelFeed;
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
    use std::sync::Mutex;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn candle(minute: i64, price: f64) -> Candle {
        Candle::new(
            t0() + ChronoDuration::minutes(minute),
            price,
            price + 1.0,
            price - 1.0,
            price,
            100.0,
            true,
        )
    }

    fn closed_tick(minute: i64, price: f64) -> FeedEvent {
        FeedEvent::Kline(KlineUpdate {
            open_time: t0() + ChronoDuration::minutes(minute),
            open: price,
            high: price + 1.0,
            low: price - 1.0,
            close: price,
            volume: 10.0,
            is_closed: true,
        })
    }

    struct FixedHistory(Vec<Candle>);

    #[async_trait]
    impl HistoricalProvider for FixedHistory {
        async fn fetch_historical_candles(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
            limit: usize,
        ) -> Result<Vec<Candle>> {
            let skip = self.0.len().saturating_sub(limit);
            Ok(self.0[skip..].to_vec())
        }
    }

    struct FailingHistory;

    #[async_trait]
    impl HistoricalProvider for FailingHistory {
        async fn fetch_historical_candles(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
            _limit: usize,
        ) -> Result<Vec<Candle>> {
            anyhow::bail!("exchange unreachable")
        }
    }

    #[tokio::test]
    async fn test_open_seeds_and_goes_live() {
        let feed = Arc::new(ChannelFeed::new());
        let key = StreamKey::new("BTCUSDT", Timeframe::M1);
        let tx = feed.sender(&key);

        let history = FixedHistory((0..5).map(|i| candle(i, 100.0 + i as f64)).collect());
        let registry = StreamRegistry::new(Arc::new(history), feed.clone());

        let opened = registry.open("BTCUSDT", Timeframe::M1, 10).await.unwrap();
        assert_eq!(opened, key);
        assert_eq!(registry.snapshot(&key, false).unwrap().len(), 5);

        tx.send(closed_tick(5, 105.0)).await.unwrap();
        assert!(registry.wait_until_ready(&key, 6, Duration::from_secs(1)).await);
        assert_eq!(registry.status(&key), Some(StreamStatus::Live));

        registry.close_all();
    }

    #[tokio::test]
    async fn test_open_fails_without_any_source() {
        let registry = StreamRegistry::new(Arc::new(FailingHistory), Arc::new(ChannelFeed::new()));

        let result = registry.open("BTCUSDT", Timeframe::M1, 10).await;
        assert!(matches!(result, Err(StreamError::Connection { .. })));
        assert!(registry.keys().is_empty());
    }

    #[tokio::test]
    async fn test_backfill_only_stream_is_stale() {
        let history = FixedHistory((0..3).map(|i| candle(i, 100.0)).collect());
        let registry = StreamRegistry::new(Arc::new(history), Arc::new(ChannelFeed::new()));

        let key = registry.open("ETHUSDT", Timeframe::M5, 10).await.unwrap();
        assert_eq!(registry.status(&key), Some(StreamStatus::Stale));
        assert_eq!(registry.snapshot(&key, false).unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_open_rejected() {
        let feed = Arc::new(ChannelFeed::new());
        let key = StreamKey::new("BTCUSDT", Timeframe::M1);
        let _tx = feed.sender(&key);
        let registry = StreamRegistry::new(Arc::new(FixedHistory(vec![])), feed);

        registry.open("BTCUSDT", Timeframe::M1, 10).await.unwrap();
        let again = registry.open("BTCUSDT", Timeframe::M1, 10).await;
        assert!(matches!(again, Err(StreamError::AlreadyOpen(_))));
    }

    #[tokio::test]
    async fn test_disconnect_marks_stale() {
        let feed = Arc::new(ChannelFeed::new());
        let key = StreamKey::new("BTCUSDT", Timeframe::M1);
        let tx = feed.sender(&key);
        let registry = StreamRegistry::new(Arc::new(FixedHistory(vec![])), feed);
        registry.open("BTCUSDT", Timeframe::M1, 10).await.unwrap();

        tx.send(closed_tick(0, 100.0)).await.unwrap();
        assert!(registry.wait_until_ready(&key, 1, Duration::from_secs(1)).await);

        tx.send(FeedEvent::Disconnected("socket reset".into()))
            .await
            .unwrap();
        drop(tx);

        for _ in 0..100 {
            if registry.status(&key) == Some(StreamStatus::Stale) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(registry.status(&key), Some(StreamStatus::Stale));
        assert_eq!(registry.snapshot(&key, false).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_releases_waiters() {
        let feed = Arc::new(ChannelFeed::new());
        let key = StreamKey::new("BTCUSDT", Timeframe::M1);
        let _tx = feed.sender(&key);
        let registry = StreamRegistry::new(Arc::new(FixedHistory(vec![])), feed);
        registry.open("BTCUSDT", Timeframe::M1, 10).await.unwrap();

        let waiter = {
            let registry = registry.clone();
            let key = key.clone();
            tokio::spawn(async move {
                registry
                    .wait_until_ready(&key, 5, Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        registry.close(&key);
        registry.close(&key);

        assert!(!waiter.await.unwrap());
        assert!(!registry.contains(&key));
        assert!(matches!(
            registry.snapshot(&key, false),
            Err(StreamError::UnknownStream(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_slow_subscriber_does_not_block_other_streams() {
        let feed = Arc::new(ChannelFeed::new());
        let slow_key = StreamKey::new("SLOWUSDT", Timeframe::M1);
        let fast_key = StreamKey::new("FASTUSDT", Timeframe::M1);
        let slow_tx = feed.sender(&slow_key);
        let fast_tx = feed.sender(&fast_key);
        let registry = StreamRegistry::new(Arc::new(FixedHistory(vec![])), feed);

        registry.open("SLOWUSDT", Timeframe::M1, 10).await.unwrap();
        registry.open("FASTUSDT", Timeframe::M1, 10).await.unwrap();

        registry
            .subscribe(
                &slow_key,
                Arc::new(|_: &StreamKey, _: &Candle| {
                    std::thread::sleep(std::time::Duration::from_millis(500))
                }),
            )
            .unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        registry
            .subscribe(
                &fast_key,
                Arc::new(move |_: &StreamKey, c: &Candle| sink.lock().unwrap().push(c.close)),
            )
            .unwrap();

        slow_tx.send(closed_tick(0, 1.0)).await.unwrap();
        for i in 0..3 {
            fast_tx.send(closed_tick(i, 10.0 + i as f64)).await.unwrap();
        }

        assert!(
            registry
                .wait_until_ready(&fast_key, 3, Duration::from_millis(300))
                .await
        );
        assert_eq!(*seen.lock().unwrap(), vec![10.0, 11.0, 12.0]);

        registry.close_all();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn test_blocking_subscribers_on_single_worker() {
        let feed = Arc::new(ChannelFeed::new());
        let slow_keys = [
            StreamKey::new("SLOWAUSDT", Timeframe::M1),
            StreamKey::new("SLOWBUSDT", Timeframe::M1),
        ];
        let fast_key = StreamKey::new("FASTUSDT", Timeframe::M1);
        let slow_txs: Vec<_> = slow_keys.iter().map(|k| feed.sender(k)).collect();
        let fast_tx = feed.sender(&fast_key);
        let registry = StreamRegistry::new(Arc::new(FixedHistory(vec![])), feed);

        for key in slow_keys.iter().chain([&fast_key]) {
            registry.open(&key.symbol, key.timeframe, 10).await.unwrap();
        }
        for key in &slow_keys {
            registry
                .subscribe(
                    key,
                    Arc::new(|_: &StreamKey, _: &Candle| {
                        std::thread::sleep(std::time::Duration::from_millis(1500))
                    }),
                )
                .unwrap();
        }

        for tx in &slow_txs {
            tx.send(closed_tick(0, 1.0)).await.unwrap();
        }
        // let both slow streams enter their callbacks
        tokio::time::sleep(Duration::from_millis(50)).await;
        fast_tx.send(closed_tick(0, 10.0)).await.unwrap();

        let started = std::time::Instant::now();
        let ready = registry
            .wait_until_ready(&fast_key, 1, Duration::from_millis(500))
            .await;
        let elapsed = started.elapsed();

        assert!(ready);
        assert!(elapsed < Duration::from_millis(500), "fast stream waited {:?}", elapsed);
        for key in &slow_keys {
            assert!(registry.wait_until_ready(key, 1, Duration::from_secs(5)).await);
        }

        registry.close_all();
    }
}
