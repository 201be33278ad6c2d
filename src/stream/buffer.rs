use super::feed::KlineUpdate;
use crate::indicators::WilderAtr;
use crate::models::{Candle, StreamKey};
use serde::Serialize;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

/// Lifecycle of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StreamStatus {
    /// Created, historical seed not applied yet
    Backfilling,
    /// Receiving live ticks
    Live,
    /// Feed reported a disconnect (or never attached); data may lag
    Stale,
    /// Detached from the feed; no further updates
    Closed,
}

/// Listener for closed candles
///
/// Runs on the stream's own task, so a slow listener delays only the
/// stream it is registered on. Heavy work belongs on a separate worker,
/// e.g. through a `ForwardingSubscriber`.
pub trait CandleSubscriber: Send + Sync {
    fn on_candle_closed(&self, key: &StreamKey, candle: &Candle);
}

impl<F> CandleSubscriber for F
where
    F: Fn(&StreamKey, &Candle) + Send + Sync,
{
    fn on_candle_closed(&self, key: &StreamKey, candle: &Candle) {
        self(key, candle)
    }
}

/// Forwards closed candles to a worker task so the stream never waits on it
pub struct ForwardingSubscriber {
    tx: mpsc::UnboundedSender<(StreamKey, Candle)>,
}

impl ForwardingSubscriber {
    pub fn new(tx: mpsc::UnboundedSender<(StreamKey, Candle)>) -> Self {
        Self { tx }
    }
}

impl CandleSubscriber for ForwardingSubscriber {
    fn on_candle_closed(&self, key: &StreamKey, candle: &Candle) {
        if self.tx.send((key.clone(), candle.clone())).is_err() {
            tracing::debug!(stream = %key, "Closed-candle worker has gone away");
        }
    }
}

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Readiness {
    closed_len: usize,
    finished: bool,
}

struct BufferState {
    closed: VecDeque<Candle>,
    current: Option<Candle>,
    status: StreamStatus,
    atr: WilderAtr,
}

/// Bounded, time-ordered candles for one (symbol, timeframe)
///
/// One writer (the stream task) and any number of readers. Cloning shares the
/// same underlying buffer.
#[derive(Clone)]
pub struct StreamBuffer {
    key: StreamKey,
    max_len: usize,
    state: Arc<RwLock<BufferState>>,
    subscribers: Arc<Mutex<Vec<(SubscriptionId, Arc<dyn CandleSubscriber>)>>>,
    ready: Arc<watch::Sender<Readiness>>,
}

impl StreamBuffer {
    /// Create an empty buffer
    ///
    /// # Arguments
    /// * `max_len` - Maximum number of closed candles to keep (oldest evicted first)
    /// * `atr_period` - Wilder ATR period used to annotate closed candles
    pub fn new(key: StreamKey, max_len: usize, atr_period: usize) -> Self {
        let (ready, _) = watch::channel(Readiness {
            closed_len: 0,
            finished: false,
        });

        Self {
            key,
            max_len: max_len.max(1),
            state: Arc::new(RwLock::new(BufferState {
                closed: VecDeque::with_capacity(max_len),
                current: None,
                status: StreamStatus::Backfilling,
                atr: WilderAtr::new(atr_period),
            })),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            ready: Arc::new(ready),
        }
    }

    pub fn key(&self) -> &StreamKey {
        &self.key
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Seed with historical closed candles
    ///
    /// Input is sorted and de-duplicated by open time; only the newest `max_len`
    /// survive. Returns the number of candles kept.
    pub fn seed(&self, mut candles: Vec<Candle>) -> usize {
        candles.retain(|c| c.close.is_finite() && c.high.is_finite() && c.low.is_finite());
        candles.sort_by_key(|c| c.open_time);
        candles.dedup_by_key(|c| c.open_time);

        let mut state = self.write_state();
        let mut atr = WilderAtr::new(state.atr.period());
        let mut closed = VecDeque::with_capacity(self.max_len);

        for mut candle in candles {
            candle.is_closed = true;
            candle.atr = atr.update(candle.high, candle.low, candle.close);
            closed.push_back(candle);
            if closed.len() > self.max_len {
                closed.pop_front();
            }
        }

        let kept = closed.len();
        state.closed = closed;
        state.atr = atr;
        drop(state);

        self.publish_len(kept);
        kept
    }

    /// Apply a live tick and notify subscribers if it closed a bar
    ///
    /// Returns the finalized candle when the tick closed one.
    pub fn on_tick(&self, update: KlineUpdate) -> Option<Candle> {
        let (closed, len) = self.apply_update(update)?;
        self.notify(&closed);
        // Waiters wake only after subscribers have seen the candle
        self.publish_len(len);
        Some(closed)
    }

    /// Update state from a tick without notifying anyone
    ///
    /// Returns the closed candle and the new closed length.
    fn apply_update(&self, update: KlineUpdate) -> Option<(Candle, usize)> {
        let mut state = self.write_state();

        if state.status == StreamStatus::Closed {
            return None;
        }

        if let Some(last) = state.closed.back() {
            if update.open_time <= last.open_time {
                tracing::debug!(
                    stream = %self.key,
                    open_time = %update.open_time,
                    "Ignoring tick for an already closed bar"
                );
                return None;
            }
        }

        if let Some(current) = &state.current {
            if update.open_time < current.open_time {
                tracing::debug!(stream = %self.key, "Ignoring out-of-order tick");
                return None;
            }
            if update.open_time > current.open_time {
                tracing::warn!(
                    stream = %self.key,
                    open_time = %current.open_time,
                    "Dropping bar that never received a closing tick"
                );
            }
        }

        if state.status != StreamStatus::Live {
            tracing::info!(stream = %self.key, "Stream live");
            state.status = StreamStatus::Live;
        }

        let mut candle = update.into_candle();
        if !candle.is_closed {
            state.current = Some(candle);
            return None;
        }

        candle.atr = state.atr.update(candle.high, candle.low, candle.close);
        state.current = None;
        state.closed.push_back(candle.clone());
        while state.closed.len() > self.max_len {
            state.closed.pop_front();
        }
        let len = state.closed.len();
        Some((candle, len))
    }

    /// Invoke every subscriber once, in registration order
    fn notify(&self, candle: &Candle) {
        // Snapshot so callbacks may (un)subscribe without deadlocking
        let subscribers: Vec<_> = self
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, s)| s.clone())
            .collect();

        for subscriber in subscribers {
            let result = catch_unwind(AssertUnwindSafe(|| {
                subscriber.on_candle_closed(&self.key, candle)
            }));
            if result.is_err() {
                tracing::error!(stream = %self.key, "Closed-candle subscriber panicked");
            }
        }
    }

    pub fn subscribe(&self, subscriber: Arc<dyn CandleSubscriber>) -> SubscriptionId {
        let id = SubscriptionId(Uuid::new_v4());
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, subscriber));
        id
    }

    /// Returns false if the id was not registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        let before = subscribers.len();
        subscribers.retain(|(sid, _)| *sid != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Copy of the closed candles, optionally followed by the in-progress one
    pub fn snapshot(&self, include_current: bool) -> Vec<Candle> {
        let state = self.read_state();
        let mut candles: Vec<Candle> = state.closed.iter().cloned().collect();
        if include_current {
            if let Some(current) = &state.current {
                candles.push(current.clone());
            }
        }
        candles
    }

    /// Get the N most recent closed candles
    pub fn recent(&self, n: usize) -> Vec<Candle> {
        let state = self.read_state();
        let skip = state.closed.len().saturating_sub(n);
        state.closed.iter().skip(skip).cloned().collect()
    }

    pub fn current(&self) -> Option<Candle> {
        self.read_state().current.clone()
    }

    pub fn len(&self) -> usize {
        self.read_state().closed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn status(&self) -> StreamStatus {
        self.read_state().status
    }

    /// Mark the stream live once its feed is attached
    pub fn mark_live(&self) {
        let mut state = self.write_state();
        if state.status == StreamStatus::Backfilling || state.status == StreamStatus::Stale {
            state.status = StreamStatus::Live;
        }
    }

    /// Mark the stream stale after a feed disconnect
    ///
    /// The partial in-progress bar is discarded rather than appended.
    pub fn mark_stale(&self, reason: &str) {
        let mut state = self.write_state();
        if state.status == StreamStatus::Closed {
            return;
        }
        state.status = StreamStatus::Stale;
        state.current = None;
        tracing::warn!(stream = %self.key, reason, "Stream stale");
    }

    /// Stop accepting updates and release waiters. Idempotent.
    pub fn mark_closed(&self) {
        let mut state = self.write_state();
        if state.status == StreamStatus::Closed {
            return;
        }
        state.status = StreamStatus::Closed;
        state.current = None;
        drop(state);

        self.ready.send_modify(|r| r.finished = true);
    }

    /// Wait until at least `min_len` closed candles are buffered
    ///
    /// Returns false on timeout or if the stream closes first. Dropping the
    /// returned future cancels the wait and releases its registration.
    pub async fn wait_until_ready(&self, min_len: usize, timeout: Duration) -> bool {
        let mut rx = self.ready.subscribe();
        let wait = rx.wait_for(|r| r.closed_len >= min_len || r.finished);

        // The watch::Ref borrows rx, so the result must not be the tail temporary
        let ready = match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(readiness)) => readiness.closed_len >= min_len,
            Ok(Err(_)) => false,
            Err(_) => {
                tracing::debug!(
                    stream = %self.key,
                    min_len,
                    "Timed out waiting for stream to fill"
                );
                false
            }
        };
        ready
    }

    /// Number of `wait_until_ready` calls currently parked on this buffer
    pub fn waiter_count(&self) -> usize {
        self.ready.receiver_count()
    }

    fn publish_len(&self, len: usize) {
        self.ready.send_modify(|r| r.closed_len = len);
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, BufferState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, BufferState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}
