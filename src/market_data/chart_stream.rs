// =============================================================================
// ChartStream — rolling candle window for one (symbol, interval)
// =============================================================================
//
// Merges a one-time REST bootstrap with the live kline delta feed and fans the
// resulting snapshot out to every subscriber.
//
// Invariants:
//   - `candles` only holds candles observed with `is_closed == true`.
//   - `current` is the most recently received candle, closed or not.
//   - Without accumulate mode, `candles.len() <= limit` after every update;
//     the oldest entries by `open_time` are evicted first.
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::market_data::candle::{parse_kline_delta, Candle, ChartKey};
use crate::transport::TransportHandle;

pub type SubscriptionId = Uuid;

pub type SnapshotFn = Arc<dyn Fn(&ChartSnapshot) + Send + Sync>;
pub type ErrorFn = Arc<dyn Fn(&SyncError) + Send + Sync>;
pub type CloseFn = Arc<dyn Fn() + Send + Sync>;

/// Per-subscriber notification hooks. Every hook is optional.
#[derive(Clone, Default)]
pub struct ChartCallbacks {
    pub on_update: Option<SnapshotFn>,
    pub on_close: Option<CloseFn>,
    pub on_error: Option<ErrorFn>,
}

impl ChartCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_update(mut self, f: impl Fn(&ChartSnapshot) + Send + Sync + 'static) -> Self {
        self.on_update = Some(Arc::new(f));
        self
    }

    pub fn on_close(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&SyncError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }
}

/// Point-in-time view of a chart.
#[derive(Debug, Clone, Serialize)]
pub struct ChartSnapshot {
    pub symbol: String,
    pub interval: String,
    /// Closed candles, newest first.
    pub candles: Vec<Candle>,
    /// Most recent candle received from the stream.
    pub current: Option<Candle>,
    /// Close of `current`, i.e. the in-progress price.
    pub current_price: Option<f64>,
    /// Closed candle with the greatest `open_time`.
    pub last_closed: Option<Candle>,
}

impl ChartSnapshot {
    /// History with the live candle in front, newest first.
    pub fn merged(&self) -> Vec<Candle> {
        let mut out = Vec::with_capacity(self.candles.len() + 1);
        if let Some(current) = &self.current {
            if !current.is_closed {
                out.push(current.clone());
            }
        }
        out.extend(self.candles.iter().cloned());
        out
    }
}

#[derive(Default)]
struct Window {
    candles: BTreeMap<i64, Candle>,
    current: Option<Candle>,
}

pub struct ChartStream {
    key: ChartKey,
    limit: usize,
    accumulate: bool,
    window: RwLock<Window>,
    subscribers: RwLock<HashMap<SubscriptionId, ChartCallbacks>>,
    transport: TransportHandle,
    closed: AtomicBool,
}

impl ChartStream {
    /// Seed the window with the closed candles of `bootstrap`.
    ///
    /// Unclosed bootstrap entries are discarded. Without accumulate mode only
    /// the newest `limit` closed candles are kept.
    pub fn new(
        key: ChartKey,
        limit: usize,
        accumulate: bool,
        bootstrap: Vec<Candle>,
        transport: TransportHandle,
    ) -> Self {
        let mut window = Window::default();
        for candle in bootstrap.into_iter().filter(|c| c.is_closed) {
            window.candles.insert(candle.open_time, candle);
        }

        let stream = Self {
            key,
            limit,
            accumulate,
            window: RwLock::new(window),
            subscribers: RwLock::new(HashMap::new()),
            transport,
            closed: AtomicBool::new(false),
        };
        stream.trim(&mut stream.window.write());

        info!(
            key = %stream.key,
            limit,
            accumulate,
            seeded = stream.len(),
            "chart stream constructed"
        );
        stream
    }

    pub fn key(&self) -> &ChartKey {
        &self.key
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Number of closed candles held.
    pub fn len(&self) -> usize {
        self.window.read().candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn transport(&self) -> &TransportHandle {
        &self.transport
    }

    fn trim(&self, window: &mut Window) {
        if self.accumulate {
            return;
        }
        while window.candles.len() > self.limit {
            if let Some((open_time, _)) = window.candles.pop_first() {
                debug!(key = %self.key, open_time, "evicted oldest candle");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Updates
    // -------------------------------------------------------------------------

    /// Decode one raw kline delta, merge it and notify every subscriber.
    ///
    /// A malformed delta is reported to subscribers' `on_error` and returned;
    /// the window is left untouched.
    pub fn apply_update(&self, raw: &str) -> SyncResult<()> {
        let candle = match parse_kline_delta(raw).and_then(|c| self.check_identity(c)) {
            Ok(candle) => candle,
            Err(e) => {
                warn!(key = %self.key, error = %e, "dropping malformed kline delta");
                self.notify_error(&e);
                return Err(e);
            }
        };

        self.apply_candle(candle);
        self.notify_update();
        Ok(())
    }

    fn check_identity(&self, candle: Candle) -> SyncResult<Candle> {
        if candle.symbol != self.key.symbol || candle.interval != self.key.interval {
            return Err(SyncError::Validation(format!(
                "delta for {}@{} routed to {}",
                candle.symbol, candle.interval, self.key
            )));
        }
        Ok(candle)
    }

    /// Upsert a decoded candle. Closed candles are keyed by `open_time`, so a
    /// retransmission overwrites instead of appending.
    pub(crate) fn apply_candle(&self, candle: Candle) {
        let mut window = self.window.write();
        if candle.is_closed {
            window.candles.insert(candle.open_time, candle.clone());
            self.trim(&mut window);
        }
        window.current = Some(candle);
    }

    // -------------------------------------------------------------------------
    // Subscribers
    // -------------------------------------------------------------------------

    /// Register a subscriber and hand back the current snapshot.
    ///
    /// Returns `None` once the stream has shut down; the caller must build a
    /// fresh stream instead.
    pub fn subscribe(&self, callbacks: ChartCallbacks) -> Option<(SubscriptionId, ChartSnapshot)> {
        if self.is_closed() {
            return None;
        }
        let id = Uuid::new_v4();
        self.subscribers.write().insert(id, callbacks);
        debug!(key = %self.key, subscription = %id, "subscriber attached");
        Some((id, self.snapshot()))
    }

    /// Remove a subscriber. Returns the number of subscribers left, or `None`
    /// when `id` was not attached. The last unsubscribe closes the transport.
    pub fn unsubscribe(&self, id: &SubscriptionId) -> Option<usize> {
        let remaining = {
            let mut subs = self.subscribers.write();
            subs.remove(id)?;
            subs.len()
        };
        debug!(key = %self.key, subscription = %id, remaining, "subscriber detached");

        if remaining == 0 {
            self.shutdown();
        }
        Some(remaining)
    }

    /// Close the transport and refuse further subscribers. Idempotent.
    pub fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(key = %self.key, "chart stream shutting down");
            self.transport.close();
        }
    }

    // -------------------------------------------------------------------------
    // Snapshot & notifications
    // -------------------------------------------------------------------------

    pub fn snapshot(&self) -> ChartSnapshot {
        let window = self.window.read();
        let current = window.current.clone();
        ChartSnapshot {
            symbol: self.key.symbol.clone(),
            interval: self.key.interval.clone(),
            candles: window.candles.values().rev().cloned().collect(),
            current_price: current.as_ref().map(|c| c.close),
            current,
            last_closed: window.candles.last_key_value().map(|(_, c)| c.clone()),
        }
    }

    fn callbacks(&self) -> Vec<ChartCallbacks> {
        self.subscribers.read().values().cloned().collect()
    }

    pub fn notify_update(&self) {
        let snapshot = self.snapshot();
        for cb in self.callbacks() {
            if let Some(f) = &cb.on_update {
                f(&snapshot);
            }
        }
    }

    pub fn notify_error(&self, err: &SyncError) {
        for cb in self.callbacks() {
            if let Some(f) = &cb.on_error {
                f(err);
            }
        }
    }

    /// Transport went away: shut down and tell every subscriber once.
    ///
    /// Returns the ids of the subscriptions that were dropped.
    pub fn notify_close(&self) -> Vec<SubscriptionId> {
        self.shutdown();
        let subscribers: Vec<(SubscriptionId, ChartCallbacks)> = self.subscribers.write().drain().collect();
        let mut dropped = Vec::with_capacity(subscribers.len());
        for (id, cb) in subscribers {
            if let Some(f) = &cb.on_close {
                f();
            }
            dropped.push(id);
        }
        dropped
    }
}

impl std::fmt::Debug for ChartStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChartStream")
            .field("key", &self.key)
            .field("limit", &self.limit)
            .field("accumulate", &self.accumulate)
            .field("candles", &self.len())
            .field("subscribers", &self.subscriber_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
