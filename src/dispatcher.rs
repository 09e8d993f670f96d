// =============================================================================
// StreamDispatcher — public surface of the sync layer
// =============================================================================
//
// Owns the chart cache and the user session table and routes every
// subscribe/unsubscribe and open/close call to them.
//
// Chart bootstrap order:
//   fetch history → connect → wait for Open → construct → register → attach
// so no delta can arrive before the stream exists to receive it.
//
// Transport close/error events for a chart go into that chart's own
// subscriber fan-out, never straight back to whoever created it.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::binance::endpoints::fetch_klines;
use crate::binance::{FuturesClient, KlineQuery, RestClient};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::market_data::{ChartCache, ChartCallbacks, ChartKey, ChartOptions, ChartSnapshot, ChartStream, SubscriptionId};
use crate::transport::{StreamTransport, TransportEvent, TungsteniteTransport};
use crate::user_data::{
    open_session, PositionRisk, SessionContext, SessionHandle, SessionOptions, SessionState, SessionTable,
};

type SubscriptionIndex = Arc<RwLock<HashMap<SubscriptionId, ChartKey>>>;

/// Largest page the klines endpoint serves.
pub const MAX_KLINE_LIMIT: usize = 1500;

/// Attach attempts before giving up on a stream that keeps closing under us.
const ATTACH_ATTEMPTS: usize = 3;

/// Result of a chart subscription: the id to unsubscribe with and the chart
/// as it stood when the subscriber attached.
#[derive(Debug, Clone, Serialize)]
pub struct ChartSubscription {
    pub id: SubscriptionId,
    pub key: ChartKey,
    pub chart: ChartSnapshot,
}

pub struct StreamDispatcher {
    rest: Arc<dyn RestClient>,
    transport: Arc<dyn StreamTransport>,
    config: Arc<SyncConfig>,
    charts: Arc<ChartCache>,
    subscriptions: SubscriptionIndex,
    sessions: Arc<SessionTable>,
}

impl StreamDispatcher {
    pub fn new(rest: Arc<dyn RestClient>, transport: Arc<dyn StreamTransport>, config: SyncConfig) -> Self {
        Self {
            rest,
            transport,
            config: Arc::new(config),
            charts: Arc::new(ChartCache::new()),
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            sessions: Arc::new(SessionTable::new()),
        }
    }

    /// Dispatcher wired to the live exchange.
    pub fn connect_live(config: SyncConfig, api_key: &str, api_secret: &str) -> SyncResult<Self> {
        let rest = FuturesClient::new(api_key, api_secret, &config)?;
        Ok(Self::new(Arc::new(rest), Arc::new(TungsteniteTransport), config))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn chart_count(&self) -> usize {
        self.charts.len()
    }

    pub fn chart(&self, symbol: &str, interval: &str) -> Option<ChartSnapshot> {
        self.charts
            .get(&ChartKey::new(symbol, interval))
            .map(|stream| stream.snapshot())
    }

    // -------------------------------------------------------------------------
    // Charts
    // -------------------------------------------------------------------------

    /// Subscribe to a `(symbol, interval)` chart.
    ///
    /// Attaches to the cached stream when there is one; otherwise bootstraps
    /// it first. A failed bootstrap is returned and leaves nothing cached.
    pub async fn subscribe_chart(
        &self,
        symbol: &str,
        interval: &str,
        options: ChartOptions,
        callbacks: ChartCallbacks,
    ) -> SyncResult<ChartSubscription> {
        let key = ChartKey::new(symbol, interval);
        if key.symbol.is_empty() || key.interval.trim().is_empty() {
            return Err(SyncError::Validation(format!("invalid chart key {key}")));
        }

        for attempt in 1..=ATTACH_ATTEMPTS {
            self.charts
                .get_or_create(&key, || self.bootstrap(key.clone(), options.clone()))
                .await?;

            if let Some((id, chart)) = self.charts.attach(&key, callbacks.clone()) {
                self.subscriptions.write().insert(id, key.clone());
                debug!(key = %key, subscription = %id, "chart subscription attached");
                return Ok(ChartSubscription { id, key, chart });
            }
            debug!(key = %key, attempt, "chart stream closed before attach, retrying");
        }

        warn!(key = %key, "chart stream closed before the subscriber could attach");
        Err(SyncError::Closed)
    }

    async fn bootstrap(&self, key: ChartKey, options: ChartOptions) -> SyncResult<Arc<ChartStream>> {
        let limit = options
            .limit
            .filter(|l| *l > 0)
            .unwrap_or(self.config.default_chart_limit as usize);
        let query = KlineQuery {
            start_time: options.start_time,
            end_time: options.end_time,
            limit: limit.min(MAX_KLINE_LIMIT) as u32,
        };

        let history = fetch_klines(self.rest.as_ref(), &key.symbol, &key.interval, &query).await?;

        let url = self.config.kline_stream_url(&key.symbol, &key.interval);
        let conn = self.transport.connect(&url).await?.opened().await?;

        info!(key = %key, history = history.len(), "kline stream open");
        let stream = Arc::new(ChartStream::new(key, limit, options.accumulate, history, conn.handle));
        tokio::spawn(pump_chart(
            self.charts.clone(),
            self.subscriptions.clone(),
            stream.clone(),
            conn.events,
        ));
        Ok(stream)
    }

    /// Drop one chart subscription. `false` for an unknown or stale id.
    pub fn unsubscribe_chart(&self, id: &SubscriptionId) -> bool {
        let Some(key) = self.subscriptions.write().remove(id) else {
            debug!(subscription = %id, "unsubscribe for unknown subscription");
            return false;
        };
        self.charts.detach(&key, id)
    }

    // -------------------------------------------------------------------------
    // User data sessions
    // -------------------------------------------------------------------------

    fn session_context(&self) -> SessionContext {
        SessionContext {
            rest: self.rest.clone(),
            transport: self.transport.clone(),
            config: self.config.clone(),
            table: self.sessions.clone(),
        }
    }

    pub async fn open_user_session(&self, options: SessionOptions) -> SyncResult<SessionHandle> {
        open_session(self.session_context(), options).await
    }

    /// Close a session. `false` when the handle is unknown or already closed.
    pub async fn close_user_session(&self, handle: &SessionHandle) -> bool {
        match self.sessions.get(handle) {
            Some(session) => {
                session.close().await;
                true
            }
            None => false,
        }
    }

    pub async fn request_positions(&self, handle: &SessionHandle) -> SyncResult<Vec<PositionRisk>> {
        let session = self.sessions.get(handle).ok_or(SyncError::Closed)?;
        session.request_positions().await
    }

    pub fn session_state(&self, handle: &SessionHandle) -> Option<SessionState> {
        self.sessions.get(handle).map(|s| s.state())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Close every session and chart.
    pub async fn shutdown(&self) {
        for handle in self.sessions.handles() {
            self.close_user_session(&handle).await;
        }
        self.subscriptions.write().clear();
        self.charts.clear();
        info!("dispatcher shut down");
    }
}

/// Route one kline socket's events into its stream until the socket ends.
async fn pump_chart(
    charts: Arc<ChartCache>,
    subscriptions: SubscriptionIndex,
    stream: Arc<ChartStream>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Open => {}
            TransportEvent::Message(text) => {
                // Malformed deltas are already reported to subscribers.
                let _ = stream.apply_update(&text);
            }
            TransportEvent::Error(e) => {
                warn!(key = %stream.key(), error = %e, "kline socket error");
                stream.notify_error(&SyncError::Transport(e));
            }
            TransportEvent::Closed => break,
        }
    }

    if stream.is_closed() {
        debug!(key = %stream.key(), "kline socket closed after shutdown");
        return;
    }
    info!(key = %stream.key(), "kline socket closed by peer");
    charts.evict(stream.key(), &stream);
    let dropped = stream.notify_close();
    let mut subscriptions = subscriptions.write();
    for id in &dropped {
        subscriptions.remove(id);
    }
}
