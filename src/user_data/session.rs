// =============================================================================
// UserDataSession — authenticated private event stream
// =============================================================================
//
// Lifecycle of one session generation:
//   issue listen key → connect (Connecting) → start (Open) → events...
//     keep-alive: PUT listenKey every `keep_alive_interval`
//     token expired: open the next generation under the same handle, then
//                    retire this one (no on_close for the caller)
//     close():     revoke the key, close the socket, fire on_close once
//
// The `SessionTable` maps each stable `SessionHandle` to its current
// generation; anything acting on behalf of a session first checks it is
// still current.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::binance::endpoints::{close_listen_key, create_listen_key, keepalive_listen_key};
use crate::binance::RestClient;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::transport::{StreamTransport, TransportEvent, TransportHandle};
use crate::user_data::events::{decode_frame, positions_from_result, InboundFrame, PositionRisk, UserDataEvent};

/// Stable identifier handed to the caller; survives token replacement.
pub type SessionHandle = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    /// Socket is up but the pump and keep-alive have not started yet.
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

pub type LifecycleFn = Arc<dyn Fn(SessionHandle) + Send + Sync>;
pub type DataFn = Arc<dyn Fn(&UserDataEvent) + Send + Sync>;
pub type SessionErrorFn = Arc<dyn Fn(&SyncError) + Send + Sync>;

#[derive(Clone, Default)]
pub struct SessionCallbacks {
    pub on_open: Option<LifecycleFn>,
    pub on_data: Option<DataFn>,
    pub on_error: Option<SessionErrorFn>,
    pub on_close: Option<LifecycleFn>,
    pub on_reconnecting: Option<LifecycleFn>,
    pub on_reconnected: Option<LifecycleFn>,
}

impl SessionCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_open(mut self, f: impl Fn(SessionHandle) + Send + Sync + 'static) -> Self {
        self.on_open = Some(Arc::new(f));
        self
    }

    pub fn on_data(mut self, f: impl Fn(&UserDataEvent) + Send + Sync + 'static) -> Self {
        self.on_data = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&SyncError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_close(mut self, f: impl Fn(SessionHandle) + Send + Sync + 'static) -> Self {
        self.on_close = Some(Arc::new(f));
        self
    }

    pub fn on_reconnecting(mut self, f: impl Fn(SessionHandle) + Send + Sync + 'static) -> Self {
        self.on_reconnecting = Some(Arc::new(f));
        self
    }

    pub fn on_reconnected(mut self, f: impl Fn(SessionHandle) + Send + Sync + 'static) -> Self {
        self.on_reconnected = Some(Arc::new(f));
        self
    }

    fn lifecycle(f: &Option<LifecycleFn>, handle: SessionHandle) {
        if let Some(f) = f {
            f(handle);
        }
    }
}

#[derive(Clone)]
pub struct SessionOptions {
    /// Ping the listen key periodically so it does not lapse.
    pub keep_alive: bool,
    pub callbacks: SessionCallbacks,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            keep_alive: true,
            callbacks: SessionCallbacks::default(),
        }
    }
}

impl SessionOptions {
    pub fn with_callbacks(callbacks: SessionCallbacks) -> Self {
        Self {
            callbacks,
            ..Self::default()
        }
    }
}

/// Collaborators every session generation needs.
#[derive(Clone)]
pub struct SessionContext {
    pub rest: Arc<dyn RestClient>,
    pub transport: Arc<dyn StreamTransport>,
    pub config: Arc<SyncConfig>,
    pub table: Arc<SessionTable>,
}

/// Outcome of one position request on one generation.
enum PositionReply {
    Positions(Vec<PositionRisk>),
    Empty,
    TimedOut,
    /// The responder was dropped: the generation was retired or closed.
    Dropped,
}

// =============================================================================
// SessionTable
// =============================================================================

#[derive(Default)]
pub struct SessionTable {
    sessions: RwLock<HashMap<SessionHandle, Arc<UserDataSession>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, handle: &SessionHandle) -> Option<Arc<UserDataSession>> {
        self.sessions.read().get(handle).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn handles(&self) -> Vec<SessionHandle> {
        self.sessions.read().keys().copied().collect()
    }

    fn register(&self, session: Arc<UserDataSession>) {
        self.sessions.write().insert(session.handle, session);
    }

    fn is_current(&self, session: &UserDataSession) -> bool {
        self.sessions
            .read()
            .get(&session.handle)
            .is_some_and(|s| std::ptr::eq(Arc::as_ptr(s), session))
    }

    /// Swap `old` for `next` only if `old` is still the registered generation.
    fn replace_if_current(&self, old: &UserDataSession, next: Arc<UserDataSession>) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.get_mut(&old.handle) {
            Some(slot) if std::ptr::eq(Arc::as_ptr(slot), old) => {
                *slot = next;
                true
            }
            _ => false,
        }
    }

    fn remove_if_current(&self, session: &UserDataSession) -> bool {
        let mut sessions = self.sessions.write();
        if sessions
            .get(&session.handle)
            .is_some_and(|s| std::ptr::eq(Arc::as_ptr(s), session))
        {
            sessions.remove(&session.handle);
            return true;
        }
        false
    }
}

/// Issue a listen key, connect and register a new session.
///
/// Fires `on_open` once the socket is confirmed open. The returned handle
/// stays valid across token replacements until the session closes.
pub async fn open_session(ctx: SessionContext, options: SessionOptions) -> SyncResult<SessionHandle> {
    let handle = Uuid::new_v4();
    let (session, events) = UserDataSession::connect(ctx.clone(), handle, options, 0).await?;

    ctx.table.register(session.clone());
    session.start(events);
    info!(session = %handle, "user data session opened");
    SessionCallbacks::lifecycle(&session.options.callbacks.on_open, handle);
    Ok(handle)
}

// =============================================================================
// UserDataSession
// =============================================================================

pub struct UserDataSession {
    handle: SessionHandle,
    generation: u32,
    listen_key: String,
    transport: TransportHandle,
    options: SessionOptions,
    ctx: SessionContext,
    state: RwLock<SessionState>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Value>>>,
    closed: AtomicBool,
}

impl UserDataSession {
    async fn connect(
        ctx: SessionContext,
        handle: SessionHandle,
        options: SessionOptions,
        generation: u32,
    ) -> SyncResult<(Arc<Self>, mpsc::UnboundedReceiver<TransportEvent>)> {
        let listen_key = create_listen_key(ctx.rest.as_ref()).await?;
        let url = ctx.config.user_stream_url(&listen_key);
        let conn = ctx.transport.connect(&url).await?.opened().await?;

        debug!(session = %handle, generation, "user data socket open");
        let session = Arc::new(Self {
            handle,
            generation,
            listen_key,
            transport: conn.handle,
            options,
            ctx,
            state: RwLock::new(SessionState::Connecting),
            keepalive: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });
        Ok((session, conn.events))
    }

    /// Mark the generation live and spawn its pump and keep-alive.
    fn start(self: &Arc<Self>, events: mpsc::UnboundedReceiver<TransportEvent>) {
        self.set_state(SessionState::Open);
        tokio::spawn(self.clone().pump(events));
        if self.options.keep_alive {
            self.spawn_keepalive();
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn listen_key(&self) -> &str {
        &self.listen_key
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: SessionState) {
        *self.state.write() = state;
    }

    fn emit_error(&self, err: &SyncError) {
        if let Some(f) = &self.options.callbacks.on_error {
            f(err);
        }
    }

    // -------------------------------------------------------------------------
    // Inbound frames
    // -------------------------------------------------------------------------

    async fn pump(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Open => {}
                TransportEvent::Message(text) => {
                    if self.on_message(&text) {
                        self.replace().await;
                        return;
                    }
                }
                TransportEvent::Error(e) => {
                    warn!(session = %self.handle, error = %e, "user data socket error");
                    self.emit_error(&SyncError::Transport(e));
                }
                TransportEvent::Closed => break,
            }
        }

        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(session = %self.handle, "user data socket closed by peer");
            self.teardown();
            self.ctx.table.remove_if_current(&self);
            SessionCallbacks::lifecycle(&self.options.callbacks.on_close, self.handle);
        }
    }

    /// Route one frame. Returns `true` when the listen key has expired.
    fn on_message(&self, text: &str) -> bool {
        match decode_frame(text) {
            Ok(InboundFrame::Control { id, result }) => {
                let waiter = self.pending.lock().remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(result);
                    }
                    None => debug!(session = %self.handle, id = %id, "dropping stale control response"),
                }
                false
            }
            Ok(InboundFrame::Event(UserDataEvent::TokenExpired { .. })) => true,
            Ok(InboundFrame::Event(event)) => {
                debug!(session = %self.handle, event = event.event_type(), "user data event");
                if let Some(f) = &self.options.callbacks.on_data {
                    f(&event);
                }
                false
            }
            Err(e) => {
                warn!(session = %self.handle, error = %e, "undecodable user data frame");
                self.emit_error(&e);
                false
            }
        }
    }

    // -------------------------------------------------------------------------
    // Token replacement
    // -------------------------------------------------------------------------

    async fn replace(self: &Arc<Self>) {
        if self.is_closed() || !self.ctx.table.is_current(self) {
            debug!(session = %self.handle, "token expiry on a retired session ignored");
            return;
        }

        info!(session = %self.handle, generation = self.generation, "listen key expired, replacing session");
        self.set_state(SessionState::Reconnecting);
        let callbacks = &self.options.callbacks;
        SessionCallbacks::lifecycle(&callbacks.on_reconnecting, self.handle);

        let next = UserDataSession::connect(
            self.ctx.clone(),
            self.handle,
            self.options.clone(),
            self.generation + 1,
        )
        .await;

        match next {
            Ok((next, events)) => {
                if !self.ctx.table.replace_if_current(self, next.clone()) {
                    debug!(session = %self.handle, "session closed during replacement");
                    next.retire();
                    return;
                }
                next.start(events);
                self.retire();
                info!(session = %self.handle, generation = next.generation, "user data session replaced");
                SessionCallbacks::lifecycle(&callbacks.on_reconnected, self.handle);
            }
            Err(e) => {
                error!(session = %self.handle, error = %e, "failed to replace expired session");
                self.emit_error(&e);
                self.close().await;
            }
        }
    }

    /// Shut this generation down silently; its successor carries on.
    fn retire(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.teardown();
            self.transport.close();
        }
    }

    fn teardown(&self) {
        self.set_state(SessionState::Closed);
        if let Some(task) = self.keepalive.lock().take() {
            task.abort();
        }
        // Dropping the responders fails every waiter.
        self.pending.lock().clear();
    }

    // -------------------------------------------------------------------------
    // Keep-alive
    // -------------------------------------------------------------------------

    fn spawn_keepalive(self: &Arc<Self>) {
        let every = self.ctx.config.keep_alive_interval();
        let validity = std::time::Duration::from_secs(self.ctx.config.token_validity_secs);
        if every >= validity {
            warn!(
                session = %self.handle,
                every_secs = every.as_secs(),
                validity_secs = validity.as_secs(),
                "keep-alive interval does not beat listen key validity"
            );
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let rest = self.ctx.rest.clone();
        let task = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + every, every);
            loop {
                ticker.tick().await;
                let Some(session) = weak.upgrade() else { break };
                if session.is_closed() {
                    break;
                }
                match keepalive_listen_key(rest.as_ref()).await {
                    Ok(()) => debug!(session = %session.handle, "listen key extended"),
                    Err(e) if e.is_token_missing() => {
                        warn!(session = %session.handle, error = %e, "listen key no longer exists");
                        session.emit_error(&e);
                    }
                    Err(e) => debug!(session = %session.handle, error = %e, "keep-alive ping failed, ignoring"),
                }
            }
        });
        *self.keepalive.lock() = Some(task);
    }

    // -------------------------------------------------------------------------
    // Correlated requests
    // -------------------------------------------------------------------------

    /// Ask the stream for the account's current positions.
    ///
    /// Each attempt sends a fresh request id and owns one retry-delay window.
    /// An empty or malformed response, or silence until the window ends,
    /// fails the attempt and the next one starts when the window is over.
    /// Once every attempt has failed, [`SyncError::LoadFailed`] is returned
    /// after exactly `attempts × delay`, never later.
    ///
    /// A request still in flight when the listen key is replaced is re-sent
    /// on the new generation within the same window.
    pub async fn request_positions(&self) -> SyncResult<Vec<PositionRisk>> {
        let attempts = self.ctx.config.request_retry_attempts.max(1);
        let delay = self.ctx.config.request_retry_delay();

        for attempt in 1..=attempts {
            let deadline = Instant::now() + delay;
            let reply = loop {
                let current = self.ctx.table.get(&self.handle);
                let target = current.as_deref().unwrap_or(self);
                match target.send_position_request(deadline).await? {
                    PositionReply::Dropped if self.has_successor(target) => {
                        debug!(session = %self.handle, attempt, "session replaced mid-request, re-sending");
                    }
                    reply => break reply,
                }
            };

            match reply {
                PositionReply::Positions(positions) => {
                    debug!(session = %self.handle, attempt, count = positions.len(), "positions loaded");
                    return Ok(positions);
                }
                PositionReply::Empty => warn!(session = %self.handle, attempt, "empty position response"),
                PositionReply::TimedOut => warn!(session = %self.handle, attempt, "position request timed out"),
                PositionReply::Dropped => {
                    return Err(SyncError::Transport(
                        "session closed while a position request was pending".into(),
                    ))
                }
            }

            // A failed attempt ends with its window; a timeout already has.
            time::sleep_until(deadline).await;
        }

        error!(session = %self.handle, attempts, "position request failed");
        Err(SyncError::LoadFailed { attempts })
    }

    /// Whether a generation other than `target` is now registered for this handle.
    fn has_successor(&self, target: &UserDataSession) -> bool {
        self.ctx
            .table
            .get(&self.handle)
            .is_some_and(|s| !std::ptr::eq(Arc::as_ptr(&s), target))
    }

    async fn send_position_request(&self, deadline: Instant) -> SyncResult<PositionReply> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id.clone(), tx);

        let frame = json!({
            "id": id,
            "method": "REQUEST",
            "params": [format!("{}@position", self.listen_key)],
        });
        if let Err(e) = self.transport.send(frame.to_string()) {
            self.pending.lock().remove(&id);
            return Err(e);
        }

        let outcome = time::timeout_at(deadline, rx).await;
        self.pending.lock().remove(&id);

        Ok(match outcome {
            Ok(Ok(result)) => match positions_from_result(&result) {
                Some(positions) => PositionReply::Positions(positions),
                None => PositionReply::Empty,
            },
            Ok(Err(_)) => PositionReply::Dropped,
            Err(_) => PositionReply::TimedOut,
        })
    }

    // -------------------------------------------------------------------------
    // Close
    // -------------------------------------------------------------------------

    /// Close the session. Idempotent; `on_close` fires once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.set_state(SessionState::Closed);
        let keepalive = self.keepalive.lock().take();
        if let Some(task) = keepalive {
            task.abort();
            let _ = task.await;
        }
        self.pending.lock().clear();
        self.ctx.table.remove_if_current(self);
        self.transport.close();

        if let Err(e) = close_listen_key(self.ctx.rest.as_ref()).await {
            warn!(session = %self.handle, error = %e, "failed to revoke listen key");
        }

        info!(session = %self.handle, "user data session closed");
        SessionCallbacks::lifecycle(&self.options.callbacks.on_close, self.handle);
    }
}

impl std::fmt::Debug for UserDataSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserDataSession")
            .field("handle", &self.handle)
            .field("generation", &self.generation)
            .field("state", &self.state())
            .field("pending", &self.pending.lock().len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binance::endpoints::LISTEN_KEY;
    use crate::testkit::{settle, MockRest, MockSocket, MockTransport};
    use crate::transport::Outbound;
    use reqwest::Method;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Harness {
        rest: Arc<MockRest>,
        transport: Arc<MockTransport>,
        ctx: SessionContext,
    }

    fn harness() -> Harness {
        let rest = Arc::new(MockRest::new());
        rest.respond(LISTEN_KEY, json!({"listenKey": "key-1"}));
        let transport = Arc::new(MockTransport::new());
        let ctx = SessionContext {
            rest: rest.clone(),
            transport: transport.clone(),
            config: Arc::new(SyncConfig::default()),
            table: Arc::new(SessionTable::new()),
        };
        Harness { rest, transport, ctx }
    }

    #[derive(Default)]
    struct Counters {
        open: AtomicUsize,
        data: AtomicUsize,
        error: AtomicUsize,
        close: AtomicUsize,
        reconnecting: AtomicUsize,
        reconnected: AtomicUsize,
    }

    fn counting(c: &Arc<Counters>) -> SessionOptions {
        let (a, b, d, e, f, g) = (c.clone(), c.clone(), c.clone(), c.clone(), c.clone(), c.clone());
        SessionOptions::with_callbacks(
            SessionCallbacks::new()
                .on_open(move |_| {
                    a.open.fetch_add(1, Ordering::SeqCst);
                })
                .on_data(move |_| {
                    b.data.fetch_add(1, Ordering::SeqCst);
                })
                .on_error(move |_| {
                    d.error.fetch_add(1, Ordering::SeqCst);
                })
                .on_close(move |_| {
                    e.close.fetch_add(1, Ordering::SeqCst);
                })
                .on_reconnecting(move |_| {
                    f.reconnecting.fetch_add(1, Ordering::SeqCst);
                })
                .on_reconnected(move |_| {
                    g.reconnected.fetch_add(1, Ordering::SeqCst);
                }),
        )
    }

    fn get(c: &AtomicUsize) -> usize {
        c.load(Ordering::SeqCst)
    }

    /// Answer every position request on `socket` with `result`.
    fn answer_requests(socket: Arc<MockSocket>, result: Value) -> Arc<AtomicUsize> {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let mut outbound = socket.take_outbound();
        tokio::spawn(async move {
            while let Some(Outbound::Text(text)) = outbound.recv().await {
                let req: Value = serde_json::from_str(&text).unwrap();
                assert_eq!(req["method"], "REQUEST");
                counter.fetch_add(1, Ordering::SeqCst);
                socket.push(json!({"id": req["id"], "result": result}).to_string());
            }
        });
        seen
    }

    fn order_update() -> String {
        json!({"e": "ORDER_TRADE_UPDATE", "E": 1, "T": 1, "o": {"s": "BTCUSDT", "i": 7, "X": "FILLED"}})
            .to_string()
    }

    #[tokio::test]
    async fn open_connects_to_listen_key_stream_and_routes_events() {
        let h = harness();
        let c = Arc::new(Counters::default());
        let handle = open_session(h.ctx.clone(), counting(&c)).await.unwrap();

        let socket = h.transport.last_socket();
        assert_eq!(socket.url, "wss://fstream.binance.com/ws/key-1");
        assert_eq!(get(&c.open), 1);
        assert_eq!(h.ctx.table.get(&handle).unwrap().state(), SessionState::Open);

        socket.push(order_update());
        socket.push("garbage");
        settle().await;
        assert_eq!(get(&c.data), 1);
        assert_eq!(get(&c.error), 1);
    }

    #[tokio::test]
    async fn open_fails_without_listen_key() {
        let h = harness();
        h.rest.respond(LISTEN_KEY, json!({"code": -2015, "msg": "Invalid API-key"}));
        let err = open_session(h.ctx.clone(), SessionOptions::default()).await.unwrap_err();
        assert!(matches!(err, SyncError::Exchange { code: -2015, .. }));
        assert_eq!(h.transport.connects(), 0);
        assert!(h.ctx.table.is_empty());
    }

    #[tokio::test]
    async fn request_positions_resolves_matching_response() {
        let h = harness();
        let handle = open_session(h.ctx.clone(), SessionOptions::default()).await.unwrap();
        let result = json!([{"req": "key-1@position", "res": {"positions": [
            {"symbol": "BTCUSDT", "positionAmt": "0.5", "entryPrice": "30000", "leverage": "20"}
        ]}}]);
        let seen = answer_requests(h.transport.last_socket(), result);

        let session = h.ctx.table.get(&handle).unwrap();
        let positions = session.request_positions().await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].position_amt, 0.5);
        assert_eq!(get(&seen), 1);
        assert!(session.pending.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn request_positions_gives_up_after_three_empty_responses() {
        let h = harness();
        let handle = open_session(h.ctx.clone(), SessionOptions::default()).await.unwrap();
        let seen = answer_requests(h.transport.last_socket(), json!([]));

        let session = h.ctx.table.get(&handle).unwrap();
        let started = Instant::now();
        let err = session.request_positions().await.unwrap_err();
        let elapsed = started.elapsed();

        assert_eq!(err, SyncError::LoadFailed { attempts: 3 });
        assert_eq!(get(&seen), 3);
        assert!(elapsed >= Duration::from_secs(15), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(15_100), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn silent_socket_fails_within_the_retry_budget() {
        let h = harness();
        let handle = open_session(h.ctx.clone(), SessionOptions::default()).await.unwrap();
        let mut outbound = h.transport.last_socket().take_outbound();

        let session = h.ctx.table.get(&handle).unwrap();
        let started = Instant::now();
        let err = session.request_positions().await.unwrap_err();
        let elapsed = started.elapsed();

        assert_eq!(err, SyncError::LoadFailed { attempts: 3 });
        assert!(elapsed >= Duration::from_secs(15), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(15_100), "{elapsed:?}");

        let mut sent = 0;
        while let Ok(Outbound::Text(_)) = outbound.try_recv() {
            sent += 1;
        }
        assert_eq!(sent, 3);
        assert!(session.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn pending_request_follows_token_replacement() {
        let h = harness();
        let handle = open_session(h.ctx.clone(), SessionOptions::default()).await.unwrap();
        let first = h.transport.last_socket();
        let session = h.ctx.table.get(&handle).unwrap();

        let requester = session.clone();
        let task = tokio::spawn(async move { requester.request_positions().await });
        settle().await;
        assert_eq!(session.pending.lock().len(), 1);

        h.rest.queue(Method::POST, LISTEN_KEY, Ok(json!({"listenKey": "key-2"})));
        first.push(json!({"e": "listenKeyExpired", "E": 1}).to_string());
        settle().await;

        let second = h.transport.last_socket();
        assert_eq!(second.url, "wss://fstream.binance.com/ws/key-2");
        let result = json!([{"req": "key-2@position", "res": {"positions": [
            {"symbol": "ETHUSDT", "positionAmt": "-1.5", "entryPrice": "2000"}
        ]}}]);
        let seen = answer_requests(second, result);

        let positions = task.await.unwrap().unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].symbol, "ETHUSDT");
        assert_eq!(positions[0].position_amt, -1.5);
        assert_eq!(get(&seen), 1);
        assert!(session.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn generation_is_connecting_until_started() {
        let h = harness();
        let (session, events) = UserDataSession::connect(h.ctx.clone(), Uuid::new_v4(), SessionOptions::default(), 0)
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Connecting);

        session.start(events);
        assert_eq!(session.state(), SessionState::Open);
        session.retire();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_responses_are_ignored() {
        let h = harness();
        let handle = open_session(h.ctx.clone(), SessionOptions::default()).await.unwrap();
        let socket = h.transport.last_socket();
        socket.push(json!({"id": "not-ours", "result": []}).to_string());
        settle().await;

        let session = h.ctx.table.get(&handle).unwrap();
        assert!(session.pending.lock().is_empty());
        assert_eq!(session.state(), SessionState::Open);
    }

    #[tokio::test]
    async fn close_fails_pending_request() {
        let h = harness();
        let handle = open_session(h.ctx.clone(), SessionOptions::default()).await.unwrap();
        let session = h.ctx.table.get(&handle).unwrap();

        let requester = session.clone();
        let task = tokio::spawn(async move { requester.request_positions().await });
        settle().await;
        assert_eq!(session.pending.lock().len(), 1);

        session.close().await;
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, SyncError::Transport(_)));
    }

    #[tokio::test]
    async fn token_expiry_replaces_session_under_same_handle() {
        let h = harness();
        let c = Arc::new(Counters::default());
        let handle = open_session(h.ctx.clone(), counting(&c)).await.unwrap();
        let first = h.transport.last_socket();
        h.rest.queue(Method::POST, LISTEN_KEY, Ok(json!({"listenKey": "key-2"})));

        first.push(json!({"e": "listenKeyExpired", "E": 1}).to_string());
        settle().await;

        assert_eq!(h.transport.connects(), 2);
        assert!(first.is_closed());
        let second = h.transport.last_socket();
        assert_eq!(second.url, "wss://fstream.binance.com/ws/key-2");

        let current = h.ctx.table.get(&handle).unwrap();
        assert_eq!(current.generation(), 1);
        assert_eq!(current.listen_key(), "key-2");
        assert_eq!(current.state(), SessionState::Open);
        assert_eq!(
            (get(&c.open), get(&c.reconnecting), get(&c.reconnected), get(&c.close)),
            (1, 1, 1, 0)
        );

        second.push(order_update());
        first.push(order_update());
        settle().await;
        assert_eq!(get(&c.data), 1);
    }

    #[tokio::test]
    async fn failed_replacement_reports_and_closes() {
        let h = harness();
        let c = Arc::new(Counters::default());
        let handle = open_session(h.ctx.clone(), counting(&c)).await.unwrap();
        h.rest.queue(
            Method::POST,
            LISTEN_KEY,
            Err(SyncError::Transport("connection reset".into())),
        );

        h.transport.last_socket().push(json!({"e": "TOKEN_EXPIRED"}).to_string());
        settle().await;

        assert_eq!(get(&c.error), 1);
        assert_eq!(get(&c.close), 1);
        assert!(h.ctx.table.get(&handle).is_none());
        assert!(h.transport.last_socket().is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_pings_every_interval() {
        let h = harness();
        open_session(h.ctx.clone(), SessionOptions::default()).await.unwrap();

        time::sleep(Duration::from_secs(2699)).await;
        settle().await;
        assert_eq!(h.rest.calls(Method::PUT, LISTEN_KEY), 0);

        time::sleep(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(h.rest.calls(Method::PUT, LISTEN_KEY), 1);

        time::sleep(Duration::from_secs(2700)).await;
        settle().await;
        assert_eq!(h.rest.calls(Method::PUT, LISTEN_KEY), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_keep_alive_interval_still_pings() {
        let mut h = harness();
        h.ctx.config = Arc::new(SyncConfig {
            keep_alive_interval_secs: 0,
            ..SyncConfig::default()
        });
        open_session(h.ctx.clone(), SessionOptions::default()).await.unwrap();

        time::sleep(Duration::from_secs(2701)).await;
        settle().await;
        assert_eq!(h.rest.calls(Method::PUT, LISTEN_KEY), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_reports_missing_token_only() {
        let h = harness();
        let c = Arc::new(Counters::default());
        open_session(h.ctx.clone(), counting(&c)).await.unwrap();

        h.rest.queue(Method::PUT, LISTEN_KEY, Err(SyncError::Transport("timeout".into())));
        h.rest.queue(
            Method::PUT,
            LISTEN_KEY,
            Ok(json!({"code": -1125, "msg": "This listenKey does not exist."})),
        );

        time::sleep(Duration::from_secs(2701)).await;
        settle().await;
        assert_eq!(get(&c.error), 0);

        time::sleep(Duration::from_secs(2700)).await;
        settle().await;
        assert_eq!(get(&c.error), 1);
    }

    #[tokio::test]
    async fn keep_alive_disabled_spawns_no_pinger() {
        let h = harness();
        let options = SessionOptions {
            keep_alive: false,
            ..SessionOptions::default()
        };
        let handle = open_session(h.ctx.clone(), options).await.unwrap();
        assert!(h.ctx.table.get(&handle).unwrap().keepalive.lock().is_none());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let h = harness();
        let c = Arc::new(Counters::default());
        let handle = open_session(h.ctx.clone(), counting(&c)).await.unwrap();
        let session = h.ctx.table.get(&handle).unwrap();

        session.close().await;
        session.close().await;

        assert_eq!(get(&c.close), 1);
        assert_eq!(h.rest.calls(Method::DELETE, LISTEN_KEY), 1);
        assert!(h.ctx.table.is_empty());
        assert!(h.transport.last_socket().is_closed());
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.request_positions().await.is_err());
    }

    #[tokio::test]
    async fn remote_close_deregisters_and_notifies() {
        let h = harness();
        let c = Arc::new(Counters::default());
        let handle = open_session(h.ctx.clone(), counting(&c)).await.unwrap();
        let session = h.ctx.table.get(&handle).unwrap();

        h.transport.last_socket().emit(TransportEvent::Closed);
        settle().await;

        assert_eq!(get(&c.close), 1);
        assert!(h.ctx.table.is_empty());
        assert_eq!(session.state(), SessionState::Closed);

        session.close().await;
        assert_eq!(get(&c.close), 1);
    }
}
