//! Mock collaborators shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Method;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::binance::RestClient;
use crate::error::{SyncError, SyncResult};
use crate::transport::{Connection, Outbound, StreamTransport, TransportEvent, TransportHandle};

// ---------------------------------------------------------------------------
// REST
// ---------------------------------------------------------------------------

type Reply = SyncResult<Value>;

/// Scripted [`RestClient`]: sticky replies per endpoint, optional one-shot
/// replies per `(method, endpoint)`, and call counters.
#[derive(Default)]
pub struct MockRest {
    sticky: Mutex<HashMap<String, Reply>>,
    queued: Mutex<HashMap<(Method, String), VecDeque<Reply>>>,
    calls: Mutex<HashMap<(Method, String), usize>>,
    params: Mutex<HashMap<String, Vec<(String, String)>>>,
    latency: Mutex<Option<Duration>>,
}

impl MockRest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, endpoint: &str, body: Value) {
        self.sticky.lock().insert(endpoint.to_string(), Ok(body));
    }

    pub fn fail(&self, endpoint: &str, err: SyncError) {
        self.sticky.lock().insert(endpoint.to_string(), Err(err));
    }

    pub fn queue(&self, method: Method, endpoint: &str, reply: Reply) {
        self.queued
            .lock()
            .entry((method, endpoint.to_string()))
            .or_default()
            .push_back(reply);
    }

    pub fn with_latency(self, latency: Duration) -> Self {
        *self.latency.lock() = Some(latency);
        self
    }

    pub fn calls(&self, method: Method, endpoint: &str) -> usize {
        self.calls
            .lock()
            .get(&(method, endpoint.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn last_params(&self, endpoint: &str) -> Option<Vec<(String, String)>> {
        self.params.lock().get(endpoint).cloned()
    }

    /// `count` closed one-bar rows starting at `start`, closes 100, 101, ...
    pub fn kline_rows(start: i64, count: usize, step: i64) -> Value {
        let rows: Vec<Value> = (0..count)
            .map(|i| {
                let open_time = start + i as i64 * step;
                let close = format!("{:.1}", 100.0 + i as f64);
                json!([
                    open_time, close, close, close, close, "1.0",
                    open_time + step - 1, "100.0", 10, "0.5", "50.0", "0"
                ])
            })
            .collect();
        Value::Array(rows)
    }
}

#[async_trait]
impl RestClient for MockRest {
    async fn send(&self, method: Method, endpoint: &str, params: &[(&str, String)]) -> Reply {
        *self
            .calls
            .lock()
            .entry((method.clone(), endpoint.to_string()))
            .or_default() += 1;
        self.params.lock().insert(
            endpoint.to_string(),
            params.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
        );

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let queued = self
            .queued
            .lock()
            .get_mut(&(method, endpoint.to_string()))
            .and_then(VecDeque::pop_front);
        if let Some(reply) = queued {
            return reply;
        }

        self.sticky
            .lock()
            .get(endpoint)
            .cloned()
            .unwrap_or_else(|| Err(SyncError::Transport(format!("no mock reply for {endpoint}"))))
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// One socket handed out by [`MockTransport`].
pub struct MockSocket {
    pub url: String,
    pub handle: TransportHandle,
    events: mpsc::UnboundedSender<TransportEvent>,
    outbound: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
}

impl MockSocket {
    pub fn push(&self, text: impl Into<String>) {
        let _ = self.events.send(TransportEvent::Message(text.into()));
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    /// Frames the core sent on this socket. Can be taken once.
    pub fn take_outbound(&self) -> mpsc::UnboundedReceiver<Outbound> {
        self.outbound
            .lock()
            .take()
            .expect("outbound receiver already taken")
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }
}

/// Scripted [`StreamTransport`] that records every socket it opens.
pub struct MockTransport {
    connects: AtomicUsize,
    sockets: Mutex<Vec<Arc<MockSocket>>>,
    auto_open: bool,
    failures: Mutex<VecDeque<SyncError>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            connects: AtomicUsize::new(0),
            sockets: Mutex::new(Vec::new()),
            auto_open: true,
            failures: Mutex::new(VecDeque::new()),
        }
    }

    /// Sockets stay silent until the test emits `Open` itself.
    pub fn manual_open(mut self) -> Self {
        self.auto_open = false;
        self
    }

    pub fn fail_next_connect(&self, err: SyncError) {
        self.failures.lock().push_back(err);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn socket(&self, index: usize) -> Arc<MockSocket> {
        self.sockets.lock()[index].clone()
    }

    pub fn last_socket(&self) -> Arc<MockSocket> {
        self.sockets
            .lock()
            .last()
            .cloned()
            .expect("no socket opened yet")
    }
}

#[async_trait]
impl StreamTransport for MockTransport {
    async fn connect(&self, url: &str) -> SyncResult<Connection> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.failures.lock().pop_front() {
            return Err(err);
        }

        let (handle, outbound) = TransportHandle::channel(url);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        if self.auto_open {
            let _ = events_tx.send(TransportEvent::Open);
        }

        self.sockets.lock().push(Arc::new(MockSocket {
            url: url.to_string(),
            handle: handle.clone(),
            events: events_tx,
            outbound: Mutex::new(Some(outbound)),
        }));

        Ok(Connection {
            handle,
            events: events_rx,
        })
    }
}

/// Kline delta as the exchange streams it.
pub fn kline_delta(symbol: &str, interval: &str, open_time: i64, close: f64, closed: bool) -> String {
    json!({
        "e": "kline",
        "E": open_time + 1,
        "s": symbol,
        "k": {
            "t": open_time,
            "T": open_time + 59_999,
            "s": symbol,
            "i": interval,
            "o": "100.0",
            "c": close.to_string(),
            "h": "200.0",
            "l": "50.0",
            "v": "3.5",
            "n": 7,
            "x": closed,
            "q": "350.0"
        }
    })
    .to_string()
}

/// Let spawned tasks drain their channels.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}
