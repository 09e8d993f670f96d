// =============================================================================
// ChartCache — one live ChartStream per (symbol, interval)
// =============================================================================
//
// Concurrent first-time requests for the same key are serialised through a
// per-key async gate, so only one bootstrap (REST fetch + socket open) runs.
// A failed bootstrap leaves nothing cached; the next waiter retries.
// =============================================================================

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::error::SyncResult;
use crate::market_data::candle::ChartKey;
use crate::market_data::chart_stream::{ChartCallbacks, ChartSnapshot, ChartStream, SubscriptionId};

type Gate = Arc<tokio::sync::Mutex<()>>;

#[derive(Default)]
pub struct ChartCache {
    streams: RwLock<HashMap<ChartKey, Arc<ChartStream>>>,
    gates: Mutex<HashMap<ChartKey, Gate>>,
}

impl ChartCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ChartKey) -> Option<Arc<ChartStream>> {
        self.streams.read().get(key).cloned()
    }

    pub fn contains(&self, key: &ChartKey) -> bool {
        self.streams.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.streams.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the live stream for `key`, creating it with `create` if absent.
    pub async fn get_or_create<F, Fut>(&self, key: &ChartKey, create: F) -> SyncResult<Arc<ChartStream>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SyncResult<Arc<ChartStream>>>,
    {
        if let Some(stream) = self.live(key) {
            return Ok(stream);
        }

        let gate = self.gates.lock().entry(key.clone()).or_default().clone();
        let result = {
            let _guard = gate.lock().await;
            match self.live(key) {
                Some(stream) => Ok(stream),
                None => {
                    debug!(key = %key, "creating chart stream");
                    create().await.map(|stream| {
                        self.streams.write().insert(key.clone(), stream.clone());
                        stream
                    })
                }
            }
        };

        // Drop the gate once nobody else is waiting on it.
        let mut gates = self.gates.lock();
        if gates.get(key).is_some_and(|g| Arc::ptr_eq(g, &gate) && Arc::strong_count(g) == 2) {
            gates.remove(key);
        }
        result
    }

    fn live(&self, key: &ChartKey) -> Option<Arc<ChartStream>> {
        self.get(key).filter(|s| !s.is_closed())
    }

    /// Attach a subscriber to an existing live stream.
    ///
    /// `None` when the key is not cached or its stream is shutting down.
    pub fn attach(&self, key: &ChartKey, callbacks: ChartCallbacks) -> Option<(SubscriptionId, ChartSnapshot)> {
        let streams = self.streams.read();
        let stream = streams.get(key)?;
        stream.subscribe(callbacks)
    }

    /// Detach a subscriber; evicts the stream when it was the last one.
    ///
    /// Returns `false` when the subscription was not attached to `key`.
    pub fn detach(&self, key: &ChartKey, id: &SubscriptionId) -> bool {
        let mut streams = self.streams.write();
        let Some(stream) = streams.get(key).cloned() else {
            return false;
        };
        match stream.unsubscribe(id) {
            Some(0) => {
                streams.remove(key);
                debug!(key = %key, "chart stream evicted after last unsubscribe");
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Remove `stream` if it is still the cached entry for `key`.
    pub fn evict(&self, key: &ChartKey, stream: &Arc<ChartStream>) -> bool {
        let mut streams = self.streams.write();
        if streams.get(key).is_some_and(|s| Arc::ptr_eq(s, stream)) {
            streams.remove(key);
            debug!(key = %key, "chart stream evicted");
            return true;
        }
        false
    }

    /// Shut down and forget every stream.
    pub fn clear(&self) {
        let drained: Vec<Arc<ChartStream>> = self.streams.write().drain().map(|(_, s)| s).collect();
        for stream in drained {
            stream.notify_close();
        }
    }
}
