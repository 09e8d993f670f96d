// =============================================================================
// binance-sync — real-time futures market data synchronisation
// =============================================================================
//
// Two stateful engines behind one dispatcher:
//   - chart streams: REST kline history merged with the live kline feed,
//     one socket per (symbol, interval) shared by every subscriber;
//   - user data sessions: listen-key backed private streams with keep-alive,
//     transparent token replacement and correlated position requests.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
pub mod binance;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod market_data;
pub mod transport;
pub mod user_data;

#[cfg(test)]
pub(crate) mod testkit;

pub use config::SyncConfig;
pub use dispatcher::{ChartSubscription, StreamDispatcher};
pub use error::{SyncError, SyncResult};
pub use market_data::{Candle, ChartCallbacks, ChartOptions, ChartSnapshot, SubscriptionId};
pub use user_data::{SessionCallbacks, SessionHandle, SessionOptions, SessionState, UserDataEvent};
