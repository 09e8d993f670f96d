pub mod candle;
pub mod chart_cache;
pub mod chart_stream;

// Re-export the chart types for convenient access (e.g. `use crate::market_data::Candle`).
pub use candle::{parse_kline_delta, Candle, ChartKey};
pub use chart_cache::ChartCache;
pub use chart_stream::{ChartCallbacks, ChartSnapshot, ChartStream, SubscriptionId};

use serde::{Deserialize, Serialize};

/// Per-chart construction options. Only the first subscriber's options
/// shape a stream; later subscribers share it as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChartOptions {
    /// Closed candles retained and requested on bootstrap. Falls back to the
    /// configured default when unset.
    pub limit: Option<usize>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    /// Keep every closed candle instead of capping at `limit`.
    pub accumulate: bool,
}

impl ChartOptions {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }
}
