// =============================================================================
// Sync Configuration — endpoints, chart defaults and session timing
// =============================================================================
//
// All fields carry `#[serde(default)]` so that a partial (or empty) JSON file
// still loads. Environment variables override the endpoint URLs so the same
// file can target testnet and production.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// =============================================================================
// Default-value helpers
// =============================================================================

fn default_rest_base_url() -> String {
    "https://fapi.binance.com".to_string()
}

fn default_ws_base_url() -> String {
    "wss://fstream.binance.com".to_string()
}

fn default_chart_limit() -> u32 {
    200
}

fn default_keep_alive_interval_secs() -> u64 {
    45 * 60
}

fn default_token_validity_secs() -> u64 {
    60 * 60
}

fn default_request_retry_attempts() -> u32 {
    3
}

fn default_request_retry_delay_secs() -> u64 {
    5
}

fn default_recv_window_ms() -> u64 {
    60_000
}

fn default_http_timeout_secs() -> u64 {
    10
}

// =============================================================================
// SyncConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    // --- Endpoints ----------------------------------------------------------

    /// Futures REST base URL.
    #[serde(default = "default_rest_base_url")]
    pub rest_base_url: String,

    /// Futures streaming base URL (without the `/ws` suffix).
    #[serde(default = "default_ws_base_url")]
    pub ws_base_url: String,

    // --- Charts -------------------------------------------------------------

    /// History size used when a subscriber does not specify a limit.
    #[serde(default = "default_chart_limit")]
    pub default_chart_limit: u32,

    // --- User data sessions -------------------------------------------------

    /// Period of the listen key keep-alive ping.
    #[serde(default = "default_keep_alive_interval_secs")]
    pub keep_alive_interval_secs: u64,

    /// How long the exchange keeps an un-pinged listen key alive.
    #[serde(default = "default_token_validity_secs")]
    pub token_validity_secs: u64,

    /// Attempts for a correlated request before it fails terminally.
    #[serde(default = "default_request_retry_attempts")]
    pub request_retry_attempts: u32,

    /// Fixed delay between correlated request attempts.
    #[serde(default = "default_request_retry_delay_secs")]
    pub request_retry_delay_secs: u64,

    // --- REST ---------------------------------------------------------------

    #[serde(default = "default_recv_window_ms")]
    pub recv_window_ms: u64,

    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            rest_base_url: default_rest_base_url(),
            ws_base_url: default_ws_base_url(),
            default_chart_limit: default_chart_limit(),
            keep_alive_interval_secs: default_keep_alive_interval_secs(),
            token_validity_secs: default_token_validity_secs(),
            request_retry_attempts: default_request_retry_attempts(),
            request_retry_delay_secs: default_request_retry_delay_secs(),
            recv_window_ms: default_recv_window_ms(),
            http_timeout_secs: default_http_timeout_secs(),
        }
    }
}

impl SyncConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// A missing file is an error so the caller can fall back to defaults
    /// with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read sync config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse sync config from {}", path.display()))?;

        info!(
            path = %path.display(),
            rest = %config.rest_base_url,
            ws = %config.ws_base_url,
            "sync config loaded"
        );

        Ok(config)
    }

    /// Override endpoint URLs from `BINANCE_SYNC_REST_URL` / `BINANCE_SYNC_WS_URL`.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("BINANCE_SYNC_REST_URL") {
            let url = url.trim().trim_end_matches('/');
            if !url.is_empty() {
                self.rest_base_url = url.to_string();
            }
        }
        if let Ok(url) = std::env::var("BINANCE_SYNC_WS_URL") {
            let url = url.trim().trim_end_matches('/');
            if !url.is_empty() {
                self.ws_base_url = url.to_string();
            }
        }
    }

    /// Keep-alive period; a zero setting falls back to the default.
    pub fn keep_alive_interval(&self) -> Duration {
        if self.keep_alive_interval_secs == 0 {
            let fallback = default_keep_alive_interval_secs();
            warn!(fallback_secs = fallback, "keep_alive_interval_secs is 0, using default");
            return Duration::from_secs(fallback);
        }
        Duration::from_secs(self.keep_alive_interval_secs)
    }

    pub fn request_retry_delay(&self) -> Duration {
        Duration::from_secs(self.request_retry_delay_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Public kline stream for one symbol/interval pair.
    pub fn kline_stream_url(&self, symbol: &str, interval: &str) -> String {
        format!(
            "{}/ws/{}@kline_{}",
            self.ws_base_url.trim_end_matches('/'),
            symbol.to_lowercase(),
            interval
        )
    }

    /// Private user data stream scoped to a listen key.
    pub fn user_stream_url(&self, listen_key: &str) -> String {
        format!("{}/ws/{}", self.ws_base_url.trim_end_matches('/'), listen_key)
    }
}
