// =============================================================================
// Binance Futures REST Client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: The secret key is never logged or serialized. Signed requests
// carry X-MBX-APIKEY as a header plus timestamp, recvWindow and signature in
// the query string. User-stream endpoints (listenKey) need the API key header
// only; market-data endpoints are sent bare.
// =============================================================================

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Method;
use serde_json::Value;
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, warn};

use crate::binance::RestClient;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};

type HmacSha256 = Hmac<Sha256>;

/// Endpoints that need neither key nor signature.
const PUBLIC_ENDPOINTS: &[&str] = &["/fapi/v1/klines", "/fapi/v1/exchangeInfo", "/fapi/v1/time"];
/// Endpoints that need the API key header but no signature.
const USER_STREAM_ENDPOINTS: &[&str] = &["/fapi/v1/listenKey"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Security {
    Public,
    UserStream,
    Signed,
}

impl Security {
    fn of(endpoint: &str) -> Self {
        if PUBLIC_ENDPOINTS.contains(&endpoint) {
            Self::Public
        } else if USER_STREAM_ENDPOINTS.contains(&endpoint) {
            Self::UserStream
        } else {
            Self::Signed
        }
    }
}

/// Binance USDⓈ-M futures REST client.
#[derive(Clone)]
pub struct FuturesClient {
    api_key: String,
    secret: String,
    base_url: String,
    recv_window_ms: u64,
    client: reqwest::Client,
}

impl FuturesClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new `FuturesClient`.
    ///
    /// # Arguments
    /// * `api_key` — Binance API key (sent as a header, never in query params).
    /// * `secret`  — Binance secret key used exclusively for HMAC signing.
    /// * `config`  — base URL, recvWindow and HTTP timeout.
    pub fn new(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        config: &SyncConfig,
    ) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()?;

        debug!(base_url = %config.rest_base_url, "FuturesClient initialised");

        Ok(Self {
            api_key: api_key.into(),
            secret: secret.into(),
            base_url: config.rest_base_url.trim_end_matches('/').to_string(),
            recv_window_ms: config.recv_window_ms,
            client,
        })
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `query`.
    pub fn sign(&self, query: &str) -> String {
        // HMAC-SHA256 accepts keys of any length, so this never fails.
        let mut mac = match HmacSha256::new_from_slice(self.secret.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return String::new(),
        };
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds.
    pub fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    fn plain_query(params: &[(&str, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Build the full query string for a signed request (appends timestamp,
    /// recvWindow, and signature).
    fn signed_query(&self, params: &[(&str, String)]) -> String {
        let ts = Self::timestamp_ms();
        let params = Self::plain_query(params);
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={}", self.recv_window_ms)
        } else {
            format!("{params}&timestamp={ts}&recvWindow={}", self.recv_window_ms)
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }
}

#[async_trait]
impl RestClient for FuturesClient {
    #[instrument(skip(self, params), name = "binance::send")]
    async fn send(
        &self,
        method: Method,
        endpoint: &str,
        params: &[(&str, String)],
    ) -> SyncResult<Value> {
        let security = Security::of(endpoint);
        let query = match security {
            Security::Signed => self.signed_query(params),
            Security::Public | Security::UserStream => Self::plain_query(params),
        };
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, endpoint)
        } else {
            format!("{}{}?{}", self.base_url, endpoint, query)
        };

        let mut request = self.client.request(method.clone(), &url);
        if security != Security::Public {
            request = request.header("X-MBX-APIKEY", &self.api_key);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| SyncError::Transport(format!("{method} {endpoint} request failed: {e}")))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| SyncError::Transport(format!("{method} {endpoint} body read failed: {e}")))?;

        // DELETE /listenKey answers with an empty object or an empty body.
        if text.trim().is_empty() {
            return Ok(Value::Object(Default::default()));
        }

        let body: Value = serde_json::from_str(&text).map_err(|e| {
            SyncError::Transport(format!("{method} {endpoint} returned non-JSON ({status}): {e}"))
        })?;

        if !status.is_success() && body.get("code").is_none() {
            warn!(%status, endpoint, "binance returned an error without a code");
            return Err(SyncError::Transport(format!(
                "Binance {method} {endpoint} returned {status}: {body}"
            )));
        }

        debug!(endpoint, %status, "request completed");
        Ok(body)
    }
}

impl std::fmt::Debug for FuturesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuturesClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
