// =============================================================================
// Futures endpoints used by the sync layer — kline history and listen keys
// =============================================================================

use serde_json::Value;
use tracing::{debug, warn};

use crate::binance::RestClient;
use crate::error::{SyncError, SyncResult};
use crate::market_data::Candle;

pub const KLINES: &str = "/fapi/v1/klines";
pub const LISTEN_KEY: &str = "/fapi/v1/listenKey";

/// Optional bounds for a history request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KlineQuery {
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub limit: u32,
}

/// Turn the exchange error shape `{code, msg}` into [`SyncError::Exchange`].
///
/// `code` values of 0 and 200 are success acknowledgements on some endpoints.
pub fn check_exchange_error(body: &Value) -> SyncResult<()> {
    let code = body.get("code").and_then(Value::as_i64);
    let msg = body.get("msg").and_then(Value::as_str);

    match (code, msg) {
        (Some(code), Some(msg)) if code != 0 && code != 200 => Err(SyncError::Exchange {
            code,
            msg: msg.to_string(),
        }),
        _ => Ok(()),
    }
}

/// GET /fapi/v1/klines — bootstrap history for one pair.
pub async fn fetch_klines(
    rest: &dyn RestClient,
    symbol: &str,
    interval: &str,
    query: &KlineQuery,
) -> SyncResult<Vec<Candle>> {
    let mut params = vec![
        ("symbol", symbol.to_uppercase()),
        ("interval", interval.to_string()),
    ];
    if let Some(start) = query.start_time {
        params.push(("startTime", start.to_string()));
    }
    if let Some(end) = query.end_time {
        params.push(("endTime", end.to_string()));
    }
    if query.limit > 0 {
        params.push(("limit", query.limit.to_string()));
    }

    let body = rest.get(KLINES, &params).await?;
    check_exchange_error(&body)?;

    let rows = body
        .as_array()
        .ok_or_else(|| SyncError::Validation("klines response is not an array".into()))?;

    let now_ms = chrono::Utc::now().timestamp_millis();
    let mut candles = Vec::with_capacity(rows.len());
    for row in rows {
        match Candle::from_rest_row(symbol, interval, row, now_ms) {
            Ok(candle) => candles.push(candle),
            Err(e) => warn!(symbol, interval, error = %e, "skipping malformed kline entry"),
        }
    }

    debug!(symbol, interval, count = candles.len(), "klines fetched");
    Ok(candles)
}

/// POST /fapi/v1/listenKey — issue (or re-issue) the user stream token.
pub async fn create_listen_key(rest: &dyn RestClient) -> SyncResult<String> {
    let body = rest.post(LISTEN_KEY, &[]).await?;
    check_exchange_error(&body)?;

    body.get("listenKey")
        .and_then(Value::as_str)
        .filter(|key| !key.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| SyncError::Auth("listenKey response carried no key".into()))
}

/// PUT /fapi/v1/listenKey — extend the token's validity window.
///
/// Returns [`SyncError::Auth`] when the exchange no longer knows the token;
/// any other failure is returned as-is.
pub async fn keepalive_listen_key(rest: &dyn RestClient) -> SyncResult<()> {
    let body = rest.put(LISTEN_KEY, &[]).await?;
    match check_exchange_error(&body) {
        Err(e) if e.is_token_missing() => Err(SyncError::Auth(e.to_string())),
        other => other,
    }
}

/// DELETE /fapi/v1/listenKey — revoke the token.
pub async fn close_listen_key(rest: &dyn RestClient) -> SyncResult<()> {
    let body = rest.delete(LISTEN_KEY, &[]).await?;
    check_exchange_error(&body)
}
