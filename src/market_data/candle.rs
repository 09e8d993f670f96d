use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{SyncError, SyncResult};

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single OHLCV bar for one `(symbol, interval)` bucket.
///
/// Identity is `(symbol, interval, open_time)`; a later candle with the same
/// identity is a revision of this one, never a new bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub interval: String,
    pub open_time: i64,
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub quote_volume: f64,
    pub trades_count: u64,
    pub is_closed: bool,
}

impl Candle {
    pub fn open_time_utc(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.open_time).single()
    }

    /// Decode one row of `GET /fapi/v1/klines`.
    ///
    /// Array indices:
    ///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
    ///   [6] closeTime, [7] quoteAssetVolume, [8] numberOfTrades
    ///
    /// The exchange includes the still-forming bar as the last row; it is
    /// marked unclosed when its `closeTime` is later than `now_ms`.
    pub fn from_rest_row(symbol: &str, interval: &str, row: &Value, now_ms: i64) -> SyncResult<Self> {
        let arr = row
            .as_array()
            .ok_or_else(|| SyncError::Validation("kline entry is not an array".into()))?;

        if arr.len() < 7 {
            return Err(SyncError::Validation(format!(
                "kline entry has {} elements, expected at least 7",
                arr.len()
            )));
        }

        let open_time = arr[0]
            .as_i64()
            .ok_or_else(|| SyncError::Validation("kline openTime is not an integer".into()))?;
        let close_time = arr[6]
            .as_i64()
            .ok_or_else(|| SyncError::Validation("kline closeTime is not an integer".into()))?;

        Ok(Self {
            symbol: symbol.to_uppercase(),
            interval: interval.to_string(),
            open_time,
            close_time,
            open: parse_string_f64(&arr[1], "open")?,
            high: parse_string_f64(&arr[2], "high")?,
            low: parse_string_f64(&arr[3], "low")?,
            close: parse_string_f64(&arr[4], "close")?,
            volume: parse_string_f64(&arr[5], "volume")?,
            quote_volume: arr.get(7).map(|v| parse_string_f64(v, "quoteVolume")).transpose()?.unwrap_or(0.0),
            trades_count: arr.get(8).and_then(Value::as_u64).unwrap_or(0),
            is_closed: close_time <= now_ms,
        })
    }
}

/// Composite key that identifies a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChartKey {
    pub symbol: String,
    pub interval: String,
}

impl ChartKey {
    pub fn new(symbol: impl AsRef<str>, interval: impl Into<String>) -> Self {
        Self {
            symbol: symbol.as_ref().trim().to_uppercase(),
            interval: interval.into(),
        }
    }
}

impl std::fmt::Display for ChartKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

// ---------------------------------------------------------------------------
// Kline delta decoding
// ---------------------------------------------------------------------------

/// Helper: Binance sends numeric values as JSON strings inside kline objects.
pub(crate) fn parse_string_f64(val: &Value, name: &str) -> SyncResult<f64> {
    match val {
        Value::String(s) => s
            .parse::<f64>()
            .map_err(|_| SyncError::Validation(format!("failed to parse {name} as f64: {s}"))),
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| SyncError::Validation(format!("field {name} is not a valid f64"))),
        _ => Err(SyncError::Validation(format!("field {name} has unexpected JSON type"))),
    }
}

/// Parse a kline stream message into a [`Candle`].
///
/// Accepts the single-stream payload and the combined-stream envelope:
/// ```json
/// { "e": "kline", "E": 1700000000123, "s": "BTCUSDT", "k": { ... } }
/// { "stream": "btcusdt@kline_1m", "data": { "e": "kline", "s": "BTCUSDT", "k": { ... } } }
/// ```
pub fn parse_kline_delta(text: &str) -> SyncResult<Candle> {
    let root: Value = serde_json::from_str(text)?;

    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    let k = data
        .get("k")
        .filter(|k| k.is_object())
        .ok_or_else(|| SyncError::Validation("kline delta is missing the k block".into()))?;

    let symbol = k["s"]
        .as_str()
        .or_else(|| data["s"].as_str())
        .ok_or_else(|| SyncError::Validation("missing field s".into()))?
        .to_uppercase();

    let interval = k["i"]
        .as_str()
        .ok_or_else(|| SyncError::Validation("missing field k.i".into()))?
        .to_string();

    let open_time = k["t"]
        .as_i64()
        .ok_or_else(|| SyncError::Validation("missing field k.t".into()))?;
    let close_time = k["T"]
        .as_i64()
        .ok_or_else(|| SyncError::Validation("missing field k.T".into()))?;

    Ok(Candle {
        symbol,
        interval,
        open_time,
        close_time,
        open: parse_string_f64(&k["o"], "k.o")?,
        high: parse_string_f64(&k["h"], "k.h")?,
        low: parse_string_f64(&k["l"], "k.l")?,
        close: parse_string_f64(&k["c"], "k.c")?,
        volume: parse_string_f64(&k["v"], "k.v")?,
        quote_volume: parse_string_f64(&k["q"], "k.q").unwrap_or(0.0),
        trades_count: k["n"].as_u64().unwrap_or(0),
        is_closed: k["x"]
            .as_bool()
            .ok_or_else(|| SyncError::Validation("missing field k.x".into()))?,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
