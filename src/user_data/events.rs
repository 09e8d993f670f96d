// =============================================================================
// User data stream events
// =============================================================================
//
// Frames on a user data socket are either exchange events, tagged by `e`, or
// responses to control requests we sent, carrying `id` and `result`.
// Exchange field names are single letters; the DTOs rename them.
// =============================================================================

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{SyncError, SyncResult};

// ---------------------------------------------------------------------------
// Numeric helpers
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(untagged)]
enum NumOrString {
    Num(f64),
    Str(String),
}

/// Binance sends most amounts as JSON strings; accept either form.
fn de_f64<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    match NumOrString::deserialize(d)? {
        NumOrString::Num(n) => Ok(n),
        NumOrString::Str(s) if s.trim().is_empty() => Ok(0.0),
        NumOrString::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

// ---------------------------------------------------------------------------
// MARGIN_CALL
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarginCall {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "cw", deserialize_with = "de_f64")]
    pub cross_wallet_balance: f64,
    #[serde(rename = "p")]
    pub positions: Vec<MarginCallPosition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarginCallPosition {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "ps")]
    pub position_side: String,
    #[serde(rename = "pa", deserialize_with = "de_f64")]
    pub position_amount: f64,
    #[serde(rename = "mt")]
    pub margin_type: String,
    #[serde(rename = "iw", deserialize_with = "de_f64")]
    pub isolated_wallet: f64,
    #[serde(rename = "mp", deserialize_with = "de_f64")]
    pub mark_price: f64,
    #[serde(rename = "up", deserialize_with = "de_f64")]
    pub unrealized_pnl: f64,
    #[serde(rename = "mm", deserialize_with = "de_f64")]
    pub maintenance_margin: f64,
}

// ---------------------------------------------------------------------------
// ACCOUNT_UPDATE
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountUpdate {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "T")]
    pub transaction_time: i64,
    #[serde(rename = "a")]
    pub data: AccountUpdateData,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountUpdateData {
    /// Reason type, e.g. `ORDER`, `FUNDING_FEE`, `DEPOSIT`.
    #[serde(rename = "m")]
    pub reason: String,
    #[serde(rename = "B")]
    pub balances: Vec<Balance>,
    #[serde(rename = "P")]
    pub positions: Vec<AccountPosition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Balance {
    #[serde(rename = "a")]
    pub asset: String,
    #[serde(rename = "wb", deserialize_with = "de_f64")]
    pub wallet_balance: f64,
    #[serde(rename = "cw", deserialize_with = "de_f64")]
    pub cross_wallet_balance: f64,
    #[serde(rename = "bc", deserialize_with = "de_f64")]
    pub balance_change: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountPosition {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "pa", deserialize_with = "de_f64")]
    pub position_amount: f64,
    #[serde(rename = "ep", deserialize_with = "de_f64")]
    pub entry_price: f64,
    #[serde(rename = "bep", deserialize_with = "de_f64")]
    pub break_even_price: f64,
    /// Accumulated realized PnL before fees.
    #[serde(rename = "cr", deserialize_with = "de_f64")]
    pub pre_fee: f64,
    #[serde(rename = "up", deserialize_with = "de_f64")]
    pub unrealized_pnl: f64,
    #[serde(rename = "mt")]
    pub margin_type: String,
    #[serde(rename = "iw", deserialize_with = "de_f64")]
    pub isolated_wallet: f64,
    #[serde(rename = "ps")]
    pub position_side: String,
}

// ---------------------------------------------------------------------------
// ORDER_TRADE_UPDATE
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderUpdate {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "T")]
    pub transaction_time: i64,
    #[serde(rename = "o")]
    pub order: OrderData,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderData {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "c")]
    pub client_order_id: String,
    #[serde(rename = "S")]
    pub side: String,
    #[serde(rename = "o")]
    pub order_type: String,
    #[serde(rename = "f")]
    pub time_in_force: String,
    #[serde(rename = "q", deserialize_with = "de_f64")]
    pub original_quantity: f64,
    #[serde(rename = "p", deserialize_with = "de_f64")]
    pub original_price: f64,
    #[serde(rename = "ap", deserialize_with = "de_f64")]
    pub average_price: f64,
    #[serde(rename = "sp", deserialize_with = "de_f64")]
    pub stop_price: f64,
    #[serde(rename = "x")]
    pub execution_type: String,
    #[serde(rename = "X")]
    pub order_status: String,
    #[serde(rename = "i")]
    pub order_id: u64,
    #[serde(rename = "l", deserialize_with = "de_f64")]
    pub last_filled_quantity: f64,
    #[serde(rename = "z", deserialize_with = "de_f64")]
    pub accumulated_filled_quantity: f64,
    #[serde(rename = "L", deserialize_with = "de_f64")]
    pub last_filled_price: f64,
    #[serde(rename = "N")]
    pub commission_asset: Option<String>,
    #[serde(rename = "n", deserialize_with = "de_f64")]
    pub commission: f64,
    #[serde(rename = "T")]
    pub trade_time: i64,
    #[serde(rename = "t")]
    pub trade_id: u64,
    #[serde(rename = "b", deserialize_with = "de_f64")]
    pub bid_notional: f64,
    #[serde(rename = "a", deserialize_with = "de_f64")]
    pub ask_notional: f64,
    #[serde(rename = "m")]
    pub is_maker: bool,
    #[serde(rename = "R")]
    pub is_reduce_only: bool,
    #[serde(rename = "wt")]
    pub working_type: String,
    #[serde(rename = "ot")]
    pub original_order_type: String,
    #[serde(rename = "ps")]
    pub position_side: String,
    #[serde(rename = "cp")]
    pub close_all: bool,
    #[serde(rename = "AP", deserialize_with = "de_f64")]
    pub activation_price: f64,
    #[serde(rename = "cr", deserialize_with = "de_f64")]
    pub callback_rate: f64,
    #[serde(rename = "pP")]
    pub price_protect: bool,
    #[serde(rename = "rp", deserialize_with = "de_f64")]
    pub realized_profit: f64,
    #[serde(rename = "V")]
    pub stp_mode: String,
    #[serde(rename = "pm")]
    pub price_match: String,
    #[serde(rename = "gtd")]
    pub good_till_date: i64,
}

impl OrderData {
    pub fn is_filled(&self) -> bool {
        self.order_status == "FILLED"
    }
}

// ---------------------------------------------------------------------------
// ACCOUNT_CONFIG_UPDATE
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfigUpdate {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "T")]
    pub transaction_time: i64,
    /// Leverage change. Absent when the event reports a multi-assets mode switch.
    #[serde(rename = "ac")]
    pub account_config: Option<AccountConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "l", deserialize_with = "de_f64")]
    pub leverage: f64,
}

// ---------------------------------------------------------------------------
// TRADE_LITE
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TradeLite {
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "T")]
    pub transaction_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "q", deserialize_with = "de_f64")]
    pub original_quantity: f64,
    #[serde(rename = "p", deserialize_with = "de_f64")]
    pub original_price: f64,
    #[serde(rename = "m")]
    pub is_maker: bool,
    #[serde(rename = "c")]
    pub client_order_id: String,
    #[serde(rename = "S")]
    pub side: String,
    #[serde(rename = "L", deserialize_with = "de_f64")]
    pub last_filled_price: f64,
    #[serde(rename = "l", deserialize_with = "de_f64")]
    pub last_filled_quantity: f64,
    #[serde(rename = "t")]
    pub trade_id: u64,
    #[serde(rename = "i")]
    pub order_id: u64,
}

// ---------------------------------------------------------------------------
// Position snapshot (control response)
// ---------------------------------------------------------------------------

/// One entry of a `<listenKey>@position` request response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PositionRisk {
    pub symbol: String,
    #[serde(deserialize_with = "de_f64")]
    pub position_amt: f64,
    #[serde(deserialize_with = "de_f64")]
    pub entry_price: f64,
    pub margin_type: String,
    pub is_auto_add_margin: bool,
    #[serde(deserialize_with = "de_f64")]
    pub isolated_margin: f64,
    #[serde(deserialize_with = "de_f64")]
    pub leverage: f64,
    #[serde(deserialize_with = "de_f64")]
    pub liquidation_price: f64,
    #[serde(deserialize_with = "de_f64")]
    pub mark_price: f64,
    #[serde(deserialize_with = "de_f64")]
    pub max_notional_value: f64,
    #[serde(rename = "unRealizedProfit", deserialize_with = "de_f64")]
    pub unrealized_profit: f64,
    pub position_side: String,
    #[serde(deserialize_with = "de_f64")]
    pub notional: f64,
    pub update_time: i64,
}

impl PositionRisk {
    pub fn is_open(&self) -> bool {
        self.position_amt != 0.0
    }
}

/// Pull the positions out of a control response `result`.
///
/// `None` when the result is missing, empty or carries no positions array;
/// the caller treats that as a failed attempt.
pub fn positions_from_result(result: &Value) -> Option<Vec<PositionRisk>> {
    let entry = result.as_array()?.first()?;
    let raw = entry.get("res")?.get("positions")?.as_array()?;
    raw.iter()
        .map(|p| serde_json::from_value(p.clone()).ok())
        .collect()
}

// ---------------------------------------------------------------------------
// Frame decoding
// ---------------------------------------------------------------------------

/// Closed set of user data events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum UserDataEvent {
    MarginCall(MarginCall),
    AccountUpdate(AccountUpdate),
    OrderUpdate(OrderUpdate),
    AccountConfigUpdate(AccountConfigUpdate),
    TradeLite(TradeLite),
    /// The listen key expired; the session replaces itself.
    TokenExpired { event_time: i64 },
    /// Anything we do not model, kept verbatim.
    Unknown(Value),
}

impl UserDataEvent {
    pub fn event_type(&self) -> &str {
        match self {
            Self::MarginCall(_) => "MARGIN_CALL",
            Self::AccountUpdate(_) => "ACCOUNT_UPDATE",
            Self::OrderUpdate(_) => "ORDER_TRADE_UPDATE",
            Self::AccountConfigUpdate(_) => "ACCOUNT_CONFIG_UPDATE",
            Self::TradeLite(_) => "TRADE_LITE",
            Self::TokenExpired { .. } => "TOKEN_EXPIRED",
            Self::Unknown(v) => v.get("e").and_then(Value::as_str).unwrap_or("UNKNOWN"),
        }
    }
}

/// Everything that can arrive on a user data socket.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Response to a control request we sent.
    Control { id: String, result: Value },
    Event(UserDataEvent),
}

/// Decode one raw text frame.
///
/// Only invalid JSON is an error. A known tag whose body does not match the
/// expected shape falls through to [`UserDataEvent::Unknown`].
pub fn decode_frame(text: &str) -> SyncResult<InboundFrame> {
    let value: Value = serde_json::from_str(text)?;
    if !value.is_object() {
        return Err(SyncError::Validation("user data frame is not an object".into()));
    }

    if value.get("e").is_none() {
        if let (Some(id), Some(result)) = (value.get("id"), value.get("result")) {
            let id = match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            return Ok(InboundFrame::Control {
                id,
                result: result.clone(),
            });
        }
    }

    Ok(InboundFrame::Event(decode_event(value)))
}

fn decode_event(value: Value) -> UserDataEvent {
    fn typed<T: serde::de::DeserializeOwned>(
        value: Value,
        wrap: fn(T) -> UserDataEvent,
    ) -> UserDataEvent {
        match serde_json::from_value::<T>(value.clone()) {
            Ok(event) => wrap(event),
            Err(_) => UserDataEvent::Unknown(value),
        }
    }

    let tag = value.get("e").and_then(Value::as_str).unwrap_or_default().to_string();
    match tag.as_str() {
        "MARGIN_CALL" => typed(value, UserDataEvent::MarginCall),
        "ACCOUNT_UPDATE" => typed(value, UserDataEvent::AccountUpdate),
        "ORDER_TRADE_UPDATE" => typed(value, UserDataEvent::OrderUpdate),
        "ACCOUNT_CONFIG_UPDATE" => typed(value, UserDataEvent::AccountConfigUpdate),
        "TRADE_LITE" => typed(value, UserDataEvent::TradeLite),
        "listenKeyExpired" | "TOKEN_EXPIRED" => UserDataEvent::TokenExpired {
            event_time: value.get("E").and_then(Value::as_i64).unwrap_or_default(),
        },
        _ => UserDataEvent::Unknown(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(text: Value) -> UserDataEvent {
        match decode_frame(&text.to_string()).unwrap() {
            InboundFrame::Event(e) => e,
            other => panic!("expected event, got {other:?}"),
        }
    }

    #[test]
    fn decodes_margin_call() {
        let e = event(json!({
            "e": "MARGIN_CALL", "E": 1587727187525i64, "cw": "3.16812045",
            "p": [{"s": "ETHUSDT", "ps": "LONG", "pa": "1.327", "mt": "CROSSED",
                   "iw": "0", "mp": "187.17127", "up": "-1.166074", "mm": "1.614445"}]
        }));
        let UserDataEvent::MarginCall(mc) = e else { panic!("wrong variant") };
        assert_eq!(mc.cross_wallet_balance, 3.16812045);
        assert_eq!(mc.positions[0].symbol, "ETHUSDT");
        assert_eq!(mc.positions[0].maintenance_margin, 1.614445);
    }

    #[test]
    fn decodes_account_update() {
        let e = event(json!({
            "e": "ACCOUNT_UPDATE", "E": 1564745798939i64, "T": 1564745798938i64,
            "a": {
                "m": "ORDER",
                "B": [{"a": "USDT", "wb": "122624.12345678", "cw": "100.12345678", "bc": "50.12345678"}],
                "P": [{"s": "BTCUSDT", "pa": "0", "ep": "0.00000", "bep": "0", "cr": "200",
                       "up": "0", "mt": "isolated", "iw": "0.00000000", "ps": "BOTH"}]
            }
        }));
        let UserDataEvent::AccountUpdate(au) = e else { panic!("wrong variant") };
        assert_eq!(au.data.reason, "ORDER");
        assert_eq!(au.data.balances[0].asset, "USDT");
        assert_eq!(au.data.positions[0].pre_fee, 200.0);
        assert_eq!(au.transaction_time, 1564745798938);
    }

    #[test]
    fn decodes_order_update() {
        let e = event(json!({
            "e": "ORDER_TRADE_UPDATE", "E": 1568879465651i64, "T": 1568879465650i64,
            "o": {"s": "BTCUSDT", "c": "TEST", "S": "SELL", "o": "TRAILING_STOP_MARKET",
                  "f": "GTC", "q": "0.001", "p": "0", "ap": "0", "sp": "7103.04", "x": "NEW",
                  "X": "NEW", "i": 8886774, "l": "0", "z": "0", "L": "0", "T": 1568879465650i64,
                  "t": 0, "b": "0", "a": "9.91", "m": false, "R": false, "wt": "CONTRACT_PRICE",
                  "ot": "TRAILING_STOP_MARKET", "ps": "LONG", "cp": false, "AP": "7476.89",
                  "cr": "5.0", "pP": false, "rp": "0", "V": "EXPIRE_TAKER", "pm": "OPPONENT", "gtd": 0}
        }));
        let UserDataEvent::OrderUpdate(ou) = e else { panic!("wrong variant") };
        assert_eq!(ou.order.order_id, 8886774);
        assert_eq!(ou.order.activation_price, 7476.89);
        assert!(ou.order.commission_asset.is_none());
        assert!(!ou.order.is_filled());
    }

    #[test]
    fn decodes_config_update_and_trade_lite() {
        let e = event(json!({
            "e": "ACCOUNT_CONFIG_UPDATE", "E": 1611646737479i64, "T": 1611646737476i64,
            "ac": {"s": "BTCUSDT", "l": 25}
        }));
        let UserDataEvent::AccountConfigUpdate(cfg) = e else { panic!("wrong variant") };
        assert_eq!(cfg.account_config.unwrap().leverage, 25.0);

        let e = event(json!({
            "e": "TRADE_LITE", "E": 1721895408092i64, "T": 1721895408214i64, "s": "BTCUSDT",
            "q": "0.001", "p": "0", "m": false, "c": "z8hc", "S": "BUY", "L": "64089.20",
            "l": "0.040", "t": 109100866, "i": 8886774
        }));
        assert_eq!(e.event_type(), "TRADE_LITE");
    }

    #[test]
    fn token_expiry_tags_map_to_one_variant() {
        for tag in ["listenKeyExpired", "TOKEN_EXPIRED"] {
            let e = event(json!({"e": tag, "E": 42}));
            assert_eq!(e, UserDataEvent::TokenExpired { event_time: 42 });
        }
    }

    #[test]
    fn unknown_or_malformed_events_pass_through() {
        let raw = json!({"e": "STRATEGY_UPDATE", "E": 1});
        assert_eq!(event(raw.clone()), UserDataEvent::Unknown(raw));

        let bad = json!({"e": "MARGIN_CALL", "cw": "not-a-number"});
        assert_eq!(event(bad.clone()), UserDataEvent::Unknown(bad));
    }

    #[test]
    fn control_responses_are_split_out() {
        let frame = decode_frame(r#"{"id":"abc","result":null}"#).unwrap();
        assert_eq!(
            frame,
            InboundFrame::Control {
                id: "abc".into(),
                result: Value::Null
            }
        );
        assert!(decode_frame("[1,2]").is_err());
        assert!(decode_frame("not json").is_err());
    }

    #[test]
    fn positions_extracted_from_result() {
        let result = json!([{
            "req": "key@position",
            "res": {"positions": [{
                "entryPrice": "0.00000", "marginType": "isolated", "isAutoAddMargin": false,
                "isolatedMargin": "0.00000000", "leverage": 10, "liquidationPrice": "0",
                "markPrice": "6679.50671178", "maxNotionalValue": "20000000",
                "positionAmt": "0.010", "symbol": "BTCUSDT", "unRealizedProfit": "0.00000000",
                "positionSide": "BOTH"
            }]}
        }]);
        let positions = positions_from_result(&result).unwrap();
        assert_eq!(positions.len(), 1);
        assert!(positions[0].is_open());
        assert_eq!(positions[0].leverage, 10.0);

        assert!(positions_from_result(&Value::Null).is_none());
        assert!(positions_from_result(&json!([])).is_none());
        assert!(positions_from_result(&json!([{"req": "key@position"}])).is_none());
    }
}
