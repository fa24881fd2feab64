// =============================================================================
// Bybit USDT-perpetual adapter — an algo-separate venue
// =============================================================================
//
// Standard limit/market orders and conditional (stop) orders live in two
// distinct queues on this venue: `/v5/order/*` for the former,
// `/v5/order/*` with `orderFilter=StopOrder` reachable only via a separate
// listing parameter for the latter. `fetch_open_orders` must union both.

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use sha2::Sha256;
use tracing::{instrument, warn};

use crate::adapter::rate_limit::RateLimitTracker;
use crate::adapter::{
    AdapterError, AdapterResult, ExchangeAdapter, ExchangePosition, Fill, Order, OrderAck,
    OrderStatus,
};
use crate::types::{CancelHint, OrderKind, Side};

const RECV_WINDOW_MS: i64 = 5_000;

type HmacSha256 = Hmac<Sha256>;

pub struct BybitAdapter {
    api_key: String,
    api_secret: String,
    base_url: String,
    client: Client,
    rate_limiter: RateLimitTracker,
}

impl BybitAdapter {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            base_url: "https://api.bybit.com".to_string(),
            client: Client::new(),
            rate_limiter: RateLimitTracker::new(40, 20),
        }
    }

    #[cfg(test)]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    fn timestamp_ms() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("hmac accepts any key length");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_headers(&self, body: &str) -> (i64, String, Vec<(&'static str, String)>) {
        let ts = Self::timestamp_ms();
        let payload = format!("{ts}{}{RECV_WINDOW_MS}{body}", self.api_key);
        let sig = self.sign(&payload);
        let headers = vec![
            ("X-BAPI-API-KEY", self.api_key.clone()),
            ("X-BAPI-TIMESTAMP", ts.to_string()),
            ("X-BAPI-SIGN", sig.clone()),
            ("X-BAPI-RECV-WINDOW", RECV_WINDOW_MS.to_string()),
        ];
        (ts, sig, headers)
    }

    fn order_status_from_str(s: &str) -> OrderStatus {
        match s {
            "Filled" => OrderStatus::Filled,
            "PartiallyFilled" => OrderStatus::PartiallyFilled,
            "Cancelled" | "Rejected" | "Deactivated" | "PartiallyFilledCanceled" => OrderStatus::Cancelled,
            _ => OrderStatus::Open,
        }
    }

    /// Bybit's own `(retCode, httpStatus)` classification into our taxonomy.
    fn classify_error(ret_code: i64, http_status: u16, msg: &str) -> AdapterError {
        match (ret_code, http_status) {
            (10006, _) | (_, 429) => AdapterError::RateLimited { retry_after_secs: 10 },
            (10016, _) | (_, 500..=599) => AdapterError::VenueDown(msg.to_string()),
            (10003, _) | (10004, _) | (_, 401) | (_, 403) => AdapterError::AuthError(msg.to_string()),
            (110007, _) => AdapterError::InsufficientFunds,
            (110001, _) | (110025, _) => AdapterError::NotFound,
            (_, 400) => AdapterError::InvalidParam(msg.to_string()),
            _ => AdapterError::TransientNetwork(msg.to_string()),
        }
    }

    async fn post(&self, path: &str, body: serde_json::Value) -> AdapterResult<serde_json::Value> {
        if !self.rate_limiter.can_send_request() {
            return Err(AdapterError::RateLimited { retry_after_secs: 1 });
        }
        let body_str = body.to_string();
        let (_, _, headers) = self.signed_headers(&body_str);
        self.rate_limiter.record_request_sent();

        let mut req = self
            .client
            .post(format!("{}{}", self.base_url, path))
            .header("Content-Type", "application/json");
        for (k, v) in headers {
            req = req.header(k, v);
        }
        let resp = req
            .body(body_str)
            .send()
            .await
            .map_err(|e| AdapterError::TransientNetwork(e.to_string()))?;

        let status = resp.status();
        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| AdapterError::TransientNetwork(e.to_string()))?;

        let ret_code = json["retCode"].as_i64().unwrap_or(0);
        if ret_code != 0 {
            let msg = json["retMsg"].as_str().unwrap_or_default().to_string();
            warn!(ret_code, %msg, path, "bybit request failed");
            return Err(Self::classify_error(ret_code, status.as_u16(), &msg));
        }
        Ok(json)
    }

    async fn get(&self, path: &str, query: &str) -> AdapterResult<serde_json::Value> {
        if !self.rate_limiter.can_send_request() {
            return Err(AdapterError::RateLimited { retry_after_secs: 1 });
        }
        let (_, _, headers) = self.signed_headers("");
        self.rate_limiter.record_request_sent();
        let mut req = self
            .client
            .get(format!("{}{}?{}", self.base_url, path, query));
        for (k, v) in headers {
            req = req.header(k, v);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| AdapterError::TransientNetwork(e.to_string()))?;
        let status = resp.status();
        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| AdapterError::TransientNetwork(e.to_string()))?;
        let ret_code = json["retCode"].as_i64().unwrap_or(0);
        if ret_code != 0 {
            let msg = json["retMsg"].as_str().unwrap_or_default().to_string();
            return Err(Self::classify_error(ret_code, status.as_u16(), &msg));
        }
        Ok(json)
    }
}

#[async_trait]
impl ExchangeAdapter for BybitAdapter {
    fn name(&self) -> &str {
        "bybit"
    }

    fn is_parent_child(&self) -> bool {
        false
    }

    #[instrument(skip(self), name = "bybit.set_leverage")]
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> AdapterResult<()> {
        let body = serde_json::json!({
            "category": "linear",
            "symbol": self.to_venue_symbol(symbol),
            "buyLeverage": leverage.to_string(),
            "sellLeverage": leverage.to_string(),
        });
        match self.post("/v5/position/set-leverage", body).await {
            Ok(_) => Ok(()),
            Err(AdapterError::InvalidParam(m)) if m.contains("leverage not modified") => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), name = "bybit.set_margin_mode_isolated")]
    async fn set_margin_mode_isolated(&self, symbol: &str) -> AdapterResult<()> {
        let body = serde_json::json!({
            "category": "linear",
            "symbol": self.to_venue_symbol(symbol),
            "tradeMode": 1,
            "buyLeverage": "10",
            "sellLeverage": "10",
        });
        match self.post("/v5/position/switch-isolated", body).await {
            Ok(_) => Ok(()),
            Err(AdapterError::InvalidParam(m)) if m.contains("already") => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, price, attached_sl, attached_tp), name = "bybit.place_entry")]
    async fn place_entry(
        &self,
        symbol: &str,
        side: Side,
        qty: Decimal,
        price: Option<Decimal>,
        client_order_id: &str,
        attached_sl: Option<Decimal>,
        attached_tp: Option<Decimal>,
    ) -> AdapterResult<OrderAck> {
        if !self.rate_limiter.can_place_order() {
            return Err(AdapterError::RateLimited { retry_after_secs: 1 });
        }
        let venue_side = match side {
            Side::Long => "Buy",
            Side::Short => "Sell",
        };
        let mut body = serde_json::json!({
            "category": "linear",
            "symbol": self.to_venue_symbol(symbol),
            "side": venue_side,
            "orderType": if price.is_some() { "Limit" } else { "Market" },
            "qty": qty.to_string(),
            "orderLinkId": client_order_id,
        });
        if let Some(p) = price {
            body["price"] = serde_json::json!(p.to_string());
            body["timeInForce"] = serde_json::json!("GTC");
        }
        // Attached SL/TP live inline on the entry order, but they are still
        // serviced by the separate conditional queue once triggered — this
        // venue does NOT merge the queues on its own, hence `is_parent_child
        // == false`: the engine still treats them as independently
        // cancellable orders once placed.
        if let Some(sl) = attached_sl {
            body["stopLoss"] = serde_json::json!(sl.to_string());
        }
        if let Some(tp) = attached_tp {
            body["takeProfit"] = serde_json::json!(tp.to_string());
        }

        let resp = self.post("/v5/order/create", body).await?;
        self.rate_limiter.record_order_sent();
        let order_id = resp["result"]["orderId"].as_str().unwrap_or_default().to_string();
        Ok(OrderAck {
            order_id,
            client_order_id: client_order_id.to_string(),
            status: OrderStatus::Open,
        })
    }

    #[instrument(skip(self), name = "bybit.place_reduce_only")]
    async fn place_reduce_only(
        &self,
        symbol: &str,
        side: Side,
        qty: Decimal,
        stop_price: Decimal,
        kind: OrderKind,
        client_order_id: &str,
    ) -> AdapterResult<OrderAck> {
        let venue_side = match side {
            Side::Long => "Buy",
            Side::Short => "Sell",
        };
        let body = serde_json::json!({
            "category": "linear",
            "symbol": self.to_venue_symbol(symbol),
            "side": venue_side,
            "orderType": "Market",
            "qty": qty.to_string(),
            "reduceOnly": true,
            "triggerPrice": stop_price.to_string(),
            "orderFilter": "StopOrder",
            "orderLinkId": client_order_id,
        });
        let _ = kind; // Bybit's StopOrder filter covers both SL and TP conditional legs.
        let resp = self.post("/v5/order/create", body).await?;
        let order_id = resp["result"]["orderId"].as_str().unwrap_or_default().to_string();
        Ok(OrderAck {
            order_id,
            client_order_id: client_order_id.to_string(),
            status: OrderStatus::Open,
        })
    }

    #[instrument(skip(self), name = "bybit.close_position_market")]
    async fn close_position_market(
        &self,
        symbol: &str,
        side: Side,
        qty: Decimal,
        client_order_id: &str,
    ) -> AdapterResult<OrderAck> {
        let venue_side = match side {
            Side::Long => "Buy",
            Side::Short => "Sell",
        };
        let body = serde_json::json!({
            "category": "linear",
            "symbol": self.to_venue_symbol(symbol),
            "side": venue_side,
            "orderType": "Market",
            "qty": qty.to_string(),
            "reduceOnly": true,
            "orderLinkId": client_order_id,
        });
        let resp = self.post("/v5/order/create", body).await?;
        let order_id = resp["result"]["orderId"].as_str().unwrap_or_default().to_string();
        Ok(OrderAck {
            order_id,
            client_order_id: client_order_id.to_string(),
            status: OrderStatus::Open,
        })
    }

    #[instrument(skip(self), name = "bybit.cancel_order")]
    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
        hint: CancelHint,
    ) -> AdapterResult<()> {
        let order_filter = match hint {
            CancelHint::Algo => Some("StopOrder"),
            CancelHint::Standard => Some("Order"),
            CancelHint::Auto => None,
        };

        let try_cancel = |filter: Option<&str>| {
            let mut body = serde_json::json!({
                "category": "linear",
                "symbol": self.to_venue_symbol(symbol),
                "orderId": order_id,
            });
            if let Some(f) = filter {
                body["orderFilter"] = serde_json::json!(f);
            }
            body
        };

        match self.post("/v5/order/cancel", try_cancel(order_filter)).await {
            Ok(_) => Ok(()),
            Err(AdapterError::NotFound) if hint == CancelHint::Auto => {
                // Failover to the other queue before giving up.
                match self
                    .post("/v5/order/cancel", try_cancel(Some("StopOrder")))
                    .await
                {
                    Ok(_) => Ok(()),
                    Err(AdapterError::NotFound) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            Err(AdapterError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    async fn fetch_positions(&self) -> AdapterResult<Vec<ExchangePosition>> {
        let resp = self.get("/v5/position/list", "category=linear&settleCoin=USDT").await?;
        let list = resp["result"]["list"].as_array().cloned().unwrap_or_default();
        let mut out = Vec::new();
        for p in list {
            let size: Decimal = p["size"].as_str().and_then(|s| s.parse().ok()).unwrap_or_default();
            if size.is_zero() {
                continue;
            }
            let side = if p["side"].as_str() == Some("Buy") { Side::Long } else { Side::Short };
            out.push(ExchangePosition {
                symbol: self.normalize_symbol(p["symbol"].as_str().unwrap_or_default()),
                side,
                qty: size,
                entry_price: p["avgPrice"].as_str().and_then(|s| s.parse().ok()).unwrap_or_default(),
                leverage: p["leverage"]
                    .as_str()
                    .and_then(|s| s.parse::<f64>().ok())
                    .map(|f| f as u32)
                    .unwrap_or(1),
            });
        }
        Ok(out)
    }

    #[instrument(skip(self))]
    async fn fetch_open_orders(&self, symbol: Option<&str>) -> AdapterResult<Vec<Order>> {
        let sym_q = symbol
            .map(|s| format!("&symbol={}", self.to_venue_symbol(s)))
            .unwrap_or_default();

        let mut out = Vec::new();
        for filter in ["Order", "StopOrder"] {
            let query = format!("category=linear&orderFilter={filter}{sym_q}");
            let resp = self.get("/v5/order/realtime", &query).await?;
            let list = resp["result"]["list"].as_array().cloned().unwrap_or_default();
            for o in list {
                let side = if o["side"].as_str() == Some("Buy") { Side::Long } else { Side::Short };
                let kind = if filter == "StopOrder" {
                    if o["stopOrderType"].as_str() == Some("TakeProfit") {
                        OrderKind::TakeProfit
                    } else {
                        OrderKind::StopLoss
                    }
                } else {
                    OrderKind::Entry
                };
                out.push(Order {
                    order_id: o["orderId"].as_str().unwrap_or_default().to_string(),
                    client_order_id: o["orderLinkId"].as_str().unwrap_or_default().to_string(),
                    symbol: self.normalize_symbol(o["symbol"].as_str().unwrap_or_default()),
                    kind,
                    side,
                    qty: o["qty"].as_str().and_then(|s| s.parse().ok()).unwrap_or_default(),
                    filled_qty: o["cumExecQty"].as_str().and_then(|s| s.parse().ok()).unwrap_or_default(),
                    price: o["price"].as_str().and_then(|s| s.parse().ok()),
                    status: Self::order_status_from_str(o["orderStatus"].as_str().unwrap_or_default()),
                });
            }
        }
        Ok(out)
    }

    #[instrument(skip(self))]
    async fn fetch_my_trades(&self, symbol: &str, since: i64) -> AdapterResult<Vec<Fill>> {
        let query = format!(
            "category=linear&symbol={}&startTime={since}",
            self.to_venue_symbol(symbol)
        );
        let resp = self.get("/v5/execution/list", &query).await?;
        let list = resp["result"]["list"].as_array().cloned().unwrap_or_default();
        let mut out = Vec::new();
        for t in list {
            let side = if t["side"].as_str() == Some("Buy") { Side::Long } else { Side::Short };
            out.push(Fill {
                order_id: t["orderId"].as_str().unwrap_or_default().to_string(),
                symbol: symbol.to_string(),
                side,
                qty: t["execQty"].as_str().and_then(|s| s.parse().ok()).unwrap_or_default(),
                price: t["execPrice"].as_str().and_then(|s| s.parse().ok()).unwrap_or_default(),
                fee: t["execFee"].as_str().and_then(|s| s.parse().ok()).unwrap_or_default(),
                timestamp: t["execTime"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_default(),
            });
        }
        Ok(out)
    }

    #[instrument(skip(self))]
    async fn fetch_balance(&self) -> AdapterResult<Decimal> {
        let resp = self
            .get("/v5/account/wallet-balance", "accountType=UNIFIED")
            .await?;
        let list = resp["result"]["list"].as_array().cloned().unwrap_or_default();
        Ok(list
            .first()
            .and_then(|acct| acct["totalAvailableBalance"].as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or_default())
    }

    fn normalize_symbol(&self, input: &str) -> String {
        input.to_uppercase()
    }

    fn to_venue_symbol(&self, canonical: &str) -> String {
        canonical.to_uppercase()
    }

    fn amount_to_precision(&self, _symbol: &str, amount: Decimal) -> Decimal {
        amount.round_dp(3)
    }

    fn price_to_precision(&self, _symbol: &str, price: Decimal) -> Decimal {
        price.round_dp(2)
    }

    async fn server_time_ms(&self) -> AdapterResult<i64> {
        let resp = self
            .client
            .get(format!("{}/v5/market/time", self.base_url))
            .send()
            .await
            .map_err(|e| AdapterError::TransientNetwork(e.to_string()))?
            .json::<serde_json::Value>()
            .await
            .map_err(|e| AdapterError::TransientNetwork(e.to_string()))?;
        let secs: i64 = resp["result"]["timeSecond"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();
        Ok(secs * 1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> BybitAdapter {
        BybitAdapter::new("key", "secret")
    }

    #[test]
    fn classify_error_maps_rate_limit_codes() {
        assert!(matches!(
            BybitAdapter::classify_error(10006, 200, "rate"),
            AdapterError::RateLimited { .. }
        ));
        assert!(matches!(
            BybitAdapter::classify_error(0, 429, "rate"),
            AdapterError::RateLimited { .. }
        ));
    }

    #[test]
    fn classify_error_maps_venue_down() {
        assert!(matches!(
            BybitAdapter::classify_error(10016, 200, "down"),
            AdapterError::VenueDown(_)
        ));
        assert!(matches!(
            BybitAdapter::classify_error(0, 503, "down"),
            AdapterError::VenueDown(_)
        ));
    }

    #[test]
    fn classify_error_maps_insufficient_funds() {
        assert!(matches!(
            BybitAdapter::classify_error(110007, 200, "insufficient"),
            AdapterError::InsufficientFunds
        ));
    }

    #[test]
    fn is_parent_child_is_false() {
        assert!(!adapter().is_parent_child());
    }

    #[test]
    fn signed_headers_carry_bapi_prefixed_keys() {
        let a = adapter();
        let (_, sig, headers) = a.signed_headers("{}");
        assert_eq!(sig.len(), 64);
        let keys: Vec<&str> = headers.iter().map(|(k, _)| *k).collect();
        assert!(keys.contains(&"X-BAPI-API-KEY"));
        assert!(keys.contains(&"X-BAPI-SIGN"));
        assert!(keys.contains(&"X-BAPI-TIMESTAMP"));
        assert!(keys.contains(&"X-BAPI-RECV-WINDOW"));
    }
}
