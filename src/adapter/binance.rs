// =============================================================================
// Binance USD-M futures adapter — a parent-child venue
// =============================================================================
//
// Entry orders may carry attached SL/TP via `STOP_MARKET`/`TAKE_PROFIT_MARKET`
// closePosition orders; cancelling the parent leaves the attached orders to
// be reaped by the standard orders endpoint (they are visible there, unlike
// an algo-separate venue's conditional queue).

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::adapter::rate_limit::RateLimitTracker;
use crate::adapter::{
    AdapterError, AdapterResult, ExchangeAdapter, ExchangePosition, Fill, Order, OrderAck,
    OrderStatus,
};
use crate::types::{CancelHint, OrderKind, Side};

const RECV_WINDOW_MS: i64 = 5_000;

type HmacSha256 = Hmac<Sha256>;

pub struct BinanceFuturesAdapter {
    api_key: String,
    secret: String,
    base_url: String,
    client: Client,
    rate_limiter: RateLimitTracker,
}

impl BinanceFuturesAdapter {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            base_url: "https://fapi.binance.com".to_string(),
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

    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("hmac accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW_MS}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW_MS}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    fn classify_status(&self, status: reqwest::StatusCode, body: &str) -> AdapterError {
        match status.as_u16() {
            429 | 418 => AdapterError::RateLimited { retry_after_secs: 10 },
            401 | 403 => AdapterError::AuthError(body.to_string()),
            404 => AdapterError::NotFound,
            400 if body.contains("-2019") || body.contains("Margin is insufficient") => {
                AdapterError::InsufficientFunds
            }
            400 => AdapterError::InvalidParam(body.to_string()),
            500..=599 => AdapterError::VenueDown(body.to_string()),
            _ => AdapterError::TransientNetwork(body.to_string()),
        }
    }

    async fn send_signed(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &str,
    ) -> AdapterResult<serde_json::Value> {
        if !self.rate_limiter.can_send_request() {
            return Err(AdapterError::RateLimited { retry_after_secs: 1 });
        }
        let query = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, path, query);
        self.rate_limiter.record_request_sent();

        let resp = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| AdapterError::TransientNetwork(e.to_string()))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| AdapterError::TransientNetwork(e.to_string()))?;

        if !status.is_success() {
            warn!(%status, %body, path, "binance futures request failed");
            return Err(self.classify_status(status, &body));
        }

        serde_json::from_str(&body)
            .map_err(|e| AdapterError::TransientNetwork(format!("invalid json: {e}")))
    }

    fn order_status_from_str(s: &str) -> OrderStatus {
        match s {
            "FILLED" => OrderStatus::Filled,
            "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
            "CANCELED" | "EXPIRED" | "REJECTED" => OrderStatus::Cancelled,
            _ => OrderStatus::Open,
        }
    }

    fn kind_from_order_type(order_type: &str) -> OrderKind {
        if order_type.starts_with("STOP") {
            OrderKind::StopLoss
        } else if order_type.starts_with("TAKE_PROFIT") {
            OrderKind::TakeProfit
        } else {
            OrderKind::Entry
        }
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceFuturesAdapter {
    fn name(&self) -> &str {
        "binance"
    }

    fn is_parent_child(&self) -> bool {
        true
    }

    #[instrument(skip(self), name = "binance.set_leverage")]
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> AdapterResult<()> {
        let venue_symbol = self.to_venue_symbol(symbol);
        let params = format!("symbol={venue_symbol}&leverage={leverage}");
        self.send_signed(reqwest::Method::POST, "/fapi/v1/leverage", &params)
            .await?;
        Ok(())
    }

    #[instrument(skip(self), name = "binance.set_margin_mode_isolated")]
    async fn set_margin_mode_isolated(&self, symbol: &str) -> AdapterResult<()> {
        let venue_symbol = self.to_venue_symbol(symbol);
        let params = format!("symbol={venue_symbol}&marginType=ISOLATED");
        match self
            .send_signed(reqwest::Method::POST, "/fapi/v1/marginType", &params)
            .await
        {
            Ok(_) => Ok(()),
            // Binance returns -4046 "No need to change margin type" when
            // already isolated; treat as success.
            Err(AdapterError::InvalidParam(body)) if body.contains("-4046") => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, price, attached_sl, attached_tp), name = "binance.place_entry")]
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
        let venue_symbol = self.to_venue_symbol(symbol);
        let venue_side = match side {
            Side::Long => "BUY",
            Side::Short => "SELL",
        };
        let (order_type, price_part) = match price {
            Some(p) => ("LIMIT".to_string(), format!("&price={p}&timeInForce=GTC")),
            None => ("MARKET".to_string(), String::new()),
        };
        let params = format!(
            "symbol={venue_symbol}&side={venue_side}&type={order_type}&quantity={qty}{price_part}&newClientOrderId={client_order_id}"
        );
        let resp = self
            .send_signed(reqwest::Method::POST, "/fapi/v1/order", &params)
            .await?;
        self.rate_limiter.record_order_sent();

        debug!(?attached_sl, ?attached_tp, "binance has no native bracket field; caller places protective orders separately");

        let order_id = resp["orderId"].as_u64().unwrap_or_default().to_string();
        let status = resp["status"].as_str().unwrap_or("NEW");
        Ok(OrderAck {
            order_id,
            client_order_id: client_order_id.to_string(),
            status: Self::order_status_from_str(status),
        })
    }

    #[instrument(skip(self), name = "binance.place_reduce_only")]
    async fn place_reduce_only(
        &self,
        symbol: &str,
        side: Side,
        qty: Decimal,
        stop_price: Decimal,
        kind: OrderKind,
        client_order_id: &str,
    ) -> AdapterResult<OrderAck> {
        let venue_symbol = self.to_venue_symbol(symbol);
        let venue_side = match side {
            Side::Long => "BUY",
            Side::Short => "SELL",
        };
        let order_type = match kind {
            OrderKind::StopLoss => "STOP_MARKET",
            OrderKind::TakeProfit => "TAKE_PROFIT_MARKET",
            OrderKind::Entry => "MARKET",
        };
        let params = format!(
            "symbol={venue_symbol}&side={venue_side}&type={order_type}&stopPrice={stop_price}&closePosition=true&quantity={qty}&newClientOrderId={client_order_id}"
        );
        let resp = self
            .send_signed(reqwest::Method::POST, "/fapi/v1/order", &params)
            .await?;
        let order_id = resp["orderId"].as_u64().unwrap_or_default().to_string();
        Ok(OrderAck {
            order_id,
            client_order_id: client_order_id.to_string(),
            status: OrderStatus::Open,
        })
    }

    #[instrument(skip(self), name = "binance.close_position_market")]
    async fn close_position_market(
        &self,
        symbol: &str,
        side: Side,
        qty: Decimal,
        client_order_id: &str,
    ) -> AdapterResult<OrderAck> {
        let venue_symbol = self.to_venue_symbol(symbol);
        let venue_side = match side {
            Side::Long => "BUY",
            Side::Short => "SELL",
        };
        let params = format!(
            "symbol={venue_symbol}&side={venue_side}&type=MARKET&quantity={qty}&reduceOnly=true&newClientOrderId={client_order_id}"
        );
        let resp = self
            .send_signed(reqwest::Method::POST, "/fapi/v1/order", &params)
            .await?;
        let order_id = resp["orderId"].as_u64().unwrap_or_default().to_string();
        let status = resp["status"].as_str().unwrap_or("NEW");
        Ok(OrderAck {
            order_id,
            client_order_id: client_order_id.to_string(),
            status: Self::order_status_from_str(status),
        })
    }

    #[instrument(skip(self), name = "binance.cancel_order")]
    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
        _hint: CancelHint,
    ) -> AdapterResult<()> {
        // Parent-child venue: a single orders endpoint covers both standard
        // and attached-protective orders, so the hint is irrelevant here.
        let venue_symbol = self.to_venue_symbol(symbol);
        let params = format!("symbol={venue_symbol}&orderId={order_id}");
        match self
            .send_signed(reqwest::Method::DELETE, "/fapi/v1/order", &params)
            .await
        {
            Ok(_) => Ok(()),
            Err(AdapterError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    async fn fetch_positions(&self) -> AdapterResult<Vec<ExchangePosition>> {
        let resp = self
            .send_signed(reqwest::Method::GET, "/fapi/v2/positionRisk", "")
            .await?;
        let arr = resp.as_array().cloned().unwrap_or_default();
        let mut out = Vec::new();
        for p in arr {
            let amt: Decimal = p["positionAmt"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or_default();
            if amt.is_zero() {
                continue;
            }
            let side = if amt > Decimal::ZERO { Side::Long } else { Side::Short };
            let entry_price: Decimal = p["entryPrice"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or_default();
            let leverage: u32 = p["leverage"]
                .as_str()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1);
            out.push(ExchangePosition {
                symbol: self.normalize_symbol(p["symbol"].as_str().unwrap_or_default()),
                side,
                qty: amt.abs(),
                entry_price,
                leverage,
            });
        }
        Ok(out)
    }

    #[instrument(skip(self))]
    async fn fetch_open_orders(&self, symbol: Option<&str>) -> AdapterResult<Vec<Order>> {
        let params = symbol
            .map(|s| format!("symbol={}", self.to_venue_symbol(s)))
            .unwrap_or_default();
        let resp = self
            .send_signed(reqwest::Method::GET, "/fapi/v1/openOrders", &params)
            .await?;
        let arr = resp.as_array().cloned().unwrap_or_default();
        let mut out = Vec::new();
        for o in arr {
            let side = if o["side"].as_str() == Some("BUY") {
                Side::Long
            } else {
                Side::Short
            };
            out.push(Order {
                order_id: o["orderId"].as_u64().unwrap_or_default().to_string(),
                client_order_id: o["clientOrderId"].as_str().unwrap_or_default().to_string(),
                symbol: self.normalize_symbol(o["symbol"].as_str().unwrap_or_default()),
                kind: Self::kind_from_order_type(o["type"].as_str().unwrap_or_default()),
                side,
                qty: o["origQty"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_default(),
                filled_qty: o["executedQty"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_default(),
                price: o["price"].as_str().and_then(|s| s.parse().ok()),
                status: Self::order_status_from_str(o["status"].as_str().unwrap_or_default()),
            });
        }
        Ok(out)
    }

    #[instrument(skip(self))]
    async fn fetch_my_trades(&self, symbol: &str, since: i64) -> AdapterResult<Vec<Fill>> {
        let venue_symbol = self.to_venue_symbol(symbol);
        let params = format!("symbol={venue_symbol}&startTime={since}");
        let resp = self
            .send_signed(reqwest::Method::GET, "/fapi/v1/userTrades", &params)
            .await?;
        let arr = resp.as_array().cloned().unwrap_or_default();
        let mut out = Vec::new();
        for t in arr {
            let side = if t["side"].as_str() == Some("BUY") {
                Side::Long
            } else {
                Side::Short
            };
            out.push(Fill {
                order_id: t["orderId"].as_u64().unwrap_or_default().to_string(),
                symbol: symbol.to_string(),
                side,
                qty: t["qty"].as_str().and_then(|s| s.parse().ok()).unwrap_or_default(),
                price: t["price"].as_str().and_then(|s| s.parse().ok()).unwrap_or_default(),
                fee: t["commission"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or_default(),
                timestamp: t["time"].as_i64().unwrap_or_default(),
            });
        }
        Ok(out)
    }

    #[instrument(skip(self))]
    async fn fetch_balance(&self) -> AdapterResult<Decimal> {
        let resp = self
            .send_signed(reqwest::Method::GET, "/fapi/v2/balance", "")
            .await?;
        let arr = resp.as_array().cloned().unwrap_or_default();
        let usdt = arr.iter().find(|a| a["asset"].as_str() == Some("USDT"));
        Ok(usdt
            .and_then(|a| a["availableBalance"].as_str())
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
            .get(format!("{}/fapi/v1/time", self.base_url))
            .send()
            .await
            .map_err(|e| AdapterError::TransientNetwork(e.to_string()))?
            .json::<serde_json::Value>()
            .await
            .map_err(|e| AdapterError::TransientNetwork(e.to_string()))?;
        Ok(resp["serverTime"].as_i64().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> BinanceFuturesAdapter {
        BinanceFuturesAdapter::new("key", "secret")
    }

    #[test]
    fn signature_is_deterministic_for_same_input() {
        let a = adapter();
        let sig1 = a.sign("symbol=BTCUSDT&timestamp=1");
        let sig2 = a.sign("symbol=BTCUSDT&timestamp=1");
        assert_eq!(sig1, sig2);
        assert_eq!(sig1.len(), 64);
    }

    #[test]
    fn signed_query_appends_timestamp_recv_window_and_signature() {
        let a = adapter();
        let q = a.signed_query("symbol=BTCUSDT");
        assert!(q.contains("symbol=BTCUSDT"));
        assert!(q.contains("recvWindow=5000"));
        assert!(q.contains("signature="));
    }

    #[test]
    fn status_429_classifies_as_rate_limited() {
        let a = adapter();
        let err = a.classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "");
        assert!(matches!(err, AdapterError::RateLimited { .. }));
    }

    #[test]
    fn status_500_classifies_as_venue_down() {
        let a = adapter();
        let err = a.classify_status(reqwest::StatusCode::INTERNAL_SERVER_ERROR, "oops");
        assert!(matches!(err, AdapterError::VenueDown(_)));
    }

    #[test]
    fn is_parent_child_is_true() {
        assert!(adapter().is_parent_child());
    }

    #[test]
    fn normalize_and_venue_symbol_are_uppercase() {
        let a = adapter();
        assert_eq!(a.normalize_symbol("btcusdt"), "BTCUSDT");
        assert_eq!(a.to_venue_symbol("btcusdt"), "BTCUSDT");
    }
}
