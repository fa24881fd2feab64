// =============================================================================
// Exchange adapter contract (spec §4.1)
// =============================================================================
//
// A uniform capability set over heterogeneous perpetual-futures venues. Two
// implementations ship with the engine: `binance` (a parent-child venue,
// where attached SL/TP cancel with the parent) and `bybit` (an algo-separate
// venue, where SL/TP live in a distinct conditional-order queue).

pub mod binance;
pub mod bybit;
pub mod rate_limit;

use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::types::{CancelHint, OrderKind, Side};

/// Error taxonomy every adapter normalizes venue failures into (spec §4.1, §7).
#[derive(Debug, Error, Clone)]
pub enum AdapterError {
    #[error("transient network error: {0}")]
    TransientNetwork(String),
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("not found")]
    NotFound,
    #[error("invalid parameter: {0}")]
    InvalidParam(String),
    #[error("insufficient funds")]
    InsufficientFunds,
    #[error("authentication error: {0}")]
    AuthError(String),
    #[error("venue unavailable: {0}")]
    VenueDown(String),
}

impl AdapterError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AdapterError::TransientNetwork(_)
                | AdapterError::RateLimited { .. }
                | AdapterError::VenueDown(_)
        )
    }
}

pub type AdapterResult<T> = Result<T, AdapterError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderStatus {
    Open,
    Filled,
    PartiallyFilled,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: String,
    pub client_order_id: String,
    pub status: OrderStatus,
}

#[derive(Debug, Clone)]
pub struct ExchangePosition {
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub entry_price: Decimal,
    pub leverage: u32,
}

#[derive(Debug, Clone)]
pub struct Order {
    pub order_id: String,
    pub client_order_id: String,
    pub symbol: String,
    pub kind: OrderKind,
    pub side: Side,
    pub qty: Decimal,
    /// Quantity actually executed so far — less than `qty` for a
    /// `PartiallyFilled` order, equal to it once `Filled`.
    pub filled_qty: Decimal,
    pub price: Option<Decimal>,
    pub status: OrderStatus,
}

#[derive(Debug, Clone)]
pub struct Fill {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub price: Decimal,
    pub fee: Decimal,
    pub timestamp: i64,
}

/// Capability set implemented per venue. All methods are idempotent with
/// respect to `client_order_id` where the venue supports it.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// True for venues where attached SL/TP are cancelled automatically when
    /// the parent entry is cancelled (spec §4.1 "parent-child" obligation).
    fn is_parent_child(&self) -> bool;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> AdapterResult<()>;
    async fn set_margin_mode_isolated(&self, symbol: &str) -> AdapterResult<()>;

    async fn place_entry(
        &self,
        symbol: &str,
        side: Side,
        qty: Decimal,
        price: Option<Decimal>,
        client_order_id: &str,
        attached_sl: Option<Decimal>,
        attached_tp: Option<Decimal>,
    ) -> AdapterResult<OrderAck>;

    async fn place_reduce_only(
        &self,
        symbol: &str,
        side: Side,
        qty: Decimal,
        stop_price: Decimal,
        kind: OrderKind,
        client_order_id: &str,
    ) -> AdapterResult<OrderAck>;

    /// Closes (or reduces) an open position immediately at market, as opposed
    /// to `place_reduce_only`'s conditional trigger order — used by
    /// signal-flip exits and admin force-close (spec §4.1).
    async fn close_position_market(
        &self,
        symbol: &str,
        side: Side,
        qty: Decimal,
        client_order_id: &str,
    ) -> AdapterResult<OrderAck>;

    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: &str,
        hint: CancelHint,
    ) -> AdapterResult<()>;

    async fn fetch_positions(&self) -> AdapterResult<Vec<ExchangePosition>>;

    /// MUST merge standard and algo/conditional queues into one list.
    async fn fetch_open_orders(&self, symbol: Option<&str>) -> AdapterResult<Vec<Order>>;

    async fn fetch_my_trades(&self, symbol: &str, since: i64) -> AdapterResult<Vec<Fill>>;

    /// Current account balance in the venue's settlement asset (USDT for
    /// both shipped adapters) — feeds `RiskGate::update_balance` (spec §4.5).
    async fn fetch_balance(&self) -> AdapterResult<Decimal>;

    fn normalize_symbol(&self, input: &str) -> String;
    fn to_venue_symbol(&self, canonical: &str) -> String;

    fn amount_to_precision(&self, symbol: &str, amount: Decimal) -> Decimal;
    fn price_to_precision(&self, symbol: &str, price: Decimal) -> Decimal;

    async fn server_time_ms(&self) -> AdapterResult<i64>;
}

/// Keyed registry so profiles reference an adapter by exchange name rather
/// than a concrete type (spec §6.2).
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, std::sync::Arc<dyn ExchangeAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, adapter: std::sync::Arc<dyn ExchangeAdapter>) {
        self.adapters.insert(name.into(), adapter);
    }

    pub fn get(&self, name: &str) -> Option<std::sync::Arc<dyn ExchangeAdapter>> {
        self.adapters.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors_are_classified_correctly() {
        assert!(AdapterError::TransientNetwork("x".into()).is_retryable());
        assert!(AdapterError::RateLimited { retry_after_secs: 1 }.is_retryable());
        assert!(AdapterError::VenueDown("x".into()).is_retryable());
        assert!(!AdapterError::NotFound.is_retryable());
        assert!(!AdapterError::InsufficientFunds.is_retryable());
        assert!(!AdapterError::AuthError("x".into()).is_retryable());
        assert!(!AdapterError::InvalidParam("x".into()).is_retryable());
    }

    #[test]
    fn registry_returns_none_for_unknown_exchange() {
        let reg = AdapterRegistry::new();
        assert!(reg.get("binance").is_none());
    }
}
