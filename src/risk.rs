// =============================================================================
// RiskGate — gates every Trader::open() call (spec §4.5)
// =============================================================================
//
// Rules are evaluated in a fixed order and the first denial wins. The
// date-rollover idiom (a read-locked comparison followed by a re-checked
// write-locked reset) is grounded on the legacy risk engine's
// `maybe_reset_daily`; the four-breaker rule set itself is replaced outright
// per spec §4.5, which specifies a different and more precise set.

use chrono::Utc;
use chrono_tz::Tz;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::config::RiskTier;
use crate::store::PositionStore;
use crate::types::ExitReason;

#[derive(Debug, Clone)]
struct Inner {
    peak_balance: Decimal,
    daily_loss: Decimal,
    daily_reset_date: String,
    starting_balance: Decimal,
    circuit_breaker_tripped: bool,
}

pub struct RiskGate {
    profile_id: String,
    state: RwLock<Inner>,
    store: std::sync::Arc<PositionStore>,
    drawdown_circuit_breaker_pct: Decimal,
    daily_loss_limit_pct: Decimal,
    sl_cooldown_secs: i64,
    max_leverage: u32,
    timezone: Tz,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Denial {
    CircuitBreakerTripped,
    DailyLossLimitReached,
    Cooldown { remaining_secs: i64 },
    SymbolAlreadyOpen,
    NoQualifyingTier,
    ZeroOrNegativeQty,
}

impl std::fmt::Display for Denial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Denial::CircuitBreakerTripped => write!(f, "circuit breaker tripped (drawdown)"),
            Denial::DailyLossLimitReached => write!(f, "daily loss limit reached"),
            Denial::Cooldown { remaining_secs } => write!(f, "symbol in cooldown for {remaining_secs}s more"),
            Denial::SymbolAlreadyOpen => write!(f, "an active/pending position already exists for this symbol"),
            Denial::NoQualifyingTier => write!(f, "signal score does not qualify for any sizing tier"),
            Denial::ZeroOrNegativeQty => write!(f, "computed position size is zero or negative"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SizeDecision {
    pub leverage: u32,
    pub margin_usdt: Decimal,
    pub qty: Decimal,
}

impl RiskGate {
    pub fn new(
        profile_id: impl Into<String>,
        store: std::sync::Arc<PositionStore>,
        starting_balance: Decimal,
        drawdown_circuit_breaker_pct: Decimal,
        daily_loss_limit_pct: Decimal,
        sl_cooldown_secs: i64,
        max_leverage: u32,
        timezone: &str,
    ) -> Self {
        let tz: Tz = timezone.parse().unwrap_or(chrono_tz::UTC);
        Self {
            profile_id: profile_id.into(),
            state: RwLock::new(Inner {
                peak_balance: starting_balance,
                daily_loss: Decimal::ZERO,
                daily_reset_date: Utc::now().with_timezone(&tz).format("%Y-%m-%d").to_string(),
                starting_balance,
                circuit_breaker_tripped: false,
            }),
            store,
            drawdown_circuit_breaker_pct,
            daily_loss_limit_pct,
            sl_cooldown_secs,
            max_leverage,
            timezone: tz,
        }
    }

    fn today(&self) -> String {
        Utc::now()
            .with_timezone(&self.timezone)
            .format("%Y-%m-%d")
            .to_string()
    }

    /// Double-checked-locking daily rollover: cheap read-lock check first,
    /// re-verified under the write lock before mutating (P7: reset occurs
    /// exactly once per calendar day).
    fn maybe_reset_daily(&self) {
        let today = self.today();
        {
            let s = self.state.read();
            if s.daily_reset_date == today {
                return;
            }
        }
        let mut s = self.state.write();
        if s.daily_reset_date != today {
            info!(profile = %self.profile_id, date = %today, "daily risk metrics reset");
            s.daily_loss = Decimal::ZERO;
            s.daily_reset_date = today;
        }
    }

    /// Rule 1 + 2: drawdown circuit breaker and daily loss limit.
    fn check_circuit_breakers(&self) -> Result<(), Denial> {
        self.maybe_reset_daily();
        let s = self.state.read();
        if s.circuit_breaker_tripped {
            return Err(Denial::CircuitBreakerTripped);
        }
        if !s.starting_balance.is_zero() && s.daily_loss / s.starting_balance >= self.daily_loss_limit_pct
        {
            return Err(Denial::DailyLossLimitReached);
        }
        Ok(())
    }

    /// Feed a fresh balance reading (e.g. from reconciliation) so the
    /// drawdown breaker has an up-to-date peak to compare against.
    pub fn update_balance(&self, current_balance: Decimal) {
        let mut s = self.state.write();
        if current_balance > s.peak_balance {
            s.peak_balance = current_balance;
        }
        if !s.peak_balance.is_zero() {
            let drawdown = (s.peak_balance - current_balance) / s.peak_balance;
            if drawdown >= self.drawdown_circuit_breaker_pct && !s.circuit_breaker_tripped {
                warn!(profile = %self.profile_id, %drawdown, "circuit breaker tripped on drawdown");
                s.circuit_breaker_tripped = true;
            }
        }
    }

    /// Admin operation: `resume_after_circuit_breaker` (§6.5).
    pub fn resume_after_circuit_breaker(&self) {
        let mut s = self.state.write();
        s.circuit_breaker_tripped = false;
        info!(profile = %self.profile_id, "circuit breaker cleared by operator");
    }

    pub fn is_circuit_breaker_tripped(&self) -> bool {
        self.state.read().circuit_breaker_tripped
    }

    /// Rule 3 + 4: cooldown then per-symbol guard.
    async fn check_cooldown_and_guard(&self, symbol: &str) -> Result<(), Denial> {
        if let Some(expiry) = self
            .store
            .get_cooldown(&self.profile_id, symbol)
            .await
            .unwrap_or(None)
        {
            let now = Utc::now().timestamp();
            if now < expiry {
                return Err(Denial::Cooldown {
                    remaining_secs: expiry - now,
                });
            }
        }
        if self
            .store
            .has_any_open_for_symbol(&self.profile_id, symbol)
            .await
            .unwrap_or(false)
        {
            return Err(Denial::SymbolAlreadyOpen);
        }
        Ok(())
    }

    /// Rule 5 + 6: tiered sizing then leverage clamp.
    fn size(&self, score: Decimal, entry_price: Decimal, tiers: &[RiskTier]) -> Result<SizeDecision, Denial> {
        let tier = tiers
            .iter()
            .filter(|t| score >= t.min_score)
            .max_by(|a, b| a.min_score.cmp(&b.min_score))
            .ok_or(Denial::NoQualifyingTier)?;

        let leverage = tier.leverage.min(self.max_leverage);
        if entry_price.is_zero() {
            return Err(Denial::ZeroOrNegativeQty);
        }
        let qty = (tier.margin_usdt * Decimal::from(leverage)) / entry_price;
        if qty <= Decimal::ZERO {
            return Err(Denial::ZeroOrNegativeQty);
        }
        Ok(SizeDecision {
            leverage,
            margin_usdt: tier.margin_usdt,
            qty,
        })
    }

    /// Full gate, rules 1-6 in order. Returns the sizing decision on success.
    pub async fn evaluate(
        &self,
        symbol: &str,
        score: Decimal,
        entry_price: Decimal,
        tiers: &[RiskTier],
    ) -> Result<SizeDecision, Denial> {
        self.check_circuit_breakers()?;
        self.check_cooldown_and_guard(symbol).await?;
        self.size(score, entry_price, tiers)
    }

    /// Called by the Trader after a trade is finalized. Sets a cooldown only
    /// on a realized SL (DESIGN.md open question #1) and rolls the daily-loss
    /// counter.
    pub async fn record_trade_result(&self, symbol: &str, pnl: Decimal, exit_reason: ExitReason) {
        self.maybe_reset_daily();
        if pnl < Decimal::ZERO {
            let mut s = self.state.write();
            s.daily_loss += -pnl;
        }
        if exit_reason == ExitReason::Sl {
            let expiry = Utc::now().timestamp() + self.sl_cooldown_secs;
            if let Err(e) = self.store.set_cooldown(&self.profile_id, symbol, expiry).await {
                warn!(error = %e, symbol, "failed to persist cooldown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn tiers() -> Vec<RiskTier> {
        vec![
            RiskTier { min_score: dec!(5), leverage: 5, margin_usdt: dec!(20) },
            RiskTier { min_score: dec!(7), leverage: 8, margin_usdt: dec!(35) },
            RiskTier { min_score: dec!(9), leverage: 12, margin_usdt: dec!(50) },
        ]
    }

    async fn gate() -> RiskGate {
        let store = std::sync::Arc::new(crate::store::PositionStore::open_in_memory().unwrap());
        RiskGate::new("p1", store, dec!(1000), dec!(0.10), dec!(0.03), 7200, 12, "UTC")
    }

    #[tokio::test]
    async fn sizing_picks_highest_qualifying_tier() {
        let g = gate().await;
        let decision = g.size(dec!(8), dec!(100), &tiers()).unwrap();
        assert_eq!(decision.leverage, 8);
        assert_eq!(decision.margin_usdt, dec!(35));
    }

    #[tokio::test]
    async fn sizing_denies_when_score_below_all_tiers() {
        let g = gate().await;
        let result = g.size(dec!(1), dec!(100), &tiers());
        assert_eq!(result.unwrap_err(), Denial::NoQualifyingTier);
    }

    #[tokio::test]
    async fn leverage_clamp_applies_even_if_tier_requests_more() {
        let store = std::sync::Arc::new(crate::store::PositionStore::open_in_memory().unwrap());
        let g = RiskGate::new("p1", store, dec!(1000), dec!(0.10), dec!(0.03), 7200, 6, "UTC");
        let decision = g.size(dec!(9), dec!(100), &tiers()).unwrap();
        assert_eq!(decision.leverage, 6);
    }

    #[tokio::test]
    async fn drawdown_circuit_breaker_trips_at_threshold() {
        let g = gate().await;
        assert!(!g.is_circuit_breaker_tripped());
        g.update_balance(dec!(900)); // 10% down from peak 1000
        assert!(g.is_circuit_breaker_tripped());
    }

    #[tokio::test]
    async fn resume_clears_circuit_breaker() {
        let g = gate().await;
        g.update_balance(dec!(850));
        assert!(g.is_circuit_breaker_tripped());
        g.resume_after_circuit_breaker();
        assert!(!g.is_circuit_breaker_tripped());
    }

    #[tokio::test]
    async fn cooldown_blocks_reentry_until_expiry() {
        let g = gate().await;
        g.store.set_cooldown("p1", "SOLUSDT", Utc::now().timestamp() + 100).await.unwrap();
        let result = g.check_cooldown_and_guard("SOLUSDT").await;
        assert!(matches!(result, Err(Denial::Cooldown { .. })));
    }

    #[tokio::test]
    async fn symbol_guard_blocks_second_open_on_same_symbol() {
        let g = gate().await;
        let pos = crate::store::Position {
            id: 0,
            profile_id: "p1".into(),
            pos_key: "P1_BINANCE_BTCUSDT_5m".into(),
            symbol: "BTCUSDT".into(),
            side: crate::types::Side::Long,
            qty: dec!(0.1),
            entry_price: dec!(100),
            sl_price: dec!(95),
            tp_price: dec!(110),
            leverage: 5,
            margin_mode: crate::types::MarginMode::Isolated,
            timeframe: "5m".into(),
            status: crate::types::PositionStatus::Active,
            order_type: crate::types::OrderType::Market,
            entry_order_id: None,
            sl_order_id: None,
            tp_order_id: None,
            entry_time: 0,
            entry_confidence: 0.9,
            feature_snapshot: serde_json::Value::Null,
            config_version: 0,
            profit_lock_active: false,
            tp_extended: false,
            emergency_tightened: false,
            protective_last_created_at: 0,
        };
        g.store.upsert_active(&pos).await.unwrap();
        let result = g.check_cooldown_and_guard("BTCUSDT").await;
        assert_eq!(result.unwrap_err(), Denial::SymbolAlreadyOpen);
    }

    #[tokio::test]
    async fn record_trade_result_sets_cooldown_only_on_sl() {
        let g = gate().await;
        g.record_trade_result("BTCUSDT", dec!(-5), ExitReason::Tp).await;
        assert!(g.store.get_cooldown("p1", "BTCUSDT").await.unwrap().is_none());

        g.record_trade_result("BTCUSDT", dec!(-5), ExitReason::Sl).await;
        assert!(g.store.get_cooldown("p1", "BTCUSDT").await.unwrap().is_some());
    }
}
