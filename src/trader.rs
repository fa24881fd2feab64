// =============================================================================
// Trader — the signal-to-order state machine (spec §4.3)
// =============================================================================
//
// Grounded on the legacy `ExecutionEngine`'s risk-gate-then-place flow and on
// `exit/triple_barrier.rs`'s one-shot-flag / only-tighten-never-widen idiom,
// generalized far beyond either: this module owns the full open/monitor/
// lifecycle/flip/reversal/reap state machine the legacy engine never had.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use parking_lot::RwLock as SyncRwLock;
use rust_decimal::Decimal;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, instrument, warn};

use crate::adapter::{AdapterError, ExchangeAdapter};
use crate::config::{EngineConfig, SlTpParams};
use crate::risk::{Denial, RiskGate};
use crate::signal::SignalSnapshot;
use crate::store::{Position, PositionStore, Trade};
use crate::types::{CancelHint, Environment, ExitReason, OrderKind, OrderType, PositionStatus, Side, SignalSide};

/// Per-symbol serialization (spec §5): all placement/cancellation/SL-TP
/// replacement for a given `(profile, symbol)` is strictly ordered.
pub struct SymbolLocks {
    locks: SyncRwLock<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl SymbolLocks {
    pub fn new() -> Self {
        Self {
            locks: SyncRwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, symbol: &str) -> Arc<AsyncMutex<()>> {
        if let Some(lock) = self.locks.read().get(symbol) {
            return lock.clone();
        }
        let mut w = self.locks.write();
        w.entry(symbol.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

impl Default for SymbolLocks {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the client order id per spec §6.4:
/// `{env_prefix}{VENUE}_{CANONICAL_SYMBOL}_{SIDE}_{timestamp_ms}`.
pub fn client_order_id(environment: Environment, venue: &str, symbol: &str, side: Side, ts_ms: i64) -> String {
    let prefix = match environment {
        Environment::Live => "bot_",
        Environment::Test => "dry_",
    };
    format!("{prefix}{}_{}_{}_{}", venue.to_uppercase(), symbol, side, ts_ms)
}

pub struct Trader {
    pub profile_id: String,
    pub environment: Environment,
    adapter: Arc<dyn ExchangeAdapter>,
    store: Arc<PositionStore>,
    risk: Arc<RiskGate>,
    locks: Arc<SymbolLocks>,
}

impl Trader {
    /// `locks` must be the same instance handed to this profile's `Reconciler`
    /// (spec §5: Reconciler takes the same per-symbol mutex before mutating).
    pub fn new(
        profile_id: impl Into<String>,
        environment: Environment,
        adapter: Arc<dyn ExchangeAdapter>,
        store: Arc<PositionStore>,
        risk: Arc<RiskGate>,
        locks: Arc<SymbolLocks>,
    ) -> Self {
        Self {
            profile_id: profile_id.into(),
            environment,
            adapter,
            store,
            risk,
            locks,
        }
    }

    /// §4.3.1 open(): RiskGate -> cooldown/guard -> placement.
    #[instrument(skip(self, signal, config), fields(profile = %self.profile_id, symbol = symbol))]
    pub async fn open(
        &self,
        symbol: &str,
        timeframe: &str,
        signal: &SignalSnapshot,
        entry_price: Decimal,
        config: &EngineConfig,
    ) -> Result<Option<i64>> {
        let lock = self.locks.get(symbol);
        let _guard = lock.lock().await;

        let side = match signal.side {
            SignalSide::Buy => Side::Long,
            SignalSide::Sell => Side::Short,
            SignalSide::None => return Ok(None),
        };

        let pos_key = Position::pos_key_for(&self.profile_id, self.adapter.name(), symbol, timeframe);
        if self.store.get_active(&self.profile_id, &pos_key).await?.is_some() {
            return Ok(None);
        }

        let score = Decimal::try_from(signal.score).unwrap_or_default();
        let decision = match self.risk.evaluate(symbol, score, entry_price, &config.risk_tiers).await {
            Ok(d) => d,
            Err(denial) => {
                info!(%denial, symbol, "open denied by risk gate");
                return Ok(None);
            }
        };

        self.place_new_position(
            symbol,
            timeframe,
            &pos_key,
            side,
            entry_price,
            decision.qty,
            decision.leverage,
            signal,
            config,
            1,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn place_new_position(
        &self,
        symbol: &str,
        timeframe: &str,
        pos_key: &str,
        side: Side,
        entry_price: Decimal,
        qty: Decimal,
        leverage: u32,
        signal: &SignalSnapshot,
        config: &EngineConfig,
        config_version: i64,
    ) -> Result<Option<i64>> {
        if self.environment == Environment::Live {
            self.adapter.set_leverage(symbol, leverage).await.ok();
            self.adapter.set_margin_mode_isolated(symbol).await.ok();
        }

        let qty = self.adapter.amount_to_precision(symbol, qty);
        if qty <= Decimal::ZERO {
            bail!("computed quantity rounds to zero for {symbol}");
        }

        let ts = Utc::now().timestamp_millis();
        let coid = client_order_id(self.environment, self.adapter.name(), symbol, side, ts);

        let (limit_price, order_type) = if config.use_limit_orders {
            let patience = config.limit_order_patience_pct;
            let adj = match side {
                Side::Long => entry_price * (Decimal::ONE - patience),
                Side::Short => entry_price * (Decimal::ONE + patience),
            };
            (Some(self.adapter.price_to_precision(symbol, adj)), OrderType::Limit)
        } else {
            (None, OrderType::Market)
        };

        let reference_price = limit_price.unwrap_or(entry_price);
        let (sl_price, tp_price) = default_sl_tp(side, reference_price);

        let status = match order_type {
            OrderType::Limit => PositionStatus::Pending,
            OrderType::Market => PositionStatus::Active,
        };

        let ack = if self.environment == Environment::Live {
            self.adapter
                .place_entry(symbol, side, qty, limit_price, &coid, None, None)
                .await
                .context("placing entry order")?
        } else {
            crate::adapter::OrderAck {
                order_id: coid.clone(),
                client_order_id: coid.clone(),
                status: crate::adapter::OrderStatus::Open,
            }
        };

        let mut pos = Position {
            id: 0,
            profile_id: self.profile_id.clone(),
            pos_key: pos_key.to_string(),
            symbol: symbol.to_string(),
            side,
            qty,
            entry_price: reference_price,
            sl_price,
            tp_price,
            leverage,
            margin_mode: crate::types::MarginMode::Isolated,
            timeframe: timeframe.to_string(),
            status,
            order_type,
            entry_order_id: Some(ack.order_id.clone()),
            sl_order_id: None,
            tp_order_id: None,
            entry_time: ts,
            entry_confidence: signal.confidence,
            feature_snapshot: signal.features.clone(),
            config_version,
            profit_lock_active: false,
            tp_extended: false,
            emergency_tightened: false,
            protective_last_created_at: 0,
        };

        let id = self.store.upsert_active(&pos).await?;
        pos.id = id;

        if status == PositionStatus::Active {
            self.place_protective_orders(&mut pos).await?;
        }

        Ok(Some(id))
    }

    async fn place_protective_orders(&self, pos: &mut Position) -> Result<()> {
        if self.environment != Environment::Live {
            let now = Utc::now().timestamp();
            self.store
                .update_protective_orders(
                    pos.id,
                    pos.sl_price,
                    pos.tp_price,
                    Some(format!("dry_sl_{}", pos.id)).as_deref(),
                    Some(format!("dry_tp_{}", pos.id)).as_deref(),
                    now,
                )
                .await?;
            return Ok(());
        }

        let exit_side = pos.side.opposite();
        let ts = Utc::now().timestamp_millis();
        let sl_coid = client_order_id(self.environment, self.adapter.name(), &pos.symbol, exit_side, ts);
        let sl_ack = self
            .adapter
            .place_reduce_only(&pos.symbol, exit_side, pos.qty, pos.sl_price, OrderKind::StopLoss, &sl_coid)
            .await
            .context("placing SL")?;

        let tp_coid = client_order_id(self.environment, self.adapter.name(), &pos.symbol, exit_side, ts + 1);
        let tp_ack = self
            .adapter
            .place_reduce_only(&pos.symbol, exit_side, pos.qty, pos.tp_price, OrderKind::TakeProfit, &tp_coid)
            .await
            .context("placing TP")?;

        let now = Utc::now().timestamp();
        self.store
            .update_protective_orders(
                pos.id,
                pos.sl_price,
                pos.tp_price,
                Some(sl_ack.order_id.as_str()),
                Some(tp_ack.order_id.as_str()),
                now,
            )
            .await?;
        pos.sl_order_id = Some(sl_ack.order_id);
        pos.tp_order_id = Some(tp_ack.order_id);
        Ok(())
    }

    /// §4.3.2 pending-fill monitor, one tick for a single PENDING position.
    #[instrument(skip(self, signal, config), fields(pos_id = pos.id))]
    pub async fn tick_pending(
        &self,
        pos: &Position,
        signal: &SignalSnapshot,
        config: &EngineConfig,
    ) -> Result<()> {
        if pos.status != PositionStatus::Pending {
            return Ok(());
        }
        let lock = self.locks.get(&pos.symbol);
        let _guard = lock.lock().await;

        let entry_order = if self.environment == Environment::Live {
            let orders = self.adapter.fetch_open_orders(Some(&pos.symbol)).await?;
            orders
                .into_iter()
                .find(|o| pos.entry_order_id.as_deref() == Some(o.order_id.as_str()))
        } else {
            None // dry-run fills immediately for test purposes
        };

        let filled = match &entry_order {
            Some(o) if o.status == crate::adapter::OrderStatus::Open => false,
            Some(o) if o.status == crate::adapter::OrderStatus::PartiallyFilled => true,
            Some(_) | None => true,
        };

        if filled {
            self.store.mark_active(pos.id).await?;
            let mut pos = pos.clone();
            pos.status = PositionStatus::Active;

            if let Some(o) = &entry_order {
                if o.status == crate::adapter::OrderStatus::PartiallyFilled && o.filled_qty < pos.qty {
                    let resized = self.adapter.amount_to_precision(&pos.symbol, o.filled_qty);
                    self.store.resize_qty(pos.id, resized).await?;
                    warn!(
                        pos_id = pos.id,
                        symbol = %pos.symbol,
                        original_qty = %pos.qty,
                        filled_qty = %resized,
                        "entry partially filled, resizing protective orders to filled quantity"
                    );
                    pos.qty = resized;
                }
            }

            self.place_protective_orders(&mut pos).await?;
            info!(pos_id = pos.id, symbol = %pos.symbol, "pending position filled");
            return Ok(());
        }

        let age_secs = Utc::now().timestamp_millis() / 1000 - pos.entry_time / 1000;
        let opposite = match pos.side {
            Side::Long => signal.side == SignalSide::Sell,
            Side::Short => signal.side == SignalSide::Buy,
        };

        let should_cancel = if opposite && signal.confidence > config.strong_reversal_confidence {
            true
        } else if age_secs as u64 >= config.min_pending_secs
            && signal.confidence < config.invalidation_confidence
        {
            true
        } else {
            false
        };

        if should_cancel {
            self.cancel_pending(pos).await?;
        }
        Ok(())
    }

    async fn cancel_pending(&self, pos: &Position) -> Result<()> {
        if self.environment == Environment::Live {
            if let Some(order_id) = &pos.entry_order_id {
                match self
                    .adapter
                    .cancel_order(&pos.symbol, order_id, CancelHint::Auto)
                    .await
                {
                    Ok(_) | Err(AdapterError::NotFound) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        self.store.finalize(pos.id, PositionStatus::Cancelled, None).await?;
        info!(pos_id = pos.id, symbol = %pos.symbol, "pending position cancelled");
        Ok(())
    }

    /// §4.3.3 SL/TP lifecycle: profit-lock, TP extension, emergency tighten.
    /// `structural_tp_candidate` is an optional level from the (out-of-scope)
    /// scoring collaborator that may extend TP; `None` means no candidate.
    #[instrument(skip(self, sl_tp), fields(pos_id = pos.id))]
    pub async fn update_sl_tp_lifecycle(
        &self,
        pos: &Position,
        current_price: Decimal,
        current_confidence: f64,
        structural_tp_candidate: Option<Decimal>,
        sl_tp: &SlTpParams,
    ) -> Result<()> {
        if pos.status != PositionStatus::Active {
            return Ok(());
        }
        let lock = self.locks.get(&pos.symbol);
        let _guard = lock.lock().await;

        let mut pos = pos.clone();
        let mut sl_changed = false;
        let mut tp_changed = false;

        // Profit lock: >= 80% of the path to TP, one-shot.
        if !pos.profit_lock_active {
            let path_total = (pos.tp_price - pos.entry_price).abs();
            let path_travelled = match pos.side {
                Side::Long => current_price - pos.entry_price,
                Side::Short => pos.entry_price - current_price,
            };
            if !path_total.is_zero() && path_travelled / path_total >= sl_tp.profit_lock_path_fraction {
                let locked_sl = match pos.side {
                    Side::Long => pos.entry_price * (Decimal::ONE + sl_tp.profit_lock_pct),
                    Side::Short => pos.entry_price * (Decimal::ONE - sl_tp.profit_lock_pct),
                };
                if only_tightens(pos.side, pos.sl_price, locked_sl) {
                    pos.sl_price = locked_sl;
                    pos.profit_lock_active = true;
                    sl_changed = true;
                }
            }
        }

        // TP extension: structural level beyond current TP, capped at 1.5x,
        // one-shot.
        if !pos.tp_extended {
            if let Some(candidate) = structural_tp_candidate {
                let original_distance = (pos.tp_price - pos.entry_price).abs();
                let max_tp = match pos.side {
                    Side::Long => pos.entry_price + original_distance * sl_tp.tp_extension_max_multiple,
                    Side::Short => pos.entry_price - original_distance * sl_tp.tp_extension_max_multiple,
                };
                let extends_further = match pos.side {
                    Side::Long => candidate > pos.tp_price,
                    Side::Short => candidate < pos.tp_price,
                };
                if extends_further {
                    let clamped = clamp_towards(pos.side, candidate, max_tp);
                    pos.tp_price = clamped;
                    pos.tp_extended = true;
                    tp_changed = true;
                }
            }
        }

        // Emergency tighten: confidence fell below 50% of entry confidence,
        // move SL halfway to entry, one-shot.
        if !pos.emergency_tightened
            && current_confidence < pos.entry_confidence * f64_from(sl_tp.emergency_tighten_factor)
        {
            let tightened = pos.sl_price + (pos.entry_price - pos.sl_price) * sl_tp.emergency_tighten_factor;
            if only_tightens(pos.side, pos.sl_price, tightened) {
                pos.sl_price = tightened;
                pos.emergency_tightened = true;
                sl_changed = true;
            }
        }

        if !sl_changed && !tp_changed {
            return Ok(());
        }

        let now = Utc::now().timestamp();
        if now - pos.protective_last_created_at < sl_tp.protective_creation_cooldown_secs {
            return Ok(());
        }

        self.replace_protective_orders(&mut pos, sl_changed, tp_changed).await?;
        self.store
            .set_flags(pos.id, Some(pos.profit_lock_active), Some(pos.tp_extended), Some(pos.emergency_tightened))
            .await?;
        Ok(())
    }

    async fn replace_protective_orders(&self, pos: &mut Position, sl_changed: bool, tp_changed: bool) -> Result<()> {
        if self.environment == Environment::Live {
            let exit_side = pos.side.opposite();
            if sl_changed {
                if let Some(old) = &pos.sl_order_id {
                    self.adapter.cancel_order(&pos.symbol, old, CancelHint::Auto).await.ok();
                }
                let ts = Utc::now().timestamp_millis();
                let coid = client_order_id(self.environment, self.adapter.name(), &pos.symbol, exit_side, ts);
                let ack = self
                    .adapter
                    .place_reduce_only(&pos.symbol, exit_side, pos.qty, pos.sl_price, OrderKind::StopLoss, &coid)
                    .await?;
                pos.sl_order_id = Some(ack.order_id);
            }
            if tp_changed {
                if let Some(old) = &pos.tp_order_id {
                    self.adapter.cancel_order(&pos.symbol, old, CancelHint::Auto).await.ok();
                }
                let ts = Utc::now().timestamp_millis();
                let coid = client_order_id(self.environment, self.adapter.name(), &pos.symbol, exit_side, ts + 1);
                let ack = self
                    .adapter
                    .place_reduce_only(&pos.symbol, exit_side, pos.qty, pos.tp_price, OrderKind::TakeProfit, &coid)
                    .await?;
                pos.tp_order_id = Some(ack.order_id);
            }
        }
        let now = Utc::now().timestamp();
        self.store
            .update_protective_orders(
                pos.id,
                pos.sl_price,
                pos.tp_price,
                pos.sl_order_id.as_deref(),
                pos.tp_order_id.as_deref(),
                now,
            )
            .await?;
        Ok(())
    }

    /// §4.3.4 + §4.3.5: signal-flip exit, optionally followed by a reduced
    /// "starter" reversal entry on the opposite side.
    #[instrument(skip(self, signal, config), fields(pos_id = pos.id))]
    pub async fn evaluate_signal_flip(
        &self,
        pos: &Position,
        signal: &SignalSnapshot,
        config: &EngineConfig,
    ) -> Result<()> {
        if pos.status != PositionStatus::Active {
            return Ok(());
        }
        let opposite = match pos.side {
            Side::Long => signal.side == SignalSide::Sell,
            Side::Short => signal.side == SignalSide::Buy,
        };
        if !opposite || signal.score <= config.exit_score_threshold {
            return Ok(());
        }

        let lock = self.locks.get(&pos.symbol);
        let _guard = lock.lock().await;

        let exit_side = pos.side.opposite();
        let ts = Utc::now().timestamp_millis();
        let coid = client_order_id(self.environment, self.adapter.name(), &pos.symbol, exit_side, ts);

        let exit_price = if self.environment == Environment::Live {
            let ack = self
                .adapter
                .close_position_market(&pos.symbol, exit_side, pos.qty, &coid)
                .await
                .context("placing signal-flip market close")?;
            let _ = ack;
            pos.entry_price // authoritative pnl comes from fetch_my_trades during reconciliation
        } else {
            pos.entry_price
        };

        let trade = Trade {
            pos_key: pos.pos_key.clone(),
            symbol: pos.symbol.clone(),
            side: pos.side,
            entry_price: pos.entry_price,
            exit_price,
            qty: pos.qty,
            pnl: Decimal::ZERO,
            fees: Decimal::ZERO,
            exit_reason: ExitReason::SignalFlip,
            entry_time: pos.entry_time,
            exit_time: ts,
            feature_snapshot: signal.features.clone(),
        };
        self.store.finalize(pos.id, PositionStatus::Closed, Some(&trade)).await?;
        self.risk.record_trade_result(&pos.symbol, trade.pnl, ExitReason::SignalFlip).await;
        info!(pos_id = pos.id, symbol = %pos.symbol, "closed on signal flip");

        // Starter reversal: reduced leverage/notional, tighter SL.
        let starter_leverage = ((pos.leverage as f64) * (1.0 - f64_from(config.starter_leverage_cut_pct))).round() as u32;
        let starter_leverage = starter_leverage.max(1);
        let starter_qty = pos.qty * (Decimal::ONE - config.starter_notional_cut_pct);
        if starter_qty <= Decimal::ZERO {
            return Ok(());
        }

        let reversal_signal = SignalSnapshot {
            timestamp: signal.timestamp,
            side: signal.side,
            confidence: signal.confidence,
            score: signal.score,
            features: signal.features.clone(),
        };
        if let Some(new_id) = self
            .place_new_position(
                &pos.symbol,
                &pos.timeframe,
                &pos.pos_key,
                exit_side,
                pos.entry_price,
                starter_qty,
                starter_leverage,
                &reversal_signal,
                config,
                pos.config_version,
            )
            .await?
        {
            if let Some(mut new_pos) = self.store.get_by_id(new_id).await? {
                let tightened_sl = match new_pos.side {
                    Side::Long => new_pos.sl_price + (new_pos.entry_price - new_pos.sl_price) * config.starter_sl_tighten_pct,
                    Side::Short => new_pos.sl_price - (new_pos.sl_price - new_pos.entry_price) * config.starter_sl_tighten_pct,
                };
                new_pos.sl_price = tightened_sl;
                self.store
                    .update_protective_orders(
                        new_pos.id,
                        new_pos.sl_price,
                        new_pos.tp_price,
                        new_pos.sl_order_id.as_deref(),
                        new_pos.tp_order_id.as_deref(),
                        Utc::now().timestamp(),
                    )
                    .await?;
            }
            info!(symbol = %pos.symbol, "opened starter reversal position");
        }

        Ok(())
    }

    /// §4.3.6 orphan reaper: cancel orders with no matching managed position
    /// and a symbol outside the profile's universe.
    #[instrument(skip(self, universe, config))]
    pub async fn reap_orphans(&self, universe: &[String], config: &EngineConfig) -> Result<usize> {
        if self.environment != Environment::Live {
            return Ok(0);
        }
        let orders = self.adapter.fetch_open_orders(None).await?;
        let active = self.store.list_all_active().await?;
        let known_coids: std::collections::HashSet<&str> = active
            .iter()
            .filter_map(|p| p.entry_order_id.as_deref())
            .chain(active.iter().filter_map(|p| p.sl_order_id.as_deref()))
            .chain(active.iter().filter_map(|p| p.tp_order_id.as_deref()))
            .collect();

        let mut cancelled = 0usize;
        for order in orders {
            if cancelled >= config.reaper_batch_limit {
                break;
            }
            let matches_known = known_coids.contains(order.client_order_id.as_str());
            let in_universe = universe.iter().any(|s| s == &order.symbol);
            if matches_known || in_universe {
                continue;
            }
            match self
                .adapter
                .cancel_order(&order.symbol, &order.order_id, CancelHint::Auto)
                .await
            {
                Ok(_) => {
                    cancelled += 1;
                    warn!(symbol = %order.symbol, order_id = %order.order_id, "reaped orphan order");
                }
                Err(AdapterError::NotFound) => {}
                Err(e) => warn!(error = %e, "failed to cancel orphan order"),
            }
            tokio::time::sleep(std::time::Duration::from_millis(config.reaper_spacing_ms)).await;
        }
        Ok(cancelled)
    }
}

fn f64_from(d: Decimal) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    d.to_f64().unwrap_or(0.0)
}

fn only_tightens(side: Side, current_sl: Decimal, candidate: Decimal) -> bool {
    match side {
        Side::Long => candidate > current_sl,
        Side::Short => candidate < current_sl,
    }
}

fn clamp_towards(side: Side, candidate: Decimal, cap: Decimal) -> Decimal {
    match side {
        Side::Long => candidate.min(cap),
        Side::Short => candidate.max(cap),
    }
}

/// Default SL/TP floors used at entry time before any lifecycle adjustment,
/// a simple symmetric percentage band (1% SL, 2% TP) — the structural level
/// is supplied later by the (out-of-scope) scoring collaborator via
/// `update_sl_tp_lifecycle`'s `structural_tp_candidate`.
pub(crate) fn default_sl_tp(side: Side, reference_price: Decimal) -> (Decimal, Decimal) {
    let sl_pct = Decimal::new(1, 2);
    let tp_pct = Decimal::new(2, 2);
    match side {
        Side::Long => (
            reference_price * (Decimal::ONE - sl_pct),
            reference_price * (Decimal::ONE + tp_pct),
        ),
        Side::Short => (
            reference_price * (Decimal::ONE + sl_pct),
            reference_price * (Decimal::ONE - tp_pct),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn client_order_id_uses_dry_prefix_in_test_environment() {
        let id = client_order_id(Environment::Test, "binance", "BTCUSDT", Side::Long, 123);
        assert!(id.starts_with("dry_BINANCE_BTCUSDT_LONG_123"));
    }

    #[test]
    fn client_order_id_uses_bot_prefix_in_live_environment() {
        let id = client_order_id(Environment::Live, "bybit", "ETHUSDT", Side::Short, 456);
        assert!(id.starts_with("bot_BYBIT_ETHUSDT_SHORT_456"));
    }

    #[test]
    fn only_tightens_rejects_widening_for_long() {
        assert!(only_tightens(Side::Long, dec!(95), dec!(97)));
        assert!(!only_tightens(Side::Long, dec!(95), dec!(93)));
    }

    #[test]
    fn only_tightens_rejects_widening_for_short() {
        assert!(only_tightens(Side::Short, dec!(105), dec!(103)));
        assert!(!only_tightens(Side::Short, dec!(105), dec!(107)));
    }

    #[test]
    fn default_sl_tp_brackets_entry_correctly_for_long() {
        let (sl, tp) = default_sl_tp(Side::Long, dec!(100));
        assert!(sl < dec!(100));
        assert!(tp > dec!(100));
    }

    #[test]
    fn default_sl_tp_brackets_entry_correctly_for_short() {
        let (sl, tp) = default_sl_tp(Side::Short, dec!(100));
        assert!(sl > dec!(100));
        assert!(tp < dec!(100));
    }

    async fn trader() -> (Trader, Arc<PositionStore>) {
        let store = Arc::new(PositionStore::open_in_memory().unwrap());
        let risk = Arc::new(RiskGate::new(
            "p1",
            store.clone(),
            dec!(1000),
            dec!(0.10),
            dec!(0.03),
            7200,
            12,
            "UTC",
        ));
        let adapter: Arc<dyn ExchangeAdapter> =
            Arc::new(crate::adapter::binance::BinanceFuturesAdapter::new("k", "s"));
        (
            Trader::new("p1", Environment::Test, adapter, store.clone(), risk, Arc::new(SymbolLocks::new())),
            store,
        )
    }

    #[tokio::test]
    async fn open_in_dry_run_creates_active_position_immediately() {
        let (trader, store) = trader().await;
        let mut config = EngineConfig::default();
        config.use_limit_orders = false;
        let signal = SignalSnapshot {
            timestamp: 0,
            side: SignalSide::Buy,
            confidence: 0.9,
            score: 9.0,
            features: serde_json::Value::Null,
        };
        let id = trader
            .open("BTCUSDT", "5m", &signal, dec!(100), &config)
            .await
            .unwrap();
        assert!(id.is_some());
        let pos = store.get_by_id(id.unwrap()).await.unwrap().unwrap();
        assert_eq!(pos.status, PositionStatus::Active);
        assert_eq!(pos.side, Side::Long);
    }

    #[tokio::test]
    async fn open_in_dry_run_with_limit_orders_creates_pending_position() {
        let (trader, store) = trader().await;
        let config = EngineConfig::default(); // use_limit_orders defaults true
        let signal = SignalSnapshot {
            timestamp: 0,
            side: SignalSide::Sell,
            confidence: 0.9,
            score: 9.0,
            features: serde_json::Value::Null,
        };
        let id = trader
            .open("ETHUSDT", "5m", &signal, dec!(100), &config)
            .await
            .unwrap()
            .unwrap();
        let pos = store.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(pos.status, PositionStatus::Pending);
    }

    #[tokio::test]
    async fn open_returns_none_when_signal_side_is_none() {
        let (trader, _store) = trader().await;
        let config = EngineConfig::default();
        let signal = SignalSnapshot::none(0);
        let id = trader.open("BTCUSDT", "5m", &signal, dec!(100), &config).await.unwrap();
        assert!(id.is_none());
    }

    #[tokio::test]
    async fn second_open_on_same_pos_key_is_rejected() {
        let (trader, _store) = trader().await;
        let mut config = EngineConfig::default();
        config.use_limit_orders = false;
        let signal = SignalSnapshot {
            timestamp: 0,
            side: SignalSide::Buy,
            confidence: 0.9,
            score: 9.0,
            features: serde_json::Value::Null,
        };
        let first = trader.open("BTCUSDT", "5m", &signal, dec!(100), &config).await.unwrap();
        assert!(first.is_some());
        let second = trader.open("BTCUSDT", "5m", &signal, dec!(100), &config).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn pending_position_cancelled_on_strong_reversal() {
        let (trader, store) = trader().await;
        let config = EngineConfig::default();
        let signal = SignalSnapshot {
            timestamp: 0,
            side: SignalSide::Buy,
            confidence: 0.9,
            score: 9.0,
            features: serde_json::Value::Null,
        };
        // Force PENDING by using LIVE environment semantics would require a
        // mock adapter; instead construct a PENDING position directly.
        let pos = Position {
            id: 0,
            profile_id: "p1".into(),
            pos_key: "P1_BINANCE_BTCUSDT_5m".into(),
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            qty: dec!(0.1),
            entry_price: dec!(98.5),
            sl_price: dec!(95),
            tp_price: dec!(102),
            leverage: 5,
            margin_mode: crate::types::MarginMode::Isolated,
            timeframe: "5m".into(),
            status: PositionStatus::Pending,
            order_type: OrderType::Limit,
            entry_order_id: Some("e1".into()),
            sl_order_id: None,
            tp_order_id: None,
            entry_time: 0,
            entry_confidence: 0.9,
            feature_snapshot: serde_json::Value::Null,
            config_version: 1,
            profit_lock_active: false,
            tp_extended: false,
            emergency_tightened: false,
            protective_last_created_at: 0,
        };
        let id = store.upsert_active(&pos).await.unwrap();
        let mut pos = pos;
        pos.id = id;

        let flip_signal = SignalSnapshot {
            timestamp: 0,
            side: SignalSide::Sell,
            confidence: 0.8,
            score: 1.0,
            features: serde_json::Value::Null,
        };
        // environment is Test in this Trader, so `filled` short-circuits true
        // in tick_pending — to exercise the cancel branch instead we call
        // cancel_pending directly, matching what a LIVE environment's
        // tick_pending would have dispatched to.
        trader.cancel_pending(&pos).await.unwrap();
        assert!(store.get_active("p1", &pos.pos_key).await.unwrap().is_none());
        let _ = (config, signal);
    }
}
