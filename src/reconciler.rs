// =============================================================================
// Reconciler — exchange-truth reconciliation per profile (spec §4.4)
// =============================================================================
//
// Runs as a fast "deep sync" at the top of every heartbeat and as a periodic
// full scan (`reconcile_full_scan_secs`). Never infers a win/loss from price
// alone (P5): a phantom close only finalizes once a real fill is found via
// `fetch_my_trades`; otherwise the position sits in `WAITING_SYNC` until the
// next cycle retries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use rust_decimal::Decimal;
use tracing::{debug, info, instrument, warn};

use crate::adapter::{ExchangeAdapter, Fill};
use crate::config::EngineConfig;
use crate::risk::RiskGate;
use crate::store::{Position, PositionStore, Trade};
use crate::trader::{default_sl_tp, SymbolLocks};
use crate::types::{ExitReason, OrderKind, PositionStatus, Side};

/// Phantom/adoption exit classification tolerance: within 0.15% of entry
/// price's distance to a barrier, attribute the fill to that barrier.
const EXIT_CLASSIFY_TOLERANCE: Decimal = Decimal::from_parts(15, 0, 0, false, 4); // 0.0015

const PHANTOM_CLOSURE_RETRIES: u32 = 3;
const PHANTOM_CLOSURE_SLEEP: Duration = Duration::from_millis(500);

pub struct Reconciler {
    profile_id: String,
    adapter: Arc<dyn ExchangeAdapter>,
    store: Arc<PositionStore>,
    risk: Arc<RiskGate>,
    trader: Arc<crate::trader::Trader>,
    locks: Arc<SymbolLocks>,
}

impl Reconciler {
    /// `locks` must be the same instance handed to this profile's `Trader`
    /// (spec §5: Reconciler takes the same per-symbol mutex before mutating).
    pub fn new(
        profile_id: impl Into<String>,
        adapter: Arc<dyn ExchangeAdapter>,
        store: Arc<PositionStore>,
        risk: Arc<RiskGate>,
        trader: Arc<crate::trader::Trader>,
        locks: Arc<SymbolLocks>,
    ) -> Self {
        Self {
            profile_id: profile_id.into(),
            adapter,
            store,
            risk,
            trader,
            locks,
        }
    }

    /// Periodic full scan (`reconcile_full_scan_secs`): WAITING_SYNC retry,
    /// phantom-closure sweep, orphan adoption, and a balance refresh for the
    /// drawdown circuit breaker (spec §4.4, §4.5).
    #[instrument(skip(self, universe, config), fields(profile = %self.profile_id))]
    pub async fn reconcile(&self, universe: &[String], config: &EngineConfig) -> Result<()> {
        if let Ok(balance) = self.adapter.fetch_balance().await {
            self.risk.update_balance(balance);
        }

        for pos in self.store.list_waiting_sync(&self.profile_id).await? {
            self.retry_waiting_sync(&pos).await?;
        }

        let exchange_positions: HashMap<String, crate::adapter::ExchangePosition> = self
            .adapter
            .fetch_positions()
            .await?
            .into_iter()
            .map(|p| (p.symbol.clone(), p))
            .collect();

        let store_positions = self.store.list_active(&self.profile_id).await?;
        let mut matched_symbols = std::collections::HashSet::new();

        for pos in store_positions.iter().filter(|p| p.status == PositionStatus::Active) {
            matched_symbols.insert(pos.symbol.clone());
            match exchange_positions.get(&pos.symbol) {
                Some(ex) if ex.side == pos.side && ex.qty > Decimal::ZERO => {
                    debug!(symbol = %pos.symbol, "position confirmed healthy against exchange truth");
                }
                _ => {
                    self.phantom_closure(pos).await?;
                }
            }
        }

        for (symbol, ex) in &exchange_positions {
            if ex.qty <= Decimal::ZERO || matched_symbols.contains(symbol) {
                continue;
            }
            self.adopt(symbol, ex).await?;
        }

        self.trader.reap_orphans(universe, config).await?;
        Ok(())
    }

    /// Fast single-symbol deep-sync a `SlotLoop` tick calls before it reads
    /// its own position, so signal evaluation never acts on stale state.
    pub async fn deep_sync_one(&self, symbol: &str) -> Result<()> {
        let ex = self
            .adapter
            .fetch_positions()
            .await?
            .into_iter()
            .find(|p| p.symbol == symbol);

        let store_positions = self.store.list_active(&self.profile_id).await?;
        for pos in store_positions
            .iter()
            .filter(|p| p.symbol == symbol && p.status == PositionStatus::Active)
        {
            match &ex {
                Some(e) if e.side == pos.side && e.qty > Decimal::ZERO => {
                    debug!(symbol = %pos.symbol, "deep-sync: position confirmed healthy");
                }
                _ => {
                    self.phantom_closure(pos).await?;
                }
            }
        }
        Ok(())
    }

    /// Retries a `WAITING_SYNC` row each cycle: if the exchange position is
    /// healthy again it was a false alarm, otherwise look once more for the
    /// closing fill before leaving it parked for the next cycle.
    async fn retry_waiting_sync(&self, pos: &Position) -> Result<()> {
        let lock = self.locks.get(&pos.symbol);
        let _guard = lock.lock().await;

        let exchange_positions = self.adapter.fetch_positions().await?;
        if let Some(ex) = exchange_positions.iter().find(|p| p.symbol == pos.symbol) {
            if ex.side == pos.side && ex.qty > Decimal::ZERO {
                self.store.clear_waiting_sync(pos.id, PositionStatus::Active).await?;
                info!(symbol = %pos.symbol, pos_id = pos.id, "waiting_sync cleared, exchange position reappeared healthy");
                return Ok(());
            }
        }

        let fills = self.adapter.fetch_my_trades(&pos.symbol, pos.entry_time).await?;
        if let Some(closing_fill) = Self::find_closing_fill(pos, &fills) {
            let exit_reason = classify_exit(pos, closing_fill.price);
            let pnl = realized_pnl(pos, closing_fill.price);
            let trade = Trade {
                pos_key: pos.pos_key.clone(),
                symbol: pos.symbol.clone(),
                side: pos.side,
                entry_price: pos.entry_price,
                exit_price: closing_fill.price,
                qty: pos.qty,
                pnl,
                fees: closing_fill.fee,
                exit_reason,
                entry_time: pos.entry_time,
                exit_time: closing_fill.timestamp,
                feature_snapshot: pos.feature_snapshot.clone(),
            };
            self.store.finalize(pos.id, PositionStatus::Closed, Some(&trade)).await?;
            self.risk.record_trade_result(&pos.symbol, pnl, exit_reason).await;
            info!(symbol = %pos.symbol, exit_reason = %exit_reason, "waiting_sync resolved via fill history");
        } else {
            debug!(symbol = %pos.symbol, pos_id = pos.id, "waiting_sync still unresolved, retrying next cycle");
        }
        Ok(())
    }

    async fn phantom_closure(&self, pos: &Position) -> Result<()> {
        let lock = self.locks.get(&pos.symbol);
        let _guard = lock.lock().await;

        tokio::time::sleep(PHANTOM_CLOSURE_SLEEP).await;

        for attempt in 1..=PHANTOM_CLOSURE_RETRIES {
            let fills = self.adapter.fetch_my_trades(&pos.symbol, pos.entry_time).await?;
            if let Some(closing_fill) = Self::find_closing_fill(pos, &fills) {
                let exit_reason = classify_exit(pos, closing_fill.price);
                let pnl = realized_pnl(pos, closing_fill.price);
                let trade = Trade {
                    pos_key: pos.pos_key.clone(),
                    symbol: pos.symbol.clone(),
                    side: pos.side,
                    entry_price: pos.entry_price,
                    exit_price: closing_fill.price,
                    qty: pos.qty,
                    pnl,
                    fees: closing_fill.fee,
                    exit_reason,
                    entry_time: pos.entry_time,
                    exit_time: closing_fill.timestamp,
                    feature_snapshot: pos.feature_snapshot.clone(),
                };
                self.store.finalize(pos.id, PositionStatus::Closed, Some(&trade)).await?;
                self.risk.record_trade_result(&pos.symbol, pnl, exit_reason).await;
                info!(symbol = %pos.symbol, exit_reason = %exit_reason, "phantom close resolved via fill history");
                return Ok(());
            }
            debug!(symbol = %pos.symbol, attempt, "no closing fill found yet");
        }

        warn!(symbol = %pos.symbol, pos_id = pos.id, "phantom close unresolved after retries, marking WAITING_SYNC");
        self.store
            .mark_waiting_sync(pos.id, "no closing fill found after phantom-closure retries")
            .await?;
        Ok(())
    }

    fn find_closing_fill<'a>(pos: &Position, fills: &'a [Fill]) -> Option<&'a Fill> {
        fills
            .iter()
            .filter(|f| f.side == pos.side.opposite() && f.timestamp >= pos.entry_time)
            .max_by_key(|f| f.timestamp)
    }

    async fn adopt(&self, symbol: &str, ex: &crate::adapter::ExchangePosition) -> Result<()> {
        let lock = self.locks.get(symbol);
        let _guard = lock.lock().await;

        let pos_key = Position::pos_key_for(&self.profile_id, self.adapter.name(), symbol, "ADOPTED");
        if self.store.get_active(&self.profile_id, &pos_key).await?.is_some() {
            return Ok(());
        }

        let open_orders = self.adapter.fetch_open_orders(Some(symbol)).await.unwrap_or_default();
        let sl_from_orders = open_orders
            .iter()
            .find(|o| o.kind == OrderKind::StopLoss)
            .and_then(|o| o.price);
        let tp_from_orders = open_orders
            .iter()
            .find(|o| o.kind == OrderKind::TakeProfit)
            .and_then(|o| o.price);
        let (default_sl, default_tp) = default_sl_tp(ex.side, ex.entry_price);

        let now = chrono::Utc::now().timestamp_millis();
        let pos = Position {
            id: 0,
            profile_id: self.profile_id.clone(),
            pos_key,
            symbol: symbol.to_string(),
            side: ex.side,
            qty: ex.qty,
            entry_price: ex.entry_price,
            sl_price: sl_from_orders.unwrap_or(default_sl),
            tp_price: tp_from_orders.unwrap_or(default_tp),
            leverage: ex.leverage,
            margin_mode: crate::types::MarginMode::Isolated,
            timeframe: "ADOPTED".to_string(),
            status: PositionStatus::Active,
            order_type: crate::types::OrderType::Market,
            entry_order_id: None,
            sl_order_id: open_orders.iter().find(|o| o.kind == OrderKind::StopLoss).map(|o| o.order_id.clone()),
            tp_order_id: open_orders.iter().find(|o| o.kind == OrderKind::TakeProfit).map(|o| o.order_id.clone()),
            entry_time: now,
            entry_confidence: 0.0,
            feature_snapshot: serde_json::Value::Null,
            config_version: 0,
            profit_lock_active: false,
            tp_extended: false,
            emergency_tightened: false,
            protective_last_created_at: now,
        };
        self.store.upsert_active(&pos).await?;
        info!(symbol = %symbol, "adopted untracked exchange position");
        Ok(())
    }
}

fn realized_pnl(pos: &Position, exit_price: Decimal) -> Decimal {
    match pos.side {
        Side::Long => pos.qty * (exit_price - pos.entry_price),
        Side::Short => pos.qty * (pos.entry_price - exit_price),
    }
}

fn classify_exit(pos: &Position, exit_price: Decimal) -> ExitReason {
    let sl_distance = (exit_price - pos.sl_price).abs() / pos.entry_price;
    let tp_distance = (exit_price - pos.tp_price).abs() / pos.entry_price;
    if sl_distance <= EXIT_CLASSIFY_TOLERANCE {
        ExitReason::Sl
    } else if tp_distance <= EXIT_CLASSIFY_TOLERANCE {
        ExitReason::Tp
    } else {
        ExitReason::Manual
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_pos() -> Position {
        Position {
            id: 1,
            profile_id: "p1".to_string(),
            pos_key: "P1_BINANCE_BTCUSDT_5m".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            qty: dec!(1),
            entry_price: dec!(100),
            sl_price: dec!(95),
            tp_price: dec!(110),
            leverage: 5,
            margin_mode: crate::types::MarginMode::Isolated,
            timeframe: "5m".to_string(),
            status: PositionStatus::Active,
            order_type: crate::types::OrderType::Market,
            entry_order_id: Some("e1".to_string()),
            sl_order_id: Some("s1".to_string()),
            tp_order_id: Some("t1".to_string()),
            entry_time: 1000,
            entry_confidence: 0.9,
            feature_snapshot: serde_json::Value::Null,
            config_version: 1,
            profit_lock_active: false,
            tp_extended: false,
            emergency_tightened: false,
            protective_last_created_at: 1000,
        }
    }

    #[test]
    fn classify_exit_near_sl_is_sl() {
        let pos = sample_pos();
        assert_eq!(classify_exit(&pos, dec!(95.05)), ExitReason::Sl);
    }

    #[test]
    fn classify_exit_near_tp_is_tp() {
        let pos = sample_pos();
        assert_eq!(classify_exit(&pos, dec!(109.98)), ExitReason::Tp);
    }

    #[test]
    fn classify_exit_elsewhere_is_manual() {
        let pos = sample_pos();
        assert_eq!(classify_exit(&pos, dec!(103)), ExitReason::Manual);
    }

    #[test]
    fn realized_pnl_long_position() {
        let pos = sample_pos();
        assert_eq!(realized_pnl(&pos, dec!(110)), dec!(10));
    }

    #[test]
    fn find_closing_fill_picks_latest_opposite_side_fill() {
        let pos = sample_pos();
        let fills = vec![
            Fill {
                order_id: "a".into(),
                symbol: "BTCUSDT".into(),
                side: Side::Short,
                qty: dec!(1),
                price: dec!(95),
                fee: dec!(0.01),
                timestamp: 1500,
            },
            Fill {
                order_id: "b".into(),
                symbol: "BTCUSDT".into(),
                side: Side::Long,
                qty: dec!(1),
                price: dec!(101),
                fee: dec!(0.01),
                timestamp: 1600,
            },
        ];
        let found = Reconciler::find_closing_fill(&pos, &fills).unwrap();
        assert_eq!(found.order_id, "a");
    }
}
