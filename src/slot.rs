// =============================================================================
// SlotLoop — the per-(profile, symbol, timeframe) heartbeat task (spec §4.6)
// =============================================================================
//
// Each slot polls the external scoring collaborator once per heartbeat and
// drives the position through `Trader`. The loop never computes indicators or
// regime itself; it only reads the latest `SignalSnapshot` and reacts.
//
// Current price and (optionally) a structural TP candidate ride along on the
// signal's opaque `features` blob as `"price"` / `"structural_tp"` numeric
// fields — the scoring collaborator already has OHLCV in hand to produce
// them, and the core has no independent price oracle (spec §6.1).

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::app_state::AppState;
use crate::config::EngineConfig;
use crate::signal::SignalSnapshot;
use crate::store::Position;
use crate::types::PositionStatus;

pub fn extract_price(signal: &SignalSnapshot) -> Option<Decimal> {
    signal
        .features
        .get("price")
        .and_then(|v| v.as_f64())
        .and_then(|f| Decimal::try_from(f).ok())
}

fn extract_structural_tp(signal: &SignalSnapshot) -> Option<Decimal> {
    signal
        .features
        .get("structural_tp")
        .and_then(|v| v.as_f64())
        .and_then(|f| Decimal::try_from(f).ok())
}

pub struct SlotLoop {
    pub profile_id: String,
    pub symbol: String,
    pub timeframe: String,
    state: Arc<AppState>,
}

impl SlotLoop {
    pub fn new(
        profile_id: impl Into<String>,
        symbol: impl Into<String>,
        timeframe: impl Into<String>,
        state: Arc<AppState>,
    ) -> Self {
        Self {
            profile_id: profile_id.into(),
            symbol: symbol.into(),
            timeframe: timeframe.into(),
            state,
        }
    }

    /// Drives the loop until the shared shutdown token is cancelled. Hot
    /// reload of `heartbeat_secs` and of the profile's wiring is picked up
    /// each tick by re-reading `AppState` fresh.
    pub async fn run(self, shutdown: CancellationToken) {
        loop {
            let heartbeat = self.state.config.read().heartbeat_secs;
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(profile = %self.profile_id, symbol = %self.symbol, "slot loop shutting down");
                    return;
                }
                _ = tokio::time::sleep(Duration::from_secs(heartbeat)) => {}
            }

            let Some(runtime) = self.state.profile(&self.profile_id) else {
                debug!(profile = %self.profile_id, "profile no longer wired, slot loop exiting");
                return;
            };
            let config = self.state.config.read().clone();
            let signal = self.state.signal_source.latest(&self.symbol);

            if let Err(e) = self.tick(&runtime, &signal, &config).await {
                warn!(profile = %self.profile_id, symbol = %self.symbol, error = %e, "slot tick failed");
            }
        }
    }

    #[instrument(skip(self, runtime, signal, config), fields(profile = %self.profile_id, symbol = %self.symbol))]
    async fn tick(
        &self,
        runtime: &crate::app_state::ProfileRuntime,
        signal: &SignalSnapshot,
        config: &EngineConfig,
    ) -> anyhow::Result<()> {
        // Fast deep-sync before any signal evaluation (spec §5): never act
        // on a position the reconciler hasn't re-synced against exchange
        // truth this tick.
        if let Err(e) = runtime.reconciler.deep_sync_one(&self.symbol).await {
            warn!(profile = %self.profile_id, symbol = %self.symbol, error = %e, "deep-sync failed, proceeding with last-known state");
        }

        let pos_key = Position::pos_key_for(
            &self.profile_id,
            runtime.adapter.name(),
            &self.symbol,
            &self.timeframe,
        );
        let existing = runtime.store.get_active(&self.profile_id, &pos_key).await?;

        match existing {
            Some(pos) if pos.status == PositionStatus::Active => {
                let Some(price) = extract_price(signal) else {
                    return Ok(());
                };
                let structural_tp = extract_structural_tp(signal);
                runtime
                    .trader
                    .update_sl_tp_lifecycle(&pos, price, signal.confidence, structural_tp, &config.sl_tp)
                    .await?;
                runtime.trader.evaluate_signal_flip(&pos, signal, config).await?;
            }
            Some(_pending) => {
                // PENDING is owned by the dedicated pending-fill monitor task.
            }
            None => {
                let Some(price) = extract_price(signal) else {
                    return Ok(());
                };
                if signal.is_actionable(config.entry_score_threshold) {
                    runtime
                        .trader
                        .open(&self.symbol, &self.timeframe, signal, price, config)
                        .await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_price_reads_features_field() {
        let mut signal = SignalSnapshot::none(0);
        signal.features = serde_json::json!({ "price": 42.5 });
        assert_eq!(extract_price(&signal), Decimal::try_from(42.5).ok());
    }

    #[test]
    fn extract_price_is_none_without_field() {
        let signal = SignalSnapshot::none(0);
        assert_eq!(extract_price(&signal), None);
    }
}
