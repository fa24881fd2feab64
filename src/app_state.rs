// =============================================================================
// AppState — dependency-injection container wiring every subsystem together
// =============================================================================
//
// No module-level singletons (spec §9): every subsystem is constructed here
// once at startup and handed down as an `Arc`. `Scheduler` and the admin API
// both hold only an `Arc<AppState>`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::adapter::binance::BinanceFuturesAdapter;
use crate::adapter::bybit::BybitAdapter;
use crate::adapter::{AdapterRegistry, ExchangeAdapter};
use crate::config::{ConfigWatcher, EngineConfig};
use crate::notify::{LogSink, Notifier};
use crate::reconciler::Reconciler;
use crate::risk::RiskGate;
use crate::signal::{SignalSource, StaticSignalSource};
use crate::store::PositionStore;
use crate::trader::{SymbolLocks, Trader};

/// One profile's fully wired runtime dependencies.
pub struct ProfileRuntime {
    pub trader: Arc<Trader>,
    pub reconciler: Arc<Reconciler>,
    pub risk_gate: Arc<RiskGate>,
    pub adapter: Arc<dyn ExchangeAdapter>,
    pub store: Arc<PositionStore>,
}

pub struct AppState {
    pub config: RwLock<EngineConfig>,
    pub config_path: PathBuf,
    config_watcher: AsyncMutex<ConfigWatcher>,

    pub store: Arc<PositionStore>,
    pub adapters: AdapterRegistry,
    pub profiles: RwLock<HashMap<String, Arc<ProfileRuntime>>>,

    pub signal_source: Arc<dyn SignalSource>,
    pub notifier: Arc<Notifier>,

    pub shutdown: CancellationToken,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(config_path: PathBuf, db_path: &std::path::Path) -> Result<Self> {
        let config = EngineConfig::load(&config_path);
        let store = Arc::new(
            PositionStore::open(db_path).with_context(|| format!("opening store at {}", db_path.display()))?,
        );

        let mut adapters = AdapterRegistry::new();
        adapters.register(
            "binance",
            Arc::new(BinanceFuturesAdapter::new(
                std::env::var("BINANCE_API_KEY").unwrap_or_default(),
                std::env::var("BINANCE_API_SECRET").unwrap_or_default(),
            )) as Arc<dyn ExchangeAdapter>,
        );
        adapters.register(
            "bybit",
            Arc::new(BybitAdapter::new(
                std::env::var("BYBIT_API_KEY").unwrap_or_default(),
                std::env::var("BYBIT_API_SECRET").unwrap_or_default(),
            )) as Arc<dyn ExchangeAdapter>,
        );

        let profiles = Self::build_profiles(&config, &adapters, &store);
        let config_watcher = ConfigWatcher::new(config_path.clone());

        Ok(Self {
            config: RwLock::new(config),
            config_path,
            config_watcher: AsyncMutex::new(config_watcher),
            store,
            adapters,
            profiles: RwLock::new(profiles),
            signal_source: Arc::new(StaticSignalSource::new(crate::signal::SignalSnapshot::none(0))),
            notifier: Arc::new(Notifier::spawn(Arc::new(LogSink))),
            shutdown: CancellationToken::new(),
            start_time: std::time::Instant::now(),
        })
    }

    fn build_profiles(
        config: &EngineConfig,
        adapters: &AdapterRegistry,
        store: &Arc<PositionStore>,
    ) -> HashMap<String, Arc<ProfileRuntime>> {
        let mut out = HashMap::new();
        for profile in &config.profiles {
            if !profile.active {
                continue;
            }
            let Some(adapter) = adapters.get(&profile.exchange) else {
                tracing::warn!(profile = %profile.id, exchange = %profile.exchange, "unknown exchange, skipping profile");
                continue;
            };
            let risk_gate = Arc::new(RiskGate::new(
                profile.id.clone(),
                store.clone(),
                Decimal::new(1000, 0),
                config.drawdown_circuit_breaker_pct,
                config.daily_loss_limit_pct,
                config.sl_cooldown_secs,
                profile.max_leverage,
                &config.timezone,
            ));
            let locks = Arc::new(SymbolLocks::new());
            let trader = Arc::new(Trader::new(
                profile.id.clone(),
                profile.environment,
                adapter.clone(),
                store.clone(),
                risk_gate.clone(),
                locks.clone(),
            ));
            let reconciler = Arc::new(Reconciler::new(
                profile.id.clone(),
                adapter.clone(),
                store.clone(),
                risk_gate.clone(),
                trader.clone(),
                locks,
            ));
            out.insert(
                profile.id.clone(),
                Arc::new(ProfileRuntime {
                    trader,
                    reconciler,
                    risk_gate,
                    adapter,
                    store: store.clone(),
                }),
            );
            info!(profile = %profile.id, "profile runtime wired");
        }
        out
    }

    pub fn profile(&self, profile_id: &str) -> Option<Arc<ProfileRuntime>> {
        self.profiles.read().get(profile_id).cloned()
    }

    pub fn profile_ids(&self) -> Vec<String> {
        self.profiles.read().keys().cloned().collect()
    }

    /// Admin op: `reload_config` (§6.5). Forces an immediate reload and
    /// rebuilds every profile runtime against the fresh document.
    pub async fn reload_config(&self) {
        let fresh = self.config_watcher.lock().await.force_reload();
        let rebuilt = Self::build_profiles(&fresh, &self.adapters, &self.store);
        *self.profiles.write() = rebuilt;
        *self.config.write() = fresh;
        info!("engine config reloaded");
    }

    /// Polled by the scheduler's config-reload task at `CONFIG_POLL_SECS`.
    pub async fn poll_config(&self) {
        let maybe_fresh = self.config_watcher.lock().await.poll();
        if let Some(fresh) = maybe_fresh {
            let rebuilt = Self::build_profiles(&fresh, &self.adapters, &self.store);
            *self.profiles.write() = rebuilt;
            *self.config.write() = fresh;
            info!("engine config hot-reloaded from disk change");
        }
    }

    pub fn save_config(&self) -> Result<()> {
        self.config.read().save(&self.config_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_with_empty_config_has_no_profiles() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("engine_config.json");
        let db_path = dir.path().join("state.db");
        let state = AppState::new(config_path, &db_path).unwrap();
        assert!(state.profile_ids().is_empty());
    }
}
