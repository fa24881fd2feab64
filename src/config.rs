// =============================================================================
// Hot-reloadable engine configuration
// =============================================================================
//
// Mirrors the atomic tmp-rename save/load idiom of the legacy runtime config,
// extended with modification-time polling so a config edit on disk is picked
// up without a restart (reload cadence governed by `CONFIG_POLL_SECS`).

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::Environment;

pub const CONFIG_POLL_SECS: u64 = 60;

fn default_true() -> bool {
    true
}

fn default_heartbeat_secs() -> u64 {
    5
}

fn default_min_pending_secs() -> u64 {
    120
}

fn default_pending_poll_secs() -> u64 {
    2
}

fn default_strong_reversal_confidence() -> f64 {
    0.4
}

fn default_invalidation_confidence() -> f64 {
    0.2
}

fn default_exit_score_threshold() -> f64 {
    5.0
}

fn default_entry_score_threshold() -> f64 {
    5.0
}

fn default_protective_creation_cooldown_secs() -> i64 {
    20
}

fn default_sl_cooldown_secs() -> i64 {
    7200
}

fn default_profit_lock_path_fraction() -> Decimal {
    Decimal::new(80, 2) // 0.80
}

fn default_profit_lock_pct() -> Decimal {
    Decimal::new(10, 3) // 0.010 -> 1% of entry into profit
}

fn default_tp_extension_max_multiple() -> Decimal {
    Decimal::new(15, 1) // 1.5
}

fn default_emergency_tighten_factor() -> Decimal {
    Decimal::new(5, 1) // 0.5
}

fn default_starter_leverage_cut_pct() -> Decimal {
    Decimal::new(40, 2) // 0.40
}

fn default_starter_notional_cut_pct() -> Decimal {
    Decimal::new(50, 2) // 0.50
}

fn default_starter_sl_tighten_pct() -> Decimal {
    Decimal::new(40, 2)
}

fn default_drawdown_circuit_breaker_pct() -> Decimal {
    Decimal::new(10, 2) // 0.10
}

fn default_daily_loss_limit_pct() -> Decimal {
    Decimal::new(3, 2) // 0.03
}

fn default_max_leverage() -> u32 {
    12
}

fn default_reaper_interval_secs() -> u64 {
    300
}

fn default_reaper_batch_limit() -> usize {
    20
}

fn default_reaper_spacing_ms() -> u64 {
    500
}

fn default_reconcile_full_scan_secs() -> u64 {
    600
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_limit_order_patience_pct() -> Decimal {
    Decimal::new(15, 3) // 0.015
}

fn default_timeframes() -> Vec<String> {
    vec!["5m".to_string()]
}

fn default_risk_tiers() -> Vec<RiskTier> {
    vec![
        RiskTier {
            min_score: Decimal::new(5, 0),
            leverage: 5,
            margin_usdt: Decimal::new(20, 0),
        },
        RiskTier {
            min_score: Decimal::new(7, 0),
            leverage: 8,
            margin_usdt: Decimal::new(35, 0),
        },
        RiskTier {
            min_score: Decimal::new(9, 0),
            leverage: 12,
            margin_usdt: Decimal::new(50, 0),
        },
    ]
}

/// One row of the tiered-sizing table used by the risk gate (spec §4.5 rule 5).
/// Tiers are evaluated highest-`min_score`-first; the first tier whose
/// `min_score` the signal's score satisfies wins.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RiskTier {
    pub min_score: Decimal,
    pub leverage: u32,
    pub margin_usdt: Decimal,
}

/// SL/TP tuning parameters shared by every profile unless overridden.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SlTpParams {
    #[serde(default = "default_profit_lock_path_fraction")]
    pub profit_lock_path_fraction: Decimal,
    #[serde(default = "default_profit_lock_pct")]
    pub profit_lock_pct: Decimal,
    #[serde(default = "default_tp_extension_max_multiple")]
    pub tp_extension_max_multiple: Decimal,
    #[serde(default = "default_emergency_tighten_factor")]
    pub emergency_tighten_factor: Decimal,
    #[serde(default = "default_protective_creation_cooldown_secs")]
    pub protective_creation_cooldown_secs: i64,
}

impl Default for SlTpParams {
    fn default() -> Self {
        Self {
            profit_lock_path_fraction: default_profit_lock_path_fraction(),
            profit_lock_pct: default_profit_lock_pct(),
            tp_extension_max_multiple: default_tp_extension_max_multiple(),
            emergency_tighten_factor: default_emergency_tighten_factor(),
            protective_creation_cooldown_secs: default_protective_creation_cooldown_secs(),
        }
    }
}

/// Per-profile (exchange-account) configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProfileConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub environment: Environment,
    pub exchange: String,
    #[serde(default = "default_true")]
    pub active: bool,
    pub symbols: Vec<String>,
    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<String>,
    #[serde(default = "default_max_leverage")]
    pub max_leverage: u32,
}

/// Top-level hot-reloadable engine document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default)]
    pub profiles: Vec<ProfileConfig>,

    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_min_pending_secs")]
    pub min_pending_secs: u64,
    #[serde(default = "default_pending_poll_secs")]
    pub pending_poll_secs: u64,
    #[serde(default = "default_strong_reversal_confidence")]
    pub strong_reversal_confidence: f64,
    #[serde(default = "default_invalidation_confidence")]
    pub invalidation_confidence: f64,
    #[serde(default = "default_entry_score_threshold")]
    pub entry_score_threshold: f64,
    #[serde(default = "default_exit_score_threshold")]
    pub exit_score_threshold: f64,

    #[serde(default = "default_sl_cooldown_secs")]
    pub sl_cooldown_secs: i64,
    #[serde(default = "default_drawdown_circuit_breaker_pct")]
    pub drawdown_circuit_breaker_pct: Decimal,
    #[serde(default = "default_daily_loss_limit_pct")]
    pub daily_loss_limit_pct: Decimal,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_risk_tiers")]
    pub risk_tiers: Vec<RiskTier>,

    #[serde(default = "default_starter_leverage_cut_pct")]
    pub starter_leverage_cut_pct: Decimal,
    #[serde(default = "default_starter_notional_cut_pct")]
    pub starter_notional_cut_pct: Decimal,
    #[serde(default = "default_starter_sl_tighten_pct")]
    pub starter_sl_tighten_pct: Decimal,

    #[serde(default = "default_true")]
    pub use_limit_orders: bool,
    #[serde(default = "default_limit_order_patience_pct")]
    pub limit_order_patience_pct: Decimal,

    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
    #[serde(default = "default_reaper_batch_limit")]
    pub reaper_batch_limit: usize,
    #[serde(default = "default_reaper_spacing_ms")]
    pub reaper_spacing_ms: u64,
    #[serde(default = "default_reconcile_full_scan_secs")]
    pub reconcile_full_scan_secs: u64,

    #[serde(default)]
    pub sl_tp: SlTpParams,

    #[serde(default)]
    pub dry_run: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            profiles: Vec::new(),
            heartbeat_secs: default_heartbeat_secs(),
            min_pending_secs: default_min_pending_secs(),
            pending_poll_secs: default_pending_poll_secs(),
            strong_reversal_confidence: default_strong_reversal_confidence(),
            invalidation_confidence: default_invalidation_confidence(),
            entry_score_threshold: default_entry_score_threshold(),
            exit_score_threshold: default_exit_score_threshold(),
            sl_cooldown_secs: default_sl_cooldown_secs(),
            drawdown_circuit_breaker_pct: default_drawdown_circuit_breaker_pct(),
            daily_loss_limit_pct: default_daily_loss_limit_pct(),
            timezone: default_timezone(),
            risk_tiers: default_risk_tiers(),
            starter_leverage_cut_pct: default_starter_leverage_cut_pct(),
            starter_notional_cut_pct: default_starter_notional_cut_pct(),
            starter_sl_tighten_pct: default_starter_sl_tighten_pct(),
            use_limit_orders: true,
            limit_order_patience_pct: default_limit_order_patience_pct(),
            reaper_interval_secs: default_reaper_interval_secs(),
            reaper_batch_limit: default_reaper_batch_limit(),
            reaper_spacing_ms: default_reaper_spacing_ms(),
            reconcile_full_scan_secs: default_reconcile_full_scan_secs(),
            sl_tp: SlTpParams::default(),
            dry_run: true,
        }
    }
}

impl EngineConfig {
    /// Load from `path`, falling back to `Default` (with a warning) if the
    /// file is missing or malformed. Never panics.
    pub fn load(path: &Path) -> Self {
        match Self::try_load(path) {
            Ok(cfg) => {
                info!(path = %path.display(), "engine config loaded");
                cfg
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load engine config, using defaults");
                Self::default()
            }
        }
    }

    fn try_load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let cfg: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(cfg)
    }

    /// Atomically persist: write to `<path>.tmp` then rename over `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(self).context("serialising engine config")?;
        std::fs::write(&tmp_path, json)
            .with_context(|| format!("writing {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("renaming {} to {}", tmp_path.display(), path.display()))?;
        Ok(())
    }
}

/// Polls a config file's mtime and reloads when it changes. Owned by
/// `Scheduler`'s config-reload task; `reload_config()` (admin API, §6.5) also
/// drives this directly for an immediate, non-polled reload.
pub struct ConfigWatcher {
    path: PathBuf,
    last_mtime: Option<SystemTime>,
}

impl ConfigWatcher {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            last_mtime: None,
        }
    }

    fn mtime(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.path).ok()?.modified().ok()
    }

    /// Returns `Some(new_config)` if the file's mtime advanced since the last
    /// check (or this is the first check and the file exists).
    pub fn poll(&mut self) -> Option<EngineConfig> {
        let current = self.mtime()?;
        let changed = self.last_mtime.map(|prev| current > prev).unwrap_or(true);
        self.last_mtime = Some(current);
        if changed {
            Some(EngineConfig::load(&self.path))
        } else {
            None
        }
    }

    /// Force a reload regardless of mtime (used by the admin `reload_config` op).
    pub fn force_reload(&mut self) -> EngineConfig {
        self.last_mtime = self.mtime();
        EngineConfig::load(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.heartbeat_secs, 5);
        assert_eq!(cfg.min_pending_secs, 120);
        assert_eq!(cfg.sl_cooldown_secs, 7200);
        assert!(cfg.dry_run);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg, EngineConfig::default());
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let cfg: EngineConfig = serde_json::from_str(r#"{"heartbeat_secs": 10}"#).unwrap();
        assert_eq!(cfg.heartbeat_secs, 10);
        assert_eq!(cfg.sl_cooldown_secs, 7200);
    }

    #[test]
    fn roundtrip_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine_config.json");
        let mut cfg = EngineConfig::default();
        cfg.heartbeat_secs = 9;
        cfg.save(&path).unwrap();
        let loaded = EngineConfig::load(&path);
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn watcher_detects_mtime_change() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine_config.json");
        EngineConfig::default().save(&path).unwrap();

        let mut watcher = ConfigWatcher::new(path.clone());
        assert!(watcher.poll().is_some());
        assert!(watcher.poll().is_none());

        std::thread::sleep(std::time::Duration::from_millis(20));
        let mut cfg = EngineConfig::default();
        cfg.heartbeat_secs = 42;
        cfg.save(&path).unwrap();
        let reloaded = watcher.poll();
        assert!(reloaded.is_some());
        assert_eq!(reloaded.unwrap().heartbeat_secs, 42);
    }

    #[test]
    fn load_missing_file_falls_back_to_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("does_not_exist.json");
        let cfg = EngineConfig::load(&path);
        assert_eq!(cfg, EngineConfig::default());
    }
}
