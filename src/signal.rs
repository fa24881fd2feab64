// =============================================================================
// Signal ingress (spec §6.1)
// =============================================================================
//
// The engine never computes indicators, regime, or weighted scores itself —
// that lives in an external scoring collaborator. This module defines only
// the contract the collaborator must satisfy and two test doubles used by
// the slot-loop tests.

use serde::{Deserialize, Serialize};

use crate::types::SignalSide;

/// A single point-in-time opinion about a symbol, as produced by the
/// (out-of-scope) scoring engine. Stored verbatim on the `Position` it
/// opens; never persisted on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalSnapshot {
    pub timestamp: i64,
    pub side: SignalSide,
    pub confidence: f64,
    pub score: f64,
    /// Opaque to the core; carried through for audit/journaling only.
    #[serde(default)]
    pub features: serde_json::Value,
}

impl SignalSnapshot {
    pub fn none(timestamp: i64) -> Self {
        Self {
            timestamp,
            side: SignalSide::None,
            confidence: 0.0,
            score: 0.0,
            features: serde_json::Value::Null,
        }
    }

    pub fn is_actionable(&self, entry_score_threshold: f64) -> bool {
        self.side != SignalSide::None && self.score >= entry_score_threshold
    }
}

/// Supplies the latest `SignalSnapshot` for a given symbol. Implemented by
/// whatever scoring pipeline is wired up; the engine only ever calls `latest`.
pub trait SignalSource: Send + Sync {
    fn latest(&self, symbol: &str) -> SignalSnapshot;
}

/// A fixed-value source, useful for tests and for a profile with no live
/// scoring pipeline attached.
pub struct StaticSignalSource {
    snapshot: parking_lot::RwLock<SignalSnapshot>,
}

impl StaticSignalSource {
    pub fn new(snapshot: SignalSnapshot) -> Self {
        Self {
            snapshot: parking_lot::RwLock::new(snapshot),
        }
    }

    pub fn set(&self, snapshot: SignalSnapshot) {
        *self.snapshot.write() = snapshot;
    }
}

impl SignalSource for StaticSignalSource {
    fn latest(&self, _symbol: &str) -> SignalSnapshot {
        self.snapshot.read().clone()
    }
}

/// A per-symbol source fed over a `tokio::sync::watch` channel, for wiring a
/// real external scoring process into the engine over IPC without the core
/// depending on its transport.
pub struct ChannelSignalSource {
    channels: parking_lot::RwLock<
        std::collections::HashMap<String, tokio::sync::watch::Receiver<SignalSnapshot>>,
    >,
}

impl ChannelSignalSource {
    pub fn new() -> Self {
        Self {
            channels: parking_lot::RwLock::new(std::collections::HashMap::new()),
        }
    }

    pub fn register(&self, symbol: &str, rx: tokio::sync::watch::Receiver<SignalSnapshot>) {
        self.channels.write().insert(symbol.to_string(), rx);
    }
}

impl Default for ChannelSignalSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalSource for ChannelSignalSource {
    fn latest(&self, symbol: &str) -> SignalSnapshot {
        match self.channels.read().get(symbol) {
            Some(rx) => rx.borrow().clone(),
            None => SignalSnapshot::none(chrono::Utc::now().timestamp_millis()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(side: SignalSide, score: f64) -> SignalSnapshot {
        SignalSnapshot {
            timestamp: 0,
            side,
            confidence: 0.9,
            score,
            features: serde_json::Value::Null,
        }
    }

    #[test]
    fn none_snapshot_is_never_actionable() {
        let s = SignalSnapshot::none(0);
        assert!(!s.is_actionable(0.0));
    }

    #[test]
    fn actionable_requires_side_and_score_threshold() {
        let s = sample(SignalSide::Buy, 7.0);
        assert!(s.is_actionable(5.0));
        assert!(!s.is_actionable(8.0));
    }

    #[test]
    fn static_source_returns_latest_set_value() {
        let src = StaticSignalSource::new(sample(SignalSide::Sell, 6.0));
        assert_eq!(src.latest("BTCUSDT").side, SignalSide::Sell);
        src.set(sample(SignalSide::Buy, 9.0));
        assert_eq!(src.latest("BTCUSDT").side, SignalSide::Buy);
    }

    #[test]
    fn channel_source_falls_back_to_none_for_unregistered_symbol() {
        let src = ChannelSignalSource::new();
        let snap = src.latest("ETHUSDT");
        assert_eq!(snap.side, SignalSide::None);
    }

    #[test]
    fn channel_source_reflects_registered_channel() {
        let (tx, rx) = tokio::sync::watch::channel(sample(SignalSide::Buy, 8.0));
        let src = ChannelSignalSource::new();
        src.register("BTCUSDT", rx);
        assert_eq!(src.latest("BTCUSDT").score, 8.0);
        tx.send(sample(SignalSide::Sell, 3.0)).unwrap();
        assert_eq!(src.latest("BTCUSDT").side, SignalSide::Sell);
    }
}
