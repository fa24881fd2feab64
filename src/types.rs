//! Shared enums used across the store, adapters, trader and risk gate.

use serde::{Deserialize, Serialize};

/// Long or short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

impl std::str::FromStr for Side {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LONG" => Ok(Side::Long),
            "SHORT" => Ok(Side::Short),
            other => anyhow::bail!("unknown side: {other}"),
        }
    }
}

/// Signal ingress side, distinct from `Side` because it also allows "no opinion".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalSide {
    Buy,
    Sell,
    None,
}

impl std::fmt::Display for SignalSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalSide::Buy => write!(f, "BUY"),
            SignalSide::Sell => write!(f, "SELL"),
            SignalSide::None => write!(f, "NONE"),
        }
    }
}

/// A profile's account environment. Defaults to `Test` — live trading is
/// never the default for a freshly loaded profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Environment {
    Live,
    Test,
}

impl Default for Environment {
    fn default() -> Self {
        Environment::Test
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Live => write!(f, "LIVE"),
            Environment::Test => write!(f, "TEST"),
        }
    }
}

/// Lifecycle of a `Position` row. See `store.rs` for the invariants each
/// transition must uphold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Pending,
    Active,
    Closed,
    Cancelled,
    WaitingSync,
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PositionStatus::Pending => "PENDING",
            PositionStatus::Active => "ACTIVE",
            PositionStatus::Closed => "CLOSED",
            PositionStatus::Cancelled => "CANCELLED",
            PositionStatus::WaitingSync => "WAITING_SYNC",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for PositionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(PositionStatus::Pending),
            "ACTIVE" => Ok(PositionStatus::Active),
            "CLOSED" => Ok(PositionStatus::Closed),
            "CANCELLED" => Ok(PositionStatus::Cancelled),
            "WAITING_SYNC" => Ok(PositionStatus::WaitingSync),
            other => anyhow::bail!("unknown position status: {other}"),
        }
    }
}

impl PositionStatus {
    /// Statuses that count against the single-active-row-per-key invariant (P1/P2).
    pub fn is_open(self) -> bool {
        matches!(self, PositionStatus::Pending | PositionStatus::Active)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderType::Market => write!(f, "MARKET"),
            OrderType::Limit => write!(f, "LIMIT"),
        }
    }
}

impl std::str::FromStr for OrderType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "MARKET" => Ok(OrderType::Market),
            "LIMIT" => Ok(OrderType::Limit),
            other => anyhow::bail!("unknown order type: {other}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarginMode {
    Isolated,
}

impl Default for MarginMode {
    fn default() -> Self {
        MarginMode::Isolated
    }
}

impl std::fmt::Display for MarginMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ISOLATED")
    }
}

/// Why a `Trade` was closed. `Sl` is the only exit reason that triggers a
/// cooldown (see DESIGN.md open question #1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    Tp,
    Sl,
    Manual,
    SignalFlip,
    AdoptedExit,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExitReason::Tp => "TP",
            ExitReason::Sl => "SL",
            ExitReason::Manual => "MANUAL",
            ExitReason::SignalFlip => "SIGNAL_FLIP",
            ExitReason::AdoptedExit => "ADOPTED_EXIT",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ExitReason {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TP" => Ok(ExitReason::Tp),
            "SL" => Ok(ExitReason::Sl),
            "MANUAL" => Ok(ExitReason::Manual),
            "SIGNAL_FLIP" => Ok(ExitReason::SignalFlip),
            "ADOPTED_EXIT" => Ok(ExitReason::AdoptedExit),
            other => anyhow::bail!("unknown exit reason: {other}"),
        }
    }
}

/// A protective order's role, used when resolving cancel hints and phantom
/// exit classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    Entry,
    StopLoss,
    TakeProfit,
}

/// Hint passed to `ExchangeAdapter::cancel_order` so parent-child venues can
/// skip the algo queue and algo-separate venues can skip the standard queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelHint {
    Standard,
    Algo,
    Auto,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_opposite_round_trips() {
        assert_eq!(Side::Long.opposite(), Side::Short);
        assert_eq!(Side::Short.opposite(), Side::Long);
    }

    #[test]
    fn environment_defaults_to_test() {
        assert_eq!(Environment::default(), Environment::Test);
    }

    #[test]
    fn position_status_round_trips_through_display_and_from_str() {
        for s in [
            PositionStatus::Pending,
            PositionStatus::Active,
            PositionStatus::Closed,
            PositionStatus::Cancelled,
            PositionStatus::WaitingSync,
        ] {
            let rendered = s.to_string();
            let parsed: PositionStatus = rendered.parse().unwrap();
            assert_eq!(parsed, s);
        }
    }

    #[test]
    fn position_status_is_open_matches_pending_and_active_only() {
        assert!(PositionStatus::Pending.is_open());
        assert!(PositionStatus::Active.is_open());
        assert!(!PositionStatus::Closed.is_open());
        assert!(!PositionStatus::Cancelled.is_open());
        assert!(!PositionStatus::WaitingSync.is_open());
    }

    #[test]
    fn exit_reason_round_trips() {
        for r in [
            ExitReason::Tp,
            ExitReason::Sl,
            ExitReason::Manual,
            ExitReason::SignalFlip,
            ExitReason::AdoptedExit,
        ] {
            let rendered = r.to_string();
            let parsed: ExitReason = rendered.parse().unwrap();
            assert_eq!(parsed, r);
        }
    }
}
