//! Master trader profile: commission model, lifecycle status, aggregate stats.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Advertised risk label shown to prospective followers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "low" => RiskLevel::Low,
            "high" => RiskLevel::High,
            _ => RiskLevel::Medium,
        }
    }
}

/// How the master is paid for follower-generated activity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CommissionModel {
    /// Percentage of each follower's winning-trade profit
    ProfitShare(Decimal),
    /// Fixed amount per copied lot
    PerLot(Decimal),
    /// Flat periodic fee per active follower
    Subscription(Decimal),
}

impl CommissionModel {
    pub fn kind(&self) -> &'static str {
        match self {
            CommissionModel::ProfitShare(_) => "profit_share",
            CommissionModel::PerLot(_) => "per_lot",
            CommissionModel::Subscription(_) => "subscription",
        }
    }

    pub fn value(&self) -> Decimal {
        match self {
            CommissionModel::ProfitShare(v)
            | CommissionModel::PerLot(v)
            | CommissionModel::Subscription(v) => *v,
        }
    }

    pub fn from_parts(kind: &str, value: Decimal) -> Self {
        match kind {
            "per_lot" => CommissionModel::PerLot(value),
            "subscription" => CommissionModel::Subscription(value),
            _ => CommissionModel::ProfitShare(value),
        }
    }
}

/// Master lifecycle status. Masters are never hard-deleted; the ledger
/// references them forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MasterStatus {
    Pending,
    Approved,
    Suspended,
    Rejected,
}

impl MasterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MasterStatus::Pending => "pending",
            MasterStatus::Approved => "approved",
            MasterStatus::Suspended => "suspended",
            MasterStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "approved" => MasterStatus::Approved,
            "suspended" => MasterStatus::Suspended,
            "rejected" => MasterStatus::Rejected,
            _ => MasterStatus::Pending,
        }
    }
}

/// Master trader profile with aggregate stats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterProfile {
    pub id: String,

    pub display_name: String,

    #[serde(default)]
    pub strategy_tag: String,

    pub risk_level: RiskLevel,

    pub commission: CommissionModel,

    pub status: MasterStatus,

    /// Account equity, used by balance-ratio sizing
    pub equity: Decimal,

    pub active_followers: i64,

    /// Fraction of settled trades that were profitable (0.0 to 1.0)
    pub win_rate: f64,

    /// Trailing 30-day profit percentage
    pub profit_30d_pct: f64,

    pub total_trades: i64,

    pub created_at: DateTime<Utc>,
}

impl MasterProfile {
    /// Whether the engine should accept new trade events for this master.
    pub fn is_accepting_events(&self) -> bool {
        self.status == MasterStatus::Approved
    }

    /// Good standing means commission settles straight to paid; suspended
    /// masters accrue pending commission until reactivation.
    pub fn in_good_standing(&self) -> bool {
        self.status != MasterStatus::Suspended
    }
}
