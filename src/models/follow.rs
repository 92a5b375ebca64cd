//! Follow relationship: one follower mirroring one master, with sizing and
//! risk configuration plus running stats.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// How a master's lot size translates into the follower's.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "param", rename_all = "snake_case")]
pub enum CopyMode {
    /// Always trade the configured lot size, regardless of the master's
    FixedLot(Decimal),
    /// Master's lot times a configured multiplier
    Multiplier(Decimal),
    /// Master's lot scaled by follower equity / master equity
    BalanceRatio,
}

impl CopyMode {
    pub fn kind(&self) -> &'static str {
        match self {
            CopyMode::FixedLot(_) => "fixed_lot",
            CopyMode::Multiplier(_) => "multiplier",
            CopyMode::BalanceRatio => "balance_ratio",
        }
    }

    pub fn param(&self) -> Option<Decimal> {
        match self {
            CopyMode::FixedLot(v) | CopyMode::Multiplier(v) => Some(*v),
            CopyMode::BalanceRatio => None,
        }
    }

    pub fn from_parts(kind: &str, param: Option<Decimal>) -> Self {
        match kind {
            "fixed_lot" => CopyMode::FixedLot(param.unwrap_or(Decimal::ZERO)),
            "multiplier" => CopyMode::Multiplier(param.unwrap_or(Decimal::ONE)),
            _ => CopyMode::BalanceRatio,
        }
    }
}

/// Per-follow risk limits. Percentages are fractions of follower equity
/// expressed as whole percents (10 = 10%).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskLimits {
    pub max_daily_loss_pct: Decimal,
    pub max_drawdown_pct: Decimal,
    pub max_lot_size: Decimal,
    /// When a loss or drawdown limit trips, pause the follow instead of
    /// just skipping the copy
    pub stop_copy_on_drawdown: bool,
}

/// Follow lifecycle. `Stopped` is terminal; the row is kept for audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FollowStatus {
    Active,
    Paused,
    Stopped,
}

impl FollowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FollowStatus::Active => "active",
            FollowStatus::Paused => "paused",
            FollowStatus::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "active" => FollowStatus::Active,
            "stopped" => FollowStatus::Stopped,
            _ => FollowStatus::Paused,
        }
    }
}

/// A follower's subscription to a master's trades.
///
/// At most one non-stopped relationship may exist per (follower, master)
/// pair; the registry enforces this with a conditional insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowRelationship {
    pub id: i64,

    pub follower_user_id: String,

    pub master_id: String,

    pub copy_mode: CopyMode,

    pub limits: RiskLimits,

    pub status: FollowStatus,

    pub total_copied_trades: i64,

    pub total_pnl: Decimal,

    /// P&L accumulated since `daily_date`; resets at the day boundary
    pub daily_pnl: Decimal,

    /// Anchor date for `daily_pnl`
    pub daily_date: NaiveDate,

    /// Highest follower equity observed at settlement, for drawdown tracking
    pub peak_equity: Decimal,

    pub created_at: DateTime<Utc>,
}

impl FollowRelationship {
    /// Daily P&L as of `today`, accounting for the reset boundary.
    pub fn daily_pnl_for(&self, today: NaiveDate) -> Decimal {
        if self.daily_date == today {
            self.daily_pnl
        } else {
            Decimal::ZERO
        }
    }

    /// Current drawdown from peak as a fraction (0.0 to 1.0) given live equity.
    pub fn drawdown(&self, equity: Decimal) -> Decimal {
        if self.peak_equity <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        ((self.peak_equity - equity) / self.peak_equity).max(Decimal::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn follow() -> FollowRelationship {
        FollowRelationship {
            id: 1,
            follower_user_id: "u1".into(),
            master_id: "m1".into(),
            copy_mode: CopyMode::FixedLot(dec!(0.1)),
            limits: RiskLimits {
                max_daily_loss_pct: dec!(10),
                max_drawdown_pct: dec!(20),
                max_lot_size: dec!(1.5),
                stop_copy_on_drawdown: false,
            },
            status: FollowStatus::Active,
            total_copied_trades: 0,
            total_pnl: Decimal::ZERO,
            daily_pnl: dec!(-120),
            daily_date: NaiveDate::from_ymd_opt(2026, 8, 29).unwrap(),
            peak_equity: dec!(1000),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn daily_pnl_resets_across_day_boundary() {
        let f = follow();
        assert_eq!(f.daily_pnl_for(f.daily_date), dec!(-120));

        let next_day = f.daily_date.succ_opt().unwrap();
        assert_eq!(f.daily_pnl_for(next_day), Decimal::ZERO);
    }

    #[test]
    fn drawdown_is_fraction_of_peak() {
        let f = follow();
        assert_eq!(f.drawdown(dec!(800)), dec!(0.2));
        // Above peak never reports negative drawdown
        assert_eq!(f.drawdown(dec!(1200)), Decimal::ZERO);
    }

    #[test]
    fn copy_mode_round_trips_through_parts() {
        for mode in [
            CopyMode::FixedLot(dec!(0.2)),
            CopyMode::Multiplier(dec!(2)),
            CopyMode::BalanceRatio,
        ] {
            assert_eq!(CopyMode::from_parts(mode.kind(), mode.param()), mode);
        }
    }
}
