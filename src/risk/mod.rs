//! Risk guard: pure decision logic for whether a follower's copy proceeds.
//!
//! No I/O and no locking; safe to call concurrently from the fan-out pool.
//! A rejection is a first-class outcome recorded as a skipped copy, never an
//! error surfaced to the master.

use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::models::{CopyMode, FollowRelationship, FollowStatus};

/// Instrument/broker lot constraints applied after sizing.
#[derive(Debug, Clone, Copy)]
pub struct LotConstraints {
    pub broker_min_lot: Decimal,
    pub lot_step: Decimal,
}

/// Follower account snapshot taken before the candidate trade.
#[derive(Debug, Clone, Copy)]
pub struct FollowerAccountState {
    pub equity: Decimal,
}

/// Why a copy was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    LotTooSmall,
    NotActive,
    DailyLossLimitHit,
    DrawdownLimitHit,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::LotTooSmall => "lot_too_small",
            RejectReason::NotActive => "not_active",
            RejectReason::DailyLossLimitHit => "daily_loss_limit",
            RejectReason::DrawdownLimitHit => "drawdown_limit",
        }
    }
}

/// Outcome of evaluating one follower against one master trade.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// Proceed with the sized lot
    Admit { lot: Decimal },
    /// Skip this copy; `pause` asks the caller to pause the follow
    Reject { reason: RejectReason, pause: bool },
}

impl Decision {
    pub fn admitted_lot(&self) -> Option<Decimal> {
        match self {
            Decision::Admit { lot } => Some(*lot),
            Decision::Reject { .. } => None,
        }
    }
}

/// Round a lot size DOWN to the instrument's lot step. Never rounds up, so
/// a copy can never exceed the configured risk.
pub fn round_to_step(lot: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return lot;
    }
    (lot / step).floor() * step
}

/// Candidate lot size from the follow's copy mode, before clamping.
pub fn candidate_lot(
    mode: &CopyMode,
    master_lot: Decimal,
    follower_equity: Decimal,
    master_equity: Decimal,
) -> Decimal {
    match mode {
        CopyMode::FixedLot(lot) => *lot,
        CopyMode::Multiplier(m) => master_lot * m,
        CopyMode::BalanceRatio => {
            if master_equity <= Decimal::ZERO {
                Decimal::ZERO
            } else {
                master_lot * follower_equity / master_equity
            }
        }
    }
}

/// Evaluate whether a follower's copy should proceed, and at what size.
///
/// All percentage comparisons use the follower's equity before the candidate
/// trade; sizing is never self-referential.
pub fn evaluate(
    follow: &FollowRelationship,
    master_lot: Decimal,
    master_equity: Decimal,
    account: FollowerAccountState,
    constraints: LotConstraints,
    today: NaiveDate,
) -> Decision {
    // Size first: a lot below the broker minimum is a skip regardless of
    // the follow's lifecycle state.
    let candidate = candidate_lot(&follow.copy_mode, master_lot, account.equity, master_equity);
    let stepped = round_to_step(candidate.min(follow.limits.max_lot_size), constraints.lot_step);

    if stepped < constraints.broker_min_lot || stepped <= Decimal::ZERO {
        return Decision::Reject {
            reason: RejectReason::LotTooSmall,
            pause: false,
        };
    }

    if follow.status != FollowStatus::Active {
        return Decision::Reject {
            reason: RejectReason::NotActive,
            pause: false,
        };
    }

    // Daily loss limit: daily_pnl <= -max_daily_loss_pct% of equity
    let daily_pnl = follow.daily_pnl_for(today);
    let daily_loss_floor =
        -follow.limits.max_daily_loss_pct / Decimal::ONE_HUNDRED * account.equity;
    if daily_pnl <= daily_loss_floor && daily_loss_floor < Decimal::ZERO {
        return Decision::Reject {
            reason: RejectReason::DailyLossLimitHit,
            pause: follow.limits.stop_copy_on_drawdown,
        };
    }

    // Drawdown limit: (peak - equity) / peak >= max_drawdown_pct%
    let drawdown_cap = follow.limits.max_drawdown_pct / Decimal::ONE_HUNDRED;
    if drawdown_cap > Decimal::ZERO && follow.drawdown(account.equity) >= drawdown_cap {
        return Decision::Reject {
            reason: RejectReason::DrawdownLimitHit,
            pause: follow.limits.stop_copy_on_drawdown,
        };
    }

    Decision::Admit { lot: stepped }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    use crate::models::RiskLimits;

    fn constraints() -> LotConstraints {
        LotConstraints {
            broker_min_lot: dec!(0.01),
            lot_step: dec!(0.01),
        }
    }

    fn follow(mode: CopyMode, max_lot: Decimal) -> FollowRelationship {
        FollowRelationship {
            id: 1,
            follower_user_id: "u1".into(),
            master_id: "m1".into(),
            copy_mode: mode,
            limits: RiskLimits {
                max_daily_loss_pct: dec!(10),
                max_drawdown_pct: dec!(20),
                max_lot_size: max_lot,
                stop_copy_on_drawdown: false,
            },
            status: FollowStatus::Active,
            total_copied_trades: 0,
            total_pnl: Decimal::ZERO,
            daily_pnl: Decimal::ZERO,
            daily_date: today(),
            peak_equity: dec!(1000),
            created_at: Utc::now(),
        }
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 8, 30).unwrap()
    }

    fn account(equity: Decimal) -> FollowerAccountState {
        FollowerAccountState { equity }
    }

    #[test]
    fn fixed_lot_copies_configured_size() {
        let f = follow(CopyMode::FixedLot(dec!(0.1)), dec!(5));
        let d = evaluate(&f, dec!(1.0), dec!(10000), account(dec!(1000)), constraints(), today());
        assert_eq!(d, Decision::Admit { lot: dec!(0.10) });
    }

    #[test]
    fn multiplier_clamps_to_max_lot() {
        let f = follow(CopyMode::Multiplier(dec!(2.0)), dec!(1.5));
        let d = evaluate(&f, dec!(1.0), dec!(10000), account(dec!(1000)), constraints(), today());
        // 2.0 clamped down to the follow's 1.5 cap, not rejected
        assert_eq!(d, Decision::Admit { lot: dec!(1.50) });
    }

    #[test]
    fn balance_ratio_scales_by_equity() {
        let f = follow(CopyMode::BalanceRatio, dec!(5));
        let d = evaluate(&f, dec!(1.0), dec!(10000), account(dec!(1000)), constraints(), today());
        assert_eq!(d, Decision::Admit { lot: dec!(0.10) });
    }

    #[test]
    fn lot_rounds_down_to_step_never_up() {
        assert_eq!(round_to_step(dec!(0.119), dec!(0.01)), dec!(0.11));
        assert_eq!(round_to_step(dec!(0.1), dec!(0.01)), dec!(0.10));
        assert_eq!(round_to_step(dec!(0.009), dec!(0.01)), dec!(0.00));
    }

    #[test]
    fn below_broker_minimum_rejects_lot_too_small() {
        let f = follow(CopyMode::BalanceRatio, dec!(5));
        // follower equity tiny relative to master: candidate rounds to zero
        let d = evaluate(&f, dec!(0.1), dec!(100000), account(dec!(100)), constraints(), today());
        assert_eq!(
            d,
            Decision::Reject {
                reason: RejectReason::LotTooSmall,
                pause: false
            }
        );
    }

    #[test]
    fn sized_lot_never_exceeds_max_lot_size() {
        // Property from the contract: post-clamp lot <= max_lot_size
        let cases = [
            (CopyMode::FixedLot(dec!(3.0)), dec!(1.0)),
            (CopyMode::Multiplier(dec!(10)), dec!(0.5)),
            (CopyMode::BalanceRatio, dec!(0.03)),
        ];
        for (mode, max_lot) in cases {
            let f = follow(mode, max_lot);
            let d = evaluate(&f, dec!(2.0), dec!(1000), account(dec!(5000)), constraints(), today());
            if let Some(lot) = d.admitted_lot() {
                assert!(lot <= max_lot, "{lot} exceeded cap {max_lot} for {mode:?}");
            }
        }
    }

    #[test]
    fn paused_follow_rejects_not_active() {
        let mut f = follow(CopyMode::FixedLot(dec!(0.1)), dec!(5));
        f.status = FollowStatus::Paused;
        let d = evaluate(&f, dec!(1.0), dec!(10000), account(dec!(1000)), constraints(), today());
        assert_eq!(
            d,
            Decision::Reject {
                reason: RejectReason::NotActive,
                pause: false
            }
        );
    }

    #[test]
    fn daily_loss_limit_rejects_and_signals_pause() {
        let mut f = follow(CopyMode::FixedLot(dec!(0.1)), dec!(5));
        f.limits.stop_copy_on_drawdown = true;
        // -12% of 1000 equity against a 10% limit
        f.daily_pnl = dec!(-120);
        let d = evaluate(&f, dec!(1.0), dec!(10000), account(dec!(1000)), constraints(), today());
        assert_eq!(
            d,
            Decision::Reject {
                reason: RejectReason::DailyLossLimitHit,
                pause: true
            }
        );
    }

    #[test]
    fn stale_daily_pnl_does_not_trip_the_limit() {
        let mut f = follow(CopyMode::FixedLot(dec!(0.1)), dec!(5));
        f.daily_pnl = dec!(-120);
        f.daily_date = today().pred_opt().unwrap();
        let d = evaluate(&f, dec!(1.0), dec!(10000), account(dec!(1000)), constraints(), today());
        assert!(d.admitted_lot().is_some());
    }

    #[test]
    fn drawdown_limit_rejects() {
        let mut f = follow(CopyMode::FixedLot(dec!(0.1)), dec!(5));
        f.limits.stop_copy_on_drawdown = true;
        f.peak_equity = dec!(1000);
        // equity 750 -> 25% drawdown against a 20% cap
        let d = evaluate(&f, dec!(1.0), dec!(10000), account(dec!(750)), constraints(), today());
        assert_eq!(
            d,
            Decision::Reject {
                reason: RejectReason::DrawdownLimitHit,
                pause: true
            }
        );
    }

    #[test]
    fn equity_before_trade_is_used_for_limits() {
        // A follower right at the 20% drawdown edge is rejected even though
        // the candidate trade itself would not change the snapshot.
        let f = follow(CopyMode::FixedLot(dec!(0.1)), dec!(5));
        let d = evaluate(&f, dec!(1.0), dec!(10000), account(dec!(800)), constraints(), today());
        assert_eq!(
            d,
            Decision::Reject {
                reason: RejectReason::DrawdownLimitHit,
                pause: false
            }
        );
    }
}
