//! Commission ledger entries and withdrawal requests.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Where a commission entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommissionSource {
    Trade,
    Subscription,
    FirstDeposit,
}

impl CommissionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommissionSource::Trade => "trade",
            CommissionSource::Subscription => "subscription",
            CommissionSource::FirstDeposit => "first_deposit",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "subscription" => CommissionSource::Subscription,
            "first_deposit" => CommissionSource::FirstDeposit,
            _ => CommissionSource::Trade,
        }
    }
}

/// Settlement status of a ledger entry. `Pending` exists only while the
/// master is suspended or mid-settlement; the flip to `Paid` happens once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerStatus {
    Pending,
    Paid,
}

impl LedgerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerStatus::Pending => "pending",
            LedgerStatus::Paid => "paid",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "paid" => LedgerStatus::Paid,
            _ => LedgerStatus::Pending,
        }
    }
}

/// Immutable commission record. Append-only; only the status flips.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommissionLedgerEntry {
    pub id: i64,

    pub master_id: String,

    /// None for commission not sourced from a specific follow
    /// (e.g. subscription accrual, first-deposit bonus)
    pub follower_user_id: Option<String>,

    pub source: CommissionSource,

    /// Follower P&L the commission was computed from
    pub trade_pnl: Decimal,

    pub commission_amount: Decimal,

    pub status: LedgerStatus,

    pub created_at: DateTime<Utc>,
}

/// Status of a withdrawal request. Transitions are monotonic:
/// pending -> completed | rejected, both terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WithdrawalStatus {
    Pending,
    Completed,
    Rejected,
}

impl WithdrawalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalStatus::Pending => "pending",
            WithdrawalStatus::Completed => "completed",
            WithdrawalStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "completed" => WithdrawalStatus::Completed,
            "rejected" => WithdrawalStatus::Rejected,
            _ => WithdrawalStatus::Pending,
        }
    }
}

/// A master's request to move available commission to their main wallet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub id: String,
    pub master_id: String,
    pub amount: Decimal,
    pub status: WithdrawalStatus,
    pub created_at: DateTime<Utc>,
}
