//! Data models for masters, follow relationships, trade events, and the ledger.

mod event;
mod follow;
mod ledger;
mod master;

pub use event::{MasterTradeEvent, OrderSide, TradeDetails, TradeEventKind};
pub use follow::{CopyMode, FollowRelationship, FollowStatus, RiskLimits};
pub use ledger::{
    CommissionLedgerEntry, CommissionSource, LedgerStatus, WithdrawalRequest, WithdrawalStatus,
};
pub use master::{CommissionModel, MasterProfile, MasterStatus, RiskLevel};
