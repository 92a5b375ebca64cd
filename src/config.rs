//! Engine configuration.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Configuration for replication, sizing constraints, and retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Smallest lot size the broker accepts
    pub broker_min_lot: Decimal,

    /// Lot sizes are rounded down to a multiple of this step
    pub lot_step: Decimal,

    /// Bounded parallelism for fan-out to followers; protects the order
    /// gateway from burst load when a master has many followers
    pub fanout_workers: usize,

    /// Minimum follower equity required to create a follow
    pub min_follow_equity: Decimal,

    /// Maximum retry attempts for order submission
    pub order_retry_attempts: u32,

    /// Maximum retry attempts for a ledger write; settlement without a
    /// matching ledger entry is an accounting defect, so this is higher
    pub ledger_retry_attempts: u32,

    /// Initial backoff between retries, in milliseconds
    pub retry_initial_backoff_ms: u64,

    /// Subscription commission accrual period in days
    pub subscription_period_days: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            broker_min_lot: dec!(0.01),
            lot_step: dec!(0.01),
            fanout_workers: 16,
            min_follow_equity: dec!(100),
            order_retry_attempts: 3,
            ledger_retry_attempts: 8,
            retry_initial_backoff_ms: 200,
            subscription_period_days: 30,
        }
    }
}
