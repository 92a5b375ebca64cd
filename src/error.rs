//! Typed domain errors.
//!
//! Risk rejections are not errors; they are first-class `Decision` outcomes
//! in the `risk` module. Everything here either rejects bad input with no
//! side effect, or reports an infrastructure/invariant failure.

use rust_decimal::Decimal;
use thiserror::Error;

/// Errors from the follow registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("already following master {master_id}")]
    AlreadyFollowing { master_id: String },

    #[error("master {master_id} is not approved")]
    MasterNotApproved { master_id: String },

    #[error("follower equity {equity} below required minimum {required}")]
    InsufficientCapital { equity: Decimal, required: Decimal },

    #[error("follow {follow_id} is not active")]
    NotActive { follow_id: i64 },

    #[error("follow {follow_id} not found")]
    NotFound { follow_id: i64 },

    #[error("database error")]
    Db(#[from] sqlx::Error),
}

/// Errors from the withdrawal coordinator.
#[derive(Debug, Error)]
pub enum WalletError {
    #[error("requested {requested} exceeds available balance {available}")]
    InsufficientBalance {
        requested: Decimal,
        available: Decimal,
    },

    #[error("master {master_id} is suspended")]
    MasterSuspended { master_id: String },

    #[error("master {master_id} not found")]
    MasterNotFound { master_id: String },

    #[error("withdrawal {request_id} not found")]
    NotFound { request_id: String },

    #[error("withdrawal {request_id} is already {status}")]
    Conflict { request_id: String, status: String },

    #[error("database error")]
    Db(#[from] sqlx::Error),
}

/// Per-follower replication failure, caught at the follower boundary so
/// siblings are unaffected.
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("order gateway failure for follower {follower}: {source}")]
    OrderSubmission {
        follower: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("ledger write failed after retries for master {master_id}")]
    LedgerDeadLettered { master_id: String },
}
