//! Withdrawal lifecycle and master standing.
//!
//! Sits between the commission ledger and the external wallet service:
//! requests reserve balance transactionally in the database, approval
//! credits the master's main wallet, rejection releases the reservation.
//! Also owns master suspension/reactivation and the periodic subscription
//! commission accrual.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{error, info, warn};

use crate::api::WalletService;
use crate::config::EngineConfig;
use crate::db::Database;
use crate::error::WalletError;
use crate::models::{CommissionModel, CommissionSource, MasterStatus, WithdrawalRequest, WithdrawalStatus};

pub struct WithdrawalCoordinator {
    config: EngineConfig,
    db: Database,
    wallet: Arc<dyn WalletService>,
}

impl WithdrawalCoordinator {
    pub fn new(config: EngineConfig, db: Database, wallet: Arc<dyn WalletService>) -> Self {
        Self { config, db, wallet }
    }

    /// Open a withdrawal request. The amount is reserved against the
    /// master's available commission the moment the request is accepted.
    pub async fn request_withdrawal(
        &self,
        master_id: &str,
        amount: Decimal,
    ) -> Result<WithdrawalRequest, WalletError> {
        let request = self.db.create_withdrawal(master_id, amount).await?;
        info!(
            request = %request.id,
            master = %master_id,
            amount = %amount,
            "Withdrawal requested"
        );
        Ok(request)
    }

    /// Approve a pending withdrawal: mark it completed, then credit the
    /// master's main wallet. The status flip happens first so a crash
    /// between the two leaves an auditable completed-but-uncredited request
    /// rather than a double credit; a credit failure is dead-lettered for
    /// reconciliation.
    pub async fn approve_withdrawal(&self, request_id: &str) -> Result<WithdrawalRequest> {
        let request = self
            .db
            .finish_withdrawal(request_id, WithdrawalStatus::Completed)
            .await?;

        let credited = retry(
            Duration::from_millis(self.config.retry_initial_backoff_ms),
            self.config.ledger_retry_attempts,
            || async {
                self.wallet
                    .credit_master_wallet(&request.master_id, request.amount)
                    .await
            },
        )
        .await;

        if let Err(e) = credited {
            error!(
                request = %request.id,
                master = %request.master_id,
                amount = %request.amount,
                error = %e,
                "ACCOUNTING: wallet credit dead-lettered"
            );
            self.db
                .dead_letter(
                    "wallet_credit",
                    &json!({
                        "request_id": request.id,
                        "master_id": request.master_id,
                        "amount": request.amount.to_string(),
                    }),
                    &e.to_string(),
                    self.config.ledger_retry_attempts,
                )
                .await
                .ok();
        } else {
            info!(request = %request.id, master = %request.master_id, amount = %request.amount, "Withdrawal completed");
        }

        Ok(request)
    }

    /// Reject a pending withdrawal, releasing its balance reservation.
    pub async fn reject_withdrawal(&self, request_id: &str) -> Result<WithdrawalRequest, WalletError> {
        let request = self
            .db
            .finish_withdrawal(request_id, WithdrawalStatus::Rejected)
            .await?;
        info!(request = %request.id, master = %request.master_id, "Withdrawal rejected");
        Ok(request)
    }

    /// Suspend a master: new events are refused and commission accrues
    /// pending until reactivation. Existing follows are untouched.
    pub async fn suspend_master(&self, master_id: &str) -> Result<()> {
        self.db
            .set_master_status(master_id, MasterStatus::Suspended)
            .await?;
        warn!(master = %master_id, "Master suspended");
        Ok(())
    }

    /// Reactivate a suspended master and release commission held pending
    /// during the suspension.
    pub async fn reactivate_master(&self, master_id: &str) -> Result<u64> {
        self.db
            .set_master_status(master_id, MasterStatus::Approved)
            .await?;
        let released = self.db.release_pending_commission(master_id).await?;
        info!(master = %master_id, released, "Master reactivated");
        Ok(released)
    }

    /// Accrue subscription commission for every approved subscription-model
    /// master whose last accrual is older than one period. One aggregate
    /// entry per master per period: fee x active follower count. Returns
    /// the number of masters accrued.
    pub async fn accrue_subscriptions(&self) -> Result<usize> {
        let masters = self
            .db
            .list_masters(Some(MasterStatus::Approved), i64::MAX, 0)
            .await?;
        let period = ChronoDuration::days(self.config.subscription_period_days);
        let now = Utc::now();
        let mut accrued = 0;

        for master in masters {
            let CommissionModel::Subscription(fee) = master.commission else {
                continue;
            };
            if master.active_followers == 0 {
                continue;
            }

            let due = match self.db.last_subscription_accrual(&master.id).await? {
                Some(last) => now - last >= period,
                None => true,
            };
            if !due {
                continue;
            }

            let amount = fee * Decimal::from(master.active_followers);
            self.db
                .record_commission(
                    &master.id,
                    None,
                    CommissionSource::Subscription,
                    Decimal::ZERO,
                    amount,
                    master.in_good_standing(),
                )
                .await?;
            info!(
                master = %master.id,
                followers = master.active_followers,
                amount = %amount,
                "Subscription commission accrued"
            );
            accrued += 1;
        }

        Ok(accrued)
    }
}

/// Bounded retry with exponential backoff.
async fn retry<T, Fut, F>(initial: Duration, max_attempts: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    use std::sync::atomic::{AtomicU32, Ordering};

    let attempts = AtomicU32::new(0);
    let policy = backoff::ExponentialBackoff {
        initial_interval: initial,
        max_interval: Duration::from_secs(10),
        max_elapsed_time: None,
        ..backoff::ExponentialBackoff::default()
    };

    backoff::future::retry(policy, || {
        let fut = op();
        let attempts = &attempts;
        async move {
            match fut.await {
                Ok(v) => Ok(v),
                Err(e) => {
                    let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                    if n >= max_attempts.max(1) {
                        Err(backoff::Error::permanent(e))
                    } else {
                        Err(backoff::Error::transient(e))
                    }
                }
            }
        }
    })
    .await
}
