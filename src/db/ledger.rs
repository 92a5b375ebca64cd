//! Commission ledger: append-only entries, the pending->paid flip, and
//! transactional withdrawal accounting.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::SqliteConnection;
use tracing::info;
use uuid::Uuid;

use crate::error::WalletError;
use crate::models::{
    CommissionLedgerEntry, CommissionSource, LedgerStatus, WithdrawalRequest, WithdrawalStatus,
};

use super::{from_cents, parse_timestamp, to_cents, Database};

#[derive(Debug, Clone, sqlx::FromRow)]
struct LedgerRow {
    id: i64,
    master_id: String,
    follower_user_id: Option<String>,
    source: String,
    trade_pnl_cents: i64,
    commission_cents: i64,
    status: String,
    created_at: String,
}

impl From<LedgerRow> for CommissionLedgerEntry {
    fn from(row: LedgerRow) -> Self {
        CommissionLedgerEntry {
            id: row.id,
            master_id: row.master_id,
            follower_user_id: row.follower_user_id,
            source: CommissionSource::parse(&row.source),
            trade_pnl: from_cents(row.trade_pnl_cents),
            commission_amount: from_cents(row.commission_cents),
            status: LedgerStatus::parse(&row.status),
            created_at: parse_timestamp(&row.created_at),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct WithdrawalRow {
    id: String,
    master_id: String,
    amount_cents: i64,
    status: String,
    created_at: String,
}

impl From<WithdrawalRow> for WithdrawalRequest {
    fn from(row: WithdrawalRow) -> Self {
        WithdrawalRequest {
            id: row.id,
            master_id: row.master_id,
            amount: from_cents(row.amount_cents),
            status: WithdrawalStatus::parse(&row.status),
            created_at: parse_timestamp(&row.created_at),
        }
    }
}

impl Database {
    /// Append a commission entry.
    ///
    /// The entry is written `pending` first and flipped to `paid` in the same
    /// transaction when the master is in good standing; a failure between the
    /// two cannot lose commission, only leave it pending for reconciliation.
    /// Suspended masters accrue pending entries until reactivation.
    pub async fn record_commission(
        &self,
        master_id: &str,
        follower_user_id: Option<&str>,
        source: CommissionSource,
        trade_pnl: Decimal,
        amount: Decimal,
        master_in_good_standing: bool,
    ) -> Result<CommissionLedgerEntry> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO ledger_entries (
                master_id, follower_user_id, source,
                trade_pnl_cents, commission_cents, status, created_at
            ) VALUES (?, ?, ?, ?, ?, 'pending', ?)
            "#,
        )
        .bind(master_id)
        .bind(follower_user_id)
        .bind(source.as_str())
        .bind(to_cents(trade_pnl))
        .bind(to_cents(amount))
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?;

        let entry_id = result.last_insert_rowid();

        if master_in_good_standing {
            sqlx::query("UPDATE ledger_entries SET status = 'paid' WHERE id = ? AND status = 'pending'")
                .bind(entry_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        let row = sqlx::query_as::<_, LedgerRow>("SELECT * FROM ledger_entries WHERE id = ?")
            .bind(entry_id)
            .fetch_one(&self.pool)
            .await?;

        Ok(CommissionLedgerEntry::from(row))
    }

    /// Flip all of a master's pending entries to paid (called on
    /// reactivation). Returns the number of entries released.
    pub async fn release_pending_commission(&self, master_id: &str) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE ledger_entries SET status = 'paid' WHERE master_id = ? AND status = 'pending'",
        )
        .bind(master_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            info!(master = %master_id, released = result.rows_affected(), "Pending commission released");
        }

        Ok(result.rows_affected())
    }

    /// Recent ledger entries for a master, newest first.
    pub async fn list_ledger_entries(
        &self,
        master_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<CommissionLedgerEntry>> {
        let rows = sqlx::query_as::<_, LedgerRow>(
            "SELECT * FROM ledger_entries WHERE master_id = ? ORDER BY id DESC LIMIT ? OFFSET ?",
        )
        .bind(master_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(CommissionLedgerEntry::from).collect())
    }

    /// When the master's subscription commission last accrued, if ever.
    pub async fn last_subscription_accrual(
        &self,
        master_id: &str,
    ) -> Result<Option<DateTime<Utc>>> {
        let row: (Option<String>,) = sqlx::query_as(
            "SELECT MAX(created_at) FROM ledger_entries WHERE master_id = ? AND source = 'subscription'",
        )
        .bind(master_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0.map(|s| parse_timestamp(&s)))
    }

    /// Available commission balance:
    /// paid entries minus completed withdrawals minus pending withdrawals.
    pub async fn available_commission(&self, master_id: &str) -> Result<Decimal> {
        let mut conn = self.pool.acquire().await?;
        let cents = balance_cents(&mut conn, master_id).await?;
        Ok(from_cents(cents))
    }

    /// Insert a withdrawal request, serialized against concurrent requests.
    ///
    /// BEGIN IMMEDIATE takes the write lock before the balance read so two
    /// racing requests cannot both observe the same balance and overdraw.
    pub async fn create_withdrawal(
        &self,
        master_id: &str,
        amount: Decimal,
    ) -> Result<WithdrawalRequest, WalletError> {
        let mut conn = self.pool.acquire().await?;

        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let outcome = Self::create_withdrawal_locked(&mut conn, master_id, amount).await;

        if outcome.is_ok() {
            if let Err(e) = sqlx::query("COMMIT").execute(&mut *conn).await {
                // A failed COMMIT leaves the transaction open; roll back so
                // the pooled connection goes back clean.
                sqlx::query("ROLLBACK").execute(&mut *conn).await.ok();
                return Err(e.into());
            }
        } else {
            sqlx::query("ROLLBACK").execute(&mut *conn).await.ok();
        }

        outcome
    }

    async fn create_withdrawal_locked(
        conn: &mut SqliteConnection,
        master_id: &str,
        amount: Decimal,
    ) -> Result<WithdrawalRequest, WalletError> {
        let status: Option<(String,)> =
            sqlx::query_as("SELECT status FROM masters WHERE id = ?")
                .bind(master_id)
                .fetch_optional(&mut *conn)
                .await?;
        let status = status.map(|(s,)| s);
        match status.as_deref() {
            None => {
                return Err(WalletError::MasterNotFound {
                    master_id: master_id.to_string(),
                })
            }
            Some("suspended") => {
                return Err(WalletError::MasterSuspended {
                    master_id: master_id.to_string(),
                })
            }
            Some(_) => {}
        }

        let available = from_cents(balance_cents(conn, master_id).await?);
        let requested_cents = to_cents(amount);
        if amount <= Decimal::ZERO || from_cents(requested_cents) > available {
            return Err(WalletError::InsufficientBalance {
                requested: amount,
                available,
            });
        }

        let request = WithdrawalRequest {
            id: Uuid::new_v4().to_string(),
            master_id: master_id.to_string(),
            amount: from_cents(requested_cents),
            status: WithdrawalStatus::Pending,
            created_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO withdrawals (id, master_id, amount_cents, status, created_at) VALUES (?, ?, ?, 'pending', ?)",
        )
        .bind(&request.id)
        .bind(master_id)
        .bind(requested_cents)
        .bind(request.created_at.to_rfc3339())
        .execute(&mut *conn)
        .await?;

        Ok(request)
    }

    /// Fetch one withdrawal request.
    pub async fn get_withdrawal(
        &self,
        request_id: &str,
    ) -> Result<Option<WithdrawalRequest>, WalletError> {
        let row = sqlx::query_as::<_, WithdrawalRow>("SELECT * FROM withdrawals WHERE id = ?")
            .bind(request_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(WithdrawalRequest::from))
    }

    /// List withdrawal requests, newest first.
    pub async fn list_withdrawals(&self, limit: i64, offset: i64) -> Result<Vec<WithdrawalRequest>> {
        let rows = sqlx::query_as::<_, WithdrawalRow>(
            "SELECT * FROM withdrawals ORDER BY created_at DESC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch withdrawals")?;

        Ok(rows.into_iter().map(WithdrawalRequest::from).collect())
    }

    /// Move a pending withdrawal to a terminal status. Transitions are
    /// monotonic; acting on a non-pending request is a conflict.
    pub async fn finish_withdrawal(
        &self,
        request_id: &str,
        status: WithdrawalStatus,
    ) -> Result<WithdrawalRequest, WalletError> {
        let result = sqlx::query("UPDATE withdrawals SET status = ? WHERE id = ? AND status = 'pending'")
            .bind(status.as_str())
            .bind(request_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return match self.get_withdrawal(request_id).await? {
                None => Err(WalletError::NotFound {
                    request_id: request_id.to_string(),
                }),
                Some(r) => Err(WalletError::Conflict {
                    request_id: request_id.to_string(),
                    status: r.status.as_str().to_string(),
                }),
            };
        }

        self.get_withdrawal(request_id)
            .await?
            .ok_or_else(|| WalletError::NotFound {
                request_id: request_id.to_string(),
            })
    }
}

/// paid entries - completed withdrawals - pending withdrawals, in cents.
/// Pending withdrawals are excluded from (not subtracted out of) the paid
/// total, so a rejection needs no compensating ledger write.
async fn balance_cents(conn: &mut SqliteConnection, master_id: &str) -> Result<i64, sqlx::Error> {
    let (paid,): (i64,) = sqlx::query_as(
        "SELECT COALESCE(SUM(commission_cents), 0) FROM ledger_entries WHERE master_id = ? AND status = 'paid'",
    )
    .bind(master_id)
    .fetch_one(&mut *conn)
    .await?;

    let (held,): (i64,) = sqlx::query_as(
        "SELECT COALESCE(SUM(amount_cents), 0) FROM withdrawals WHERE master_id = ? AND status IN ('completed', 'pending')",
    )
    .bind(master_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(paid - held)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    use crate::models::{CommissionModel, MasterStatus, RiskLevel};

    async fn db_with_master(status: MasterStatus) -> Database {
        let db = Database::new_in_memory().await.unwrap();
        db.create_master(
            "m1",
            "Alpha",
            "",
            RiskLevel::Medium,
            CommissionModel::ProfitShare(dec!(20)),
            dec!(10000),
        )
        .await
        .unwrap();
        db.set_master_status("m1", status).await.unwrap();
        db
    }

    #[tokio::test]
    async fn good_standing_commission_settles_paid() {
        let db = db_with_master(MasterStatus::Approved).await;

        let entry = db
            .record_commission("m1", Some("u1"), CommissionSource::Trade, dec!(500), dec!(100), true)
            .await
            .unwrap();
        assert_eq!(entry.status, LedgerStatus::Paid);
        assert_eq!(entry.commission_amount, dec!(100.00));

        assert_eq!(db.available_commission("m1").await.unwrap(), dec!(100.00));
    }

    #[tokio::test]
    async fn suspended_master_accrues_pending_until_release() {
        let db = db_with_master(MasterStatus::Suspended).await;

        let entry = db
            .record_commission("m1", Some("u1"), CommissionSource::Trade, dec!(500), dec!(100), false)
            .await
            .unwrap();
        assert_eq!(entry.status, LedgerStatus::Pending);
        // Pending commission is not withdrawable
        assert_eq!(db.available_commission("m1").await.unwrap(), Decimal::ZERO);

        let released = db.release_pending_commission("m1").await.unwrap();
        assert_eq!(released, 1);
        assert_eq!(db.available_commission("m1").await.unwrap(), dec!(100.00));
    }

    #[tokio::test]
    async fn repeated_identical_commissions_accumulate_exactly() {
        let db = db_with_master(MasterStatus::Approved).await;

        for _ in 0..1000 {
            db.record_commission("m1", Some("u1"), CommissionSource::Trade, dec!(500), dec!(100.00), true)
                .await
                .unwrap();
        }

        // No rounding drift: 1000 x $100.00 exactly
        assert_eq!(db.available_commission("m1").await.unwrap(), dec!(100000.00));
    }

    #[tokio::test]
    async fn withdrawal_respects_available_balance() {
        let db = db_with_master(MasterStatus::Approved).await;
        db.record_commission("m1", None, CommissionSource::Trade, dec!(0), dec!(150), true)
            .await
            .unwrap();

        let request = db.create_withdrawal("m1", dec!(100)).await.unwrap();
        assert_eq!(request.status, WithdrawalStatus::Pending);

        // Pending request already reserves the amount
        assert_eq!(db.available_commission("m1").await.unwrap(), dec!(50.00));

        let err = db.create_withdrawal("m1", dec!(60)).await;
        assert!(matches!(err, Err(WalletError::InsufficientBalance { .. })));

        // Within the remainder still works
        db.create_withdrawal("m1", dec!(50)).await.unwrap();
        assert_eq!(db.available_commission("m1").await.unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn concurrent_withdrawals_never_overdraw() {
        let db = db_with_master(MasterStatus::Approved).await;
        db.record_commission("m1", None, CommissionSource::Trade, dec!(0), dec!(100), true)
            .await
            .unwrap();

        let mut tasks = Vec::new();
        for _ in 0..6 {
            let db = db.clone();
            tasks.push(tokio::spawn(async move { db.create_withdrawal("m1", dec!(40)).await }));
        }

        let mut ok = 0;
        for task in tasks {
            if task.await.unwrap().is_ok() {
                ok += 1;
            }
        }

        // $100 available, $40 each: exactly two fit
        assert_eq!(ok, 2);
        assert_eq!(db.available_commission("m1").await.unwrap(), dec!(20.00));
    }

    #[tokio::test]
    async fn rejection_releases_reserved_amount() {
        let db = db_with_master(MasterStatus::Approved).await;
        db.record_commission("m1", None, CommissionSource::Trade, dec!(0), dec!(100), true)
            .await
            .unwrap();

        let request = db.create_withdrawal("m1", dec!(80)).await.unwrap();
        assert_eq!(db.available_commission("m1").await.unwrap(), dec!(20.00));

        db.finish_withdrawal(&request.id, WithdrawalStatus::Rejected).await.unwrap();
        assert_eq!(db.available_commission("m1").await.unwrap(), dec!(100.00));

        // Terminal: completing a rejected request is a conflict
        let err = db.finish_withdrawal(&request.id, WithdrawalStatus::Completed).await;
        assert!(matches!(err, Err(WalletError::Conflict { .. })));
    }

    #[tokio::test]
    async fn failed_request_leaves_the_connection_clean() {
        // Single-connection pool: if an error path left the explicit
        // transaction open, every later statement on the pool would fail.
        let db = db_with_master(MasterStatus::Approved).await;
        db.record_commission("m1", None, CommissionSource::Trade, dec!(0), dec!(50), true)
            .await
            .unwrap();

        let err = db.create_withdrawal("m1", dec!(80)).await;
        assert!(matches!(err, Err(WalletError::InsufficientBalance { .. })));

        let request = db.create_withdrawal("m1", dec!(30)).await.unwrap();
        assert_eq!(request.status, WithdrawalStatus::Pending);
        assert_eq!(db.available_commission("m1").await.unwrap(), dec!(20.00));
    }

    #[tokio::test]
    async fn suspended_master_cannot_withdraw() {
        let db = db_with_master(MasterStatus::Approved).await;
        db.record_commission("m1", None, CommissionSource::Trade, dec!(0), dec!(100), true)
            .await
            .unwrap();
        db.set_master_status("m1", MasterStatus::Suspended).await.unwrap();

        let err = db.create_withdrawal("m1", dec!(50)).await;
        assert!(matches!(err, Err(WalletError::MasterSuspended { .. })));
    }
}
