//! Master profile store: durable master trader profiles and status transitions.

use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;

use crate::models::{CommissionModel, MasterProfile, MasterStatus, RiskLevel};

use super::{from_cents, parse_decimal, parse_timestamp, to_cents, Database};

#[derive(Debug, Clone, sqlx::FromRow)]
struct MasterRow {
    id: String,
    display_name: String,
    strategy_tag: String,
    risk_level: String,
    commission_kind: String,
    commission_value: String,
    status: String,
    equity_cents: i64,
    active_followers: i64,
    win_rate: f64,
    profit_30d_pct: f64,
    total_trades: i64,
    created_at: String,
}

impl From<MasterRow> for MasterProfile {
    fn from(row: MasterRow) -> Self {
        MasterProfile {
            id: row.id,
            display_name: row.display_name,
            strategy_tag: row.strategy_tag,
            risk_level: RiskLevel::parse(&row.risk_level),
            commission: CommissionModel::from_parts(
                &row.commission_kind,
                parse_decimal(&row.commission_value),
            ),
            status: MasterStatus::parse(&row.status),
            equity: from_cents(row.equity_cents),
            active_followers: row.active_followers,
            win_rate: row.win_rate,
            profit_30d_pct: row.profit_30d_pct,
            total_trades: row.total_trades,
            created_at: parse_timestamp(&row.created_at),
        }
    }
}

impl Database {
    /// Register a master request. Profiles start `pending` until an admin
    /// approves them.
    pub async fn create_master(
        &self,
        id: &str,
        display_name: &str,
        strategy_tag: &str,
        risk_level: RiskLevel,
        commission: CommissionModel,
        equity: Decimal,
    ) -> Result<MasterProfile> {
        sqlx::query(
            r#"
            INSERT INTO masters (
                id, display_name, strategy_tag, risk_level,
                commission_kind, commission_value, status, equity_cents, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, 'pending', ?, ?)
            "#,
        )
        .bind(id)
        .bind(display_name)
        .bind(strategy_tag)
        .bind(risk_level.as_str())
        .bind(commission.kind())
        .bind(commission.value().to_string())
        .bind(to_cents(equity))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        self.get_master(id)
            .await?
            .context("master vanished after insert")
    }

    /// Fetch a master profile.
    pub async fn get_master(&self, id: &str) -> Result<Option<MasterProfile>> {
        let row = sqlx::query_as::<_, MasterRow>("SELECT * FROM masters WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(MasterProfile::from))
    }

    /// List masters, optionally filtered by status, newest first.
    pub async fn list_masters(
        &self,
        status: Option<MasterStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<MasterProfile>> {
        let rows = match status {
            Some(s) => {
                sqlx::query_as::<_, MasterRow>(
                    "SELECT * FROM masters WHERE status = ? ORDER BY created_at DESC LIMIT ? OFFSET ?",
                )
                .bind(s.as_str())
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, MasterRow>(
                    "SELECT * FROM masters ORDER BY created_at DESC LIMIT ? OFFSET ?",
                )
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
        };

        Ok(rows.into_iter().map(MasterProfile::from).collect())
    }

    /// Transition a master's status. Soft transitions only; rows are never
    /// deleted so ledger references stay valid.
    pub async fn set_master_status(&self, id: &str, status: MasterStatus) -> Result<()> {
        sqlx::query("UPDATE masters SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Update a master's equity snapshot (feeds balance-ratio sizing).
    pub async fn set_master_equity(&self, id: &str, equity: Decimal) -> Result<()> {
        sqlx::query("UPDATE masters SET equity_cents = ? WHERE id = ?")
            .bind(to_cents(equity))
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Fold one settled trade into the master's aggregate stats.
    pub async fn record_master_trade_settled(&self, id: &str, won: bool) -> Result<()> {
        // win_rate maintained incrementally: new = (old * n + won) / (n + 1)
        sqlx::query(
            r#"
            UPDATE masters SET
                win_rate = (win_rate * total_trades + ?) / (total_trades + 1),
                total_trades = total_trades + 1
            WHERE id = ?
            "#,
        )
        .bind(if won { 1.0 } else { 0.0 })
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Adjust the active-follower count (registry calls this on follow
    /// create/stop).
    pub async fn adjust_active_followers(&self, id: &str, delta: i64) -> Result<()> {
        sqlx::query(
            "UPDATE masters SET active_followers = MAX(0, active_followers + ?) WHERE id = ?",
        )
        .bind(delta)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    async fn db() -> Database {
        Database::new_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn master_lifecycle_transitions() {
        let db = db().await;
        let master = db
            .create_master(
                "m1",
                "Alpha",
                "scalper",
                RiskLevel::High,
                CommissionModel::ProfitShare(dec!(20)),
                dec!(10000),
            )
            .await
            .unwrap();
        assert_eq!(master.status, MasterStatus::Pending);

        db.set_master_status("m1", MasterStatus::Approved).await.unwrap();
        let master = db.get_master("m1").await.unwrap().unwrap();
        assert_eq!(master.status, MasterStatus::Approved);
        assert_eq!(master.commission, CommissionModel::ProfitShare(dec!(20)));
        assert_eq!(master.equity, dec!(10000));
    }

    #[tokio::test]
    async fn settled_trades_update_win_rate() {
        let db = db().await;
        db.create_master(
            "m1",
            "Alpha",
            "",
            RiskLevel::Medium,
            CommissionModel::PerLot(dec!(3)),
            dec!(5000),
        )
        .await
        .unwrap();

        db.record_master_trade_settled("m1", true).await.unwrap();
        db.record_master_trade_settled("m1", true).await.unwrap();
        db.record_master_trade_settled("m1", false).await.unwrap();

        let master = db.get_master("m1").await.unwrap().unwrap();
        assert_eq!(master.total_trades, 3);
        assert!((master.win_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn follower_count_never_goes_negative() {
        let db = db().await;
        db.create_master(
            "m1",
            "Alpha",
            "",
            RiskLevel::Low,
            CommissionModel::Subscription(dec!(29.99)),
            dec!(1000),
        )
        .await
        .unwrap();

        db.adjust_active_followers("m1", -5).await.unwrap();
        let master = db.get_master("m1").await.unwrap().unwrap();
        assert_eq!(master.active_followers, 0);
    }
}
