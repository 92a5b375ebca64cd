//! Follow registry: durable follow relationships, lifecycle transitions, and
//! per-relationship stat updates.

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::info;

use crate::error::RegistryError;
use crate::models::{CopyMode, FollowRelationship, FollowStatus, MasterStatus, RiskLimits};

use super::{from_cents, parse_date, parse_decimal, parse_timestamp, to_cents, Database};

/// Sizing and risk configuration supplied at follow creation.
#[derive(Debug, Clone)]
pub struct FollowConfig {
    pub copy_mode: CopyMode,
    pub limits: RiskLimits,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct FollowRow {
    id: i64,
    follower_user_id: String,
    master_id: String,
    copy_mode: String,
    copy_param: Option<String>,
    max_daily_loss_pct: String,
    max_drawdown_pct: String,
    max_lot_size: String,
    stop_copy_on_drawdown: i64,
    status: String,
    total_copied_trades: i64,
    total_pnl_cents: i64,
    daily_pnl_cents: i64,
    daily_date: String,
    peak_equity_cents: i64,
    created_at: String,
}

impl From<FollowRow> for FollowRelationship {
    fn from(row: FollowRow) -> Self {
        FollowRelationship {
            id: row.id,
            follower_user_id: row.follower_user_id,
            master_id: row.master_id,
            copy_mode: CopyMode::from_parts(
                &row.copy_mode,
                row.copy_param.as_deref().map(parse_decimal),
            ),
            limits: RiskLimits {
                max_daily_loss_pct: parse_decimal(&row.max_daily_loss_pct),
                max_drawdown_pct: parse_decimal(&row.max_drawdown_pct),
                max_lot_size: parse_decimal(&row.max_lot_size),
                stop_copy_on_drawdown: row.stop_copy_on_drawdown != 0,
            },
            status: FollowStatus::parse(&row.status),
            total_copied_trades: row.total_copied_trades,
            total_pnl: from_cents(row.total_pnl_cents),
            daily_pnl: from_cents(row.daily_pnl_cents),
            daily_date: parse_date(&row.daily_date),
            peak_equity: from_cents(row.peak_equity_cents),
            created_at: parse_timestamp(&row.created_at),
        }
    }
}

/// A follower's open order mirroring one master trade.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CopiedPosition {
    pub id: i64,
    pub follow_id: i64,
    pub master_id: String,
    pub master_trade_id: String,
    pub order_id: String,
    pub symbol: String,
    pub side: String,
    pub copied_lot: String,
    pub master_lot: String,
    pub status: String,
    pub opened_at: String,
    pub closed_at: Option<String>,
}

impl CopiedPosition {
    pub fn copied_lot_decimal(&self) -> Decimal {
        parse_decimal(&self.copied_lot)
    }

    pub fn master_lot_decimal(&self) -> Decimal {
        parse_decimal(&self.master_lot)
    }
}

impl Database {
    /// Create a follow relationship.
    ///
    /// The partial unique index on live follows makes this fail closed under
    /// racing creates: the loser gets `AlreadyFollowing`, never a duplicate.
    pub async fn create_follow(
        &self,
        follower_user_id: &str,
        master_id: &str,
        config: FollowConfig,
        min_equity: Decimal,
    ) -> Result<FollowRelationship, RegistryError> {
        let master = self
            .get_master(master_id)
            .await
            .map_err(|_| RegistryError::MasterNotApproved {
                master_id: master_id.to_string(),
            })?;
        match master {
            Some(m) if m.status == MasterStatus::Approved => {}
            _ => {
                return Err(RegistryError::MasterNotApproved {
                    master_id: master_id.to_string(),
                })
            }
        }

        let equity = self
            .get_follower_account(follower_user_id)
            .await
            .ok()
            .flatten()
            .map(|(_, equity)| equity)
            .unwrap_or(Decimal::ZERO);
        if equity < min_equity {
            return Err(RegistryError::InsufficientCapital {
                equity,
                required: min_equity,
            });
        }

        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO follows (
                follower_user_id, master_id, copy_mode, copy_param,
                max_daily_loss_pct, max_drawdown_pct, max_lot_size,
                stop_copy_on_drawdown, status, daily_date, peak_equity_cents, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'active', ?, ?, ?)
            "#,
        )
        .bind(follower_user_id)
        .bind(master_id)
        .bind(config.copy_mode.kind())
        .bind(config.copy_mode.param().map(|p| p.to_string()))
        .bind(config.limits.max_daily_loss_pct.to_string())
        .bind(config.limits.max_drawdown_pct.to_string())
        .bind(config.limits.max_lot_size.to_string())
        .bind(config.limits.stop_copy_on_drawdown as i64)
        .bind(now.date_naive().format("%Y-%m-%d").to_string())
        .bind(to_cents(equity))
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                RegistryError::AlreadyFollowing {
                    master_id: master_id.to_string(),
                }
            }
            _ => RegistryError::Db(e),
        })?;

        self.adjust_active_followers(master_id, 1).await.ok();

        let follow_id = result.last_insert_rowid();
        info!(
            follower = %follower_user_id,
            master = %master_id,
            follow_id,
            mode = config.copy_mode.kind(),
            "Follow created"
        );

        self.get_follow(follow_id)
            .await?
            .ok_or(RegistryError::NotFound { follow_id })
    }

    /// Fetch one follow relationship.
    pub async fn get_follow(&self, follow_id: i64) -> Result<Option<FollowRelationship>, RegistryError> {
        let row = sqlx::query_as::<_, FollowRow>("SELECT * FROM follows WHERE id = ?")
            .bind(follow_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(FollowRelationship::from))
    }

    /// All active follows for a master, for fan-out.
    pub async fn list_active_followers(
        &self,
        master_id: &str,
    ) -> Result<Vec<FollowRelationship>, RegistryError> {
        let rows = sqlx::query_as::<_, FollowRow>(
            "SELECT * FROM follows WHERE master_id = ? AND status = 'active' ORDER BY id",
        )
        .bind(master_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(FollowRelationship::from).collect())
    }

    /// All follows (any status) for one follower, newest first.
    pub async fn list_follows_for_user(
        &self,
        follower_user_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<FollowRelationship>, RegistryError> {
        let rows = sqlx::query_as::<_, FollowRow>(
            "SELECT * FROM follows WHERE follower_user_id = ? ORDER BY created_at DESC LIMIT ? OFFSET ?",
        )
        .bind(follower_user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(FollowRelationship::from).collect())
    }

    /// Pause an active follow.
    pub async fn pause_follow(&self, follow_id: i64) -> Result<(), RegistryError> {
        let result = sqlx::query("UPDATE follows SET status = 'paused' WHERE id = ? AND status = 'active'")
            .bind(follow_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return match self.get_follow(follow_id).await? {
                Some(f) if f.status == FollowStatus::Paused => Ok(()),
                Some(_) => Err(RegistryError::NotActive { follow_id }),
                None => Err(RegistryError::NotFound { follow_id }),
            };
        }

        info!(follow_id, "Follow paused");
        Ok(())
    }

    /// Resume a paused follow.
    pub async fn resume_follow(&self, follow_id: i64) -> Result<(), RegistryError> {
        let result = sqlx::query("UPDATE follows SET status = 'active' WHERE id = ? AND status = 'paused'")
            .bind(follow_id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return match self.get_follow(follow_id).await? {
                Some(f) if f.status == FollowStatus::Active => Ok(()),
                Some(_) => Err(RegistryError::NotActive { follow_id }),
                None => Err(RegistryError::NotFound { follow_id }),
            };
        }

        info!(follow_id, "Follow resumed");
        Ok(())
    }

    /// Stop a follow. Terminal and idempotent: stopping a stopped follow is
    /// a no-op success. The row is retained for audit.
    pub async fn stop_follow(&self, follow_id: i64) -> Result<(), RegistryError> {
        let follow = self
            .get_follow(follow_id)
            .await?
            .ok_or(RegistryError::NotFound { follow_id })?;

        let result = sqlx::query("UPDATE follows SET status = 'stopped' WHERE id = ? AND status != 'stopped'")
            .bind(follow_id)
            .execute(&self.pool)
            .await?;

        // Only the transition that actually flipped decrements the count
        if result.rows_affected() > 0 {
            self.adjust_active_followers(&follow.master_id, -1).await.ok();
            info!(follow_id, master = %follow.master_id, "Follow stopped");
        }

        Ok(())
    }

    /// Fold one copy result into the follow's running stats.
    ///
    /// A single UPDATE so concurrent settlements for different followers of
    /// the same master never serialize on anything wider than the row:
    /// total/daily P&L increment, day-boundary reset, peak-equity watermark,
    /// and the copied-trade counter all move together.
    pub async fn record_copy_result(
        &self,
        follow_id: i64,
        pnl_delta: Decimal,
        trade_copied: bool,
        equity_after: Decimal,
    ) -> Result<(), RegistryError> {
        let today = Utc::now().date_naive().format("%Y-%m-%d").to_string();

        let result = sqlx::query(
            r#"
            UPDATE follows SET
                total_pnl_cents = total_pnl_cents + ?1,
                daily_pnl_cents = CASE WHEN daily_date = ?2 THEN daily_pnl_cents + ?1 ELSE ?1 END,
                daily_date = ?2,
                peak_equity_cents = MAX(peak_equity_cents, ?3),
                total_copied_trades = total_copied_trades + ?4
            WHERE id = ?5
            "#,
        )
        .bind(to_cents(pnl_delta))
        .bind(today)
        .bind(to_cents(equity_after))
        .bind(trade_copied as i64)
        .bind(follow_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RegistryError::NotFound { follow_id });
        }

        Ok(())
    }

    // ==================== Copied positions ====================

    /// Record a submitted follower order mirroring a master trade.
    pub async fn open_copied_position(
        &self,
        follow_id: i64,
        master_id: &str,
        master_trade_id: &str,
        order_id: &str,
        symbol: &str,
        side: &str,
        copied_lot: Decimal,
        master_lot: Decimal,
    ) -> Result<(), RegistryError> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO copied_positions (
                follow_id, master_id, master_trade_id, order_id,
                symbol, side, copied_lot, master_lot, status, opened_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'open', ?)
            "#,
        )
        .bind(follow_id)
        .bind(master_id)
        .bind(master_trade_id)
        .bind(order_id)
        .bind(symbol)
        .bind(side)
        .bind(copied_lot.to_string())
        .bind(master_lot.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Open copied positions mirroring one master trade.
    pub async fn list_open_copies(
        &self,
        master_id: &str,
        master_trade_id: &str,
    ) -> Result<Vec<CopiedPosition>, RegistryError> {
        let rows = sqlx::query_as::<_, CopiedPosition>(
            r#"
            SELECT * FROM copied_positions
            WHERE master_id = ? AND master_trade_id = ? AND status = 'open'
            ORDER BY id
            "#,
        )
        .bind(master_id)
        .bind(master_trade_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Mark a copied position closed. Idempotent.
    pub async fn close_copied_position(&self, position_id: i64) -> Result<(), RegistryError> {
        sqlx::query(
            "UPDATE copied_positions SET status = 'closed', closed_at = ? WHERE id = ? AND status = 'open'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(position_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
