//! SQLite persistence for the replication engine.
//!
//! Owns the durable state the engine needs:
//! - Master profiles (commission model, status, aggregate stats)
//! - Follow relationships with sizing/risk config and running stats
//! - Copied positions linking follower orders to master trades
//! - The append-only commission ledger and withdrawal requests
//! - Dead letters for work that exhausted its retries
//!
//! Monetary amounts are stored as INTEGER cents so that SQL-side arithmetic
//! (stat increments, balance sums) stays exact; lot sizes and percent knobs
//! carry no SQL arithmetic and are stored as TEXT decimals.

mod follows;
mod ledger;
mod masters;

pub use follows::{CopiedPosition, FollowConfig};

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

/// Convert a decimal amount to integer cents, rounding half away from zero.
pub fn to_cents(amount: Decimal) -> i64 {
    (amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero) * Decimal::ONE_HUNDRED)
        .to_i64()
        .unwrap_or(0)
}

/// Convert integer cents back to a decimal amount.
pub fn from_cents(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

pub(crate) fn parse_decimal(s: &str) -> Decimal {
    s.parse().unwrap_or(Decimal::ZERO)
}

pub(crate) fn parse_timestamp(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn parse_date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap_or_else(|_| Utc::now().date_naive())
}

/// Database connection pool with engine state management.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// Dead-lettered unit of work awaiting manual reconciliation.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DeadLetter {
    pub id: i64,
    pub kind: String,
    pub payload: String,
    pub error: String,
    pub attempts: i64,
    pub created_at: String,
}

impl Database {
    /// Create a new database connection and run migrations.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// In-memory database for tests. A single connection so every handle
    /// sees the same memory database.
    #[cfg(test)]
    pub async fn new_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        // Master profiles. Never hard-deleted; the ledger references them.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS masters (
                id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                strategy_tag TEXT NOT NULL DEFAULT '',
                risk_level TEXT NOT NULL DEFAULT 'medium',
                commission_kind TEXT NOT NULL DEFAULT 'profit_share',
                commission_value TEXT NOT NULL DEFAULT '0',
                status TEXT NOT NULL DEFAULT 'pending',
                equity_cents INTEGER NOT NULL DEFAULT 0,
                active_followers INTEGER NOT NULL DEFAULT 0,
                win_rate REAL NOT NULL DEFAULT 0,
                profit_30d_pct REAL NOT NULL DEFAULT 0,
                total_trades INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Follow relationships with running stats
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS follows (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                follower_user_id TEXT NOT NULL,
                master_id TEXT NOT NULL,
                copy_mode TEXT NOT NULL,
                copy_param TEXT,
                max_daily_loss_pct TEXT NOT NULL,
                max_drawdown_pct TEXT NOT NULL,
                max_lot_size TEXT NOT NULL,
                stop_copy_on_drawdown INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'active',
                total_copied_trades INTEGER NOT NULL DEFAULT 0,
                total_pnl_cents INTEGER NOT NULL DEFAULT 0,
                daily_pnl_cents INTEGER NOT NULL DEFAULT 0,
                daily_date TEXT NOT NULL,
                peak_equity_cents INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                FOREIGN KEY (master_id) REFERENCES masters(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // At most one non-stopped follow per (follower, master). The partial
        // unique index makes racing create_follow calls fail closed instead
        // of inserting duplicates.
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_follows_live_unique
            ON follows(follower_user_id, master_id)
            WHERE status != 'stopped'
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Follower account snapshots (equity feeds sizing and risk checks)
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS follower_accounts (
                user_id TEXT PRIMARY KEY,
                account_id TEXT NOT NULL,
                equity_cents INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Copied positions: a follower's order mirroring one master trade
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS copied_positions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                follow_id INTEGER NOT NULL,
                master_id TEXT NOT NULL,
                master_trade_id TEXT NOT NULL,
                order_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                copied_lot TEXT NOT NULL,
                master_lot TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'open',
                opened_at TEXT NOT NULL,
                closed_at TEXT,
                UNIQUE(follow_id, master_trade_id),
                FOREIGN KEY (follow_id) REFERENCES follows(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Commission ledger: append-only, only the status ever flips
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_entries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                master_id TEXT NOT NULL,
                follower_user_id TEXT,
                source TEXT NOT NULL DEFAULT 'trade',
                trade_pnl_cents INTEGER NOT NULL DEFAULT 0,
                commission_cents INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                FOREIGN KEY (master_id) REFERENCES masters(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Withdrawal requests
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS withdrawals (
                id TEXT PRIMARY KEY,
                master_id TEXT NOT NULL,
                amount_cents INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                FOREIGN KEY (master_id) REFERENCES masters(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Processed event ids (dedupe against feed replays)
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS seen_events (
                event_id TEXT PRIMARY KEY,
                master_id TEXT NOT NULL,
                seen_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Dead letters for exhausted retries
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS dead_letters (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                error TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Indexes
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_follows_master ON follows(master_id, status)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_positions_trade ON copied_positions(master_id, master_trade_id, status)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_ledger_master ON ledger_entries(master_id, status)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_withdrawals_master ON withdrawals(master_id, status)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ==================== Follower accounts ====================

    /// Save or refresh a follower account snapshot.
    pub async fn upsert_follower_account(
        &self,
        user_id: &str,
        account_id: &str,
        equity: Decimal,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO follower_accounts (user_id, account_id, equity_cents, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                account_id = excluded.account_id,
                equity_cents = excluded.equity_cents,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(account_id)
        .bind(to_cents(equity))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Get a follower's trading account id and current equity.
    pub async fn get_follower_account(&self, user_id: &str) -> Result<Option<(String, Decimal)>> {
        let row: Option<(String, i64)> =
            sqlx::query_as("SELECT account_id, equity_cents FROM follower_accounts WHERE user_id = ?")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(account_id, cents)| (account_id, from_cents(cents))))
    }

    // ==================== Event dedupe ====================

    /// Returns true the first time an event id is seen.
    pub async fn mark_event_seen(&self, event_id: &str, master_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO seen_events (event_id, master_id, seen_at) VALUES (?, ?, ?)",
        )
        .bind(event_id)
        .bind(master_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Whether an event id has already been fully processed.
    pub async fn is_event_seen(&self, event_id: &str) -> Result<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM seen_events WHERE event_id = ?")
                .bind(event_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.is_some())
    }

    // ==================== Dead letters ====================

    /// Record work that exhausted its retries; never silently dropped.
    pub async fn dead_letter(
        &self,
        kind: &str,
        payload: &serde_json::Value,
        error: &str,
        attempts: u32,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO dead_letters (kind, payload, error, attempts, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(kind)
        .bind(payload.to_string())
        .bind(error)
        .bind(attempts as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// List dead letters for reconciliation.
    pub async fn list_dead_letters(&self, limit: i64) -> Result<Vec<DeadLetter>> {
        sqlx::query_as::<_, DeadLetter>(
            "SELECT * FROM dead_letters ORDER BY created_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch dead letters")
    }

    /// Get the connection pool (for advanced queries).
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
