//! Copy-trade replication engine
//!
//! Mirrors approved masters' trades onto follower accounts with per-follow
//! position sizing and risk limits, and settles master commission into an
//! append-only ledger.

mod api;
mod config;
mod db;
mod engine;
mod error;
mod models;
mod risk;
mod wallet;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tokio::time::interval;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::api::{HttpOrderGateway, HttpWalletClient, TradeFeedClient};
use crate::config::EngineConfig;
use crate::db::{Database, FollowConfig};
use crate::engine::{EventRouter, Replicator};
use crate::models::{CommissionModel, CopyMode, MasterStatus, RiskLevel, RiskLimits};
use crate::wallet::WithdrawalCoordinator;

/// Copy-trade replication engine CLI.
#[derive(Parser)]
#[command(name = "tradecopy")]
#[command(about = "Replicate master trades onto follower accounts", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(short, long, default_value = "sqlite:./tradecopy.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the replication engine
    Run {
        /// Trade feed polling interval in seconds
        #[arg(short, long, default_value = "5")]
        interval: u64,
    },

    /// Register a master profile (starts pending approval)
    Register {
        /// Master identifier
        id: String,

        /// Display name shown to followers
        #[arg(short, long)]
        name: String,

        /// Strategy tag, e.g. "scalping"
        #[arg(short, long, default_value = "")]
        strategy: String,

        /// Advertised risk level (low, medium, high)
        #[arg(short, long, default_value = "medium")]
        risk: String,

        /// Commission model (profit_share, per_lot, subscription)
        #[arg(short, long, default_value = "profit_share")]
        commission: String,

        /// Commission value: percent, per-lot rate, or periodic fee
        #[arg(short = 'v', long, default_value = "20")]
        value: Decimal,

        /// Master account equity
        #[arg(short, long, default_value = "0")]
        equity: Decimal,
    },

    /// Approve a pending master
    Approve { id: String },

    /// Suspend a master (events refused, commission held pending)
    Suspend { id: String },

    /// Reactivate a suspended master and release held commission
    Reactivate { id: String },

    /// List master profiles
    Masters {
        /// Filter by status (pending, approved, suspended, rejected)
        #[arg(short, long)]
        status: Option<String>,
    },

    /// Create a follow relationship
    Follow {
        /// Follower user id
        follower: String,

        /// Master id to copy
        master: String,

        /// Sizing mode (fixed_lot, multiplier, balance_ratio)
        #[arg(short, long, default_value = "balance_ratio")]
        mode: String,

        /// Mode parameter: lot size or multiplier
        #[arg(short, long)]
        param: Option<Decimal>,

        /// Max daily loss as percent of equity
        #[arg(long, default_value = "10")]
        max_daily_loss: Decimal,

        /// Max drawdown from peak equity as percent
        #[arg(long, default_value = "25")]
        max_drawdown: Decimal,

        /// Hard cap on copied lot size
        #[arg(long, default_value = "1")]
        max_lot: Decimal,

        /// Auto-pause the follow when a loss limit trips
        #[arg(long)]
        stop_on_drawdown: bool,
    },

    /// Pause a follow (skip new copies, keep open positions)
    Pause { follow_id: i64 },

    /// Resume a paused follow
    Resume { follow_id: i64 },

    /// Stop a follow permanently
    Stop { follow_id: i64 },

    /// List a user's follow relationships
    Follows { follower: String },

    /// Show a master's commission ledger and balance
    Ledger {
        master: String,

        #[arg(short, long, default_value = "50")]
        limit: i64,
    },

    /// Request a commission withdrawal for a master
    Withdraw { master: String, amount: Decimal },

    /// List withdrawal requests
    Withdrawals {
        #[arg(short, long, default_value = "50")]
        limit: i64,
    },

    /// Approve a pending withdrawal (credits the master's wallet)
    Payout { request_id: String },

    /// Reject a pending withdrawal
    Reject { request_id: String },

    /// Show dead-lettered work awaiting reconciliation
    DeadLetters {
        #[arg(short, long, default_value = "50")]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let db = Database::new(&cli.database).await?;
    let config = EngineConfig::default();

    match cli.command {
        Commands::Run { interval: secs } => {
            run_engine(db, config, secs).await?;
        }

        Commands::Register {
            id,
            name,
            strategy,
            risk,
            commission,
            value,
            equity,
        } => {
            let master = db
                .create_master(
                    &id,
                    &name,
                    &strategy,
                    RiskLevel::parse(&risk),
                    CommissionModel::from_parts(&commission, value),
                    equity,
                )
                .await?;
            println!(
                "Registered master {} ({}) - pending approval",
                master.id, master.display_name
            );
        }

        Commands::Approve { id } => {
            db.set_master_status(&id, MasterStatus::Approved).await?;
            println!("Approved master {}", id);
        }

        Commands::Suspend { id } => {
            let wallet = Arc::new(HttpWalletClient::from_env()?);
            let coordinator = WithdrawalCoordinator::new(config, db, wallet);
            coordinator.suspend_master(&id).await?;
            println!("Suspended master {}", id);
        }

        Commands::Reactivate { id } => {
            let wallet = Arc::new(HttpWalletClient::from_env()?);
            let coordinator = WithdrawalCoordinator::new(config, db, wallet);
            let released = coordinator.reactivate_master(&id).await?;
            println!("Reactivated master {} ({} ledger entries released)", id, released);
        }

        Commands::Masters { status } => {
            let filter = status.as_deref().map(MasterStatus::parse);
            let masters = db.list_masters(filter, 200, 0).await?;

            println!(
                "\n{:<16} {:<20} {:<10} {:<12} {:>9} {:>7} {:>8}",
                "ID", "NAME", "STATUS", "COMMISSION", "FOLLOWERS", "WIN%", "30D%"
            );
            println!("{}", "-".repeat(88));
            for m in masters {
                println!(
                    "{:<16} {:<20} {:<10} {:<12} {:>9} {:>6.1}% {:>7.1}%",
                    truncate(&m.id, 16),
                    truncate(&m.display_name, 20),
                    m.status.as_str(),
                    m.commission.kind(),
                    m.active_followers,
                    m.win_rate * 100.0,
                    m.profit_30d_pct
                );
            }
        }

        Commands::Follow {
            follower,
            master,
            mode,
            param,
            max_daily_loss,
            max_drawdown,
            max_lot,
            stop_on_drawdown,
        } => {
            let follow = db
                .create_follow(
                    &follower,
                    &master,
                    FollowConfig {
                        copy_mode: CopyMode::from_parts(&mode, param),
                        limits: RiskLimits {
                            max_daily_loss_pct: max_daily_loss,
                            max_drawdown_pct: max_drawdown,
                            max_lot_size: max_lot,
                            stop_copy_on_drawdown: stop_on_drawdown,
                        },
                    },
                    config.min_follow_equity,
                )
                .await?;
            println!(
                "Follow {} created: {} copying {} ({})",
                follow.id, follower, master, follow.copy_mode.kind()
            );
        }

        Commands::Pause { follow_id } => {
            db.pause_follow(follow_id).await?;
            println!("Paused follow {}", follow_id);
        }

        Commands::Resume { follow_id } => {
            db.resume_follow(follow_id).await?;
            println!("Resumed follow {}", follow_id);
        }

        Commands::Stop { follow_id } => {
            db.stop_follow(follow_id).await?;
            println!("Stopped follow {}", follow_id);
        }

        Commands::Follows { follower } => {
            let follows = db.list_follows_for_user(&follower, 200, 0).await?;

            println!(
                "\n{:>6} {:<16} {:<14} {:<8} {:>7} {:>12} {:>12}",
                "ID", "MASTER", "MODE", "STATUS", "TRADES", "TOTAL P&L", "DAILY P&L"
            );
            println!("{}", "-".repeat(82));
            for f in follows {
                println!(
                    "{:>6} {:<16} {:<14} {:<8} {:>7} {:>12} {:>12}",
                    f.id,
                    truncate(&f.master_id, 16),
                    f.copy_mode.kind(),
                    f.status.as_str(),
                    f.total_copied_trades,
                    format!("${}", f.total_pnl),
                    format!("${}", f.daily_pnl)
                );
            }
        }

        Commands::Ledger { master, limit } => {
            let entries = db.list_ledger_entries(&master, limit, 0).await?;
            let balance = db.available_commission(&master).await?;

            println!("\n{:>6} {:<14} {:<18} {:<8} {:>12} {:>12}", "ID", "SOURCE", "FOLLOWER", "STATUS", "TRADE P&L", "COMMISSION");
            println!("{}", "-".repeat(76));
            for e in entries {
                println!(
                    "{:>6} {:<14} {:<18} {:<8} {:>12} {:>12}",
                    e.id,
                    e.source.as_str(),
                    truncate(e.follower_user_id.as_deref().unwrap_or("-"), 18),
                    e.status.as_str(),
                    format!("${}", e.trade_pnl),
                    format!("${}", e.commission_amount)
                );
            }
            println!("\nAvailable balance: ${}", balance);
        }

        Commands::Withdraw { master, amount } => {
            let wallet = Arc::new(HttpWalletClient::from_env()?);
            let coordinator = WithdrawalCoordinator::new(config, db, wallet);
            let request = coordinator.request_withdrawal(&master, amount).await?;
            println!("Withdrawal {} pending: ${} for {}", request.id, request.amount, master);
        }

        Commands::Withdrawals { limit } => {
            let requests = db.list_withdrawals(limit, 0).await?;

            println!("\n{:<38} {:<16} {:<10} {:>12}", "REQUEST", "MASTER", "STATUS", "AMOUNT");
            println!("{}", "-".repeat(80));
            for r in requests {
                println!(
                    "{:<38} {:<16} {:<10} {:>12}",
                    r.id,
                    truncate(&r.master_id, 16),
                    r.status.as_str(),
                    format!("${}", r.amount)
                );
            }
        }

        Commands::Payout { request_id } => {
            let wallet = Arc::new(HttpWalletClient::from_env()?);
            let coordinator = WithdrawalCoordinator::new(config, db, wallet);
            let request = coordinator.approve_withdrawal(&request_id).await?;
            println!(
                "Withdrawal {} {}: ${} to {}",
                request.id,
                request.status.as_str(),
                request.amount,
                request.master_id
            );
        }

        Commands::Reject { request_id } => {
            let wallet = Arc::new(HttpWalletClient::from_env()?);
            let coordinator = WithdrawalCoordinator::new(config, db, wallet);
            let request = coordinator.reject_withdrawal(&request_id).await?;
            println!("Withdrawal {} rejected; reservation released", request.id);
        }

        Commands::DeadLetters { limit } => {
            let letters = db.list_dead_letters(limit).await?;

            if letters.is_empty() {
                println!("No dead letters.");
                return Ok(());
            }
            for l in letters {
                println!("[{}] #{} {} ({} attempts)", l.created_at, l.id, l.kind, l.attempts);
                println!("  error:   {}", l.error);
                println!("  payload: {}", l.payload);
            }
        }
    }

    Ok(())
}

/// Poll the trade feed and route events to per-master workers until Ctrl+C.
async fn run_engine(db: Database, config: EngineConfig, poll_secs: u64) -> Result<()> {
    let feed = TradeFeedClient::from_env()?;
    let orders = Arc::new(HttpOrderGateway::from_env()?);
    let wallet = Arc::new(HttpWalletClient::from_env()?);

    let replicator = Arc::new(Replicator::new(config.clone(), db.clone(), orders));
    let router = EventRouter::new(replicator);
    let coordinator = WithdrawalCoordinator::new(config.clone(), db, wallet);

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        });
    }

    info!(poll_secs, "Replication engine started");
    println!("Replication engine running. Press Ctrl+C to stop.");

    let mut poll = interval(Duration::from_secs(poll_secs.max(1)));
    // Subscription accrual is cheap and idempotent within a period, so an
    // hourly sweep is plenty.
    let mut accrual = interval(Duration::from_secs(3600));

    while !shutdown.load(Ordering::SeqCst) {
        tokio::select! {
            _ = poll.tick() => {
                match feed.poll_new_events().await {
                    Ok(events) => {
                        for event in events {
                            if let Err(e) = router.dispatch(event).await {
                                error!(error = %e, "Failed to dispatch event");
                            }
                        }
                    }
                    Err(e) => error!(error = %e, "Trade feed poll failed"),
                }
            }
            _ = accrual.tick() => {
                if let Err(e) = coordinator.accrue_subscriptions().await {
                    error!(error = %e, "Subscription accrual failed");
                }
            }
        }
    }

    // Queued events drain with their workers when the router drops
    info!("Replication engine stopped");
    Ok(())
}

/// Truncate a string with ellipsis if too long. Counts chars, not bytes,
/// so multibyte display names never split mid-character.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::truncate;

    #[test]
    fn truncate_is_char_boundary_safe() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghij", 8), "abcde...");
        // Multibyte names must not panic or split a character
        assert_eq!(truncate("Müller-Lüdenscheidt", 10), "Müller-...");
        assert_eq!(truncate("株式会社トレード", 6), "株式会...");
    }
}
