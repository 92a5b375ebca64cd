//! Per-event replication: fan-out of master trades to followers, and
//! settlement of follower P&L and master commission on close.
//!
//! Each event moves Received -> Fanned-Out, and close events additionally
//! -> Settled. A failure replicating to one follower is caught at the
//! follower boundary: it is logged and dead-lettered, never propagated to
//! sibling followers or back to the master's event stream.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use backoff::ExponentialBackoff;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use rust_decimal::{Decimal, RoundingStrategy};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::api::{FollowerOrder, OrderSubmitter};
use crate::config::EngineConfig;
use crate::db::Database;
use crate::error::ReplicationError;
use crate::models::{
    CommissionModel, CommissionSource, FollowRelationship, MasterProfile, MasterTradeEvent,
    TradeEventKind,
};
use crate::risk::{self, Decision, FollowerAccountState, LotConstraints};

/// Per-event fan-out summary. Rejections are skipped copies, not errors.
#[derive(Debug, Clone, Default)]
pub struct FanoutReport {
    pub admitted: usize,
    pub skipped: usize,
    pub failed: usize,
}

enum CopyOutcome {
    Copied,
    Skipped,
    Failed,
}

/// Commission owed to the master for one settled follower copy.
///
/// Never negative: a losing profit-share trade earns zero, and per-lot
/// commission is lot x rate with both factors non-negative. Subscription
/// masters accrue on a schedule, not per trade.
pub fn commission_for(
    model: &CommissionModel,
    follower_pnl: Decimal,
    copied_lot: Decimal,
) -> Option<Decimal> {
    let amount = match model {
        CommissionModel::ProfitShare(pct) => {
            follower_pnl.max(Decimal::ZERO) * pct / Decimal::ONE_HUNDRED
        }
        CommissionModel::PerLot(rate) => copied_lot * rate,
        CommissionModel::Subscription(_) => return None,
    };

    Some(amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
}

/// Bounded retry with exponential backoff; the final error is returned to
/// the caller for dead-lettering.
async fn retry_async<T, Fut, F>(initial: Duration, max_attempts: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = AtomicU32::new(0);
    let policy = ExponentialBackoff {
        initial_interval: initial,
        max_interval: Duration::from_secs(10),
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
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

/// Processes one master trade event at a time (the router guarantees
/// per-master ordering; instances for different masters run in parallel).
pub struct Replicator {
    config: EngineConfig,
    db: Database,
    orders: Arc<dyn OrderSubmitter>,
}

impl Replicator {
    pub fn new(config: EngineConfig, db: Database, orders: Arc<dyn OrderSubmitter>) -> Self {
        Self { config, db, orders }
    }

    /// Handle one event end-to-end. Returns the fan-out summary; errors here
    /// are infrastructure failures, never individual follower outcomes.
    pub async fn handle_event(&self, event: &MasterTradeEvent) -> Result<FanoutReport> {
        // Dedupe against feed replays. Per-master ordering means a single
        // worker handles this master's events, so check-then-mark has no
        // racing writer.
        if self.db.is_event_seen(&event.event_id).await? {
            debug!(event = %event.event_id, "Event already processed, skipping");
            return Ok(FanoutReport::default());
        }

        let master = self
            .db
            .get_master(&event.master_id)
            .await?
            .ok_or_else(|| anyhow!("unknown master {}", event.master_id))?;

        // A suspended master's in-flight fan-out completes, but no new
        // events are accepted until reactivation. The refused event is NOT
        // consumed: it stays replayable and is dead-lettered so a close
        // arriving mid-suspension can still flatten followers later.
        if !master.is_accepting_events() {
            warn!(master = %master.id, event = %event.event_id, "Master not approved; event refused");
            self.db
                .dead_letter(
                    "refused_event",
                    &json!({ "event": event }),
                    "master not accepting events",
                    0,
                )
                .await
                .ok();
            return Ok(FanoutReport::default());
        }

        let report = match event.kind {
            TradeEventKind::Open => self.fan_out_open(&master, event).await?,
            TradeEventKind::Modify => self.fan_out_modify(&master, event).await?,
            TradeEventKind::Close => self.settle_close(&master, event).await?,
        };

        // Marked only after handling succeeds; an infrastructure failure
        // leaves the event unconsumed for the next replay.
        self.db
            .mark_event_seen(&event.event_id, &event.master_id)
            .await?;

        Ok(report)
    }

    /// Fan an open event out to every active follower with bounded
    /// parallelism, protecting the order gateway from burst load.
    async fn fan_out_open(
        &self,
        master: &MasterProfile,
        event: &MasterTradeEvent,
    ) -> Result<FanoutReport> {
        let follows = self.db.list_active_followers(&master.id).await?;
        debug!(master = %master.id, followers = follows.len(), "Fanning out open event");

        let copy_futs: Vec<_> = follows
            .iter()
            .map(|follow| self.copy_open(master, event, follow))
            .collect();
        let outcomes: Vec<CopyOutcome> = stream::iter(copy_futs)
            .buffer_unordered(self.config.fanout_workers.max(1))
            .collect()
            .await;

        let report = summarize(&outcomes);
        info!(
            master = %master.id,
            event = %event.event_id,
            admitted = report.admitted,
            skipped = report.skipped,
            failed = report.failed,
            "Open event fanned out"
        );
        Ok(report)
    }

    /// Copy one open to one follower. All failure paths are contained here.
    async fn copy_open(
        &self,
        master: &MasterProfile,
        event: &MasterTradeEvent,
        follow: &FollowRelationship,
    ) -> CopyOutcome {
        let details = &event.details;

        let Ok(Some((account_id, equity))) =
            self.db.get_follower_account(&follow.follower_user_id).await
        else {
            warn!(follow = follow.id, follower = %follow.follower_user_id, "No account snapshot; copy skipped");
            return CopyOutcome::Skipped;
        };

        let decision = risk::evaluate(
            follow,
            details.lot_size,
            master.equity,
            FollowerAccountState { equity },
            LotConstraints {
                broker_min_lot: self.config.broker_min_lot,
                lot_step: self.config.lot_step,
            },
            Utc::now().date_naive(),
        );

        let lot = match decision {
            Decision::Admit { lot } => lot,
            Decision::Reject { reason, pause } => {
                // A rejection is a first-class outcome: the follower sees a
                // soft notification, the master sees nothing.
                info!(
                    follow = follow.id,
                    follower = %follow.follower_user_id,
                    reason = reason.as_str(),
                    "Copy skipped"
                );
                if pause {
                    if let Err(e) = self.db.pause_follow(follow.id).await {
                        error!(follow = follow.id, error = %e, "Failed to auto-pause follow");
                    } else {
                        warn!(follow = follow.id, reason = reason.as_str(), "Follow auto-paused");
                    }
                }
                return CopyOutcome::Skipped;
            }
        };

        let order = FollowerOrder {
            follower_account_id: account_id,
            symbol: details.symbol.clone(),
            side: details.side,
            lot_size: lot,
            source_trade_id: details.trade_id.clone(),
        };

        let submitted = retry_async(
            Duration::from_millis(self.config.retry_initial_backoff_ms),
            self.config.order_retry_attempts,
            || async { self.orders.submit_follower_order(&order).await },
        )
        .await;

        match submitted {
            Ok(order_id) => {
                if let Err(e) = self
                    .db
                    .open_copied_position(
                        follow.id,
                        &master.id,
                        &details.trade_id,
                        &order_id,
                        &details.symbol,
                        details.side.as_str(),
                        lot,
                        details.lot_size,
                    )
                    .await
                {
                    error!(follow = follow.id, error = %e, "Order placed but position record failed");
                    self.dead_letter_copy(follow, event, &e.to_string()).await;
                    return CopyOutcome::Failed;
                }
                debug!(follow = follow.id, order = %order_id, lot = %lot, "Follower order submitted");
                CopyOutcome::Copied
            }
            Err(e) => {
                let err = ReplicationError::OrderSubmission {
                    follower: follow.follower_user_id.clone(),
                    source: e,
                };
                error!(follow = follow.id, error = %err, "Follower order failed after retries");
                self.dead_letter_copy(follow, event, &err.to_string()).await;
                CopyOutcome::Failed
            }
        }
    }

    /// Forward an SL/TP amendment to every copied position of the trade.
    async fn fan_out_modify(
        &self,
        master: &MasterProfile,
        event: &MasterTradeEvent,
    ) -> Result<FanoutReport> {
        let details = &event.details;
        let copies = self
            .db
            .list_open_copies(&master.id, &details.trade_id)
            .await?;

        let modify_futs: Vec<_> = copies
            .iter()
            .map(|copy| self.modify_copy(event, copy))
            .collect();
        let outcomes: Vec<CopyOutcome> = stream::iter(modify_futs)
            .buffer_unordered(self.config.fanout_workers.max(1))
            .collect()
            .await;

        let report = summarize(&outcomes);
        info!(
            master = %master.id,
            trade = %details.trade_id,
            amended = report.admitted,
            failed = report.failed,
            "Modify event forwarded"
        );
        Ok(report)
    }

    /// Forward one SL/TP amendment to one copied position.
    async fn modify_copy(&self, event: &MasterTradeEvent, copy: &crate::db::CopiedPosition) -> CopyOutcome {
        let details = &event.details;

        let Ok(Some(follow)) = self.db.get_follow(copy.follow_id).await else {
            error!(follow = copy.follow_id, "Copied position references missing follow");
            return CopyOutcome::Failed;
        };
        let Ok(Some((account_id, _))) =
            self.db.get_follower_account(&follow.follower_user_id).await
        else {
            error!(follow = copy.follow_id, "Missing account snapshot at amendment");
            return CopyOutcome::Failed;
        };

        let amended = retry_async(
            Duration::from_millis(self.config.retry_initial_backoff_ms),
            self.config.order_retry_attempts,
            || async {
                self.orders
                    .amend_follower_order(
                        &account_id,
                        &copy.order_id,
                        details.stop_loss,
                        details.take_profit,
                    )
                    .await
            },
        )
        .await;

        match amended {
            Ok(()) => CopyOutcome::Copied,
            Err(e) => {
                error!(follow = copy.follow_id, order = %copy.order_id, error = %e, "Amendment failed after retries");
                self.dead_letter_copy(&follow, event, &e.to_string()).await;
                CopyOutcome::Failed
            }
        }
    }

    /// Settle a close event: close each copy, attribute follower P&L, update
    /// registry stats, and write the master's commission.
    async fn settle_close(
        &self,
        master: &MasterProfile,
        event: &MasterTradeEvent,
    ) -> Result<FanoutReport> {
        let details = &event.details;
        let copies = self
            .db
            .list_open_copies(&master.id, &details.trade_id)
            .await?;
        let master_profit = event.settled_profit();

        let settle_futs: Vec<_> = copies
            .iter()
            .map(|copy| self.settle_copy(master, event, copy, master_profit))
            .collect();
        let outcomes: Vec<CopyOutcome> = stream::iter(settle_futs)
            .buffer_unordered(self.config.fanout_workers.max(1))
            .collect()
            .await;

        if !copies.is_empty() {
            self.db
                .record_master_trade_settled(&master.id, master_profit > Decimal::ZERO)
                .await?;
        }

        let report = summarize(&outcomes);
        info!(
            master = %master.id,
            trade = %details.trade_id,
            settled = report.admitted,
            failed = report.failed,
            profit = %master_profit,
            "Close event settled"
        );
        Ok(report)
    }

    async fn settle_copy(
        &self,
        master: &MasterProfile,
        event: &MasterTradeEvent,
        copy: &crate::db::CopiedPosition,
        master_profit: Decimal,
    ) -> CopyOutcome {
        let details = &event.details;

        let Ok(Some(follow)) = self.db.get_follow(copy.follow_id).await else {
            error!(follow = copy.follow_id, "Copied position references missing follow");
            return CopyOutcome::Failed;
        };
        let Ok(Some((account_id, equity))) =
            self.db.get_follower_account(&follow.follower_user_id).await
        else {
            error!(follow = copy.follow_id, "Missing account snapshot at settlement");
            return CopyOutcome::Failed;
        };

        // Close the follower's order first; without it the follower would
        // stay exposed after the master is flat.
        let closed = retry_async(
            Duration::from_millis(self.config.retry_initial_backoff_ms),
            self.config.order_retry_attempts,
            || async {
                self.orders
                    .close_follower_order(&account_id, &copy.order_id)
                    .await
            },
        )
        .await;
        if let Err(e) = closed {
            error!(follow = copy.follow_id, order = %copy.order_id, error = %e, "Close failed after retries");
            self.dead_letter_copy(&follow, event, &e.to_string()).await;
            return CopyOutcome::Failed;
        }

        // Follower P&L scaled from the master's settled profit by lot ratio
        let copied_lot = copy.copied_lot_decimal();
        let master_lot = copy.master_lot_decimal();
        let follower_pnl = if master_lot > Decimal::ZERO {
            (master_profit * copied_lot / master_lot)
                .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
        } else {
            Decimal::ZERO
        };
        let equity_after = equity + follower_pnl;

        if let Err(e) = self
            .db
            .record_copy_result(follow.id, follower_pnl, true, equity_after)
            .await
        {
            error!(follow = follow.id, error = %e, "Failed to record copy result");
            self.dead_letter_copy(&follow, event, &e.to_string()).await;
            return CopyOutcome::Failed;
        }
        self.db
            .upsert_follower_account(&follow.follower_user_id, &account_id, equity_after)
            .await
            .ok();
        self.db.close_copied_position(copy.id).await.ok();

        // The ledger write is the last step; settlement without a matching
        // ledger entry is an accounting defect, so it retries harder than
        // order traffic and alerts when it dead-letters.
        if let Some(amount) = commission_for(&master.commission, follower_pnl, copied_lot) {
            if amount > Decimal::ZERO {
                let written = retry_async(
                    Duration::from_millis(self.config.retry_initial_backoff_ms),
                    self.config.ledger_retry_attempts,
                    || async {
                        self.db
                            .record_commission(
                                &master.id,
                                Some(&follow.follower_user_id),
                                CommissionSource::Trade,
                                follower_pnl,
                                amount,
                                master.in_good_standing(),
                            )
                            .await
                            .map(|_| ())
                    },
                )
                .await;

                if let Err(e) = written {
                    let err = ReplicationError::LedgerDeadLettered {
                        master_id: master.id.clone(),
                    };
                    error!(
                        master = %master.id,
                        follow = follow.id,
                        amount = %amount,
                        error = %e,
                        "ACCOUNTING: {err}"
                    );
                    self.db
                        .dead_letter(
                            "commission_write",
                            &json!({
                                "master_id": master.id,
                                "follow_id": follow.id,
                                "follower_user_id": follow.follower_user_id,
                                "trade_id": details.trade_id,
                                "follower_pnl": follower_pnl.to_string(),
                                "amount": amount.to_string(),
                            }),
                            &e.to_string(),
                            self.config.ledger_retry_attempts,
                        )
                        .await
                        .ok();
                    return CopyOutcome::Failed;
                }
            }
        }

        CopyOutcome::Copied
    }

    async fn dead_letter_copy(
        &self,
        follow: &FollowRelationship,
        event: &MasterTradeEvent,
        error: &str,
    ) {
        self.db
            .dead_letter(
                "follower_copy",
                &json!({
                    "follow_id": follow.id,
                    "follower_user_id": follow.follower_user_id,
                    "master_id": event.master_id,
                    "event_id": event.event_id,
                    "trade_id": event.details.trade_id,
                    "kind": event.kind,
                }),
                error,
                self.config.order_retry_attempts,
            )
            .await
            .ok();
    }
}

fn summarize(outcomes: &[CopyOutcome]) -> FanoutReport {
    let mut report = FanoutReport::default();
    for outcome in outcomes {
        match outcome {
            CopyOutcome::Copied => report.admitted += 1,
            CopyOutcome::Skipped => report.skipped += 1,
            CopyOutcome::Failed => report.failed += 1,
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use rust_decimal_macros::dec;

    use crate::db::FollowConfig;
    use crate::models::{
        CopyMode, FollowStatus, MasterStatus, OrderSide, RiskLevel, RiskLimits, TradeDetails,
    };

    /// Order gateway test double: records submissions, can fail per account.
    struct MockGateway {
        submitted: Mutex<Vec<FollowerOrder>>,
        amended: Mutex<Vec<(String, Option<Decimal>, Option<Decimal>)>>,
        closed: Mutex<Vec<String>>,
        fail_accounts: Mutex<HashSet<String>>,
    }

    impl MockGateway {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                submitted: Mutex::new(Vec::new()),
                amended: Mutex::new(Vec::new()),
                closed: Mutex::new(Vec::new()),
                fail_accounts: Mutex::new(HashSet::new()),
            })
        }

        fn fail_for(&self, account: &str) {
            self.fail_accounts.lock().unwrap().insert(account.to_string());
        }

        fn submissions(&self) -> Vec<FollowerOrder> {
            self.submitted.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl OrderSubmitter for MockGateway {
        async fn submit_follower_order(&self, order: &FollowerOrder) -> Result<String> {
            if self
                .fail_accounts
                .lock()
                .unwrap()
                .contains(&order.follower_account_id)
            {
                return Err(anyhow!("gateway unavailable"));
            }
            self.submitted.lock().unwrap().push(order.clone());
            Ok(format!("ord-{}", order.follower_account_id))
        }

        async fn amend_follower_order(
            &self,
            follower_account_id: &str,
            _order_id: &str,
            stop_loss: Option<Decimal>,
            take_profit: Option<Decimal>,
        ) -> Result<()> {
            if self.fail_accounts.lock().unwrap().contains(follower_account_id) {
                return Err(anyhow!("gateway unavailable"));
            }
            self.amended.lock().unwrap().push((
                follower_account_id.to_string(),
                stop_loss,
                take_profit,
            ));
            Ok(())
        }

        async fn close_follower_order(&self, follower_account_id: &str, order_id: &str) -> Result<()> {
            if self.fail_accounts.lock().unwrap().contains(follower_account_id) {
                return Err(anyhow!("gateway unavailable"));
            }
            self.closed.lock().unwrap().push(order_id.to_string());
            Ok(())
        }
    }

    fn test_config() -> EngineConfig {
        EngineConfig {
            order_retry_attempts: 1,
            ledger_retry_attempts: 1,
            retry_initial_backoff_ms: 1,
            ..EngineConfig::default()
        }
    }

    async fn setup() -> (Database, Arc<MockGateway>, Replicator) {
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
        db.set_master_status("m1", MasterStatus::Approved).await.unwrap();

        let gateway = MockGateway::new();
        let replicator = Replicator::new(test_config(), db.clone(), gateway.clone());
        (db, gateway, replicator)
    }

    async fn add_follower(
        db: &Database,
        user: &str,
        equity: Decimal,
        mode: CopyMode,
        max_lot: Decimal,
    ) -> i64 {
        db.upsert_follower_account(user, &format!("acct-{user}"), equity)
            .await
            .unwrap();
        db.create_follow(
            user,
            "m1",
            FollowConfig {
                copy_mode: mode,
                limits: RiskLimits {
                    max_daily_loss_pct: dec!(10),
                    max_drawdown_pct: dec!(20),
                    max_lot_size: max_lot,
                    stop_copy_on_drawdown: true,
                },
            },
            dec!(100),
        )
        .await
        .unwrap()
        .id
    }

    fn open_event(event_id: &str, trade_id: &str, lot: Decimal) -> MasterTradeEvent {
        MasterTradeEvent {
            event_id: event_id.into(),
            master_id: "m1".into(),
            kind: TradeEventKind::Open,
            details: TradeDetails {
                trade_id: trade_id.into(),
                symbol: "EURUSD".into(),
                side: OrderSide::Buy,
                lot_size: lot,
                open_price: dec!(1.0850),
                close_price: None,
                profit: None,
                stop_loss: None,
                take_profit: None,
            },
            emitted_at: Utc::now(),
        }
    }

    fn close_event(event_id: &str, trade_id: &str, lot: Decimal, profit: Decimal) -> MasterTradeEvent {
        let mut event = open_event(event_id, trade_id, lot);
        event.kind = TradeEventKind::Close;
        event.details.close_price = Some(dec!(1.0900));
        event.details.profit = Some(profit);
        event
    }

    #[test]
    fn profit_share_commission_on_winning_trade() {
        let model = CommissionModel::ProfitShare(dec!(20));
        assert_eq!(commission_for(&model, dec!(500), dec!(1)), Some(dec!(100.00)));
        // Losing trade earns zero, never negative
        assert_eq!(commission_for(&model, dec!(-500), dec!(1)), Some(dec!(0.00)));
    }

    #[test]
    fn per_lot_commission_is_volume_based() {
        let model = CommissionModel::PerLot(dec!(3.5));
        assert_eq!(commission_for(&model, dec!(-100), dec!(2)), Some(dec!(7.00)));
    }

    #[test]
    fn subscription_accrues_off_trade_path() {
        let model = CommissionModel::Subscription(dec!(29.99));
        assert_eq!(commission_for(&model, dec!(500), dec!(1)), None);
    }

    #[tokio::test]
    async fn open_event_sizes_each_follower_independently() {
        let (db, gateway, replicator) = setup().await;
        add_follower(&db, "ua", dec!(1000), CopyMode::FixedLot(dec!(0.1)), dec!(5)).await;
        add_follower(&db, "ub", dec!(1000), CopyMode::Multiplier(dec!(2.0)), dec!(1.5)).await;

        let report = replicator
            .handle_event(&open_event("e1", "t1", dec!(1.0)))
            .await
            .unwrap();
        assert_eq!(report.admitted, 2);

        let mut lots: Vec<(String, Decimal)> = gateway
            .submissions()
            .into_iter()
            .map(|o| (o.follower_account_id, o.lot_size))
            .collect();
        lots.sort();
        assert_eq!(lots[0], ("acct-ua".to_string(), dec!(0.10)));
        // Multiplier 2.0 clamped to the follow's 1.5 cap
        assert_eq!(lots[1], ("acct-ub".to_string(), dec!(1.50)));
    }

    #[tokio::test]
    async fn one_failing_follower_does_not_block_siblings() {
        let (db, gateway, replicator) = setup().await;
        add_follower(&db, "ua", dec!(1000), CopyMode::FixedLot(dec!(0.1)), dec!(5)).await;
        add_follower(&db, "ub", dec!(1000), CopyMode::FixedLot(dec!(0.2)), dec!(5)).await;
        gateway.fail_for("acct-ua");

        let report = replicator
            .handle_event(&open_event("e1", "t1", dec!(1.0)))
            .await
            .unwrap();
        assert_eq!(report.admitted, 1);
        assert_eq!(report.failed, 1);

        let submissions = gateway.submissions();
        assert_eq!(submissions.len(), 1);
        assert_eq!(submissions[0].follower_account_id, "acct-ub");

        // The failure is dead-lettered, never silently dropped
        let letters = db.list_dead_letters(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].kind, "follower_copy");
    }

    #[tokio::test]
    async fn duplicate_event_is_processed_once() {
        let (db, gateway, replicator) = setup().await;
        add_follower(&db, "ua", dec!(1000), CopyMode::FixedLot(dec!(0.1)), dec!(5)).await;

        let event = open_event("e1", "t1", dec!(1.0));
        replicator.handle_event(&event).await.unwrap();
        let second = replicator.handle_event(&event).await.unwrap();

        assert_eq!(second.admitted, 0);
        assert_eq!(gateway.submissions().len(), 1);
    }

    #[tokio::test]
    async fn close_settles_pnl_and_commission() {
        let (db, gateway, replicator) = setup().await;
        let follow_id = add_follower(&db, "ua", dec!(1000), CopyMode::FixedLot(dec!(0.5)), dec!(5)).await;

        replicator
            .handle_event(&open_event("e1", "t1", dec!(1.0)))
            .await
            .unwrap();
        let report = replicator
            .handle_event(&close_event("e2", "t1", dec!(1.0), dec!(500)))
            .await
            .unwrap();
        assert_eq!(report.admitted, 1);
        assert_eq!(gateway.closed.lock().unwrap().len(), 1);

        // P&L scaled by lot ratio: 500 * 0.5 / 1.0 = 250
        let follow = db.get_follow(follow_id).await.unwrap().unwrap();
        assert_eq!(follow.total_pnl, dec!(250.00));
        assert_eq!(follow.total_copied_trades, 1);
        assert_eq!(follow.peak_equity, dec!(1250.00));

        // Commission: 20% of follower profit, settled paid
        let entries = db.list_ledger_entries("m1", 10, 0).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].commission_amount, dec!(50.00));
        assert_eq!(entries[0].status, crate::models::LedgerStatus::Paid);

        // Master aggregate stats moved
        let master = db.get_master("m1").await.unwrap().unwrap();
        assert_eq!(master.total_trades, 1);
        assert!(master.win_rate > 0.99);

        // Position no longer open
        assert!(db.list_open_copies("m1", "t1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn losing_close_records_no_commission_entry() {
        let (db, _gateway, replicator) = setup().await;
        let follow_id = add_follower(&db, "ua", dec!(1000), CopyMode::FixedLot(dec!(0.5)), dec!(5)).await;

        replicator
            .handle_event(&open_event("e1", "t1", dec!(1.0)))
            .await
            .unwrap();
        replicator
            .handle_event(&close_event("e2", "t1", dec!(1.0), dec!(-200)))
            .await
            .unwrap();

        let follow = db.get_follow(follow_id).await.unwrap().unwrap();
        assert_eq!(follow.total_pnl, dec!(-100.00));
        assert!(db.list_ledger_entries("m1", 10, 0).await.unwrap().is_empty());
        assert_eq!(db.available_commission("m1").await.unwrap(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn daily_loss_limit_skips_and_auto_pauses() {
        let (db, gateway, replicator) = setup().await;
        let follow_id = add_follower(&db, "ua", dec!(1000), CopyMode::FixedLot(dec!(0.1)), dec!(5)).await;
        // Push daily P&L to -12% of equity against a 10% limit
        db.record_copy_result(follow_id, dec!(-120), true, dec!(880)).await.unwrap();
        db.upsert_follower_account("ua", "acct-ua", dec!(880)).await.unwrap();

        let report = replicator
            .handle_event(&open_event("e1", "t2", dec!(1.0)))
            .await
            .unwrap();
        assert_eq!(report.skipped, 1);
        assert!(gateway.submissions().is_empty());

        // stop_copy_on_drawdown paused the follow
        let follow = db.get_follow(follow_id).await.unwrap().unwrap();
        assert_eq!(follow.status, FollowStatus::Paused);
    }

    #[tokio::test]
    async fn refused_event_is_dead_lettered_and_stays_replayable() {
        let (db, gateway, replicator) = setup().await;
        add_follower(&db, "ua", dec!(1000), CopyMode::FixedLot(dec!(0.1)), dec!(5)).await;
        db.set_master_status("m1", MasterStatus::Suspended).await.unwrap();

        let event = open_event("e1", "t1", dec!(1.0));
        let report = replicator.handle_event(&event).await.unwrap();
        assert_eq!(report.admitted + report.skipped + report.failed, 0);
        assert!(gateway.submissions().is_empty());

        // Refusal is recorded, never silently dropped
        let letters = db.list_dead_letters(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].kind, "refused_event");

        // The event was not consumed: after reactivation a feed replay of
        // the same event processes normally.
        db.set_master_status("m1", MasterStatus::Approved).await.unwrap();
        let report = replicator.handle_event(&event).await.unwrap();
        assert_eq!(report.admitted, 1);
        assert_eq!(gateway.submissions().len(), 1);
    }

    #[tokio::test]
    async fn modify_event_amends_each_open_copy() {
        let (db, gateway, replicator) = setup().await;
        add_follower(&db, "ua", dec!(1000), CopyMode::FixedLot(dec!(0.1)), dec!(5)).await;
        add_follower(&db, "ub", dec!(1000), CopyMode::FixedLot(dec!(0.2)), dec!(5)).await;

        replicator
            .handle_event(&open_event("e1", "t1", dec!(1.0)))
            .await
            .unwrap();

        let mut event = open_event("e2", "t1", dec!(1.0));
        event.kind = TradeEventKind::Modify;
        event.details.stop_loss = Some(dec!(1.0800));
        event.details.take_profit = Some(dec!(1.0950));

        let report = replicator.handle_event(&event).await.unwrap();
        assert_eq!(report.admitted, 2);
        assert_eq!(report.failed, 0);

        let mut amended = gateway.amended.lock().unwrap().clone();
        amended.sort();
        assert_eq!(
            amended,
            vec![
                ("acct-ua".to_string(), Some(dec!(1.0800)), Some(dec!(1.0950))),
                ("acct-ub".to_string(), Some(dec!(1.0800)), Some(dec!(1.0950))),
            ]
        );
    }
}
