//! Per-master event ordering.
//!
//! Every master gets its own worker task fed by a bounded channel, so a
//! master's events replay in emission order while different masters fan out
//! in parallel. Workers are spawned lazily on the first event for a master
//! and live until the router is dropped.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info};

use crate::models::MasterTradeEvent;

use super::{FanoutReport, Replicator};

const MASTER_QUEUE_DEPTH: usize = 256;

pub struct EventRouter {
    replicator: Arc<Replicator>,
    senders: Mutex<HashMap<String, mpsc::Sender<MasterTradeEvent>>>,
}

impl EventRouter {
    pub fn new(replicator: Arc<Replicator>) -> Self {
        Self {
            replicator,
            senders: Mutex::new(HashMap::new()),
        }
    }

    /// Queue an event onto its master's worker, spawning the worker on
    /// first contact. Backpressure: a full queue blocks the feed poller,
    /// never reorders.
    pub async fn dispatch(&self, event: MasterTradeEvent) -> Result<()> {
        let mut senders = self.senders.lock().await;

        let sender = match senders.get(&event.master_id) {
            Some(tx) if !tx.is_closed() => tx.clone(),
            _ => {
                let tx = self.spawn_worker(&event.master_id);
                senders.insert(event.master_id.clone(), tx.clone());
                tx
            }
        };
        drop(senders);

        sender
            .send(event)
            .await
            .context("Master worker terminated")?;
        Ok(())
    }

    fn spawn_worker(&self, master_id: &str) -> mpsc::Sender<MasterTradeEvent> {
        let (tx, mut rx) = mpsc::channel::<MasterTradeEvent>(MASTER_QUEUE_DEPTH);
        let replicator = Arc::clone(&self.replicator);
        let master_id = master_id.to_string();

        info!(master = %master_id, "Starting master worker");
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match replicator.handle_event(&event).await {
                    Ok(FanoutReport { admitted, skipped, failed }) => {
                        debug!(
                            master = %master_id,
                            event = %event.event_id,
                            admitted,
                            skipped,
                            failed,
                            "Event processed"
                        );
                    }
                    // Per-follower failures are absorbed inside the
                    // replicator; an error here is infrastructure-level.
                    Err(e) => {
                        error!(master = %master_id, event = %event.event_id, error = %e, "Event processing failed");
                    }
                }
            }
            info!(master = %master_id, "Master worker stopped");
        });

        tx
    }
}
