//! Trade event feed: polls the core trading engine for master trade
//! lifecycle events.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use tokio::sync::RwLock;
use tracing::debug;

use serde::Deserialize;

use crate::models::MasterTradeEvent;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for the core engine's trade event stream.
///
/// Keeps an opaque cursor so each poll only returns events emitted after the
/// previous poll; the core engine guarantees per-master emission order within
/// a page.
pub struct TradeFeedClient {
    client: Client,
    base_url: String,
    cursor: RwLock<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct EventPage {
    events: Vec<MasterTradeEvent>,
    #[serde(default)]
    next_cursor: Option<String>,
}

impl TradeFeedClient {
    pub fn new(base_url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url,
            cursor: RwLock::new(None),
        })
    }

    /// Read the feed endpoint from `TRADE_FEED_URL`.
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var("TRADE_FEED_URL").context("TRADE_FEED_URL not set")?;
        Self::new(base_url)
    }

    /// Fetch events emitted since the last poll, advancing the cursor.
    pub async fn poll_new_events(&self) -> Result<Vec<MasterTradeEvent>> {
        let mut url = format!("{}/v1/trade-events?limit=200", self.base_url);
        if let Some(cursor) = self.cursor.read().await.as_deref() {
            url.push_str(&format!("&after={}", cursor));
        }

        let page: EventPage = self
            .client
            .get(&url)
            .send()
            .await
            .context("Trade feed request failed")?
            .error_for_status()
            .context("Trade feed rejected request")?
            .json()
            .await
            .context("Invalid trade feed response")?;

        if let Some(next) = page.next_cursor {
            *self.cursor.write().await = Some(next);
        }

        debug!(count = page.events.len(), "Polled trade events");
        Ok(page.events)
    }
}
