//! Order-submission collaborator: places follower orders with the broker's
//! execution layer.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::OrderSide;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// A sized order instruction for one follower account.
#[derive(Debug, Clone, Serialize)]
pub struct FollowerOrder {
    pub follower_account_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub lot_size: Decimal,
    /// Master trade this order mirrors
    pub source_trade_id: String,
}

/// Seam to the order-submission service. Implementations must be safe to
/// call concurrently from the fan-out pool.
#[async_trait]
pub trait OrderSubmitter: Send + Sync {
    /// Submit a follower order; returns the broker's order id.
    async fn submit_follower_order(&self, order: &FollowerOrder) -> Result<String>;

    /// Amend SL/TP on a previously submitted follower order.
    async fn amend_follower_order(
        &self,
        follower_account_id: &str,
        order_id: &str,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<()>;

    /// Close a previously submitted follower order.
    async fn close_follower_order(&self, follower_account_id: &str, order_id: &str) -> Result<()>;
}

/// HTTP client for the order-submission service.
pub struct HttpOrderGateway {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    order_id: String,
}

#[derive(Debug, Serialize)]
struct AmendRequest<'a> {
    order_id: &'a str,
    stop_loss: Option<Decimal>,
    take_profit: Option<Decimal>,
}

impl HttpOrderGateway {
    pub fn new(base_url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, base_url })
    }

    /// Read the gateway endpoint from `ORDER_GATEWAY_URL`.
    pub fn from_env() -> Result<Self> {
        let base_url =
            std::env::var("ORDER_GATEWAY_URL").context("ORDER_GATEWAY_URL not set")?;
        Self::new(base_url)
    }
}

#[async_trait]
impl OrderSubmitter for HttpOrderGateway {
    async fn submit_follower_order(&self, order: &FollowerOrder) -> Result<String> {
        let url = format!("{}/v1/orders", self.base_url);
        debug!(account = %order.follower_account_id, symbol = %order.symbol, lot = %order.lot_size, "Submitting follower order");

        let response = self
            .client
            .post(&url)
            .json(order)
            .send()
            .await
            .context("Order submission request failed")?
            .error_for_status()
            .context("Order submission rejected")?;

        let body: SubmitResponse = response
            .json()
            .await
            .context("Invalid order submission response")?;

        Ok(body.order_id)
    }

    async fn amend_follower_order(
        &self,
        follower_account_id: &str,
        order_id: &str,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<()> {
        let url = format!(
            "{}/v1/accounts/{}/orders/{}/amend",
            self.base_url, follower_account_id, order_id
        );

        self.client
            .post(&url)
            .json(&AmendRequest {
                order_id,
                stop_loss,
                take_profit,
            })
            .send()
            .await
            .context("Order amendment request failed")?
            .error_for_status()
            .context("Order amendment rejected")?;

        Ok(())
    }

    async fn close_follower_order(&self, follower_account_id: &str, order_id: &str) -> Result<()> {
        let url = format!(
            "{}/v1/accounts/{}/orders/{}/close",
            self.base_url, follower_account_id, order_id
        );

        self.client
            .post(&url)
            .send()
            .await
            .context("Order close request failed")?
            .error_for_status()
            .context("Order close rejected")?;

        Ok(())
    }
}
