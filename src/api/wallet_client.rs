//! Wallet/funds collaborator: credits a master's primary wallet when a
//! withdrawal completes.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Seam to the wallet/funds service.
#[async_trait]
pub trait WalletService: Send + Sync {
    async fn credit_master_wallet(&self, master_id: &str, amount: Decimal) -> Result<()>;
}

/// HTTP client for the wallet service.
pub struct HttpWalletClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct CreditRequest {
    amount: Decimal,
    reason: &'static str,
}

impl HttpWalletClient {
    pub fn new(base_url: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, base_url })
    }

    /// Read the wallet endpoint from `WALLET_SERVICE_URL`.
    pub fn from_env() -> Result<Self> {
        let base_url =
            std::env::var("WALLET_SERVICE_URL").context("WALLET_SERVICE_URL not set")?;
        Self::new(base_url)
    }
}

#[async_trait]
impl WalletService for HttpWalletClient {
    async fn credit_master_wallet(&self, master_id: &str, amount: Decimal) -> Result<()> {
        let url = format!("{}/v1/wallets/{}/credit", self.base_url, master_id);
        debug!(master = %master_id, amount = %amount, "Crediting master wallet");

        self.client
            .post(&url)
            .json(&CreditRequest {
                amount,
                reason: "copy_trade_commission_withdrawal",
            })
            .send()
            .await
            .context("Wallet credit request failed")?
            .error_for_status()
            .context("Wallet credit rejected")?;

        Ok(())
    }
}
