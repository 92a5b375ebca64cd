//! Trade lifecycle events pushed by the core trading engine.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

/// What happened to the master's trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeEventKind {
    Open,
    Modify,
    Close,
}

/// Details of the master's trade carried on every lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeDetails {
    /// Trade identifier in the core engine (stable across open/modify/close)
    pub trade_id: String,

    /// Instrument symbol, e.g. "EURUSD"
    pub symbol: String,

    pub side: OrderSide,

    /// Master's lot size
    pub lot_size: Decimal,

    pub open_price: Decimal,

    /// Present on close events
    #[serde(default)]
    pub close_price: Option<Decimal>,

    /// Master's settled P&L; present on close events
    #[serde(default)]
    pub profit: Option<Decimal>,

    /// Stop-loss, if set (carried on modify events)
    #[serde(default)]
    pub stop_loss: Option<Decimal>,

    /// Take-profit, if set (carried on modify events)
    #[serde(default)]
    pub take_profit: Option<Decimal>,
}

/// A single lifecycle event for one of a master's trades.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterTradeEvent {
    /// Unique event identifier (dedupe key)
    pub event_id: String,

    pub master_id: String,

    pub kind: TradeEventKind,

    pub details: TradeDetails,

    pub emitted_at: DateTime<Utc>,
}

impl MasterTradeEvent {
    /// Master profit on a close event, zero otherwise.
    pub fn settled_profit(&self) -> Decimal {
        self.details.profit.unwrap_or(Decimal::ZERO)
    }
}
