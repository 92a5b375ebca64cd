//! Clients for collaborator services: order submission, wallet credit, and
//! the core engine's trade event feed.

mod feed;
mod order_gateway;
mod wallet_client;

pub use feed::TradeFeedClient;
pub use order_gateway::{FollowerOrder, HttpOrderGateway, OrderSubmitter};
pub use wallet_client::{HttpWalletClient, WalletService};
