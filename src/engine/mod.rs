//! Replication engine: consumes master trade events, mirrors them onto
//! follower accounts, and settles commission.

mod replicator;
mod router;

pub use replicator::{FanoutReport, Replicator};
pub use router::EventRouter;
