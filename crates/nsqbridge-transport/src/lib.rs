//! NsqBridge Transport - Broker and directory service seams
//!
//! This crate defines the interface the engine consumes from the broker
//! and its directory service, plus the raw message handle.
//! Currently provides:
//! - In-memory cluster (default, for development/testing)

pub mod message;
pub mod traits;

#[cfg(feature = "memory")]
pub mod memory;

// Re-exports
pub use message::RawMessage;
pub use traits::{
    Connection, Connector, Lookup, Responder, SubscribeConfig, Subscriber, Subscription,
    SubscriptionEvent,
};

#[cfg(feature = "memory")]
pub use memory::{ChannelStats, MemoryCluster};
