//! NsqBridge Types - Shared domain types for the message exchange engine
//!
//! This crate contains the envelope codec, delivery metadata, configuration
//! and error types used across NsqBridge components.

pub mod context;
pub mod envelope;
pub mod error;
pub mod message;
pub mod options;
pub mod outcome;

// Re-export commonly used types
pub use context::DeliveryContext;
pub use envelope::{decode, encode, IncomingPacket, Meta, OutboundEnvelope, DEFAULT_COMPONENT};
pub use error::{BoxError, Error, Result};
pub use message::{DiscardedMessage, MessageId, Payload};
pub use options::{BindingOptions, DiscardHandler, NsqOptions, PublishOptions, Strategy};
pub use outcome::{ConnectionFailure, PublishOutcome};
