//! NsqBridge Core - Message exchange engine
//!
//! This crate contains the engine between application handlers and the
//! broker:
//! - Client: outbound publishes through a connection pool
//! - Server: inbound consumption, one worker per binding
//! - Binding registry and the per-delivery state machine

pub mod client;
pub mod consumer;
pub mod handler;
pub mod pool;
pub mod registry;
pub mod server;
pub mod strategy;

// Re-exports
pub use client::Client;
pub use consumer::{DeliveryState, InboundMessage};
pub use handler::{Handler, HandlerResponse};
pub use pool::ConnectionPool;
pub use registry::{Binding, BindingRegistry, Pattern, PatternKind, RegistryBuilder};
pub use server::Server;
pub use strategy::Dispatcher;
