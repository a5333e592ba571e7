//! Broker seam trait definitions
//!
//! Defines the interface that every broker backend must implement.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use nsqbridge_types::{DiscardHandler, MessageId, Result};
use tokio::sync::mpsc;

use crate::message::RawMessage;

// ==================== Discovery ====================

/// Directory service returning the current broker node addresses
#[async_trait]
pub trait Lookup: Send + Sync {
    /// Current node addresses, in a stable order
    async fn nodes(&self) -> Result<Vec<String>>;
}

// ==================== Producing ====================

/// Opens connections to broker nodes
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to the node at `address`
    async fn connect(&self, address: &str) -> Result<Arc<dyn Connection>>;
}

/// A live producer connection to one broker node
#[async_trait]
pub trait Connection: Send + Sync {
    /// Address of the node this connection talks to
    fn address(&self) -> &str;

    /// Publish a body to a topic
    async fn publish(&self, topic: &str, body: Bytes) -> Result<()>;

    /// Publish a body that the broker holds back for `delay`
    async fn deferred_publish(&self, topic: &str, body: Bytes, delay: Duration) -> Result<()>;

    /// Close the connection
    async fn close(&self);
}

// ==================== Consuming ====================

/// Message-level operations forwarded to the broker
pub trait Responder: Send + Sync {
    /// Permanent success
    fn finish(&self, id: &MessageId);

    /// Temporary failure, redeliver after `delay`
    fn requeue(&self, id: &MessageId, delay: Duration);

    /// Reset the broker's in-flight timeout
    fn touch(&self, id: &MessageId);
}

/// Subscription parameters handed to the broker
#[derive(Clone, Default)]
pub struct SubscribeConfig {
    /// Concurrent unacknowledged deliveries; the engine enforces it,
    /// backends may use it as a delivery window
    pub max_in_flight: usize,
    /// Attempts before discarding (0 = unlimited)
    pub max_attempts: u16,
    /// Callback for discarded messages
    pub discard_handler: Option<DiscardHandler>,
}

impl std::fmt::Debug for SubscribeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscribeConfig")
            .field("max_in_flight", &self.max_in_flight)
            .field("max_attempts", &self.max_attempts)
            .field("discard_handler", &self.discard_handler.is_some())
            .finish()
    }
}

/// Creates channel subscriptions
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Subscribe to `channel` on `topic`
    async fn subscribe(
        &self,
        topic: &str,
        channel: &str,
        config: SubscribeConfig,
    ) -> Result<Subscription>;
}

/// Item produced by a subscription
#[derive(Debug)]
pub enum SubscriptionEvent {
    /// A delivered message
    Message(RawMessage),
    /// A reader-level error; the subscription stays open
    Error(String),
}

/// Stream of deliveries for one (topic, channel) pair
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<SubscriptionEvent>,
    on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// Create a subscription from a receiver and a detach callback
    pub fn new(
        receiver: mpsc::UnboundedReceiver<SubscriptionEvent>,
        on_close: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            receiver,
            on_close: Some(Box::new(on_close)),
        }
    }

    /// Next event, or `None` once the broker side is gone
    pub async fn next(&mut self) -> Option<SubscriptionEvent> {
        self.receiver.recv().await
    }

    /// Event already buffered on this side, without waiting
    pub fn try_next(&mut self) -> Option<SubscriptionEvent> {
        self.receiver.try_recv().ok()
    }

    /// Refuse further deliveries while staying attached
    ///
    /// Buffered events stay readable through [`Self::try_next`] and
    /// in-flight messages can still be settled. Deliveries the broker tries
    /// afterwards stay on the broker side.
    pub fn stop_intake(&mut self) {
        self.receiver.close();
    }

    /// Detach from the broker; idempotent
    pub fn close(&mut self) {
        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
        self.receiver.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("closed", &self.on_close.is_none())
            .finish()
    }
}
