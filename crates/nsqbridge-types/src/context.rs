//! Delivery metadata passed to handlers alongside the payload.

use serde::Serialize;
use utoipa::ToSchema;

use crate::message::MessageId;

/// Read-only description of the delivery being handled
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct DeliveryContext {
    topic: String,
    channel: String,
    message_id: MessageId,
    attempts: u16,
}

impl DeliveryContext {
    pub fn new(
        topic: impl Into<String>,
        channel: impl Into<String>,
        message_id: MessageId,
        attempts: u16,
    ) -> Self {
        Self {
            topic: topic.into(),
            channel: channel.into(),
            message_id,
            attempts,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    /// Delivery attempts as counted by the broker (1 on first delivery)
    pub fn attempts(&self) -> u16 {
        self.attempts
    }
}
