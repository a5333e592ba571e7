//! Raw broker message handle
//!
//! The handle settles at most once: after `finish` or `requeue`, every
//! further terminal call and every `touch` is rejected. A handle dropped
//! without being settled is requeued for immediate redelivery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nsqbridge_types::{Error, MessageId, Result};
use tracing::{debug, warn};

use crate::traits::Responder;

/// A message as delivered by the broker
pub struct RawMessage {
    id: MessageId,
    attempts: u16,
    body: Bytes,
    responder: Arc<dyn Responder>,
    settled: AtomicBool,
}

impl RawMessage {
    pub fn new(id: MessageId, attempts: u16, body: Bytes, responder: Arc<dyn Responder>) -> Self {
        Self {
            id,
            attempts,
            body,
            responder,
            settled: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    /// Delivery attempts as counted by the broker
    pub fn attempts(&self) -> u16 {
        self.attempts
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Whether finish or requeue has already been sent
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// Acknowledge permanently
    pub fn finish(&self) -> Result<()> {
        self.settle()?;
        debug!(message_id = %self.id, "Message finished");
        self.responder.finish(&self.id);
        Ok(())
    }

    /// Return to the broker for redelivery after `delay`
    pub fn requeue(&self, delay: Duration) -> Result<()> {
        self.settle()?;
        debug!(
            message_id = %self.id,
            delay_ms = delay.as_millis() as u64,
            "Message requeued"
        );
        self.responder.requeue(&self.id, delay);
        Ok(())
    }

    /// Keep the message in flight
    pub fn touch(&self) -> Result<()> {
        if self.is_settled() {
            return Err(Error::AlreadyAcknowledged(self.id.to_string()));
        }
        self.responder.touch(&self.id);
        Ok(())
    }

    /// Mark the handle settled without telling the broker
    ///
    /// For backends taking back a message they could not hand out.
    pub(crate) fn disarm(&self) {
        self.settled.store(true, Ordering::Release);
    }

    fn settle(&self) -> Result<()> {
        self.settled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| Error::AlreadyAcknowledged(self.id.to_string()))
    }
}

impl Drop for RawMessage {
    fn drop(&mut self) {
        if self.settle().is_ok() {
            warn!(message_id = %self.id, "Message dropped unsettled, requeueing");
            self.responder.requeue(&self.id, Duration::ZERO);
        }
    }
}

impl std::fmt::Debug for RawMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawMessage")
            .field("id", &self.id)
            .field("attempts", &self.attempts)
            .field("body_len", &self.body.len())
            .field("settled", &self.is_settled())
            .finish()
    }
}
