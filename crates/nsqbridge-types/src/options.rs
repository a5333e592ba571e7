//! Configuration types for NsqBridge
//!
//! Server-wide options, per-binding overrides and per-publish options.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;

use crate::message::DiscardedMessage;

/// Requeue delay used when neither the binding nor the server sets one
pub const DEFAULT_REQUEUE_DELAY: Duration = Duration::from_secs(90);

/// Outbound distribution strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// One connection per publish, cycling through the pool
    #[default]
    RoundRobin,
    /// Every connection on every publish
    FanOut,
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct NsqOptions {
    /// Directory service (lookupd) HTTP addresses
    #[serde(default)]
    pub lookupd_http_addresses: Vec<String>,

    /// Outbound distribution strategy
    #[serde(default)]
    pub strategy: Strategy,

    /// Concurrent in-flight deliveries per binding
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Default requeue delay in milliseconds (unset = 90 seconds)
    #[serde(default)]
    pub requeue_delay_ms: Option<u64>,

    /// Directory refresh interval in seconds
    #[serde(default = "default_lookupd_poll_interval")]
    pub lookupd_poll_interval_secs: u64,

    /// Delivery attempts before the broker discards (0 = unlimited)
    #[serde(default)]
    pub max_attempts: u16,

    /// How long shutdown waits for running handlers, in milliseconds
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_ms: u64,
}

fn default_max_in_flight() -> usize {
    10
}

fn default_lookupd_poll_interval() -> u64 {
    60 // 1 minute
}

fn default_drain_timeout() -> u64 {
    30_000
}

impl Default for NsqOptions {
    fn default() -> Self {
        Self {
            lookupd_http_addresses: Vec::new(),
            strategy: Strategy::default(),
            max_in_flight: default_max_in_flight(),
            requeue_delay_ms: None,
            lookupd_poll_interval_secs: default_lookupd_poll_interval(),
            max_attempts: 0,
            drain_timeout_ms: default_drain_timeout(),
        }
    }
}

impl NsqOptions {
    pub fn lookupd_poll_interval(&self) -> Duration {
        Duration::from_secs(self.lookupd_poll_interval_secs.max(1))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn requeue_delay(&self) -> Duration {
        self.requeue_delay_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_REQUEUE_DELAY)
    }
}

/// Callback invoked by the broker when a message runs out of attempts
pub type DiscardHandler = Arc<dyn Fn(DiscardedMessage) + Send + Sync>;

/// Per-binding overrides of [`NsqOptions`]
#[derive(Clone, Default)]
pub struct BindingOptions {
    pub max_attempts: Option<u16>,
    pub requeue_delay: Option<Duration>,
    pub max_in_flight: Option<usize>,
    pub discard_handler: Option<DiscardHandler>,
}

impl BindingOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, max_attempts: u16) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_requeue_delay(mut self, delay: Duration) -> Self {
        self.requeue_delay = Some(delay);
        self
    }

    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = Some(max_in_flight);
        self
    }

    pub fn with_discard_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(DiscardedMessage) + Send + Sync + 'static,
    {
        self.discard_handler = Some(Arc::new(handler));
        self
    }
}

impl std::fmt::Debug for BindingOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BindingOptions")
            .field("max_attempts", &self.max_attempts)
            .field("requeue_delay", &self.requeue_delay)
            .field("max_in_flight", &self.max_in_flight)
            .field("discard_handler", &self.discard_handler.is_some())
            .finish()
    }
}

/// Options steering a single publish, read from the envelope's `options`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Deferred publish delay
    pub delay: Option<Duration>,
    /// Extra attempts per connection before it counts as failed
    pub retries: u32,
}

impl PublishOptions {
    /// Interpret an envelope options map; unknown keys are ignored
    pub fn from_map(options: &Map<String, Value>) -> Self {
        let delay = options
            .get("delay")
            .and_then(Value::as_u64)
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);
        let retries = options
            .get("retry")
            .and_then(|retry| retry.get("retries"))
            .and_then(Value::as_u64)
            .map(|n| n.min(u32::MAX as u64) as u32)
            .unwrap_or(0);

        Self { delay, retries }
    }
}
