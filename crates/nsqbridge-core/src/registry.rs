//! Binding registry
//!
//! Maps (topic, channel) pairs to handlers. Built once at startup through
//! [`RegistryBuilder`] and read-only afterwards.

use std::sync::Arc;
use std::time::Duration;

use nsqbridge_types::{BindingOptions, DiscardHandler, Error, NsqOptions, Result};
use tracing::debug;

use crate::handler::Handler;

/// Kind of subscription a handler was declared for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternKind {
    /// Fire-and-forget event consumption
    Event,
    /// Request/response; not supported
    Request,
}

/// Routing key of a binding
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pattern {
    pub topic: String,
    pub channel: String,
    pub kind: PatternKind,
}

impl Pattern {
    pub fn event(topic: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            channel: channel.into(),
            kind: PatternKind::Event,
        }
    }

    pub fn request(topic: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            channel: channel.into(),
            kind: PatternKind::Request,
        }
    }
}

/// A handler bound to one (topic, channel) subscription
pub struct Binding {
    topic: String,
    channel: String,
    handler: Arc<dyn Handler>,
    options: BindingOptions,
}

impl Binding {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn handler(&self) -> &dyn Handler {
        self.handler.as_ref()
    }

    pub fn options(&self) -> &BindingOptions {
        &self.options
    }

    /// Binding delay, else the server default, else 90 seconds
    pub fn requeue_delay(&self, defaults: &NsqOptions) -> Duration {
        self.options
            .requeue_delay
            .unwrap_or_else(|| defaults.requeue_delay())
    }

    pub fn max_attempts(&self, defaults: &NsqOptions) -> u16 {
        self.options.max_attempts.unwrap_or(defaults.max_attempts)
    }

    pub fn max_in_flight(&self, defaults: &NsqOptions) -> usize {
        self.options
            .max_in_flight
            .unwrap_or(defaults.max_in_flight)
            .max(1)
    }

    pub fn discard_handler(&self) -> Option<&DiscardHandler> {
        self.options.discard_handler.as_ref()
    }
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("topic", &self.topic)
            .field("channel", &self.channel)
            .field("options", &self.options)
            .finish()
    }
}

/// Collects bindings before the engine starts
#[derive(Default)]
pub struct RegistryBuilder {
    bindings: Vec<Binding>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a pattern
    ///
    /// Fails for request/response patterns and for a (topic, channel) pair
    /// that is already bound.
    pub fn register<H: Handler>(
        &mut self,
        pattern: Pattern,
        handler: H,
        options: BindingOptions,
    ) -> Result<&mut Self> {
        if pattern.kind != PatternKind::Event {
            return Err(Error::NotImplemented(format!(
                "request/response binding for {}/{}",
                pattern.topic, pattern.channel
            )));
        }
        if self
            .bindings
            .iter()
            .any(|b| b.topic == pattern.topic && b.channel == pattern.channel)
        {
            return Err(Error::DuplicateBinding {
                topic: pattern.topic,
                channel: pattern.channel,
            });
        }

        debug!(topic = %pattern.topic, channel = %pattern.channel, "Binding registered");
        self.bindings.push(Binding {
            topic: pattern.topic,
            channel: pattern.channel,
            handler: Arc::new(handler),
            options,
        });
        Ok(self)
    }

    /// Register an event handler
    pub fn event<H: Handler>(
        &mut self,
        topic: impl Into<String>,
        channel: impl Into<String>,
        handler: H,
        options: BindingOptions,
    ) -> Result<&mut Self> {
        self.register(Pattern::event(topic, channel), handler, options)
    }

    pub fn build(self) -> BindingRegistry {
        BindingRegistry {
            bindings: self.bindings.into_iter().map(Arc::new).collect(),
        }
    }
}

/// Immutable set of bindings
#[derive(Debug, Default)]
pub struct BindingRegistry {
    bindings: Vec<Arc<Binding>>,
}

impl BindingRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new()
    }

    pub fn get(&self, topic: &str, channel: &str) -> Option<&Arc<Binding>> {
        self.bindings
            .iter()
            .find(|b| b.topic == topic && b.channel == channel)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Binding>> {
        self.bindings.iter()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
