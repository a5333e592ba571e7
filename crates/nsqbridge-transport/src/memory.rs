//! In-memory broker cluster
//!
//! Fast, non-persistent stand-in for a set of broker nodes plus their
//! directory service, for development and testing.
//! All data is lost when the process exits.
//!
//! Topics are shared across nodes: a publish through any node reaches every
//! channel of the topic. Each channel serves one subscriber at a time; a new
//! subscription replaces the previous one.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use nsqbridge_types::{DiscardHandler, DiscardedMessage, Error, MessageId, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::message::RawMessage;
use crate::traits::{
    Connection, Connector, Lookup, Responder, SubscribeConfig, Subscriber, Subscription,
    SubscriptionEvent,
};

/// Per-channel counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    /// Deliveries handed to a subscriber (redeliveries included)
    pub delivered: u64,
    pub finished: u64,
    pub requeued: u64,
    pub discarded: u64,
    pub touched: u64,
    /// Delivered but not yet finished or requeued
    pub in_flight: usize,
    /// Waiting for a subscriber
    pub pending: usize,
    /// Delay of the most recent requeue
    pub last_requeue_delay: Option<Duration>,
    /// In-flight window requested by the current subscriber
    pub max_in_flight: usize,
}

#[derive(Debug, Clone)]
struct Pending {
    id: MessageId,
    attempts: u16,
    body: Bytes,
}

impl Pending {
    fn new(body: Bytes) -> Self {
        Self {
            id: MessageId::new(),
            attempts: 1,
            body,
        }
    }
}

/// Internal channel state
struct MemoryChannel {
    this: Weak<MemoryChannel>,
    topic: String,
    name: String,
    /// Current subscriber and its generation
    sender: Mutex<Option<(u64, mpsc::UnboundedSender<SubscriptionEvent>)>>,
    generation: AtomicU64,
    pending: Mutex<VecDeque<Pending>>,
    in_flight: DashMap<MessageId, Pending>,
    max_attempts: AtomicU16,
    max_in_flight: AtomicUsize,
    discard_handler: Mutex<Option<DiscardHandler>>,
    stats: Mutex<ChannelStats>,
}

impl MemoryChannel {
    fn new(topic: &str, name: &str) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            topic: topic.to_string(),
            name: name.to_string(),
            sender: Mutex::new(None),
            generation: AtomicU64::new(0),
            pending: Mutex::new(VecDeque::new()),
            in_flight: DashMap::new(),
            max_attempts: AtomicU16::new(0),
            max_in_flight: AtomicUsize::new(0),
            discard_handler: Mutex::new(None),
            stats: Mutex::new(ChannelStats::default()),
        })
    }

    /// Hand a message to the subscriber, park it, or discard it
    fn dispatch(self: &Arc<Self>, item: Pending) {
        let max_attempts = self.max_attempts.load(Ordering::Acquire);
        if max_attempts > 0 && item.attempts > max_attempts {
            self.discard(item);
            return;
        }

        let sender = self.sender.lock().as_ref().map(|(_, tx)| tx.clone());
        let Some(tx) = sender else {
            self.pending.lock().push_back(item);
            return;
        };

        self.in_flight.insert(item.id.clone(), item.clone());
        let responder: Arc<dyn Responder> = self.clone();
        let raw = RawMessage::new(item.id.clone(), item.attempts, item.body.clone(), responder);

        if let Err(mpsc::error::SendError(event)) = tx.send(SubscriptionEvent::Message(raw)) {
            if let SubscriptionEvent::Message(raw) = event {
                raw.disarm();
            }
            self.in_flight.remove(&item.id);
            self.pending.lock().push_back(item);
        } else {
            self.stats.lock().delivered += 1;
        }
    }

    fn discard(&self, item: Pending) {
        self.stats.lock().discarded += 1;
        warn!(
            topic = %self.topic,
            channel = %self.name,
            message_id = %item.id,
            attempts = item.attempts,
            "Message exceeded max attempts, discarding"
        );

        let handler = self.discard_handler.lock().clone();
        if let Some(handler) = handler {
            handler(DiscardedMessage {
                id: item.id,
                topic: self.topic.clone(),
                channel: self.name.clone(),
                attempts: item.attempts,
                body: item.body,
            });
        }
    }

    fn attach(self: &Arc<Self>, tx: mpsc::UnboundedSender<SubscriptionEvent>) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        *self.sender.lock() = Some((generation, tx));

        let parked: Vec<Pending> = self.pending.lock().drain(..).collect();
        for item in parked {
            self.dispatch(item);
        }
        generation
    }

    /// Drop the subscriber if it is still the current one; its in-flight
    /// messages go back to pending.
    fn detach(&self, generation: u64) {
        {
            let mut sender = self.sender.lock();
            match sender.as_ref() {
                Some((current, _)) if *current == generation => *sender = None,
                _ => return,
            }
        }

        let ids: Vec<MessageId> = self.in_flight.iter().map(|e| e.key().clone()).collect();
        let mut pending = self.pending.lock();
        for id in ids {
            if let Some((_, item)) = self.in_flight.remove(&id) {
                pending.push_back(item);
            }
        }
        debug!(topic = %self.topic, channel = %self.name, "Subscriber detached");
    }

    fn report_error(&self, error: String) {
        if let Some((_, tx)) = self.sender.lock().as_ref() {
            let _ = tx.send(SubscriptionEvent::Error(error));
        }
    }

    fn stats(&self) -> ChannelStats {
        let mut stats = self.stats.lock().clone();
        stats.in_flight = self.in_flight.len();
        stats.pending = self.pending.lock().len();
        stats.max_in_flight = self.max_in_flight.load(Ordering::Acquire);
        stats
    }
}

impl Responder for MemoryChannel {
    fn finish(&self, id: &MessageId) {
        match self.in_flight.remove(id) {
            Some(_) => self.stats.lock().finished += 1,
            None => debug!(channel = %self.name, message_id = %id, "Finish for unknown message"),
        }
    }

    fn requeue(&self, id: &MessageId, delay: Duration) {
        let Some((_, mut item)) = self.in_flight.remove(id) else {
            debug!(channel = %self.name, message_id = %id, "Requeue for unknown message");
            return;
        };
        {
            let mut stats = self.stats.lock();
            stats.requeued += 1;
            stats.last_requeue_delay = Some(delay);
        }
        item.attempts = item.attempts.saturating_add(1);

        let Some(this) = self.this.upgrade() else {
            return;
        };
        if delay.is_zero() {
            this.dispatch(item);
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    this.dispatch(item);
                });
            }
            Err(_) => this.dispatch(item),
        }
    }

    fn touch(&self, id: &MessageId) {
        if self.in_flight.contains_key(id) {
            self.stats.lock().touched += 1;
        }
    }
}

/// Internal topic state
#[derive(Default)]
struct TopicData {
    /// Messages published before any channel existed
    backlog: VecDeque<Bytes>,
    channels: HashMap<String, Arc<MemoryChannel>>,
}

#[derive(Default)]
struct NodeState {
    failing: bool,
    open_connections: usize,
    published: Vec<(String, Bytes)>,
}

struct ClusterInner {
    nodes: DashMap<String, NodeState>,
    /// Node addresses in registration order
    order: Mutex<Vec<String>>,
    lookup_failing: AtomicBool,
    topics: DashMap<String, TopicData>,
}

impl ClusterInner {
    fn deliver(&self, topic: &str, body: Bytes) {
        let channels: Vec<Arc<MemoryChannel>> = {
            let mut topic_data = self.topics.entry(topic.to_string()).or_default();
            if topic_data.channels.is_empty() {
                topic_data.backlog.push_back(body);
                return;
            }
            topic_data.channels.values().cloned().collect()
        };

        for channel in channels {
            channel.dispatch(Pending::new(body.clone()));
        }
    }

    fn channel(&self, topic: &str, name: &str) -> Arc<MemoryChannel> {
        let mut topic_data = self.topics.entry(topic.to_string()).or_default();
        if let Some(channel) = topic_data.channels.get(name) {
            return channel.clone();
        }

        let channel = MemoryChannel::new(topic, name);
        {
            let mut pending = channel.pending.lock();
            pending.extend(topic_data.backlog.drain(..).map(Pending::new));
        }
        topic_data.channels.insert(name.to_string(), channel.clone());
        info!(topic = %topic, channel = %name, "Channel created");
        channel
    }

    /// Record a publish on a node, failing if the node is gone or failing
    fn record(&self, address: &str, topic: &str, body: &Bytes) -> Result<()> {
        match self.nodes.get_mut(address) {
            None => Err(Error::connection(address, "node is gone")),
            Some(node) if node.failing => Err(Error::connection(address, "node unavailable")),
            Some(mut node) => {
                node.published.push((topic.to_string(), body.clone()));
                Ok(())
            }
        }
    }
}

/// In-memory cluster of broker nodes
#[derive(Clone)]
pub struct MemoryCluster {
    inner: Arc<ClusterInner>,
}

impl MemoryCluster {
    /// Create an empty cluster
    pub fn new() -> Self {
        info!("Initializing in-memory cluster");
        Self {
            inner: Arc::new(ClusterInner {
                nodes: DashMap::new(),
                order: Mutex::new(Vec::new()),
                lookup_failing: AtomicBool::new(false),
                topics: DashMap::new(),
            }),
        }
    }

    /// Create a cluster with the given nodes
    pub fn with_nodes<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let cluster = Self::new();
        for address in addresses {
            cluster.add_node(address);
        }
        cluster
    }

    /// Register a node; it shows up in the next lookup
    pub fn add_node(&self, address: impl Into<String>) {
        let address = address.into();
        if self.inner.nodes.contains_key(&address) {
            return;
        }
        self.inner.nodes.insert(address.clone(), NodeState::default());
        self.inner.order.lock().push(address.clone());
        info!(address = %address, "Node added");
    }

    /// Remove a node; publishes through its open connections start failing
    pub fn remove_node(&self, address: &str) {
        self.inner.nodes.remove(address);
        self.inner.order.lock().retain(|a| a != address);
        info!(address = %address, "Node removed");
    }

    /// Make publishes through a node fail (or succeed again)
    pub fn set_node_failing(&self, address: &str, failing: bool) {
        if let Some(mut node) = self.inner.nodes.get_mut(address) {
            node.failing = failing;
        }
    }

    /// Make the directory service fail (or answer again)
    pub fn set_lookup_failing(&self, failing: bool) {
        self.inner.lookup_failing.store(failing, Ordering::Release);
    }

    /// Publish directly to a topic, bypassing producer connections
    pub fn inject(&self, topic: &str, body: impl Into<Bytes>) {
        self.inner.deliver(topic, body.into());
    }

    /// Push a reader error to the current subscriber of a channel
    pub fn inject_reader_error(&self, topic: &str, channel: &str, error: impl Into<String>) {
        self.inner.channel(topic, channel).report_error(error.into());
    }

    /// Everything published through a node, in order
    pub fn published(&self, address: &str) -> Vec<(String, Bytes)> {
        self.inner
            .nodes
            .get(address)
            .map(|node| node.published.clone())
            .unwrap_or_default()
    }

    /// Producer connections currently open to a node
    pub fn open_connections(&self, address: &str) -> usize {
        self.inner
            .nodes
            .get(address)
            .map(|node| node.open_connections)
            .unwrap_or(0)
    }

    /// Counters for a channel, if it exists
    pub fn channel_stats(&self, topic: &str, channel: &str) -> Option<ChannelStats> {
        self.inner
            .topics
            .get(topic)
            .and_then(|t| t.channels.get(channel).map(|c| c.stats()))
    }
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

/// Producer connection to one in-memory node
struct MemoryConnection {
    cluster: Arc<ClusterInner>,
    address: String,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::connection(&self.address, "connection closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn address(&self) -> &str {
        &self.address
    }

    async fn publish(&self, topic: &str, body: Bytes) -> Result<()> {
        self.check_open()?;
        self.cluster.record(&self.address, topic, &body)?;
        self.cluster.deliver(topic, body);

        debug!(address = %self.address, topic = %topic, "Message published");
        Ok(())
    }

    async fn deferred_publish(&self, topic: &str, body: Bytes, delay: Duration) -> Result<()> {
        self.check_open()?;
        self.cluster.record(&self.address, topic, &body)?;

        let cluster = Arc::clone(&self.cluster);
        let topic_name = topic.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            cluster.deliver(&topic_name, body);
        });

        debug!(
            address = %self.address,
            topic = %topic,
            delay_ms = delay.as_millis() as u64,
            "Deferred message published"
        );
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mut node) = self.cluster.nodes.get_mut(&self.address) {
            node.open_connections = node.open_connections.saturating_sub(1);
        }
        debug!(address = %self.address, "Connection closed");
    }
}

#[async_trait]
impl Connector for MemoryCluster {
    async fn connect(&self, address: &str) -> Result<Arc<dyn Connection>> {
        match self.inner.nodes.get_mut(address) {
            Some(mut node) => node.open_connections += 1,
            None => return Err(Error::connection(address, "connection refused")),
        }

        Ok(Arc::new(MemoryConnection {
            cluster: Arc::clone(&self.inner),
            address: address.to_string(),
            closed: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl Lookup for MemoryCluster {
    async fn nodes(&self) -> Result<Vec<String>> {
        if self.inner.lookup_failing.load(Ordering::Acquire) {
            return Err(Error::Discovery("lookupd unavailable".to_string()));
        }
        Ok(self.inner.order.lock().clone())
    }
}

#[async_trait]
impl Subscriber for MemoryCluster {
    async fn subscribe(
        &self,
        topic: &str,
        channel: &str,
        config: SubscribeConfig,
    ) -> Result<Subscription> {
        let memory_channel = self.inner.channel(topic, channel);
        memory_channel
            .max_attempts
            .store(config.max_attempts, Ordering::Release);
        memory_channel
            .max_in_flight
            .store(config.max_in_flight, Ordering::Release);
        *memory_channel.discard_handler.lock() = config.discard_handler;

        let (tx, rx) = mpsc::unbounded_channel();
        let generation = memory_channel.attach(tx);
        info!(topic = %topic, channel = %channel, "Subscribed");

        let weak = Arc::downgrade(&memory_channel);
        Ok(Subscription::new(rx, move || {
            if let Some(memory_channel) = weak.upgrade() {
                memory_channel.detach(generation);
            }
        }))
    }
}
