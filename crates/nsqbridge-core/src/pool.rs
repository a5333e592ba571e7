//! Connection pool
//!
//! Owns the producer connections to broker nodes. Membership follows the
//! directory service: one round runs on connect, then a background task
//! refreshes on the configured interval.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use nsqbridge_transport::{Connection, Connector, Lookup};
use nsqbridge_types::{ConnectionFailure, Error, PublishOptions, PublishOutcome, Result, Strategy};
use parking_lot::RwLock;
use tokio::sync::{Mutex, RwLock as GateLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::strategy::Dispatcher;

/// Pool of producer connections
pub struct ConnectionPool {
    lookup: Arc<dyn Lookup>,
    connector: Arc<dyn Connector>,
    dispatcher: Dispatcher,
    /// Current connections, in directory order
    connections: RwLock<Vec<Arc<dyn Connection>>>,
    /// Held shared by publishes and refreshes, exclusively by close.
    /// `true` once closed.
    gate: GateLock<bool>,
    /// Serializes refresh rounds
    refresh_lock: Mutex<()>,
    cancel: CancellationToken,
}

impl ConnectionPool {
    /// Run one discovery round and start background refreshes
    ///
    /// Resolves even if no connection could be opened.
    pub async fn connect(
        lookup: Arc<dyn Lookup>,
        connector: Arc<dyn Connector>,
        strategy: Strategy,
        poll_interval: Duration,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            lookup,
            connector,
            dispatcher: Dispatcher::new(strategy),
            connections: RwLock::new(Vec::new()),
            gate: GateLock::new(false),
            refresh_lock: Mutex::new(()),
            cancel: CancellationToken::new(),
        });

        // Failures are logged inside; the pool stays usable
        let _ = pool.refresh().await;
        pool.spawn_discovery(poll_interval);

        info!(
            strategy = ?strategy,
            connections = pool.len(),
            "Connection pool ready"
        );
        pool
    }

    fn spawn_discovery(self: &Arc<Self>, poll_interval: Duration) {
        let pool = Arc::downgrade(self);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval.max(Duration::from_millis(1)));
            // The first tick fires immediately; connect already ran that round
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let Some(pool) = pool.upgrade() else { return };
                        let _ = pool.refresh().await;
                    }
                }
            }
        });
    }

    /// Reconcile connections with the directory's current node list
    ///
    /// On lookup failure the previous connections stay in effect.
    pub async fn refresh(&self) -> Result<usize> {
        let closed = self.gate.read().await;
        if *closed {
            return Err(Error::PoolClosed);
        }
        let _round = self.refresh_lock.lock().await;

        let addresses = match self.lookup.nodes().await {
            Ok(addresses) => addresses,
            Err(e) => {
                error!(error = %e, "Discovery failed, keeping previous connections");
                return Err(e);
            }
        };

        let current = self.connections.read().clone();
        let (mut next, stale): (Vec<_>, Vec<_>) = current
            .into_iter()
            .partition(|c| addresses.iter().any(|a| a == c.address()));

        for address in &addresses {
            if next.iter().any(|c| c.address() == address) {
                continue;
            }
            match self.connector.connect(address).await {
                Ok(connection) => {
                    info!(address = %address, "Connected to broker node");
                    next.push(connection);
                }
                Err(e) => {
                    warn!(address = %address, error = %e, "Failed to connect to broker node");
                }
            }
        }
        next.sort_by_key(|c| addresses.iter().position(|a| a == c.address()));

        let count = next.len();
        *self.connections.write() = next;

        for connection in stale {
            info!(address = %connection.address(), "Broker node left, closing connection");
            connection.close().await;
        }

        debug!(connections = count, "Discovery round complete");
        Ok(count)
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Addresses of the live connections, in dispatch order
    pub fn addresses(&self) -> Vec<String> {
        self.connections
            .read()
            .iter()
            .map(|c| c.address().to_string())
            .collect()
    }

    pub fn strategy(&self) -> Strategy {
        self.dispatcher.strategy()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Publish a body to the connection(s) picked by the strategy
    pub async fn publish(
        &self,
        topic: &str,
        body: Bytes,
        options: &PublishOptions,
    ) -> Result<PublishOutcome> {
        let closed = self.gate.read().await;
        if *closed {
            return Err(Error::PoolClosed);
        }

        let targets = {
            let connections = self.connections.read();
            self.dispatcher.select(connections.as_slice())
        };
        let Some(targets) = targets else {
            error!(topic = %topic, "No broker connection available");
            return Err(Error::NoConnection(topic.to_string()));
        };

        self.send_to(&targets, topic, body, options).await
    }

    /// Publish a body to explicit targets
    pub async fn publish_to(
        &self,
        targets: &[Arc<dyn Connection>],
        topic: &str,
        body: Bytes,
        options: &PublishOptions,
    ) -> Result<PublishOutcome> {
        let closed = self.gate.read().await;
        if *closed {
            return Err(Error::PoolClosed);
        }
        self.send_to(targets, topic, body, options).await
    }

    /// Caller holds the gate
    async fn send_to(
        &self,
        targets: &[Arc<dyn Connection>],
        topic: &str,
        body: Bytes,
        options: &PublishOptions,
    ) -> Result<PublishOutcome> {
        if targets.is_empty() {
            return Err(Error::NoConnection(topic.to_string()));
        }

        let sends = targets
            .iter()
            .map(|connection| publish_one(connection.as_ref(), topic, body.clone(), options));
        let results = join_all(sends).await;

        let mut delivered = Vec::new();
        let mut failures = Vec::new();
        for (connection, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => delivered.push(connection.address().to_string()),
                Err(e) => {
                    warn!(
                        topic = %topic,
                        address = %connection.address(),
                        error = %e,
                        "Publish failed on connection"
                    );
                    failures.push(ConnectionFailure::new(connection.address(), &e));
                }
            }
        }

        match PublishOutcome::from_results(delivered, failures.clone()) {
            Some(outcome) => {
                debug!(topic = %topic, partial = outcome.is_partial(), "Message published");
                Ok(outcome)
            }
            None => {
                error!(topic = %topic, failed = failures.len(), "Publish failed on every connection");
                Err(Error::PublishFailed {
                    topic: topic.to_string(),
                    failures,
                })
            }
        }
    }

    /// Close every connection and stop discovery; idempotent
    ///
    /// Waits for in-flight publishes to finish first.
    pub async fn close(&self) {
        let mut closed = self.gate.write().await;
        if *closed {
            return;
        }
        *closed = true;
        self.cancel.cancel();

        let connections = std::mem::take(&mut *self.connections.write());
        for connection in connections {
            connection.close().await;
        }
        info!("Connection pool closed");
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

const RETRY_BACKOFF: Duration = Duration::from_millis(100);
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// Wait before retry number `attempt + 1`, doubling from 100ms up to 2s
fn retry_backoff(attempt: u32) -> Duration {
    RETRY_BACKOFF
        .saturating_mul(1 << attempt.min(5))
        .min(MAX_RETRY_BACKOFF)
}

async fn publish_one(
    connection: &dyn Connection,
    topic: &str,
    body: Bytes,
    options: &PublishOptions,
) -> Result<()> {
    let mut attempt = 0;
    loop {
        let result = match options.delay {
            Some(delay) => {
                connection
                    .deferred_publish(topic, body.clone(), delay)
                    .await
            }
            None => connection.publish(topic, body.clone()).await,
        };

        match result {
            Err(e) if attempt < options.retries => {
                let backoff = retry_backoff(attempt);
                attempt += 1;
                debug!(
                    address = %connection.address(),
                    topic = %topic,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Retrying publish"
                );
                tokio::time::sleep(backoff).await;
            }
            other => return other,
        }
    }
}
