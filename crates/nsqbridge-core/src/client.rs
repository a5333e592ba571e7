//! Client - outbound side of the engine

use std::sync::Arc;

use nsqbridge_transport::{Connector, Lookup};
use nsqbridge_types::{encode, Error, NsqOptions, PublishOptions, PublishOutcome, Result};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use crate::pool::ConnectionPool;

enum ClientState {
    Idle,
    Connected(Arc<ConnectionPool>),
    Closed,
}

/// Publishes application payloads to the broker
///
/// The connection pool is created on first use. Once closed, a client
/// cannot be reconnected.
pub struct Client {
    options: NsqOptions,
    lookup: Arc<dyn Lookup>,
    connector: Arc<dyn Connector>,
    state: Mutex<ClientState>,
}

impl Client {
    pub fn new(options: NsqOptions, lookup: Arc<dyn Lookup>, connector: Arc<dyn Connector>) -> Self {
        Self {
            options,
            lookup,
            connector,
            state: Mutex::new(ClientState::Idle),
        }
    }

    /// Build the connection pool unless one is already open
    pub async fn connect(&self) -> Result<Arc<ConnectionPool>> {
        let mut state = self.state.lock().await;
        match &*state {
            ClientState::Connected(pool) => Ok(Arc::clone(pool)),
            ClientState::Closed => Err(Error::PoolClosed),
            ClientState::Idle => {
                info!(
                    lookupd = ?self.options.lookupd_http_addresses,
                    strategy = ?self.options.strategy,
                    "Connecting client"
                );
                let pool = ConnectionPool::connect(
                    Arc::clone(&self.lookup),
                    Arc::clone(&self.connector),
                    self.options.strategy,
                    self.options.lookupd_poll_interval(),
                )
                .await;
                *state = ClientState::Connected(Arc::clone(&pool));
                Ok(pool)
            }
        }
    }

    /// Publish a payload with default metadata
    pub async fn publish(&self, topic: &str, payload: Value) -> Result<PublishOutcome> {
        self.publish_with_meta(topic, payload, None).await
    }

    /// Publish a payload, merging `meta` into the envelope metadata
    #[instrument(skip(self, payload, meta))]
    pub async fn publish_with_meta(
        &self,
        topic: &str,
        payload: Value,
        meta: Option<Map<String, Value>>,
    ) -> Result<PublishOutcome> {
        let pool = self.connect().await?;

        let envelope = encode(payload, meta);
        let options = PublishOptions::from_map(&envelope.options);
        let body = envelope.to_body()?;

        debug!(
            transaction_id = ?envelope.meta.transaction_id,
            bytes = body.len(),
            "Publishing envelope"
        );
        pool.publish(topic, body, &options).await
    }

    /// Close the pool; idempotent
    pub async fn close(&self) {
        let previous = std::mem::replace(&mut *self.state.lock().await, ClientState::Closed);
        if let ClientState::Connected(pool) = previous {
            pool.close().await;
            info!("Client closed");
        }
    }
}
