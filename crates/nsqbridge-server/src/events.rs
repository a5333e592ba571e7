//! Demo event bindings
//!
//! Two bindings record what they receive so the HTTP API can show it back.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use nsqbridge_core::{HandlerResponse, RegistryBuilder};
use nsqbridge_types::{BindingOptions, BoxError, DeliveryContext, Payload, Result};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;
use utoipa::ToSchema;

/// A handler invocation captured by a demo binding
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RecordedEvent {
    /// Data handed to the handler
    #[schema(value_type = Object)]
    pub payload: Payload,
    /// Delivery the data arrived with
    pub context: DeliveryContext,
    pub received_at: DateTime<Utc>,
}

/// Handler invocations keyed by event id
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<DashMap<String, RecordedEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, event_id: &str) -> Option<RecordedEvent> {
        self.events.get(event_id).map(|e| e.clone())
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    fn record(&self, event_id: &str, payload: &Payload, context: &DeliveryContext) {
        debug!(event_id = %event_id, topic = %context.topic(), "Event recorded");
        self.events.insert(
            event_id.to_string(),
            RecordedEvent {
                payload: payload.clone(),
                context: context.clone(),
                received_at: Utc::now(),
            },
        );
    }
}

/// Register the demo bindings on `topic01/channel01` and `topic04/channel04`
///
/// The first expects `eventId` at the top level of the body. Ids ending in
/// `thrown` fail, ids ending in `return-empty` answer with an empty stream.
/// The second expects it under `data`, as sent by `POST /dispatch`.
pub fn register(builder: &mut RegistryBuilder, log: &EventLog) -> Result<()> {
    let top_level = log.clone();
    builder.event(
        "topic01",
        "channel01",
        move |data: Payload, ctx: DeliveryContext| -> std::result::Result<HandlerResponse, BoxError> {
            let event_id = data
                .get("eventId")
                .and_then(Value::as_str)
                .ok_or("payload has no eventId")?;

            if event_id.ends_with("thrown") {
                return Err("a thrown error for test".into());
            }
            top_level.record(event_id, &data, &ctx);
            if event_id.ends_with("return-empty") {
                return Ok(HandlerResponse::empty());
            }
            Ok(HandlerResponse::value("Event: Ok"))
        },
        BindingOptions::default(),
    )?;

    let nested = log.clone();
    builder.event(
        "topic04",
        "channel04",
        move |data: Payload, ctx: DeliveryContext| -> std::result::Result<HandlerResponse, BoxError> {
            let event_id = data
                .get("data")
                .and_then(|inner| inner.get("eventId"))
                .and_then(Value::as_str);
            if let Some(event_id) = event_id {
                nested.record(event_id, &data, &ctx);
            }
            Ok(HandlerResponse::value("Event: Ok"))
        },
        BindingOptions::default(),
    )?;

    Ok(())
}
