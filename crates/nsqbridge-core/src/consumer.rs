//! Consumption state machine
//!
//! Each delivery moves through
//! `Received -> Deserializing -> HandlerInvoked -> Finished | Requeued`.
//! Handler failures of every shape end in a requeue; nothing escapes the
//! pipeline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nsqbridge_transport::{RawMessage, Subscription, SubscriptionEvent};
use nsqbridge_types::{decode, DeliveryContext, MessageId, Payload, Result};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use crate::handler::invoke;
use crate::registry::Binding;

/// Single-use acknowledgment token for one delivery
///
/// `finish` and `requeue` consume the token, so a delivery can be settled
/// only once.
#[derive(Debug)]
pub struct InboundMessage {
    raw: RawMessage,
}

impl InboundMessage {
    pub fn new(raw: RawMessage) -> Self {
        Self { raw }
    }

    pub fn id(&self) -> &MessageId {
        self.raw.id()
    }

    pub fn attempts(&self) -> u16 {
        self.raw.attempts()
    }

    pub fn body(&self) -> &Bytes {
        self.raw.body()
    }

    /// Ask the broker for more time
    pub fn touch(&self) -> Result<()> {
        self.raw.touch()
    }

    pub fn finish(self) -> Result<()> {
        self.raw.finish()
    }

    pub fn requeue(self, delay: Duration) -> Result<()> {
        self.raw.requeue(delay)
    }
}

/// Lifecycle of a single delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Received,
    Deserializing,
    HandlerInvoked,
    Finished,
    Requeued,
}

/// Drive one delivery to its terminal state
pub async fn process(
    binding: &Binding,
    message: InboundMessage,
    requeue_delay: Duration,
) -> DeliveryState {
    let topic = binding.topic();
    let channel = binding.channel();
    trace!(topic = %topic, channel = %channel, message_id = %message.id(), state = ?DeliveryState::Received);

    trace!(message_id = %message.id(), state = ?DeliveryState::Deserializing);
    let packet = decode(message.id().clone(), message.body(), (topic, channel));
    if let Payload::Raw(_) = packet.data {
        debug!(
            topic = %topic,
            channel = %channel,
            message_id = %packet.id,
            "Body is not JSON, passing raw payload"
        );
    }
    let ctx = DeliveryContext::new(topic, channel, packet.id.clone(), message.attempts());

    trace!(message_id = %packet.id, state = ?DeliveryState::HandlerInvoked);
    let (state, settled) = match invoke(binding.handler(), packet.data, ctx).await {
        Ok(_) => (DeliveryState::Finished, message.finish()),
        Err(e) => {
            warn!(
                topic = %topic,
                channel = %channel,
                message_id = %packet.id,
                attempts = message.attempts(),
                delay_ms = requeue_delay.as_millis() as u64,
                error = %e,
                "Handler failed, requeueing message"
            );
            (DeliveryState::Requeued, message.requeue(requeue_delay))
        }
    };

    if let Err(e) = settled {
        error!(
            topic = %topic,
            channel = %channel,
            message_id = %packet.id,
            error = %e,
            "Message was settled twice"
        );
    }
    debug!(topic = %topic, channel = %channel, message_id = %packet.id, state = ?state, "Delivery settled");
    state
}

/// Deliveries currently inside a handler
///
/// Keyed per delivery; a redelivery of the same message gets its own entry.
#[derive(Clone, Default)]
pub(crate) struct InFlight {
    next: Arc<AtomicU64>,
    entries: Arc<Mutex<HashMap<u64, (Arc<Binding>, MessageId)>>>,
}

impl InFlight {
    fn insert(&self, binding: Arc<Binding>, id: MessageId) -> u64 {
        let key = self.next.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().insert(key, (binding, id));
        key
    }

    fn remove(&self, key: u64) {
        self.entries.lock().remove(&key);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// (topic, channel, message id) of every unsettled delivery
    pub(crate) fn snapshot(&self) -> Vec<(String, String, MessageId)> {
        self.entries
            .lock()
            .values()
            .map(|(binding, id)| {
                (
                    binding.topic().to_string(),
                    binding.channel().to_string(),
                    id.clone(),
                )
            })
            .collect()
    }
}

/// Consumes one binding's subscription
///
/// Deliveries run concurrently, up to `max_in_flight` at a time.
pub(crate) struct BindingWorker {
    binding: Arc<Binding>,
    subscription: Subscription,
    requeue_delay: Duration,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    in_flight: InFlight,
}

impl BindingWorker {
    pub(crate) fn new(
        binding: Arc<Binding>,
        subscription: Subscription,
        requeue_delay: Duration,
        max_in_flight: usize,
        cancel: CancellationToken,
        tracker: TaskTracker,
        in_flight: InFlight,
    ) -> Self {
        Self {
            binding,
            subscription,
            requeue_delay,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            cancel,
            tracker,
            in_flight,
        }
    }

    /// Run until cancelled or the subscription ends
    ///
    /// On the way out, intake stops and every delivery not yet handed to a
    /// handler is requeued for immediate redelivery. The subscription is
    /// handed back so the caller can close it once handlers have settled.
    pub(crate) async fn run(mut self) -> Subscription {
        let topic = self.binding.topic().to_string();
        let channel = self.binding.channel().to_string();
        let mut waiting = None;

        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                event = self.subscription.next() => event,
            };

            let raw = match event {
                Some(SubscriptionEvent::Message(raw)) => raw,
                Some(SubscriptionEvent::Error(e)) => {
                    error!(topic = %topic, channel = %channel, error = %e, "Consumer reader error");
                    continue;
                }
                None => {
                    info!(topic = %topic, channel = %channel, "Subscription ended");
                    break;
                }
            };

            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    waiting = Some(raw);
                    break;
                }
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        waiting = Some(raw);
                        break;
                    }
                },
            };

            let binding = Arc::clone(&self.binding);
            let requeue_delay = self.requeue_delay;
            let in_flight = self.in_flight.clone();
            let key = in_flight.insert(Arc::clone(&binding), raw.id().clone());
            self.tracker.spawn(async move {
                let _permit = permit;
                process(&binding, InboundMessage::new(raw), requeue_delay).await;
                in_flight.remove(key);
            });
        }

        self.subscription.stop_intake();
        let mut released = 0usize;
        if let Some(raw) = waiting {
            self.release(raw);
            released += 1;
        }
        while let Some(event) = self.subscription.try_next() {
            if let SubscriptionEvent::Message(raw) = event {
                self.release(raw);
                released += 1;
            }
        }

        debug!(topic = %topic, channel = %channel, released, "Binding worker stopped");
        self.subscription
    }

    /// Hand an unprocessed delivery back to the broker
    fn release(&self, raw: RawMessage) {
        if let Err(e) = raw.requeue(Duration::ZERO) {
            error!(
                topic = %self.binding.topic(),
                channel = %self.binding.channel(),
                message_id = %raw.id(),
                error = %e,
                "Failed to release message"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerResponse;
    use crate::registry::BindingRegistry;
    use nsqbridge_transport::Responder;
    use nsqbridge_types::{BindingOptions, BoxError, NsqOptions};
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Finish,
        Requeue(Duration),
    }

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<Call>>,
    }

    impl Responder for Recorder {
        fn finish(&self, _id: &MessageId) {
            self.calls.lock().push(Call::Finish);
        }

        fn requeue(&self, _id: &MessageId, delay: Duration) {
            self.calls.lock().push(Call::Requeue(delay));
        }

        fn touch(&self, _id: &MessageId) {}
    }

    fn binding<H: crate::handler::Handler>(handler: H, options: BindingOptions) -> Arc<Binding> {
        let mut builder = BindingRegistry::builder();
        builder.event("topic01", "channel01", handler, options).unwrap();
        let registry = builder.build();
        let binding = registry.get("topic01", "channel01").unwrap();
        Arc::clone(binding)
    }

    async fn deliver<H: crate::handler::Handler>(
        handler: H,
        body: &'static [u8],
    ) -> (DeliveryState, Vec<Call>) {
        deliver_with(handler, BindingOptions::default(), body).await
    }

    async fn deliver_with<H: crate::handler::Handler>(
        handler: H,
        options: BindingOptions,
        body: &'static [u8],
    ) -> (DeliveryState, Vec<Call>) {
        let recorder = Arc::new(Recorder::default());
        let raw = RawMessage::new(
            MessageId::from("0123456789abcdef"),
            1,
            Bytes::from_static(body),
            recorder.clone(),
        );
        let binding = binding(handler, options);
        let delay = binding.requeue_delay(&NsqOptions::default());

        let state = process(&binding, InboundMessage::new(raw), delay).await;
        let calls = recorder.calls.lock().clone();
        (state, calls)
    }

    const BODY: &[u8] = br#"{"eventId":"e1"}"#;
    const DEFAULT_DELAY: Duration = Duration::from_millis(90_000);

    type HandlerResult = std::result::Result<HandlerResponse, BoxError>;

    #[tokio::test]
    async fn test_success_shapes_finish_once() {
        let sync = |_: Payload, _: DeliveryContext| -> HandlerResult {
            Ok(HandlerResponse::value("Event: Ok"))
        };
        let deferred = |_: Payload, _: DeliveryContext| -> HandlerResult {
            Ok(HandlerResponse::deferred(async {
                tokio::task::yield_now().await;
                Ok::<_, BoxError>(json!("done"))
            }))
        };
        let stream = |_: Payload, _: DeliveryContext| -> HandlerResult {
            let items: Vec<std::result::Result<Value, BoxError>> = vec![Ok(json!(1)), Ok(json!(2))];
            Ok(HandlerResponse::stream(futures::stream::iter(items)))
        };

        assert_eq!(deliver(sync, BODY).await, (DeliveryState::Finished, vec![Call::Finish]));
        assert_eq!(deliver(deferred, BODY).await, (DeliveryState::Finished, vec![Call::Finish]));
        assert_eq!(deliver(stream, BODY).await, (DeliveryState::Finished, vec![Call::Finish]));
    }

    #[tokio::test]
    async fn test_failure_shapes_requeue_once_with_default_delay() {
        let thrown = |_: Payload, _: DeliveryContext| -> HandlerResult {
            Err("a thrown error for test".into())
        };
        let rejected = |_: Payload, _: DeliveryContext| -> HandlerResult {
            Ok(HandlerResponse::deferred(async {
                Err::<Value, BoxError>("rejected".into())
            }))
        };
        let stream_error = |_: Payload, _: DeliveryContext| -> HandlerResult {
            let items: Vec<std::result::Result<Value, BoxError>> = vec![Err("stream error".into())];
            Ok(HandlerResponse::stream(futures::stream::iter(items)))
        };

        let expected = (DeliveryState::Requeued, vec![Call::Requeue(DEFAULT_DELAY)]);
        assert_eq!(deliver(thrown, BODY).await, expected);
        assert_eq!(deliver(rejected, BODY).await, expected);
        assert_eq!(deliver(stream_error, BODY).await, expected);
    }

    #[tokio::test]
    async fn test_configured_requeue_delay() {
        let thrown = |_: Payload, _: DeliveryContext| -> HandlerResult { Err("nope".into()) };
        let options = BindingOptions::new().with_requeue_delay(Duration::from_millis(1500));

        let (state, calls) = deliver_with(thrown, options, BODY).await;
        assert_eq!(state, DeliveryState::Requeued);
        assert_eq!(calls, vec![Call::Requeue(Duration::from_millis(1500))]);
    }

    #[tokio::test]
    async fn test_empty_stream_finishes() {
        let empty = |_: Payload, _: DeliveryContext| -> HandlerResult { Ok(HandlerResponse::empty()) };
        assert_eq!(deliver(empty, BODY).await, (DeliveryState::Finished, vec![Call::Finish]));
    }

    #[tokio::test]
    async fn test_panicking_handler_is_requeued() {
        let panics = |_: Payload, _: DeliveryContext| -> HandlerResult { panic!("handler bug") };
        let (state, calls) = deliver(panics, BODY).await;
        assert_eq!(state, DeliveryState::Requeued);
        assert_eq!(calls, vec![Call::Requeue(DEFAULT_DELAY)]);
    }

    #[tokio::test]
    async fn test_unparseable_body_reaches_handler_raw() {
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let handler = move |data: Payload, ctx: DeliveryContext| -> HandlerResult {
            *sink.lock() = Some((data, ctx));
            Ok(HandlerResponse::value(Value::Null))
        };

        let (state, _) = deliver(handler, b"not { json").await;
        assert_eq!(state, DeliveryState::Finished);

        let (data, ctx) = seen.lock().take().unwrap();
        assert_eq!(data, Payload::Raw(Bytes::from_static(b"not { json")));
        assert_eq!(ctx.topic(), "topic01");
        assert_eq!(ctx.channel(), "channel01");
        assert_eq!(ctx.message_id().as_str(), "0123456789abcdef");
        assert_eq!(ctx.attempts(), 1);
    }

    #[test]
    fn test_settled_message_rejects_second_ack() {
        let recorder = Arc::new(Recorder::default());
        let raw = RawMessage::new(MessageId::from("m"), 1, Bytes::new(), recorder.clone());
        raw.finish().unwrap();

        let message = InboundMessage::new(raw);
        assert!(message.touch().is_err());
        assert!(message.requeue(Duration::ZERO).is_err());
        assert_eq!(*recorder.calls.lock(), vec![Call::Finish]);
    }
}
