//! Server - inbound side of the engine
//!
//! Subscribes every registered binding and runs one worker per binding.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use nsqbridge_transport::{SubscribeConfig, Subscriber, Subscription};
use nsqbridge_types::{DiscardHandler, DiscardedMessage, Error, NsqOptions, Result};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::consumer::{BindingWorker, InFlight};
use crate::registry::BindingRegistry;

/// Consumes broker deliveries on behalf of registered handlers
pub struct Server {
    options: NsqOptions,
    registry: Arc<BindingRegistry>,
    subscriber: Arc<dyn Subscriber>,
    /// Used by bindings that do not set their own
    discard_handler: Option<DiscardHandler>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    in_flight: InFlight,
    workers: Mutex<Vec<JoinHandle<Subscription>>>,
    started: AtomicBool,
}

impl Server {
    pub fn new(
        options: NsqOptions,
        registry: BindingRegistry,
        subscriber: Arc<dyn Subscriber>,
    ) -> Self {
        info!(bindings = registry.len(), "Initializing NsqBridge server");
        Self {
            options,
            registry: Arc::new(registry),
            subscriber,
            discard_handler: None,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            in_flight: InFlight::default(),
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Server-wide discard callback
    pub fn with_discard_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(DiscardedMessage) + Send + Sync + 'static,
    {
        self.discard_handler = Some(Arc::new(handler));
        self
    }

    pub fn registry(&self) -> &BindingRegistry {
        &self.registry
    }

    pub fn options(&self) -> &NsqOptions {
        &self.options
    }

    /// Subscribe every binding, start the workers, then call `on_ready`
    ///
    /// If a subscription fails, the bindings already started are shut down
    /// before the error is returned and the server cannot be started again.
    pub async fn start<F: FnOnce()>(&self, on_ready: F) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyStarted);
        }

        let mut workers = self.workers.lock().await;
        for binding in self.registry.iter() {
            let config = SubscribeConfig {
                max_in_flight: binding.max_in_flight(&self.options),
                max_attempts: binding.max_attempts(&self.options),
                discard_handler: binding
                    .discard_handler()
                    .or(self.discard_handler.as_ref())
                    .cloned(),
            };
            let max_in_flight = config.max_in_flight;

            let subscription = match self
                .subscriber
                .subscribe(binding.topic(), binding.channel(), config)
                .await
            {
                Ok(subscription) => subscription,
                Err(e) => {
                    error!(
                        topic = %binding.topic(),
                        channel = %binding.channel(),
                        error = %e,
                        "Failed to subscribe binding"
                    );
                    let spawned = std::mem::take(&mut *workers);
                    drop(workers);
                    self.shutdown(spawned).await;
                    return Err(e);
                }
            };

            let worker = BindingWorker::new(
                Arc::clone(binding),
                subscription,
                binding.requeue_delay(&self.options),
                max_in_flight,
                self.cancel.clone(),
                self.tracker.clone(),
                self.in_flight.clone(),
            );
            workers.push(tokio::spawn(worker.run()));

            info!(
                topic = %binding.topic(),
                channel = %binding.channel(),
                max_in_flight,
                "Binding subscribed"
            );
        }
        drop(workers);

        info!("NsqBridge server started");
        on_ready();
        Ok(())
    }

    /// Stop intake, give running handlers up to the drain timeout to
    /// settle, then close every subscription; idempotent
    pub async fn close(&self) {
        let workers = std::mem::take(&mut *self.workers.lock().await);
        self.shutdown(workers).await;
        info!("NsqBridge server closed");
    }

    async fn shutdown(&self, workers: Vec<JoinHandle<Subscription>>) {
        self.cancel.cancel();

        let mut subscriptions = Vec::with_capacity(workers.len());
        for worker in workers {
            match worker.await {
                Ok(subscription) => subscriptions.push(subscription),
                Err(e) => error!(error = %e, "Binding worker failed"),
            }
        }

        self.tracker.close();
        let timeout = self.options.drain_timeout();
        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
            for (topic, channel, message_id) in self.in_flight.snapshot() {
                warn!(
                    topic = %topic,
                    channel = %channel,
                    message_id = %message_id,
                    "Delivery still unsettled at shutdown"
                );
            }
            warn!(
                timeout_ms = timeout.as_millis() as u64,
                unsettled = self.in_flight.len(),
                "Drain timed out, closing subscriptions anyway"
            );
        }

        for mut subscription in subscriptions {
            subscription.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerResponse;
    use nsqbridge_transport::MemoryCluster;
    use nsqbridge_types::{BindingOptions, BoxError, DeliveryContext, Payload};
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    type HandlerResult = std::result::Result<HandlerResponse, BoxError>;

    async fn eventually(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    fn server(cluster: &MemoryCluster, registry: BindingRegistry) -> Server {
        Server::new(NsqOptions::default(), registry, Arc::new(cluster.clone()))
    }

    #[tokio::test]
    async fn test_start_calls_on_ready_and_delivers() {
        let cluster = MemoryCluster::new();
        let seen = Arc::new(SyncMutex::new(Vec::new()));
        let sink = seen.clone();

        let mut builder = BindingRegistry::builder();
        builder
            .event(
                "topic01",
                "channel01",
                move |data: Payload, ctx: DeliveryContext| -> HandlerResult {
                    sink.lock().push((data, ctx.topic().to_string()));
                    Ok(HandlerResponse::value("Event: Ok"))
                },
                BindingOptions::default(),
            )
            .unwrap();
        let server = server(&cluster, builder.build());

        let mut ready = false;
        server.start(|| ready = true).await.unwrap();
        assert!(ready);

        cluster.inject("topic01", r#"{"eventId":"e1","foo":"bar"}"#);
        eventually(|| {
            cluster
                .channel_stats("topic01", "channel01")
                .map(|s| s.finished == 1)
                .unwrap_or(false)
        })
        .await;

        let seen = seen.lock();
        assert_eq!(seen[0].1, "topic01");
        assert_eq!(
            seen[0].0,
            Payload::Json(serde_json::json!({"eventId": "e1", "foo": "bar"}))
        );
        server.close().await;
    }

    #[tokio::test]
    async fn test_failing_handler_requeues_with_binding_delay() {
        let cluster = MemoryCluster::new();
        let mut builder = BindingRegistry::builder();
        builder
            .event(
                "t",
                "c",
                |_: Payload, _: DeliveryContext| -> HandlerResult { Err("boom".into()) },
                BindingOptions::new().with_requeue_delay(Duration::from_secs(30)),
            )
            .unwrap();
        let server = server(&cluster, builder.build());
        server.start(|| {}).await.unwrap();

        cluster.inject("t", "{}");
        eventually(|| {
            cluster
                .channel_stats("t", "c")
                .map(|s| s.requeued == 1)
                .unwrap_or(false)
        })
        .await;

        let stats = cluster.channel_stats("t", "c").unwrap();
        assert_eq!(stats.finished, 0);
        assert_eq!(stats.last_requeue_delay, Some(Duration::from_secs(30)));
        server.close().await;
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let cluster = MemoryCluster::new();
        let server = server(&cluster, BindingRegistry::default());

        server.start(|| {}).await.unwrap();
        assert!(matches!(server.start(|| {}).await, Err(Error::AlreadyStarted)));
        server.close().await;
        server.close().await;
    }

    /// Handler that counts its calls and answers after `delay`
    fn slow_handler(
        delay: Duration,
        calls: Arc<AtomicUsize>,
    ) -> impl Fn(Payload, DeliveryContext) -> HandlerResult + Send + Sync + 'static {
        move |_: Payload, _: DeliveryContext| -> HandlerResult {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(HandlerResponse::deferred(async move {
                tokio::time::sleep(delay).await;
                Ok::<_, BoxError>(serde_json::Value::Null)
            }))
        }
    }

    #[tokio::test]
    async fn test_close_waits_for_running_handlers() {
        let cluster = MemoryCluster::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut builder = BindingRegistry::builder();
        builder
            .event(
                "slow",
                "c",
                slow_handler(Duration::from_millis(50), calls.clone()),
                BindingOptions::default(),
            )
            .unwrap();
        let server = server(&cluster, builder.build());
        server.start(|| {}).await.unwrap();

        cluster.inject("slow", "{}");
        eventually(|| calls.load(Ordering::SeqCst) == 1).await;

        server.close().await;
        let stats = cluster.channel_stats("slow", "c").unwrap();
        assert_eq!(stats.finished, 1);
        assert_eq!(stats.requeued, 0);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.pending, 0);
    }

    #[tokio::test]
    async fn test_close_releases_deliveries_not_yet_handled() {
        let cluster = MemoryCluster::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let mut builder = BindingRegistry::builder();
        builder
            .event(
                "busy",
                "c",
                slow_handler(Duration::from_millis(100), calls.clone()),
                BindingOptions::new().with_max_in_flight(1),
            )
            .unwrap();
        let server = server(&cluster, builder.build());
        server.start(|| {}).await.unwrap();
        assert_eq!(cluster.channel_stats("busy", "c").unwrap().max_in_flight, 1);

        for _ in 0..3 {
            cluster.inject("busy", "{}");
        }
        eventually(|| calls.load(Ordering::SeqCst) == 1).await;

        server.close().await;
        let stats = cluster.channel_stats("busy", "c").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(stats.delivered, 3);
        assert_eq!(stats.finished + stats.requeued, stats.delivered);
        assert_eq!(stats.finished, 1);
        assert_eq!(stats.requeued, 2);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.pending, 2);
    }

    #[tokio::test]
    async fn test_close_gives_up_on_stuck_handlers() {
        let cluster = MemoryCluster::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut builder = BindingRegistry::builder();
        builder
            .event(
                "stuck",
                "c",
                move |_: Payload, _: DeliveryContext| -> HandlerResult {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(HandlerResponse::deferred(futures::future::pending()))
                },
                BindingOptions::default(),
            )
            .unwrap();
        let options = NsqOptions {
            drain_timeout_ms: 50,
            ..Default::default()
        };
        let server = Server::new(options, builder.build(), Arc::new(cluster.clone()));
        server.start(|| {}).await.unwrap();

        cluster.inject("stuck", "{}");
        eventually(|| calls.load(Ordering::SeqCst) == 1).await;

        tokio::time::timeout(Duration::from_secs(2), server.close())
            .await
            .expect("close did not return");
        assert_eq!(server.in_flight.len(), 1);

        // Detaching hands the unsettled delivery back to the broker
        let stats = cluster.channel_stats("stuck", "c").unwrap();
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.pending, 1);
    }

    struct FailingSubscriber {
        cluster: MemoryCluster,
        failing_topic: &'static str,
    }

    #[async_trait::async_trait]
    impl Subscriber for FailingSubscriber {
        async fn subscribe(
            &self,
            topic: &str,
            channel: &str,
            config: SubscribeConfig,
        ) -> Result<Subscription> {
            if topic == self.failing_topic {
                return Err(Error::connection("nsqd-1:4150", "subscribe refused"));
            }
            self.cluster.subscribe(topic, channel, config).await
        }
    }

    #[tokio::test]
    async fn test_failed_start_closes_earlier_subscriptions() {
        let cluster = MemoryCluster::new();
        let ok = |_: Payload, _: DeliveryContext| -> HandlerResult { Ok(HandlerResponse::empty()) };
        let mut builder = BindingRegistry::builder();
        builder
            .event("first", "c", ok, BindingOptions::default())
            .unwrap()
            .event("second", "c", ok, BindingOptions::default())
            .unwrap();
        let subscriber = FailingSubscriber {
            cluster: cluster.clone(),
            failing_topic: "second",
        };
        let server = Server::new(NsqOptions::default(), builder.build(), Arc::new(subscriber));

        let mut ready = false;
        let result = server.start(|| ready = true).await;
        assert!(matches!(result, Err(Error::Connection { .. })));
        assert!(!ready);

        cluster.inject("first", "{}");
        let stats = cluster.channel_stats("first", "c").unwrap();
        assert_eq!(stats.delivered, 0);
        assert_eq!(stats.pending, 1);

        assert!(matches!(server.start(|| {}).await, Err(Error::AlreadyStarted)));
        server.close().await;
    }

    #[tokio::test]
    async fn test_server_discard_handler_is_wired_through() {
        let cluster = MemoryCluster::new();
        let discarded = Arc::new(SyncMutex::new(Vec::new()));
        let sink = discarded.clone();

        let mut builder = BindingRegistry::builder();
        builder
            .event(
                "poison",
                "c",
                |_: Payload, _: DeliveryContext| -> HandlerResult { Err("always".into()) },
                BindingOptions::new()
                    .with_max_attempts(2)
                    .with_requeue_delay(Duration::ZERO),
            )
            .unwrap();
        let server = server(&cluster, builder.build())
            .with_discard_handler(move |message| sink.lock().push(message.id));
        server.start(|| {}).await.unwrap();

        cluster.inject("poison", "{}");
        eventually(|| discarded.lock().len() == 1).await;

        let stats = cluster.channel_stats("poison", "c").unwrap();
        assert_eq!(stats.requeued, 2);
        assert_eq!(stats.discarded, 1);
        server.close().await;
    }

    #[tokio::test]
    async fn test_reader_errors_do_not_stop_the_worker() {
        let cluster = MemoryCluster::new();
        let mut builder = BindingRegistry::builder();
        builder
            .event(
                "t",
                "c",
                |_: Payload, _: DeliveryContext| -> HandlerResult { Ok(HandlerResponse::empty()) },
                BindingOptions::default(),
            )
            .unwrap();
        let server = server(&cluster, builder.build());
        server.start(|| {}).await.unwrap();

        cluster.inject_reader_error("t", "c", "connection reset");
        cluster.inject("t", "{}");
        eventually(|| {
            cluster
                .channel_stats("t", "c")
                .map(|s| s.finished == 1)
                .unwrap_or(false)
        })
        .await;
        server.close().await;
    }
}
