//! NsqBridge Server - demo host application
//!
//! Dispatches events over HTTP through the bridge client and consumes them
//! with the bridge server, both backed by the in-memory cluster.

mod events;

use std::sync::Arc;

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use nsqbridge_core::{BindingRegistry, Client, Server};
use nsqbridge_transport::MemoryCluster;
use nsqbridge_types::{
    ConnectionFailure, DeliveryContext, Error, MessageId, NsqOptions, PublishOutcome, Strategy,
};
use serde::Serialize;
use serde_json::Value;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

use events::{EventLog, RecordedEvent};

const DEFAULT_ADDR: &str = "127.0.0.1:3000";
const DEFAULT_NODES: &str = "nsqd-1:4150,nsqd-2:4150";

// ==================== App State ====================

/// Shared application state
#[derive(Clone)]
struct AppState {
    client: Arc<Client>,
    cluster: MemoryCluster,
    events: EventLog,
}

// ==================== Request/Response Types ====================

/// Inject response
#[derive(Debug, Serialize, ToSchema)]
struct InjectResponse {
    /// Topic the body was placed on
    topic: String,
}

/// API Error response
#[derive(Debug, Serialize, ToSchema)]
struct ApiErrorBody {
    /// Error message
    error: String,
    /// Error code
    code: String,
}

/// Health check response
#[derive(Debug, Serialize, ToSchema)]
struct HealthResponse {
    /// Health status
    status: String,
    /// Server version
    version: String,
    /// Broker nodes the client is connected to
    connections: Vec<String>,
    /// Handler invocations recorded so far
    recorded_events: usize,
}

// ==================== Error Handling ====================

#[derive(Debug, thiserror::Error)]
enum AppError {
    #[error(transparent)]
    Bridge(#[from] Error),

    #[error("Event not found: {0}")]
    EventNotFound(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, code) = match &self {
            AppError::EventNotFound(_) => (StatusCode::NOT_FOUND, "EVENT_NOT_FOUND"),
            AppError::Bridge(Error::PoolClosed) => (StatusCode::SERVICE_UNAVAILABLE, "POOL_CLOSED"),
            AppError::Bridge(Error::NoConnection(_)) => {
                (StatusCode::SERVICE_UNAVAILABLE, "NO_CONNECTION")
            }
            AppError::Bridge(Error::PublishFailed { .. }) => {
                (StatusCode::BAD_GATEWAY, "PUBLISH_FAILED")
            }
            AppError::Bridge(Error::NotImplemented(_)) => {
                (StatusCode::NOT_IMPLEMENTED, "NOT_IMPLEMENTED")
            }
            AppError::Bridge(Error::Serialization(_)) => (StatusCode::BAD_REQUEST, "INVALID_PAYLOAD"),
            AppError::Bridge(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        let body = Json(ApiErrorBody {
            error: self.to_string(),
            code: code.to_string(),
        });

        (status, body).into_response()
    }
}

// ==================== OpenAPI Documentation ====================

#[derive(OpenApi)]
#[openapi(
    info(
        title = "NsqBridge Demo API",
        version = "0.1.0",
        description = "Dispatch events through NsqBridge and inspect what the handlers received",
        license(name = "MIT OR Apache-2.0")
    ),
    servers(
        (url = "http://localhost:3000", description = "Local development server")
    ),
    paths(health, dispatch_event, inject_message, get_event),
    components(
        schemas(
            HealthResponse,
            PublishOutcome,
            ConnectionFailure,
            InjectResponse,
            RecordedEvent,
            DeliveryContext,
            MessageId,
            ApiErrorBody,
            NsqOptions,
            Strategy,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "events", description = "Event dispatch and inspection")
    )
)]
struct ApiDoc;

// ==================== Handlers ====================

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Server is healthy", body = HealthResponse)
    )
)]
async fn health(State(state): State<AppState>) -> Result<Json<HealthResponse>, AppError> {
    let pool = state.client.connect().await?;
    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        connections: pool.addresses(),
        recorded_events: state.events.len(),
    }))
}

/// Publish a JSON body to a topic through the bridge client
#[utoipa::path(
    post,
    path = "/dispatch/{topic}",
    tag = "events",
    params(
        ("topic" = String, Path, description = "Topic name")
    ),
    request_body = Object,
    responses(
        (status = 200, description = "Published to at least one node", body = PublishOutcome),
        (status = 502, description = "Every node rejected the publish", body = ApiErrorBody),
        (status = 503, description = "No broker connection", body = ApiErrorBody)
    )
)]
async fn dispatch_event(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    Json(payload): Json<Value>,
) -> Result<Json<PublishOutcome>, AppError> {
    let outcome = state.client.publish(&topic, payload).await?;
    if outcome.is_partial() {
        warn!(topic = %topic, failures = outcome.failures().len(), "Partial publish");
    }
    Ok(Json(outcome))
}

/// Place a raw body on a topic, bypassing the envelope
#[utoipa::path(
    post,
    path = "/inject/{topic}",
    tag = "events",
    params(
        ("topic" = String, Path, description = "Topic name")
    ),
    request_body = String,
    responses(
        (status = 202, description = "Body queued for the topic's channels", body = InjectResponse)
    )
)]
async fn inject_message(
    State(state): State<AppState>,
    Path(topic): Path<String>,
    body: Bytes,
) -> (StatusCode, Json<InjectResponse>) {
    state.cluster.inject(&topic, body);
    (StatusCode::ACCEPTED, Json(InjectResponse { topic }))
}

/// Get the recorded handler invocation for an event id
#[utoipa::path(
    get,
    path = "/events/{event_id}",
    tag = "events",
    params(
        ("event_id" = String, Path, description = "Event id found in the payload")
    ),
    responses(
        (status = 200, description = "Recorded invocation", body = RecordedEvent),
        (status = 404, description = "Event not seen", body = ApiErrorBody)
    )
)]
async fn get_event(
    State(state): State<AppState>,
    Path(event_id): Path<String>,
) -> Result<Json<RecordedEvent>, AppError> {
    state
        .events
        .get(&event_id)
        .map(Json)
        .ok_or(AppError::EventNotFound(event_id))
}

// ==================== Router ====================

fn create_router(state: AppState) -> Router {
    Router::new()
        // Swagger UI
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/health", get(health))
        .route("/dispatch/:topic", post(dispatch_event))
        .route("/inject/:topic", post(inject_message))
        .route("/events/:event_id", get(get_event))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

// ==================== Setup ====================

/// Options from the JSON file named by `NSQBRIDGE_CONFIG`, else defaults
fn load_options() -> anyhow::Result<NsqOptions> {
    match std::env::var("NSQBRIDGE_CONFIG") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config file {path}"))?;
            serde_json::from_str(&raw).with_context(|| format!("parsing config file {path}"))
        }
        Err(_) => Ok(NsqOptions::default()),
    }
}

fn cluster_nodes() -> Vec<String> {
    std::env::var("NSQBRIDGE_NODES")
        .unwrap_or_else(|_| DEFAULT_NODES.to_string())
        .split(',')
        .map(str::trim)
        .filter(|node| !node.is_empty())
        .map(String::from)
        .collect()
}

/// Wire the cluster, the consuming server and the publishing client together
async fn build(options: NsqOptions, nodes: Vec<String>) -> anyhow::Result<(AppState, Server)> {
    let cluster = MemoryCluster::with_nodes(nodes);
    let events = EventLog::new();

    let mut builder = BindingRegistry::builder();
    events::register(&mut builder, &events)?;

    let server = Server::new(options.clone(), builder.build(), Arc::new(cluster.clone()))
        .with_discard_handler(|message| {
            warn!(
                message_id = %message.id,
                topic = %message.topic,
                channel = %message.channel,
                attempts = message.attempts,
                "Message discarded"
            );
        });
    server
        .start(|| info!("Consumers ready"))
        .await
        .context("starting bridge server")?;

    let client = Arc::new(Client::new(
        options,
        Arc::new(cluster.clone()),
        Arc::new(cluster.clone()),
    ));

    Ok((
        AppState {
            client,
            cluster,
            events,
        },
        server,
    ))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

// ==================== Main ====================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nsqbridge=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let options = load_options()?;
    let nodes = cluster_nodes();
    info!(
        lookupd = ?options.lookupd_http_addresses,
        nodes = ?nodes,
        strategy = ?options.strategy,
        "Starting NsqBridge"
    );

    let (state, server) = build(options, nodes).await?;
    let client = Arc::clone(&state.client);
    let app = create_router(state);

    let addr = std::env::var("NSQBRIDGE_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("NsqBridge demo listening on {}", addr);
    info!("Swagger UI: http://{}/swagger-ui/", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    client.close().await;
    server.close().await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    async fn demo() -> (AppState, Server) {
        build(NsqOptions::default(), vec!["nsqd-1:4150".to_string()])
            .await
            .unwrap()
    }

    async fn wait_for_event(state: &AppState, event_id: &str) -> RecordedEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(event) = state.events.get(event_id) {
                    return event;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("event was not recorded")
    }

    #[tokio::test]
    async fn test_dispatch_reaches_nested_binding() {
        let (state, server) = demo().await;

        let Json(outcome) = dispatch_event(
            State(state.clone()),
            Path("topic04".to_string()),
            Json(json!({"eventId": "e2e-1"})),
        )
        .await
        .unwrap();
        assert!(!outcome.is_partial());

        let event = wait_for_event(&state, "e2e-1").await;
        assert_eq!(event.context.topic(), "topic04");
        let payload = event.payload.as_json().unwrap();
        assert_eq!(payload["meta"]["component"], "nsq-bridge");

        let Json(found) = get_event(State(state.clone()), Path("e2e-1".to_string()))
            .await
            .unwrap();
        assert_eq!(found.context.channel(), "channel04");
        server.close().await;
    }

    #[tokio::test]
    async fn test_inject_reaches_top_level_binding() {
        let (state, server) = demo().await;

        let (status, _) = inject_message(
            State(state.clone()),
            Path("topic01".to_string()),
            Bytes::from_static(br#"{"eventId":"raw-1"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let event = wait_for_event(&state, "raw-1").await;
        assert_eq!(event.context.attempts(), 1);
        server.close().await;
    }

    #[tokio::test]
    async fn test_unknown_event_is_not_found() {
        let (state, server) = demo().await;

        let err = get_event(State(state), Path("missing".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::EventNotFound(_)));
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
        server.close().await;
    }

    #[tokio::test]
    async fn test_publish_errors_map_to_status_codes() {
        let (state, server) = demo().await;
        state.client.close().await;

        let err = dispatch_event(
            State(state),
            Path("topic04".to_string()),
            Json(json!({})),
        )
        .await
        .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
        server.close().await;
    }
}
