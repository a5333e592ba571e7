//! Application handler model
//!
//! A handler answers with one of three shapes: an immediate value, a
//! deferred value or a stream. [`HandlerResponse::resolve`] reduces all of
//! them to a single success/failure decision.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::future::BoxFuture;
use futures::stream::{BoxStream, Stream};
use futures::{FutureExt, StreamExt};
use nsqbridge_types::{BoxError, DeliveryContext, Payload};
use serde_json::Value;

/// What a handler returned
pub enum HandlerResponse {
    /// Immediate result
    Value(Value),
    /// A single eventual result
    Deferred(BoxFuture<'static, Result<Value, BoxError>>),
    /// Multiple results; only the first one counts
    Stream(BoxStream<'static, Result<Value, BoxError>>),
}

impl HandlerResponse {
    pub fn value(value: impl Into<Value>) -> Self {
        Self::Value(value.into())
    }

    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = Result<Value, BoxError>> + Send + 'static,
    {
        Self::Deferred(future.boxed())
    }

    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Value, BoxError>> + Send + 'static,
    {
        Self::Stream(stream.boxed())
    }

    /// A stream that completes without producing anything
    pub fn empty() -> Self {
        Self::Stream(futures::stream::empty().boxed())
    }

    /// Wait for the response to settle
    ///
    /// `Ok(None)` means an empty stream, which counts as success. Values a
    /// stream produces after its first are never polled.
    pub async fn resolve(self) -> Result<Option<Value>, BoxError> {
        match self {
            Self::Value(value) => Ok(Some(value)),
            Self::Deferred(future) => future.await.map(Some),
            Self::Stream(mut stream) => stream.next().await.transpose(),
        }
    }
}

impl std::fmt::Debug for HandlerResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Deferred(_) => f.write_str("Deferred"),
            Self::Stream(_) => f.write_str("Stream"),
        }
    }
}

/// Application-side message handler
///
/// Returning `Err` is the synchronous failure path; it is treated exactly
/// like a deferred value that fails.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, data: Payload, ctx: DeliveryContext) -> Result<HandlerResponse, BoxError>;
}

impl<F> Handler for F
where
    F: Fn(Payload, DeliveryContext) -> Result<HandlerResponse, BoxError> + Send + Sync + 'static,
{
    fn handle(&self, data: Payload, ctx: DeliveryContext) -> Result<HandlerResponse, BoxError> {
        self(data, ctx)
    }
}

/// Call a handler and settle its response; panics count as failures
pub(crate) async fn invoke(
    handler: &dyn Handler,
    data: Payload,
    ctx: DeliveryContext,
) -> Result<Option<Value>, BoxError> {
    let response = match std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle(data, ctx))) {
        Ok(response) => response?,
        Err(panic) => return Err(panic_error(panic)),
    };

    AssertUnwindSafe(response.resolve())
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(panic_error(panic)))
}

fn panic_error(panic: Box<dyn Any + Send>) -> BoxError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("handler panicked: {message}").into()
}
