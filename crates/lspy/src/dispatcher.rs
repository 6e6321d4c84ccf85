//! Dispatcher (C8): wires a [`Transport`] to the framing/classification/middleware/pending-tracker
//! machinery, routing inbound messages to registered handlers and outbound calls through the
//! pipeline. A single dispatcher instance drives either side of a connection symmetrically.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::cancellation::{CancellationToken, CancellationTokenSource};
use crate::error::{error_codes, LspError, ResponseError};
use crate::lifecycle::{Lifecycle, Role, TraceValue, METHOD_CANCEL_REQUEST, METHOD_EXIT, METHOD_PROGRESS, METHOD_SET_TRACE};
use crate::message::{classify, Direction, Id, Message};
use crate::middleware::{run_pipeline, terminal, Middleware, MiddlewareContext, Outcome};
use crate::pending::{PendingTracker, RequestMetadata};
use crate::peer_options::{ParamsValidator, ValidationErrorHook, ValidationFailure};
use crate::progress::{PartialOutcome, ProgressCollector, ProgressToken};
use crate::subscription::Disposer;
use crate::transport::Transport;

/// A handler for inbound requests of one method. Returning `Err` sends an error response, mapped
/// through [`LspError::to_response_error`]; returning `Err(LspError::RequestCancelled)` is how a
/// handler reports it honored a cancellation (§4.5).
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, params: Option<Value>, cancellation: CancellationToken) -> Result<Value, LspError>;
}

pub struct FnRequestHandler<F> {
    func: F,
}

impl<F> FnRequestHandler<F> {
    pub fn new(func: F) -> Self {
        FnRequestHandler { func }
    }
}

#[async_trait]
impl<F, Fut> RequestHandler for FnRequestHandler<F>
where
    F: Fn(Option<Value>, CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, LspError>> + Send,
{
    async fn handle(&self, params: Option<Value>, cancellation: CancellationToken) -> Result<Value, LspError> {
        (self.func)(params, cancellation).await
    }
}

/// A handler for inbound notifications of one method. Multiple handlers may be registered for the
/// same method; all run, in registration order.
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn handle(&self, params: Option<Value>);
}

pub struct FnNotificationHandler<F> {
    func: F,
}

impl<F> FnNotificationHandler<F> {
    pub fn new(func: F) -> Self {
        FnNotificationHandler { func }
    }
}

#[async_trait]
impl<F, Fut> NotificationHandler for FnNotificationHandler<F>
where
    F: Fn(Option<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send,
{
    async fn handle(&self, params: Option<Value>) {
        (self.func)(params).await
    }
}

/// Routes messages between a [`Transport`] and the registered handlers, enforcing lifecycle
/// gating and running every message through the middleware pipeline. One instance per peer.
pub struct Dispatcher {
    role: Role,
    transport: Arc<dyn Transport>,
    lifecycle: Arc<Lifecycle>,
    pending: PendingTracker,
    progress: ProgressCollector,
    middleware: Vec<Arc<dyn Middleware>>,
    request_handlers: Mutex<HashMap<String, Arc<dyn RequestHandler>>>,
    notification_handlers: Mutex<HashMap<String, Vec<Arc<dyn NotificationHandler>>>>,
    inbound_cancellations: Mutex<HashMap<Id, CancellationTokenSource>>,
    request_timeout: Option<Duration>,
    validate_params: Option<ParamsValidator>,
    on_validation_error: Option<ValidationErrorHook>,
    subscriptions: Mutex<Vec<Disposer>>,
}

impl Dispatcher {
    pub fn new(
        role: Role,
        transport: Arc<dyn Transport>,
        lifecycle: Arc<Lifecycle>,
        middleware: Vec<Arc<dyn Middleware>>,
        request_timeout: Option<Duration>,
    ) -> Arc<Self> {
        Self::with_validation(role, transport, lifecycle, middleware, request_timeout, None, None)
    }

    /// Same as [`Self::new`], additionally wiring the host's inbound-params validator (§4.3,
    /// §10.3's `validateParams`/`onValidationError` configuration options).
    pub fn with_validation(
        role: Role,
        transport: Arc<dyn Transport>,
        lifecycle: Arc<Lifecycle>,
        middleware: Vec<Arc<dyn Middleware>>,
        request_timeout: Option<Duration>,
        validate_params: Option<ParamsValidator>,
        on_validation_error: Option<ValidationErrorHook>,
    ) -> Arc<Self> {
        Arc::new(Dispatcher {
            role,
            transport,
            lifecycle,
            pending: PendingTracker::new(),
            progress: ProgressCollector::new(),
            middleware,
            request_handlers: Mutex::new(HashMap::new()),
            notification_handlers: Mutex::new(HashMap::new()),
            inbound_cancellations: Mutex::new(HashMap::new()),
            request_timeout,
            validate_params,
            on_validation_error,
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    pub fn pending(&self) -> &PendingTracker {
        &self.pending
    }

    pub fn progress(&self) -> &ProgressCollector {
        &self.progress
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    /// Subscribes to the transport's message/error/close events. Must be called exactly once,
    /// after every initial handler registration that needs to observe early traffic is in place.
    pub async fn start(self: &Arc<Self>) {
        let dispatcher = self.clone();
        let message_disposer = self
            .transport
            .subscribe_message(Box::new(move |value| {
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move { dispatcher.handle_inbound(value).await });
            }))
            .await;

        let dispatcher = self.clone();
        let close_disposer = self
            .transport
            .subscribe_close(Box::new(move || {
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move { dispatcher.pending.clear(LspError::Disconnected).await });
            }))
            .await;

        let error_disposer = self
            .transport
            .subscribe_error(Box::new(|err| {
                tracing::warn!(error = %err, "transport reported an error");
            }))
            .await;

        let mut subscriptions = self.subscriptions.lock().await;
        subscriptions.push(message_disposer);
        subscriptions.push(close_disposer);
        subscriptions.push(error_disposer);
    }

    pub async fn on_request(&self, method: impl Into<String>, handler: Arc<dyn RequestHandler>) {
        self.request_handlers.lock().await.insert(method.into(), handler);
    }

    pub async fn on_notification(&self, method: impl Into<String>, handler: Arc<dyn NotificationHandler>) {
        self.notification_handlers.lock().await.entry(method.into()).or_default().push(handler);
    }

    fn outbound_direction(&self) -> Direction {
        match self.role {
            Role::Client => Direction::ClientToServer,
            Role::Server => Direction::ServerToClient,
        }
    }

    fn inbound_direction(&self) -> Direction {
        match self.role {
            Role::Client => Direction::ServerToClient,
            Role::Server => Direction::ClientToServer,
        }
    }

    /// Sends a request and awaits its correlated response, subject to lifecycle gating, the
    /// outbound middleware pipeline, and `timeout_override` (falling back to the peer's configured
    /// default request timeout) (§4.4, §4.8).
    ///
    /// If `params` carries a `partialResultToken` or `workDoneToken` field, a progress bucket is
    /// opened before the request is sent and the eventual outcome aggregates every `$/progress`
    /// notification delivered for that token in the meantime, per §4.6 / §8 scenario 4. Requests
    /// without either field still resolve through the same [`PartialOutcome`] shape, just with an
    /// always-empty `partial_results` — use [`PartialOutcome::into_result`] to collapse to the bare
    /// final value.
    ///
    /// If `cancellation` fires before a response arrives, the pending awaitable is rejected with
    /// [`LspError::RequestCancelled`] and `$/cancelRequest` is emitted to the remote peer, the same
    /// as an explicit [`Self::cancel_request`] call (§4.8).
    #[tracing::instrument(skip_all)]
    pub async fn send_request(
        self: &Arc<Self>,
        method: impl Into<String>,
        params: Option<Value>,
        timeout_override: Option<Duration>,
        cancellation: Option<CancellationToken>,
    ) -> Result<PartialOutcome, LspError> {
        let method = method.into();
        tracing::trace!(method = %method, direction = ?self.outbound_direction(), "sending request");
        self.lifecycle.gate_request(&method)?;

        let partial_token = params.as_ref().and_then(extract_partial_result_token);
        if let Some(token) = &partial_token {
            let _ = self.progress.start(token.clone()).await;
        }

        let id = self.pending.next_id();
        let timeout = timeout_override.or(self.request_timeout);
        let rx = self.pending.create(id.clone(), RequestMetadata { method: method.clone() }, timeout).await;

        let message = Message::request(id.clone(), method, params);
        let ctx = MiddlewareContext::new(self.outbound_direction(), "transport", message);

        let dispatcher = self.clone();
        let terminal_fn = terminal(move |ctx: MiddlewareContext| {
            let dispatcher = dispatcher.clone();
            async move {
                dispatcher.transport.send(ctx.message.to_value()).await?;
                Ok(Outcome::Continue(ctx))
            }
        });

        match run_pipeline(&self.middleware, &terminal_fn, ctx).await {
            Ok(Outcome::Continue(_)) => {}
            Ok(Outcome::ShortCircuit { response, error }) => {
                if let Some(value) = response {
                    self.pending.resolve(&id, value).await;
                } else {
                    self.pending.reject(&id, error.unwrap_or(LspError::Protocol("request short-circuited".into()))).await;
                }
            }
            Err(err) => {
                self.pending.reject(&id, clone_for_reject(&err)).await;
            }
        }

        let result = match cancellation {
            Some(cancellation) => {
                tokio::select! {
                    received = rx => received.unwrap_or(Err(LspError::Disconnected)),
                    _ = cancellation.cancelled() => {
                        self.cancel_request(id.clone()).await?;
                        Err(LspError::RequestCancelled)
                    }
                }
            }
            None => match rx.await {
                Ok(result) => result,
                Err(_) => Err(LspError::Disconnected),
            },
        };

        match (result, &partial_token) {
            (Ok(final_result), Some(token)) => Ok(self.progress.finish_resolved(token, final_result).await),
            (Ok(final_result), None) => Ok(PartialOutcome::Resolved { partial_results: Vec::new(), final_result }),
            (Err(LspError::RequestCancelled), Some(token)) => Ok(self.progress.finish_cancelled(token).await),
            (Err(err), Some(token)) => {
                let _ = self.progress.finish_cancelled(token).await;
                Err(err)
            }
            (Err(err), None) => Err(err),
        }
    }

    /// Sends a fire-and-forget notification through the outbound middleware pipeline (§4.8).
    #[tracing::instrument(skip_all)]
    pub async fn send_notification(self: &Arc<Self>, method: impl Into<String>, params: Option<Value>) -> Result<(), LspError> {
        let method = method.into();
        tracing::trace!(method = %method, direction = ?self.outbound_direction(), "sending notification");
        self.lifecycle.gate_notification(&method)?;

        let message = Message::notification(method, params);
        let ctx = MiddlewareContext::new(self.outbound_direction(), "transport", message);

        let dispatcher = self.clone();
        let terminal_fn = terminal(move |ctx: MiddlewareContext| {
            let dispatcher = dispatcher.clone();
            async move {
                dispatcher.transport.send(ctx.message.to_value()).await?;
                Ok(Outcome::Continue(ctx))
            }
        });

        run_pipeline(&self.middleware, &terminal_fn, ctx).await?;
        Ok(())
    }

    /// Cancels a locally-initiated outbound request: rejects the pending awaitable immediately
    /// with [`LspError::RequestCancelled`], then emits `$/cancelRequest` (§9 decision — the local
    /// caller must not wait on the remote peer to acknowledge the cancellation).
    pub async fn cancel_request(self: &Arc<Self>, id: Id) -> Result<(), LspError> {
        self.pending.reject(&id, LspError::RequestCancelled).await;
        self.send_notification(METHOD_CANCEL_REQUEST, Some(serde_json::json!({ "id": id }))).await
    }

    #[tracing::instrument(skip_all)]
    async fn handle_inbound(self: Arc<Self>, value: Value) {
        let message = match classify(value) {
            Ok(message) => message,
            Err(err) => {
                if let Some(id) = err.recovered_id() {
                    let _ = self.transport.send(Message::error(id.clone(), err.to_response_error()).to_value()).await;
                }
                tracing::debug!("dropped a message that did not classify as request/notification/response");
                return;
            }
        };

        tracing::trace!(
            method = message.method().unwrap_or("<none>"),
            direction = ?self.inbound_direction(),
            "handling inbound message"
        );
        let ctx = MiddlewareContext::new(self.inbound_direction(), "transport", message);
        let dispatcher = self.clone();
        let terminal_fn = terminal(move |ctx: MiddlewareContext| {
            let dispatcher = dispatcher.clone();
            async move { dispatcher.clone().dispatch_terminal(ctx).await }
        });

        if let Err(err) = run_pipeline(&self.middleware, &terminal_fn, ctx).await {
            tracing::warn!(error = %err, "inbound middleware pipeline failed");
        }
    }

    async fn dispatch_terminal(self: Arc<Self>, ctx: MiddlewareContext) -> Result<Outcome, LspError> {
        match &ctx.message {
            Message::Request { id, method, params } => {
                self.clone().handle_inbound_request(id.clone(), method.clone(), params.clone()).await;
            }
            Message::Notification { method, params } => {
                self.clone().handle_inbound_notification(method.clone(), params.clone()).await;
            }
            Message::SuccessResponse { id, result } => {
                self.pending.resolve(id, result.clone()).await;
            }
            Message::ErrorResponse { id, error } => {
                self.pending
                    .reject(id, LspError::Remote { code: error.code, message: error.message.clone(), data: error.data.clone() })
                    .await;
            }
        }
        Ok(Outcome::Continue(ctx))
    }

    async fn handle_inbound_request(self: Arc<Self>, id: Id, method: String, params: Option<Value>) {
        if let Err(err) = self.lifecycle.gate_request(&method) {
            let _ = self.transport.send(Message::error(id, err.to_response_error()).to_value()).await;
            return;
        }

        if let Some(validator) = &self.validate_params {
            if let Err(reason) = validator(&method, params.as_ref()) {
                if let Some(hook) = &self.on_validation_error {
                    hook(&ValidationFailure { method: method.clone(), reason: reason.clone() });
                }
                let error = ResponseError::new(error_codes::INVALID_PARAMS, reason);
                let _ = self.transport.send(Message::error(id, error).to_value()).await;
                return;
            }
        }

        let handler = self.request_handlers.lock().await.get(&method).cloned();
        let Some(handler) = handler else {
            let err = ResponseError::new(error_codes::METHOD_NOT_FOUND, format!("method `{method}` is not registered"));
            let _ = self.transport.send(Message::error(id, err).to_value()).await;
            return;
        };

        let source = CancellationTokenSource::new();
        self.inbound_cancellations.lock().await.insert(id.clone(), source.clone());
        let token = source.token();

        let dispatcher = self.clone();
        tokio::spawn(async move {
            let result = handler.handle(params, token).await;
            dispatcher.inbound_cancellations.lock().await.remove(&id);

            let outgoing = match result {
                Ok(value) => Message::success(id.clone(), value),
                Err(LspError::RequestCancelled) => {
                    Message::error(id.clone(), ResponseError::new(error_codes::REQUEST_CANCELLED, "request was cancelled".into()))
                }
                Err(err) => Message::error(id.clone(), err.to_response_error()),
            };
            let _ = dispatcher.transport.send(outgoing.to_value()).await;
        });
    }

    async fn handle_inbound_notification(self: Arc<Self>, method: String, params: Option<Value>) {
        match method.as_str() {
            METHOD_CANCEL_REQUEST => {
                if let Some(id) = params.as_ref().and_then(extract_id_field) {
                    // An unknown id means the target request already finished or was never ours;
                    // that's a no-op, not an error (§9 decision).
                    if let Some(source) = self.inbound_cancellations.lock().await.get(&id) {
                        source.cancel();
                    }
                }
            }
            METHOD_PROGRESS => {
                if let Some(params) = &params {
                    if let (Some(token), Some(value)) = (
                        params.get("token").and_then(extract_progress_token),
                        params.get("value").cloned(),
                    ) {
                        self.progress.on_progress(&token, value).await;
                    }
                }
            }
            METHOD_SET_TRACE => {
                let value = params
                    .as_ref()
                    .and_then(|p| p.get("value"))
                    .and_then(Value::as_str)
                    .map(TraceValue::parse)
                    .unwrap_or(TraceValue::Off);
                self.lifecycle.set_trace_value(value);
            }
            other => {
                if other != METHOD_EXIT {
                    if let Err(err) = self.lifecycle.gate_notification(other) {
                        tracing::debug!(error = %err, method = %other, "dropped notification outside the permitted lifecycle state");
                        return;
                    }
                }
                let handlers = self.notification_handlers.lock().await.get(other).cloned().unwrap_or_default();
                for handler in handlers {
                    handler.handle(params.clone()).await;
                }
            }
        }
    }
}

fn extract_id_field(params: &Value) -> Option<Id> {
    match params.get("id")? {
        Value::Number(n) => n.as_i64().map(Id::Number),
        Value::String(s) => Some(Id::String(s.clone())),
        _ => None,
    }
}

fn extract_progress_token(value: &Value) -> Option<ProgressToken> {
    match value {
        Value::Number(n) => n.as_i64().map(ProgressToken::Number),
        Value::String(s) => Some(ProgressToken::String(s.clone())),
        _ => None,
    }
}

/// A request's own params carry its partial-result/work-done token, if any, unlike inbound
/// `$/progress{token, value}` notifications where the token is a sibling field (§4.6).
fn extract_partial_result_token(params: &Value) -> Option<ProgressToken> {
    params
        .get("partialResultToken")
        .or_else(|| params.get("workDoneToken"))
        .and_then(extract_progress_token)
}

/// `LspError` is not `Clone`; a middleware pipeline failure needs to reject the pending awaitable
/// with *something* descriptive without losing the variant's message.
fn clone_for_reject(error: &LspError) -> LspError {
    match error {
        LspError::RequestCancelled => LspError::RequestCancelled,
        LspError::Disconnected => LspError::Disconnected,
        other => LspError::Protocol(other.to_string()),
    }
}
