//! Bidirectional middleware pipeline (C7): ordered interception of outbound and inbound
//! messages with short-circuit capability, expressed as plain async trait objects rather than
//! a `tower::Layer`/`Service` stack, since this crate does not carry a `tower` dependency.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::LspError;
use crate::message::{Direction, Id, Message, MessageType};

/// Per-message scratch space and read-only message view passed through the pipeline.
pub struct MiddlewareContext {
    pub direction: Direction,
    pub message_type: MessageType,
    pub method: Option<String>,
    /// Read-only by convention: the pipeline detects and rejects any change to this field by the
    /// time the chain unwinds (see `PipelineViolation`).
    pub id: Option<Id>,
    pub message: Message,
    pub metadata: HashMap<String, Value>,
    pub transport: String,
}

impl MiddlewareContext {
    pub fn new(direction: Direction, transport: impl Into<String>, message: Message) -> Self {
        MiddlewareContext {
            direction,
            message_type: message.kind(),
            method: message.method().map(str::to_string),
            id: message.id().cloned(),
            message,
            metadata: HashMap::new(),
            transport: transport.into(),
        }
    }
}

/// What a middleware or the terminal step returns: either "continue normally" with the
/// (possibly unchanged) context, or a short-circuit outcome (§4.7).
pub enum Outcome {
    Continue(MiddlewareContext),
    ShortCircuit { response: Option<Value>, error: Option<LspError> },
}

type TerminalFuture = Pin<Box<dyn Future<Output = Result<Outcome, LspError>> + Send>>;
type TerminalFn = dyn Fn(MiddlewareContext) -> TerminalFuture + Send + Sync;

/// The continuation passed to a middleware. Calling it enters the next middleware in the chain
/// (or the dispatcher's terminal step, e.g. `handler` or `send`).
pub struct Next<'a> {
    remaining: &'a [Arc<dyn Middleware>],
    terminal: &'a TerminalFn,
}

impl<'a> Next<'a> {
    pub async fn call(self, ctx: MiddlewareContext) -> Result<Outcome, LspError> {
        match self.remaining.split_first() {
            Some((first, rest)) => {
                let next = Next { remaining: rest, terminal: self.terminal };
                first.handle(ctx, next).await
            }
            None => (self.terminal)(ctx).await,
        }
    }
}

/// A single middleware in the pipeline. Implementors call `next.call(ctx).await` to continue the
/// chain, or return `Outcome::ShortCircuit` to stop it (§4.7).
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, ctx: MiddlewareContext, next: Next<'_>) -> Result<Outcome, LspError>;
}

/// Composes an ordered list of middlewares plus a terminal step into a single callable chain.
/// Observable order for two middlewares A, B around a terminal step H is `A:before, B:before, H,
/// B:after, A:after` (§4.7, §8), because each middleware's own code runs both before and after its
/// `next.call(ctx).await`.
pub async fn run_pipeline(
    middlewares: &[Arc<dyn Middleware>],
    terminal: &TerminalFn,
    ctx: MiddlewareContext,
) -> Result<Outcome, LspError> {
    let original_id = ctx.id.clone();
    let next = Next { remaining: middlewares, terminal };
    let outcome = next.call(ctx).await?;

    if let Outcome::Continue(ref ctx) = outcome {
        if ctx.id != original_id {
            return Err(LspError::PipelineViolation {
                before: original_id.unwrap_or_else(|| Id::String(String::new())),
                after: ctx.id.clone().unwrap_or_else(|| Id::String(String::new())),
            });
        }
    }

    Ok(outcome)
}

/// Boxes a plain async closure into a [`TerminalFn`] for [`run_pipeline`].
pub fn terminal<F, Fut>(func: F) -> Box<TerminalFn>
where
    F: Fn(MiddlewareContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Outcome, LspError>> + Send + 'static,
{
    Box::new(move |ctx| Box::pin(func(ctx)))
}

/// A filter used by [`Scoped`] to decide whether a wrapped middleware should run for a given
/// context.
#[derive(Default, Clone)]
pub struct MiddlewareFilter {
    pub methods: Option<Vec<String>>,
    pub direction: Option<Direction>,
    pub message_type: Option<MessageType>,
}

impl MiddlewareFilter {
    pub fn matches(&self, ctx: &MiddlewareContext) -> bool {
        if let Some(methods) = &self.methods {
            let matches_method =
                ctx.method.as_deref().map(|m| methods.iter().any(|p| m == p)).unwrap_or(false);
            if !matches_method {
                return false;
            }
        }
        if let Some(direction) = self.direction {
            if direction != ctx.direction {
                return false;
            }
        }
        if let Some(message_type) = self.message_type {
            if message_type != ctx.message_type {
                return false;
            }
        }
        true
    }
}

/// Wraps a core middleware with a filter. On a non-matching context it passes through via
/// `next.call(ctx)` immediately without invoking the inner middleware (§4.7 scoping).
pub struct Scoped<M> {
    filter: MiddlewareFilter,
    inner: M,
}

impl<M> Scoped<M> {
    pub fn new(filter: MiddlewareFilter, inner: M) -> Self {
        Scoped { filter, inner }
    }
}

#[async_trait]
impl<M: Middleware + 'static> Middleware for Scoped<M> {
    async fn handle(&self, ctx: MiddlewareContext, next: Next<'_>) -> Result<Outcome, LspError> {
        if self.filter.matches(&ctx) {
            self.inner.handle(ctx, next).await
        } else {
            next.call(ctx).await
        }
    }
}

/// A middleware built from a boxed async closure; saves implementors from hand-writing the
/// boilerplate `impl Middleware for ...` when all they need is a function.
pub struct FnMiddleware<F> {
    func: F,
}

impl<F> FnMiddleware<F> {
    pub fn new(func: F) -> Self {
        FnMiddleware { func }
    }
}

#[async_trait]
impl<F, Fut> Middleware for FnMiddleware<F>
where
    F: for<'a> Fn(MiddlewareContext, Next<'a>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Outcome, LspError>> + Send,
{
    async fn handle(&self, ctx: MiddlewareContext, next: Next<'_>) -> Result<Outcome, LspError> {
        (self.func)(ctx, next).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn log_middleware(name: &'static str, log: Arc<StdMutex<Vec<String>>>) -> Arc<dyn Middleware> {
        Arc::new(FnMiddleware::new(move |ctx: MiddlewareContext, next: Next<'_>| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(format!("{name}:before"));
                let outcome = next.call(ctx).await?;
                log.lock().unwrap().push(format!("{name}:after"));
                Ok(outcome)
            }
        }))
    }

    #[tokio::test]
    async fn pipeline_preserves_lifo_unwind_order() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let middlewares: Vec<Arc<dyn Middleware>> =
            vec![log_middleware("A", log.clone()), log_middleware("B", log.clone())];

        let handler_log = log.clone();
        let terminal_fn = terminal(move |ctx: MiddlewareContext| {
            let handler_log = handler_log.clone();
            async move {
                handler_log.lock().unwrap().push("H".to_string());
                Ok(Outcome::Continue(ctx))
            }
        });

        let ctx = MiddlewareContext::new(
            Direction::ClientToServer,
            "test",
            Message::request(1i64, "textDocument/hover", None),
        );

        run_pipeline(&middlewares, &terminal_fn, ctx).await.unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["A:before", "B:before", "H", "B:after", "A:after"]);
    }

    #[tokio::test]
    async fn id_mutation_is_rejected() {
        let middlewares: Vec<Arc<dyn Middleware>> = vec![Arc::new(FnMiddleware::new(
            |mut ctx: MiddlewareContext, next: Next<'_>| async move {
                ctx.id = Some(Id::Number(999));
                next.call(ctx).await
            },
        ))];

        let terminal_fn = terminal(|ctx: MiddlewareContext| async move { Ok(Outcome::Continue(ctx)) });

        let ctx =
            MiddlewareContext::new(Direction::ClientToServer, "test", Message::request(1i64, "foo", None));

        let err = run_pipeline(&middlewares, &terminal_fn, ctx).await.unwrap_err();
        assert!(matches!(err, LspError::PipelineViolation { .. }));
    }

    #[tokio::test]
    async fn scoped_middleware_passes_through_on_non_matching_context() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let inner = LoggingMiddleware { name: "scoped", log: log.clone() };
        let filter = MiddlewareFilter { methods: Some(vec!["only/this".into()]), ..Default::default() };
        let scoped: Arc<dyn Middleware> = Arc::new(Scoped::new(filter, inner));

        let middlewares = vec![scoped];
        let terminal_fn = terminal(|ctx: MiddlewareContext| async move { Ok(Outcome::Continue(ctx)) });
        let ctx = MiddlewareContext::new(
            Direction::ClientToServer,
            "test",
            Message::request(1i64, "other/method", None),
        );
        run_pipeline(&middlewares, &terminal_fn, ctx).await.unwrap();
        assert!(log.lock().unwrap().is_empty());
    }

    struct LoggingMiddleware {
        name: &'static str,
        log: Arc<StdMutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for LoggingMiddleware {
        async fn handle(&self, ctx: MiddlewareContext, next: Next<'_>) -> Result<Outcome, LspError> {
            self.log.lock().unwrap().push(format!("{}:before", self.name));
            let outcome = next.call(ctx).await?;
            self.log.lock().unwrap().push(format!("{}:after", self.name));
            Ok(outcome)
        }
    }

    #[tokio::test]
    async fn short_circuit_skips_terminal_step() {
        let middlewares: Vec<Arc<dyn Middleware>> = vec![Arc::new(FnMiddleware::new(
            |_ctx: MiddlewareContext, _next: Next<'_>| async move {
                Ok(Outcome::ShortCircuit { response: Some(serde_json::json!({"cached": true})), error: None })
            },
        ))];

        let called = Arc::new(StdMutex::new(false));
        let called_clone = called.clone();
        let terminal_fn = terminal(move |ctx: MiddlewareContext| {
            let called_clone = called_clone.clone();
            async move {
                *called_clone.lock().unwrap() = true;
                Ok(Outcome::Continue(ctx))
            }
        });

        let ctx =
            MiddlewareContext::new(Direction::ClientToServer, "test", Message::request(1i64, "foo", None));
        let outcome = run_pipeline(&middlewares, &terminal_fn, ctx).await.unwrap();
        assert!(!*called.lock().unwrap());
        assert!(matches!(outcome, Outcome::ShortCircuit { .. }));
    }
}
