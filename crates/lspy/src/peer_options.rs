//! Peer configuration (§6, ambient §10.3): a fluent builder — construct-then-`build()`, with
//! defaults for everything but `name`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::error::LspError;
use crate::middleware::Middleware;

/// Parameters describing validation failures passed to [`PeerOptions::on_validation_error`].
#[derive(Debug, Clone)]
pub struct ValidationFailure {
    pub method: String,
    pub reason: String,
}

/// A `params` validator a caller can register via [`PeerOptionsBuilder::validate_params`]. Takes
/// the method name and raw params, returns `Ok(())` or a human-readable rejection reason.
pub type ParamsValidator = Arc<dyn Fn(&str, Option<&Value>) -> Result<(), String> + Send + Sync>;

/// Hook invoked when [`ParamsValidator`] rejects a message. Purely observational — the request
/// is rejected regardless of whether a hook is registered.
pub type ValidationErrorHook = Arc<dyn Fn(&ValidationFailure) + Send + Sync>;

/// Callback fired on a heartbeat responsiveness transition (§4.11's `onUnresponsive`/
/// `onResponsive`). Purely observational — the heartbeat loop itself never tears down the peer.
pub type HeartbeatHook = Arc<dyn Fn() + Send + Sync>;

/// Heartbeat/liveness-probe configuration (§4.11).
#[derive(Clone)]
pub struct HeartbeatOptions {
    pub enabled: bool,
    pub interval: Duration,
    pub timeout: Duration,
    /// Fired when a probe goes unanswered after a prior successful (or first) round-trip.
    pub on_unresponsive: Option<HeartbeatHook>,
    /// Fired when a probe succeeds after the peer was previously marked unresponsive.
    pub on_responsive: Option<HeartbeatHook>,
}

impl Default for HeartbeatOptions {
    fn default() -> Self {
        HeartbeatOptions {
            enabled: false,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            on_unresponsive: None,
            on_responsive: None,
        }
    }
}

impl HeartbeatOptions {
    pub fn on_unresponsive<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_unresponsive = Some(Arc::new(hook));
        self
    }

    pub fn on_responsive<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_responsive = Some(Arc::new(hook));
        self
    }
}

/// Immutable, fully-resolved configuration for a single [`crate::peer::Peer`] (§6).
pub struct PeerOptions {
    pub name: String,
    pub version: String,
    pub static_capabilities: Value,
    pub middleware: Vec<Arc<dyn Middleware>>,
    pub request_timeout: Option<Duration>,
    pub validate_params: Option<ParamsValidator>,
    pub on_validation_error: Option<ValidationErrorHook>,
    pub heartbeat: HeartbeatOptions,
    pub strict_dynamic_registration: bool,
}

impl PeerOptions {
    pub fn builder(name: impl Into<String>) -> PeerOptionsBuilder {
        PeerOptionsBuilder::new(name)
    }
}

/// Builds a [`PeerOptions`]. `name` is the only mandatory field; every other knob defaults to the
/// conservative choice (no timeout, no middleware, heartbeat off, lenient dynamic registration).
pub struct PeerOptionsBuilder {
    name: String,
    version: String,
    static_capabilities: Value,
    middleware: Vec<Arc<dyn Middleware>>,
    request_timeout: Option<Duration>,
    validate_params: Option<ParamsValidator>,
    on_validation_error: Option<ValidationErrorHook>,
    heartbeat: HeartbeatOptions,
    strict_dynamic_registration: bool,
}

impl PeerOptionsBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        PeerOptionsBuilder {
            name: name.into(),
            version: "0.0.0".to_string(),
            static_capabilities: Value::Null,
            middleware: Vec::new(),
            request_timeout: None,
            validate_params: None,
            on_validation_error: None,
            heartbeat: HeartbeatOptions::default(),
            strict_dynamic_registration: false,
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn static_capabilities(mut self, capabilities: Value) -> Self {
        self.static_capabilities = capabilities;
        self
    }

    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn validate_params<F>(mut self, validator: F) -> Self
    where
        F: Fn(&str, Option<&Value>) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validate_params = Some(Arc::new(validator));
        self
    }

    pub fn on_validation_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ValidationFailure) + Send + Sync + 'static,
    {
        self.on_validation_error = Some(Arc::new(hook));
        self
    }

    pub fn heartbeat(mut self, heartbeat: HeartbeatOptions) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn strict_dynamic_registration(mut self, strict: bool) -> Self {
        self.strict_dynamic_registration = strict;
        self
    }

    pub fn build(self) -> Result<PeerOptions, LspError> {
        if self.name.trim().is_empty() {
            return Err(LspError::Protocol("peer name must not be empty".into()));
        }
        Ok(PeerOptions {
            name: self.name,
            version: self.version,
            static_capabilities: self.static_capabilities,
            middleware: self.middleware,
            request_timeout: self.request_timeout,
            validate_params: self.validate_params,
            on_validation_error: self.on_validation_error,
            heartbeat: self.heartbeat,
            strict_dynamic_registration: self.strict_dynamic_registration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_name_is_rejected() {
        let err = PeerOptions::builder("  ").build().unwrap_err();
        assert!(matches!(err, LspError::Protocol(_)));
    }

    #[test]
    fn defaults_are_conservative() {
        let opts = PeerOptions::builder("demo").build().unwrap();
        assert_eq!(opts.version, "0.0.0");
        assert!(opts.request_timeout.is_none());
        assert!(!opts.heartbeat.enabled);
        assert!(!opts.strict_dynamic_registration);
    }

    #[test]
    fn validation_hook_runs_on_rejection() {
        use std::sync::atomic::{AtomicBool, Ordering};
        let fired = Arc::new(AtomicBool::new(false));
        let fired_clone = fired.clone();
        let opts = PeerOptions::builder("demo")
            .validate_params(|_, _| Err("bad params".into()))
            .on_validation_error(move |_| fired_clone.store(true, Ordering::SeqCst))
            .build()
            .unwrap();

        let validator = opts.validate_params.unwrap();
        let result = validator("textDocument/hover", None);
        assert!(result.is_err());
        if let Some(hook) = opts.on_validation_error {
            hook(&ValidationFailure { method: "textDocument/hover".into(), reason: result.unwrap_err() });
        }
        assert!(fired.load(Ordering::SeqCst));
    }
}
