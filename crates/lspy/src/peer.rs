//! Peer facade (C11): the public entry point an application embeds, wiring together the
//! dispatcher, lifecycle state machine, capability registry, and heartbeat monitor behind a small
//! surface (`connect`/`listen`, `sendRequest`, `sendNotification`, `onRequest`, `onNotification`,
//! `setCapabilities`, `shutdown`, `disconnect`). The same type drives either side of the
//! connection; only the handshake direction differs between `connect` and `listen`.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{oneshot, Mutex};

use crate::cancellation::CancellationToken;
use crate::capability::{CapabilityRegistry, Registration};
use crate::dispatcher::{Dispatcher, FnNotificationHandler, FnRequestHandler, NotificationHandler, RequestHandler};
use crate::error::LspError;
use crate::heartbeat::HeartbeatMonitor;
use crate::lifecycle::{
    ConnectionState, Lifecycle, Role, StateChangeEvent, METHOD_EXIT, METHOD_INITIALIZE, METHOD_INITIALIZED,
    METHOD_SHUTDOWN,
};
use crate::peer_options::PeerOptions;
use crate::transport::Transport;

const METHOD_REGISTER_CAPABILITY: &str = "client/registerCapability";
const METHOD_UNREGISTER_CAPABILITY: &str = "client/unregisterCapability";

/// A single end of a connection: either the language client or the language server, sharing one
/// implementation (§2).
pub struct Peer {
    role: Role,
    lifecycle: Arc<Lifecycle>,
    dispatcher: Arc<Dispatcher>,
    capabilities: CapabilityRegistry,
    options: PeerOptions,
    heartbeat: Mutex<Option<HeartbeatMonitor>>,
}

impl Peer {
    pub fn new(role: Role, transport: Arc<dyn Transport>, options: PeerOptions) -> Arc<Self> {
        let lifecycle = Lifecycle::new();
        let dispatcher = Dispatcher::with_validation(
            role,
            transport,
            lifecycle.clone(),
            options.middleware.clone(),
            options.request_timeout,
            options.validate_params.clone(),
            options.on_validation_error.clone(),
        );
        let capabilities = CapabilityRegistry::new(options.static_capabilities.clone(), options.strict_dynamic_registration);
        Arc::new(Peer { role, lifecycle, dispatcher, capabilities, options, heartbeat: Mutex::new(None) })
    }

    /// Server-side entry point: registers the built-in lifecycle handlers and starts reading the
    /// transport, then waits for the client's `initialize` request to drive the rest of the
    /// handshake (§4.9).
    pub async fn listen(self: &Arc<Self>) -> Result<(), LspError> {
        self.lifecycle.transition(ConnectionState::Connecting, Some("listen".into())).await?;
        self.register_builtin_handlers().await;
        self.dispatcher.start().await;
        self.lifecycle.transition(ConnectionState::Initializing, None).await?;
        Ok(())
    }

    /// Client-side entry point: starts the transport, sends `initialize`, and on a successful
    /// reply sends `initialized` and moves to `Initialized` (§4.9, §8 scenario 1).
    pub async fn connect(self: &Arc<Self>) -> Result<Value, LspError> {
        self.lifecycle.transition(ConnectionState::Connecting, Some("connect".into())).await?;
        self.register_builtin_handlers().await;
        self.dispatcher.start().await;
        self.lifecycle.transition(ConnectionState::Initializing, None).await?;

        let params = serde_json::json!({
            "clientInfo": { "name": self.options.name, "version": self.options.version },
            "capabilities": self.capabilities.static_capabilities().await,
        });
        let result = self.dispatcher.send_request(METHOD_INITIALIZE, Some(params), None, None).await?.into_result()?;

        if let Some(caps) = result.get("capabilities") {
            self.capabilities.set_static_capabilities(caps.clone()).await;
        }

        self.lifecycle.transition(ConnectionState::Initialized, None).await?;
        self.dispatcher.send_notification(METHOD_INITIALIZED, Some(serde_json::json!({}))).await?;

        if self.options.heartbeat.enabled {
            self.start_heartbeat().await;
        }

        Ok(result)
    }

    async fn register_builtin_handlers(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);

        if self.role == Role::Server {
            let weak_initialize = weak.clone();
            self.dispatcher
                .on_request(
                    METHOD_INITIALIZE,
                    Arc::new(FnRequestHandler::new(move |_params, _cancel: CancellationToken| {
                        let weak_initialize = weak_initialize.clone();
                        async move {
                            let peer = weak_initialize.upgrade().ok_or(LspError::Disconnected)?;
                            Ok(serde_json::json!({
                                "capabilities": peer.capabilities.static_capabilities().await,
                                "serverInfo": { "name": peer.options.name, "version": peer.options.version },
                            }))
                        }
                    })),
                )
                .await;

            let weak_initialized = weak.clone();
            self.dispatcher
                .on_notification(
                    METHOD_INITIALIZED,
                    Arc::new(FnNotificationHandler::new(move |_params| {
                        let weak_initialized = weak_initialized.clone();
                        async move {
                            if let Some(peer) = weak_initialized.upgrade() {
                                let _ = peer.lifecycle.transition(ConnectionState::Initialized, None).await;
                                if peer.options.heartbeat.enabled {
                                    peer.start_heartbeat().await;
                                }
                            }
                        }
                    })),
                )
                .await;
        }

        let weak_shutdown = weak.clone();
        self.dispatcher
            .on_request(
                METHOD_SHUTDOWN,
                Arc::new(FnRequestHandler::new(move |_params, _cancel: CancellationToken| {
                    let weak_shutdown = weak_shutdown.clone();
                    async move {
                        let peer = weak_shutdown.upgrade().ok_or(LspError::Disconnected)?;
                        let _ = peer.lifecycle.transition(ConnectionState::ShuttingDown, Some("shutdown".into())).await;
                        Ok(Value::Null)
                    }
                })),
            )
            .await;

        let weak_exit = weak.clone();
        self.dispatcher
            .on_notification(
                METHOD_EXIT,
                Arc::new(FnNotificationHandler::new(move |_params| {
                    let weak_exit = weak_exit.clone();
                    async move {
                        if let Some(peer) = weak_exit.upgrade() {
                            let _ = peer.lifecycle.transition(ConnectionState::Exited, Some("exit".into())).await;
                            let _ = peer.dispatcher.transport().close().await;
                        }
                    }
                })),
            )
            .await;

        let weak_register = weak.clone();
        self.dispatcher
            .on_request(
                METHOD_REGISTER_CAPABILITY,
                Arc::new(FnRequestHandler::new(move |params, _cancel: CancellationToken| {
                    let weak_register = weak_register.clone();
                    async move {
                        let peer = weak_register.upgrade().ok_or(LspError::Disconnected)?;
                        let registrations: Vec<Registration> = params
                            .as_ref()
                            .and_then(|p| p.get("registrations"))
                            .cloned()
                            .map(serde_json::from_value)
                            .transpose()
                            .map_err(|e| LspError::InvalidParams {
                                method: METHOD_REGISTER_CAPABILITY.into(),
                                reason: e.to_string(),
                            })?
                            .unwrap_or_default();
                        for registration in registrations {
                            peer.capabilities.upsert(registration).await?;
                        }
                        Ok(Value::Null)
                    }
                })),
            )
            .await;

        let weak_unregister = weak.clone();
        self.dispatcher
            .on_request(
                METHOD_UNREGISTER_CAPABILITY,
                Arc::new(FnRequestHandler::new(move |params, _cancel: CancellationToken| {
                    let weak_unregister = weak_unregister.clone();
                    async move {
                        let peer = weak_unregister.upgrade().ok_or(LspError::Disconnected)?;
                        let ids: Vec<String> = params
                            .as_ref()
                            .and_then(|p| p.get("unregisterations"))
                            .and_then(|v| v.as_array())
                            .map(|entries| {
                                entries.iter().filter_map(|e| e.get("id").and_then(|i| i.as_str()).map(str::to_string)).collect()
                            })
                            .unwrap_or_default();
                        let unknown = peer.capabilities.remove_many(&ids).await;
                        if unknown.is_empty() {
                            Ok(Value::Null)
                        } else {
                            Err(LspError::UnknownRegistrationId(unknown))
                        }
                    }
                })),
            )
            .await;
    }

    /// Starts the liveness probe loop if configured. Firing `onUnresponsive`/`onResponsive` is
    /// purely observational (§4.11) — a host that wants to tear down the connection on sustained
    /// unresponsiveness does so from its own hook, e.g. by calling [`Self::disconnect`].
    async fn start_heartbeat(self: &Arc<Self>) {
        let dispatcher = self.dispatcher.clone();
        let mut heartbeat = self.options.heartbeat.clone();
        if heartbeat.on_unresponsive.is_none() {
            heartbeat = heartbeat.on_unresponsive(|| tracing::warn!("heartbeat probe unanswered; peer is unresponsive"));
        }
        if heartbeat.on_responsive.is_none() {
            heartbeat = heartbeat.on_responsive(|| tracing::info!("heartbeat probe recovered; peer is responsive again"));
        }
        let monitor = HeartbeatMonitor::start(dispatcher, heartbeat);
        *self.heartbeat.lock().await = Some(monitor);
    }

    /// Sends a request with no timeout override and no cancellation token, collapsing to the bare
    /// final value. Use [`Self::send_request_with_options`] for a `partialResultToken`-aware or
    /// cancellable request (§4.6, §4.8).
    pub async fn send_request(self: &Arc<Self>, method: impl Into<String>, params: Option<Value>) -> Result<Value, LspError> {
        self.send_request_with_options(method, params, None, None).await?.into_result()
    }

    pub async fn send_request_with_timeout(
        self: &Arc<Self>,
        method: impl Into<String>,
        params: Option<Value>,
        timeout: std::time::Duration,
    ) -> Result<Value, LspError> {
        self.send_request_with_options(method, params, Some(timeout), None).await?.into_result()
    }

    /// Sends a request that can be cancelled from the caller's side: fire `cancellation`'s source
    /// before the response arrives and `$/cancelRequest` is emitted and the call rejects with
    /// [`LspError::RequestCancelled`], without the caller ever needing to learn the allocated
    /// request id (§4.8).
    pub async fn send_request_with_cancellation(
        self: &Arc<Self>,
        method: impl Into<String>,
        params: Option<Value>,
        cancellation: CancellationToken,
    ) -> Result<Value, LspError> {
        self.send_request_with_options(method, params, None, Some(cancellation)).await?.into_result()
    }

    /// The full-power send: returns the [`crate::progress::PartialOutcome`] directly so a caller
    /// that passed a `partialResultToken`/`workDoneToken` in `params` can inspect the accumulated
    /// partials, and optionally honors `timeout` and `cancellation` (§4.6, §4.8).
    pub async fn send_request_with_options(
        self: &Arc<Self>,
        method: impl Into<String>,
        params: Option<Value>,
        timeout: Option<std::time::Duration>,
        cancellation: Option<CancellationToken>,
    ) -> Result<crate::progress::PartialOutcome, LspError> {
        self.dispatcher.send_request(method, params, timeout, cancellation).await
    }

    pub async fn send_notification(self: &Arc<Self>, method: impl Into<String>, params: Option<Value>) -> Result<(), LspError> {
        self.dispatcher.send_notification(method, params).await
    }

    /// Cancels a locally-initiated outbound request by id (§4.5, §9).
    pub async fn cancel_request(self: &Arc<Self>, id: crate::message::Id) -> Result<(), LspError> {
        self.dispatcher.cancel_request(id).await
    }

    pub async fn on_request(&self, method: impl Into<String>, handler: Arc<dyn RequestHandler>) {
        self.dispatcher.on_request(method, handler).await;
    }

    pub async fn on_notification(&self, method: impl Into<String>, handler: Arc<dyn NotificationHandler>) {
        self.dispatcher.on_notification(method, handler).await;
    }

    pub async fn set_capabilities(&self, capabilities: Value) {
        self.capabilities.set_static_capabilities(capabilities).await;
    }

    pub async fn get_server_capabilities(&self) -> Value {
        self.capabilities.static_capabilities().await
    }

    pub fn capabilities(&self) -> &CapabilityRegistry {
        &self.capabilities
    }

    pub fn progress(&self) -> &crate::progress::ProgressCollector {
        self.dispatcher.progress()
    }

    pub fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }

    /// Last trace verbosity requested by the remote peer via `$/setTrace`.
    pub fn trace_value(&self) -> crate::lifecycle::TraceValue {
        self.lifecycle.trace_value()
    }

    pub async fn on_state_change<F>(&self, listener: F)
    where
        F: Fn(&StateChangeEvent) + Send + Sync + 'static,
    {
        self.lifecycle.on_state_change(listener).await;
    }

    /// Registers a one-shot waiter for the next occurrence of `method`, useful for tests and for
    /// application code awaiting a specific push notification (e.g.
    /// `textDocument/publishDiagnostics`).
    pub async fn wait_for_notification(&self, method: impl Into<String>) -> NotificationWaiter {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));
        self.dispatcher
            .on_notification(
                method,
                Arc::new(FnNotificationHandler::new(move |params: Option<Value>| {
                    let slot = slot.clone();
                    async move {
                        if let Some(tx) = slot.lock().await.take() {
                            let _ = tx.send(params);
                        }
                    }
                })),
            )
            .await;
        NotificationWaiter { receiver: rx }
    }

    /// Requests an orderly shutdown: sends `shutdown` and waits for the peer's acknowledgement,
    /// moving to `ShuttingDown`. Call [`Self::exit`] afterwards to close the transport (§4.9).
    pub async fn shutdown(self: &Arc<Self>) -> Result<(), LspError> {
        self.dispatcher.send_request(METHOD_SHUTDOWN, None, None, None).await?;
        self.lifecycle.transition(ConnectionState::ShuttingDown, Some("shutdown".into())).await
    }

    /// Sends `exit` and closes the transport, matching the terminal step of the standard
    /// shutdown sequence (§4.9).
    pub async fn exit(self: &Arc<Self>) -> Result<(), LspError> {
        self.dispatcher.send_notification(METHOD_EXIT, None).await?;
        self.lifecycle.transition(ConnectionState::Exited, Some("exit".into())).await?;
        self.dispatcher.transport().close().await
    }

    /// Forcibly tears down the connection regardless of lifecycle state — the one place that
    /// bypasses monotonic transition checks, since a peer can disconnect from anywhere, including
    /// from `Exited` itself (idempotent).
    pub async fn disconnect(self: &Arc<Self>) -> Result<(), LspError> {
        if let Some(heartbeat) = self.heartbeat.lock().await.take() {
            heartbeat.stop().await;
        }
        self.lifecycle.force(ConnectionState::Exited, Some("disconnect".into())).await;
        self.dispatcher.transport().close().await
    }
}

/// A handle to a pending one-shot notification subscription created by
/// [`Peer::wait_for_notification`].
pub struct NotificationWaiter {
    receiver: oneshot::Receiver<Option<Value>>,
}

impl NotificationWaiter {
    pub async fn wait(self) -> Option<Value> {
        self.receiver.await.unwrap_or(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::FramedTransport;

    fn pair() -> (Arc<dyn Transport>, Arc<dyn Transport>) {
        let (client_io, server_io) = tokio::io::duplex(16384);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, server_write) = tokio::io::split(server_io);
        (FramedTransport::spawn(client_read, client_write), FramedTransport::spawn(server_read, server_write))
    }

    #[tokio::test]
    async fn connect_listen_handshake_reaches_initialized_on_both_sides() {
        let (client_transport, server_transport) = pair();
        let client = Peer::new(Role::Client, client_transport, PeerOptions::builder("demo-client").build().unwrap());
        let server = Peer::new(
            Role::Server,
            server_transport,
            PeerOptions::builder("demo-server").static_capabilities(serde_json::json!({"hoverProvider": true})).build().unwrap(),
        );

        server.listen().await.unwrap();
        let init_result = client.connect().await.unwrap();

        assert_eq!(client.state(), ConnectionState::Initialized);
        assert_eq!(init_result["capabilities"], serde_json::json!({"hoverProvider": true}));

        for _ in 0..50 {
            if server.state() == ConnectionState::Initialized {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(server.state(), ConnectionState::Initialized);
    }

    #[tokio::test]
    async fn shutdown_then_exit_reaches_terminal_state() {
        let (client_transport, server_transport) = pair();
        let client = Peer::new(Role::Client, client_transport, PeerOptions::builder("demo-client").build().unwrap());
        let server = Peer::new(Role::Server, server_transport, PeerOptions::builder("demo-server").build().unwrap());

        server.listen().await.unwrap();
        client.connect().await.unwrap();

        client.shutdown().await.unwrap();
        client.exit().await.unwrap();
        assert_eq!(client.state(), ConnectionState::Exited);
    }

    #[tokio::test]
    async fn dynamic_registration_round_trips_through_register_capability() {
        let (client_transport, server_transport) = pair();
        let client = Peer::new(Role::Client, client_transport, PeerOptions::builder("demo-client").build().unwrap());
        let server = Peer::new(Role::Server, server_transport, PeerOptions::builder("demo-server").build().unwrap());

        server.listen().await.unwrap();
        client.connect().await.unwrap();

        // `client/registerCapability` is the server asking the *receiver* to register a
        // capability against its own registry, so the server is the sender here and the
        // client's registry is what should change.
        let params = serde_json::json!({
            "registrations": [{"id": "r1", "method": "textDocument/formatting"}]
        });
        server.send_request(METHOD_REGISTER_CAPABILITY, Some(params)).await.unwrap();
        assert!(client.capabilities().supports("textDocument/formatting").await);
    }

    #[tokio::test]
    async fn wait_for_notification_resolves_on_first_delivery() {
        let (client_transport, server_transport) = pair();
        let client = Peer::new(Role::Client, client_transport, PeerOptions::builder("demo-client").build().unwrap());
        let server = Peer::new(Role::Server, server_transport, PeerOptions::builder("demo-server").build().unwrap());

        server.listen().await.unwrap();
        client.connect().await.unwrap();

        let waiter = client.wait_for_notification("textDocument/publishDiagnostics").await;
        server
            .send_notification("textDocument/publishDiagnostics", Some(serde_json::json!({"uri": "file:///a", "diagnostics": []})))
            .await
            .unwrap();

        let result = tokio::time::timeout(std::time::Duration::from_millis(200), waiter.wait()).await.unwrap();
        assert_eq!(result.unwrap()["uri"], "file:///a");
    }
}
