//! Lifecycle state machine (C9): enforces `initialize`/`initialized`/`shutdown`/`exit` ordering
//! and gates traffic by state. A single state machine is shared by both client and server roles.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;

use crate::error::LspError;

/// The peer's role, used only to pick which built-in methods legally narrow the pre-Initialized
/// gate (§4.9): a server may answer `initialize` while `Initializing`; a client may not send
/// anything but lifecycle traffic before `Initialized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// `{Disconnected, Connecting, Initializing, Initialized, ShuttingDown, Exited}`. Monotonically
/// non-reversing except that `Exited` is terminal (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Initializing = 2,
    Initialized = 3,
    ShuttingDown = 4,
    Exited = 5,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Disconnected,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Initializing,
            3 => ConnectionState::Initialized,
            4 => ConnectionState::ShuttingDown,
            _ => ConnectionState::Exited,
        }
    }

    fn rank(self) -> u8 {
        self as u8
    }
}

/// Emitted on every state transition (§4.9).
#[derive(Debug, Clone)]
pub struct StateChangeEvent {
    pub previous: ConnectionState,
    pub current: ConnectionState,
    /// Unix epoch milliseconds.
    pub timestamp_ms: u128,
    pub reason: Option<String>,
}

type Listener = Box<dyn Fn(&StateChangeEvent) + Send + Sync>;

/// The verbosity level requested by a `$/setTrace` notification. The runtime only threads this
/// through as routing metadata (§10.5) — it never changes what the `tracing` subscriber itself
/// logs, that's left to the host's own subscriber configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TraceValue {
    Off = 0,
    Messages = 1,
    Verbose = 2,
}

impl TraceValue {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TraceValue::Messages,
            2 => TraceValue::Verbose,
            _ => TraceValue::Off,
        }
    }

    /// Parses the `value` field of a `$/setTrace` notification. Unrecognized strings fall back
    /// to `Off` rather than erroring — trace level is advisory, not protocol-critical.
    pub fn parse(value: &str) -> Self {
        match value {
            "messages" => TraceValue::Messages,
            "verbose" => TraceValue::Verbose,
            _ => TraceValue::Off,
        }
    }
}

/// Shared, atomically-updated connection state with a subscription list for transitions.
pub struct Lifecycle {
    state: AtomicU8,
    trace: AtomicU8,
    listeners: Mutex<Vec<Listener>>,
}

impl Lifecycle {
    pub fn new() -> Arc<Self> {
        Arc::new(Lifecycle {
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            trace: AtomicU8::new(TraceValue::Off as u8),
            listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Current trace verbosity, last set by an inbound `$/setTrace` notification.
    pub fn trace_value(&self) -> TraceValue {
        TraceValue::from_u8(self.trace.load(Ordering::SeqCst))
    }

    pub fn set_trace_value(&self, value: TraceValue) {
        self.trace.store(value as u8, Ordering::SeqCst);
    }

    /// Registers a listener invoked in registration order after every transition. Returns a
    /// disposer index; call [`Self::remove_listener`] with it to unsubscribe (idempotent).
    pub async fn on_state_change<F>(&self, listener: F)
    where
        F: Fn(&StateChangeEvent) + Send + Sync + 'static,
    {
        self.listeners.lock().await.push(Box::new(listener));
    }

    /// Unconditionally moves to `next`, even if that would be a reversal — used only by
    /// `Exited`-on-`disconnect` and by tests. Normal traffic should use [`Self::transition`].
    pub async fn force(&self, next: ConnectionState, reason: Option<String>) {
        self.set(next, reason).await;
    }

    /// Attempts a transition, enforcing monotonic non-reversal (`Exited` excluded, since it's
    /// terminal and already the maximum rank).
    pub async fn transition(&self, next: ConnectionState, reason: Option<String>) -> Result<(), LspError> {
        let current = self.state();
        if current == ConnectionState::Exited {
            return Err(LspError::Lifecycle { operation: "transition", state: current });
        }
        if next.rank() < current.rank() {
            return Err(LspError::Lifecycle { operation: "transition", state: current });
        }
        self.set(next, reason).await;
        Ok(())
    }

    async fn set(&self, next: ConnectionState, reason: Option<String>) {
        let previous = self.state();
        self.state.store(next as u8, Ordering::SeqCst);
        let event = StateChangeEvent {
            previous,
            current: next,
            timestamp_ms: SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis()).unwrap_or(0),
            reason,
        };
        let listeners = self.listeners.lock().await;
        for listener in listeners.iter() {
            listener(&event);
        }
    }

    /// Gates a non-lifecycle request per §4.9: fails closed before `Initialized`, and after
    /// `shutdown` has been answered (`ShuttingDown`/`Exited`) everything but `exit` fails too.
    pub fn gate_request(&self, method: &str) -> Result<(), LspError> {
        if is_lifecycle_method(method) {
            return Ok(());
        }
        match self.state() {
            ConnectionState::Initialized => Ok(()),
            other => Err(LspError::Lifecycle { operation: "request", state: other }),
        }
    }

    /// Gates a non-lifecycle notification the same way requests are gated, except `exit` is
    /// always accepted in `ShuttingDown`.
    pub fn gate_notification(&self, method: &str) -> Result<(), LspError> {
        if method == METHOD_EXIT {
            return Ok(());
        }
        self.gate_request(method)
    }
}

/// Built-in lifecycle/control method names always accepted regardless of state gating.
pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_INITIALIZED: &str = "initialized";
pub const METHOD_SHUTDOWN: &str = "shutdown";
pub const METHOD_EXIT: &str = "exit";
pub const METHOD_CANCEL_REQUEST: &str = "$/cancelRequest";
pub const METHOD_PROGRESS: &str = "$/progress";
pub const METHOD_SET_TRACE: &str = "$/setTrace";

fn is_lifecycle_method(method: &str) -> bool {
    matches!(
        method,
        METHOD_INITIALIZE
            | METHOD_INITIALIZED
            | METHOD_SHUTDOWN
            | METHOD_EXIT
            | METHOD_CANCEL_REQUEST
            | METHOD_PROGRESS
            | METHOD_SET_TRACE
    )
}
