//! `lspy`: a symmetric JSON-RPC 2.0 / Language Server Protocol runtime shared by a language
//! client and a language server. The same [`peer::Peer`] type drives either side of a connection
//! over a pluggable [`transport::Transport`], with request/response correlation, cancellation,
//! progress aggregation, a bidirectional middleware pipeline, a lifecycle state machine, and a
//! capability registry layered on top of a length-prefixed framing codec.
//!
//! Start with [`peer::Peer::new`], built from a [`peer_options::PeerOptions`] and a transport
//! (commonly [`transport::stdio`]), then call [`peer::Peer::connect`] (client) or
//! [`peer::Peer::listen`] (server).

pub mod cancellation;
pub mod capability;
pub mod dispatcher;
pub mod error;
pub mod framing;
pub mod heartbeat;
pub mod lifecycle;
pub mod message;
pub mod middleware;
pub mod peer;
pub mod peer_options;
pub mod pending;
pub mod progress;
pub mod subscription;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod test_support;

pub use cancellation::{CancellationToken, CancellationTokenSource};
pub use capability::{CapabilityRegistry, Registration};
pub use dispatcher::{Dispatcher, FnNotificationHandler, FnRequestHandler, NotificationHandler, RequestHandler};
pub use error::{error_codes, FramingError, LspError, ResponseError};
pub use lifecycle::{ConnectionState, Lifecycle, Role, StateChangeEvent, TraceValue};
pub use message::{Direction, Id, Message, MessageType};
pub use middleware::{Middleware, MiddlewareContext, MiddlewareFilter, Outcome};
pub use peer::{NotificationWaiter, Peer};
pub use peer_options::{HeartbeatHook, HeartbeatOptions, PeerOptions, PeerOptionsBuilder, ValidationFailure};
pub use progress::{PartialOutcome, ProgressCollector, ProgressToken};
pub use transport::{stdio, FramedTransport, Transport};
