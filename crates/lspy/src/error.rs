use std::time::Duration;

use serde_json::Value;

use crate::lifecycle::ConnectionState;
use crate::message::Id;

/// Errors that may occur anywhere in the protocol runtime.
#[derive(Debug, thiserror::Error)]
pub enum LspError {
    #[error("transport error: {0}")]
    Transport(#[source] std::io::Error),

    #[error("transport is closed")]
    TransportClosed,

    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("message failed shape validation: {0}")]
    Protocol(String),

    #[error("params for `{method}` failed validation: {reason}")]
    InvalidParams { method: String, reason: String },

    #[error("handler for `{method}` failed: {message}")]
    Handler { method: String, message: String },

    #[error("request was cancelled")]
    RequestCancelled,

    #[error("request timed out after {0:?}")]
    RequestTimedOut(Duration),

    #[error("middleware mutated the message id from {before:?} to {after:?}")]
    PipelineViolation { before: Id, after: Id },

    #[error("operation `{operation}` is not permitted in state {state:?}")]
    Lifecycle {
        operation: &'static str,
        state: ConnectionState,
    },

    #[error("unknown registration id: {0:?}")]
    UnknownRegistrationId(Vec<String>),

    #[error("dynamic registration for `{method}` was rejected: client did not declare static support")]
    UndeclaredDynamicRegistration { method: String },

    #[error("registration id `{0}` is already in use")]
    DuplicateRegistrationId(String),

    #[error("peer disconnected")]
    Disconnected,

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("the remote peer returned a JSON-RPC error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<Value>,
    },
}

impl LspError {
    /// Maps this error onto a standard JSON-RPC error object.
    pub fn to_response_error(&self) -> ResponseError {
        match self {
            LspError::Protocol(msg) => ResponseError::new(error_codes::INVALID_REQUEST, msg.clone()),
            LspError::InvalidParams { reason, .. } => {
                ResponseError::new(error_codes::INVALID_PARAMS, reason.clone())
            }
            LspError::Handler { message, .. } => {
                ResponseError::new(error_codes::INTERNAL_ERROR, message.clone())
            }
            LspError::RequestCancelled => {
                ResponseError::new(error_codes::REQUEST_CANCELLED, "request was cancelled".into())
            }
            LspError::Lifecycle { state, .. } => match state {
                ConnectionState::Disconnected
                | ConnectionState::Connecting
                | ConnectionState::Initializing => ResponseError::new(
                    error_codes::SERVER_NOT_INITIALIZED,
                    "server is not yet initialized".into(),
                ),
                _ => ResponseError::new(error_codes::INVALID_REQUEST, "request is not permitted in the current state".into()),
            },
            LspError::UnknownRegistrationId(ids) => ResponseError {
                code: error_codes::INVALID_PARAMS,
                message: "unknown registration id".into(),
                data: Some(serde_json::json!({ "unknownRegistrationIds": ids })),
            },
            LspError::UndeclaredDynamicRegistration { method } => ResponseError::new(
                error_codes::INVALID_PARAMS,
                format!("method `{method}` was not declared in static capabilities"),
            ),
            LspError::DuplicateRegistrationId(id) => {
                ResponseError::new(error_codes::INVALID_PARAMS, format!("registration id `{id}` is already in use"))
            }
            LspError::Remote { code, message, data } => ResponseError {
                code: *code,
                message: message.clone(),
                data: data.clone(),
            },
            other => ResponseError::new(error_codes::INTERNAL_ERROR, other.to_string()),
        }
    }
}

/// Errors produced by the framing codec (C1). `IncompleteHeaders` is not fatal — it signals
/// that the decoder should wait for more bytes.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("headers incomplete, awaiting more bytes")]
    IncompleteHeaders,

    #[error("missing mandatory Content-Length header")]
    MissingContentLength,

    #[error("Content-Length header was not a valid decimal byte count: {0}")]
    InvalidContentLength(String),

    #[error("message body was not valid JSON: {0}")]
    MalformedJson(String),

    #[error("message body was not valid UTF-8")]
    InvalidUtf8,

    #[error("message of {size} bytes exceeds the configured cap of {cap} bytes")]
    OversizeMessage { size: usize, cap: usize },
}

/// A JSON-RPC error object, as carried by `ErrorResponse` and by [`LspError::to_response_error`].
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    pub fn new(code: i64, message: String) -> Self {
        ResponseError { code, message, data: None }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl std::fmt::Display for ResponseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for ResponseError {}

/// Standard JSON-RPC / LSP error codes emitted by the runtime (§6).
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const SERVER_NOT_INITIALIZED: i64 = -32002;
    pub const REQUEST_CANCELLED: i64 = -32800;
    pub const CONTENT_MODIFIED: i64 = -32801;
}
