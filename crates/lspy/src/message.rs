//! Discriminated JSON-RPC message kinds and the shape validation that classifies raw JSON into
//! them (C3).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{error_codes, ResponseError};

/// A JSON-RPC request/response identifier. Either an integer or a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Number(i64),
    String(String),
}

impl From<i64> for Id {
    fn from(value: i64) -> Self {
        Id::Number(value)
    }
}

impl From<u64> for Id {
    fn from(value: u64) -> Self {
        Id::Number(value as i64)
    }
}

impl From<String> for Id {
    fn from(value: String) -> Self {
        Id::String(value)
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Id::Number(n) => write!(f, "{n}"),
            Id::String(s) => write!(f, "{s}"),
        }
    }
}

/// A validated JSON-RPC 2.0 message. `jsonrpc` is always `"2.0"` and is not stored, matching the
/// wire requirement without repeating it on every variant.
#[derive(Debug, Clone)]
pub enum Message {
    Request { id: Id, method: String, params: Option<Value> },
    Notification { method: String, params: Option<Value> },
    SuccessResponse { id: Id, result: Value },
    ErrorResponse { id: Id, error: ResponseError },
}

impl Message {
    pub fn request(id: impl Into<Id>, method: impl Into<String>, params: Option<Value>) -> Self {
        Message::Request { id: id.into(), method: method.into(), params }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Message::Notification { method: method.into(), params }
    }

    pub fn success(id: impl Into<Id>, result: Value) -> Self {
        Message::SuccessResponse { id: id.into(), result }
    }

    pub fn error(id: impl Into<Id>, error: ResponseError) -> Self {
        Message::ErrorResponse { id: id.into(), error }
    }

    /// The message's id, if it carries one. Requests and responses carry an id; notifications
    /// never do. Exposed read-only: nothing in this crate hands out a `&mut Id` to a `Message`.
    pub fn id(&self) -> Option<&Id> {
        match self {
            Message::Request { id, .. } => Some(id),
            Message::Notification { .. } => None,
            Message::SuccessResponse { id, .. } => Some(id),
            Message::ErrorResponse { id, .. } => Some(id),
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request { method, .. } => Some(method),
            Message::Notification { method, .. } => Some(method),
            Message::SuccessResponse { .. } | Message::ErrorResponse { .. } => None,
        }
    }

    pub fn kind(&self) -> MessageType {
        match self {
            Message::Request { .. } => MessageType::Request,
            Message::Notification { .. } => MessageType::Notification,
            Message::SuccessResponse { .. } => MessageType::Response,
            Message::ErrorResponse { .. } => MessageType::Error,
        }
    }

    /// Serializes to the wire JSON value, including the `"jsonrpc": "2.0"` tag.
    pub fn to_value(&self) -> Value {
        match self {
            Message::Request { id, method, params } => {
                let mut obj = serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "method": method,
                });
                if let Some(params) = params {
                    obj["params"] = params.clone();
                }
                obj
            }
            Message::Notification { method, params } => {
                let mut obj = serde_json::json!({
                    "jsonrpc": "2.0",
                    "method": method,
                });
                if let Some(params) = params {
                    obj["params"] = params.clone();
                }
                obj
            }
            Message::SuccessResponse { id, result } => serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": result,
            }),
            Message::ErrorResponse { id, error } => serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": error,
            }),
        }
    }
}

/// The direction a message (and its [`crate::middleware::MiddlewareContext`]) travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

/// The discriminant used by middleware contexts and logging; mirrors [`Message::kind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Request,
    Notification,
    Response,
    Error,
}

/// Classifies a raw JSON value into a [`Message`], per the field-presence rules in §4.3:
/// `{id, method}` -> request, `{method}` only -> notification, `{id, result}` -> success,
/// `{id, error}` -> error response. Anything else is malformed.
pub fn classify(value: Value) -> Result<Message, ClassifyError> {
    let Value::Object(mut obj) = value else {
        return Err(ClassifyError::NotAnObject);
    };

    let id = obj.remove("id");
    let method = obj.remove("method");

    if let Some(method) = method {
        let method = method
            .as_str()
            .ok_or(ClassifyError::Malformed { recovered_id: extract_id(id.as_ref()) })?
            .to_string();
        let params = obj.remove("params");

        return match id {
            Some(id_value) => {
                let id = extract_id(Some(&id_value))
                    .ok_or(ClassifyError::Malformed { recovered_id: None })?;
                Ok(Message::Request { id, method, params })
            }
            None => Ok(Message::Notification { method, params }),
        };
    }

    if let Some(id_value) = id {
        let Some(id) = extract_id(Some(&id_value)) else {
            return Err(ClassifyError::Malformed { recovered_id: None });
        };

        if let Some(result) = obj.remove("result") {
            return Ok(Message::SuccessResponse { id, result });
        }
        if let Some(error) = obj.remove("error") {
            let error: ResponseError = serde_json::from_value(error)
                .map_err(|_| ClassifyError::Malformed { recovered_id: Some(id.clone()) })?;
            return Ok(Message::ErrorResponse { id, error });
        }

        return Err(ClassifyError::Malformed { recovered_id: Some(id) });
    }

    Err(ClassifyError::Malformed { recovered_id: None })
}

fn extract_id(value: Option<&Value>) -> Option<Id> {
    match value? {
        Value::Number(n) => n.as_i64().map(Id::Number),
        Value::String(s) => Some(Id::String(s.clone())),
        _ => None,
    }
}

/// Failure to classify a raw JSON value as one of the four message kinds.
#[derive(Debug, Clone)]
pub enum ClassifyError {
    NotAnObject,
    /// The object had some id/method/result/error shape that didn't fit any variant.
    /// `recovered_id` carries the id if one could still be parsed out, so the caller can reply
    /// with a standard error response instead of dropping silently (§4.3).
    Malformed { recovered_id: Option<Id> },
}

impl ClassifyError {
    pub fn recovered_id(&self) -> Option<&Id> {
        match self {
            ClassifyError::NotAnObject => None,
            ClassifyError::Malformed { recovered_id } => recovered_id.as_ref(),
        }
    }

    pub fn to_response_error(&self) -> ResponseError {
        ResponseError::new(error_codes::INVALID_REQUEST, "malformed JSON-RPC message".into())
    }
}
