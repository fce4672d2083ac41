//! The gateway wire envelope.
//!
//! Every message on the socket is one [`Frame`]: a request from the client,
//! a response to a request, or a server-pushed event. The `type` field
//! selects which of the three shapes is present, so a frame can never carry
//! fields from two shapes at once.
//!
//! Payloads are kept as opaque JSON values at this layer and only decoded
//! into concrete types by the handler that owns them.

use crate::error::GwResult;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Machine-readable error codes carried in [`ErrorShape::code`].
pub mod codes {
    /// Malformed handshake (wrong first frame, protocol mismatch).
    pub const PROTOCOL_ERROR: &str = "protocol_error";
    /// Request parameters could not be decoded.
    pub const INVALID_PARAMS: &str = "invalid_params";
    /// Handshake authentication failed; the message carries the reason.
    pub const UNAUTHORIZED: &str = "unauthorized";
    /// No handler is registered under the requested method.
    pub const METHOD_NOT_FOUND: &str = "method_not_found";
    /// The configuration path is outside the allow-list.
    pub const FORBIDDEN: &str = "forbidden";
    /// The configuration path does not exist.
    pub const NOT_FOUND: &str = "not_found";
    /// A required collaborator is not configured.
    pub const UNAVAILABLE: &str = "unavailable";
    /// The agent runner failed or timed out.
    pub const AGENT_ERROR: &str = "agent_error";
    /// Transport-level parse failure before a request id is known.
    pub const PARSE_ERROR: &str = "-32700";
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Request(RequestFrame),
    Response(ResponseFrame),
    Event(EventFrame),
}

/// Client → server call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    pub id: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// Server → client reply to exactly one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    pub id: String,
    /// Tri-state: `Some(true)`, `Some(false)` or absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorShape>,
}

/// Server-pushed notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default)]
    pub seq: u64,
}

/// Error body of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorShape {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorShape {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            retryable: false,
            retry_after_ms: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Mark the error as retryable, optionally after a delay.
    pub fn retry_after(mut self, after_ms: Option<u64>) -> Self {
        self.retryable = true;
        self.retry_after_ms = after_ms;
        self
    }
}

/// Serialize a payload, treating JSON `null` as "no payload" so that the
/// field is omitted on the wire and parses back to `None`.
fn to_payload<T: Serialize>(value: &T) -> GwResult<Option<Value>> {
    let value = serde_json::to_value(value)?;
    Ok((!value.is_null()).then_some(value))
}

impl Frame {
    /// Build a request frame.
    pub fn request<T: Serialize>(
        id: impl Into<String>,
        method: impl Into<String>,
        params: &T,
    ) -> GwResult<Self> {
        Ok(Frame::Request(RequestFrame {
            id: id.into(),
            method: method.into(),
            params: to_payload(params)?,
        }))
    }

    /// Build a success response (`ok = true`).
    pub fn ok<T: Serialize>(id: impl Into<String>, payload: &T) -> GwResult<Self> {
        Ok(Frame::Response(ResponseFrame {
            id: id.into(),
            ok: Some(true),
            payload: to_payload(payload)?,
            error: None,
        }))
    }

    /// Build an error response (`ok = false`).
    pub fn error(id: impl Into<String>, error: ErrorShape) -> Self {
        Frame::Response(ResponseFrame {
            id: id.into(),
            ok: Some(false),
            payload: None,
            error: Some(error),
        })
    }

    /// Build an event frame.
    pub fn event<T: Serialize>(name: impl Into<String>, payload: &T, seq: u64) -> GwResult<Self> {
        Ok(Frame::Event(EventFrame {
            event: name.into(),
            payload: to_payload(payload)?,
            seq,
        }))
    }

    /// Wire name of the frame type.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Request(_) => "request",
            Frame::Response(_) => "response",
            Frame::Event(_) => "event",
        }
    }
}

impl RequestFrame {
    /// Decode the parameters into `T`. Returns `Ok(None)` when no
    /// parameters were sent.
    pub fn decode_params<T: DeserializeOwned>(&self) -> GwResult<Option<T>> {
        match &self.params {
            Some(value) => Ok(Some(T::deserialize(value)?)),
            None => Ok(None),
        }
    }
}

impl ResponseFrame {
    /// Decode the success payload into `T`.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> GwResult<Option<T>> {
        match &self.payload {
            Some(value) => Ok(Some(T::deserialize(value)?)),
            None => Ok(None),
        }
    }
}
