//! Request/response codec for the guest agent wire protocol.
//!
//! One JSON document per line:
//! - request: `{"execute": "<name>", "arguments": <any>, "id": <any>}`
//! - success: `{"return": <any>, "id": <echoed>}`
//! - failure: `{"error": {"class": "<ErrorClass>", "desc": "<text>"}, "id": <echoed>}`
//!
//! `arguments` stays raw JSON until a handler asks for it, and `id` is kept as
//! a `Value` so it round-trips with its original JSON type.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;
use tracing::error;

use crate::error::{HandlerError, ProtocolError};

/// Description sent back when a line cannot be decoded.
pub const MALFORMED_REQUEST_DESC: &str = "Invalid message format";

/// Last-resort bytes if even the fallback response cannot be serialized.
const INTERNAL_ERROR_LITERAL: &[u8] =
    br#"{"error":{"class":"InternalError","desc":"Failed to marshal response"}}"#;

/// A decoded request.
#[derive(Debug, Deserialize)]
pub struct Request {
    /// Command name.
    pub execute: String,

    /// Opaque arguments, handed to the handler unparsed.
    #[serde(default)]
    pub arguments: Option<Box<RawValue>>,

    /// Correlation id, echoed verbatim in the response.
    #[serde(default)]
    pub id: Option<Value>,
}

impl Request {
    pub fn command(&self) -> &str {
        &self.execute
    }

    pub fn arguments(&self) -> Option<&RawValue> {
        self.arguments.as_deref()
    }
}

/// Protocol-visible error classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Unregistered, disabled or gated-out command.
    CommandNotFound,
    /// Arguments could not be marshalled before dispatch.
    InvalidParameter,
    /// Handler-reported failure.
    GenericError,
    /// The agent failed while producing the response.
    InternalError,
}

/// The `error` member of a failure response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QmpError {
    pub class: ErrorClass,
    pub desc: String,
}

impl QmpError {
    pub fn new(class: ErrorClass, desc: impl Into<String>) -> Self {
        Self {
            class,
            desc: desc.into(),
        }
    }

    pub fn command_not_found(name: &str) -> Self {
        Self::new(
            ErrorClass::CommandNotFound,
            format!("The command {name} has not been found"),
        )
    }
}

impl From<HandlerError> for QmpError {
    fn from(err: HandlerError) -> Self {
        Self::new(ErrorClass::GenericError, err.to_string())
    }
}

/// Exactly one of `return` or `error`.
#[derive(Debug, Serialize)]
pub enum ResponseBody<T = Value> {
    #[serde(rename = "return")]
    Return(T),
    #[serde(rename = "error")]
    Error(QmpError),
}

/// A response ready for encoding.
#[derive(Debug, Serialize)]
pub struct Response<T = Value> {
    #[serde(flatten)]
    pub body: ResponseBody<T>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl<T> Response<T> {
    pub fn success(value: T) -> Self {
        Self {
            body: ResponseBody::Return(value),
            id: None,
        }
    }

    pub fn failure(err: QmpError) -> Self {
        Self {
            body: ResponseBody::Error(err),
            id: None,
        }
    }

    /// Attach the request's correlation id, if it had one.
    #[must_use]
    pub fn with_id(mut self, id: Option<Value>) -> Self {
        self.id = id;
        self
    }
}

impl Response<Value> {
    /// Response sent for a line that could not be decoded.
    pub fn malformed() -> Self {
        Self::failure(QmpError::new(
            ErrorClass::GenericError,
            MALFORMED_REQUEST_DESC,
        ))
    }
}

/// Decode one request line.
///
/// Unknown members are ignored; `arguments` and `id` are optional.
pub fn decode_request(line: &[u8]) -> Result<Request, ProtocolError> {
    let request: Request = serde_json::from_slice(line)?;
    if request.execute.is_empty() {
        return Err(ProtocolError::MissingCommand);
    }
    Ok(request)
}

/// Encode a response. Never fails: a response that cannot be serialized is
/// replaced by an `InternalError` carrying the same id.
pub fn encode_response<T: Serialize>(response: &Response<T>) -> Vec<u8> {
    match serde_json::to_vec(response) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(error = %e, id = ?response.id, "Failed to serialize response");
            let fallback = Response::<Value>::failure(QmpError::new(
                ErrorClass::InternalError,
                "Failed to marshal response",
            ))
            .with_id(response.id.clone());
            serde_json::to_vec(&fallback).unwrap_or_else(|_| INTERNAL_ERROR_LITERAL.to_vec())
        }
    }
}

/// Parse handler arguments into `T`. Absent arguments parse as `{}`, so
/// required fields still fail and `#[serde(default)]` fields apply.
pub fn parse_arguments<T: DeserializeOwned>(args: Option<&RawValue>) -> Result<T, HandlerError> {
    let raw = args.map_or("{}", RawValue::get);
    Ok(serde_json::from_str(raw)?)
}
