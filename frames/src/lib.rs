//! Shared frame model and line codec for the JSON-RPC 2.0 wire.
//!
//! This crate owns the wire representation used by the `tether` client and by
//! the mock servers in its tests. Every frame travels as one JSON text per
//! line, terminated by `\n`.
//!
//! DESIGN
//! ======
//! Parsing never fails: a line always classifies into zero or more [`Parsed`]
//! frames, and anything that is not a well-formed JSON-RPC 2.0 message becomes
//! [`Parsed::Invalid`] carrying a reason. Callers decide what to do with each
//! kind; the codec has no opinion about routing.
//!
//! Batches (JSON arrays) classify element by element. Blank lines yield
//! nothing.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Protocol version carried in every frame.
pub const VERSION: &str = "2.0";

// =============================================================================
// ERROR CODES
// =============================================================================

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// Error returned by [`encode_line`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The frame could not be serialized to JSON text.
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

// =============================================================================
// TYPES
// =============================================================================

/// Correlation id of a call. JSON-RPC allows strings and integers.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Str(String),
    Num(i64),
}

impl Id {
    /// Read an id from a JSON value. Floats, objects and nulls are not ids.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self::Str(s.clone())),
            Value::Number(n) => n.as_i64().map(Self::Num),
            _ => None,
        }
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Str(s) => f.write_str(s),
            Self::Num(n) => write!(f, "{n}"),
        }
    }
}

impl From<String> for Id {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<&str> for Id {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<i64> for Id {
    fn from(value: i64) -> Self {
        Self::Num(value)
    }
}

/// The `error` member of an error response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), data: None }
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Read an error object; `code` must be an integer and `message` a string.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let code = obj.get("code")?.as_i64()?;
        let message = obj.get("message")?.as_str()?.to_owned();
        let data = obj.get("data").cloned();
        Some(Self { code, message, data })
    }
}

/// A call that expects a response.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Request {
    pub id: Id,
    pub method: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl Request {
    pub fn new(id: impl Into<Id>, method: impl Into<String>, params: Value) -> Self {
        Self { id: id.into(), method: method.into(), params }
    }
}

/// A call without an id. Never answered.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Notification {
    pub method: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub params: Value,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self { method: method.into(), params }
    }
}

/// Successful response.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Success {
    pub id: Id,
    pub result: Value,
}

impl Success {
    pub fn new(id: impl Into<Id>, result: impl Into<Value>) -> Self {
        Self { id: id.into(), result: result.into() }
    }
}

/// Error response. The id is `null` when the peer could not read the request id.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Failure {
    pub id: Option<Id>,
    pub error: RpcError,
}

impl Failure {
    #[must_use]
    pub fn new(id: Option<Id>, error: RpcError) -> Self {
        Self { id, error }
    }
}

/// A line (or batch element) that is not a valid JSON-RPC 2.0 message.
#[derive(Clone, Debug, PartialEq)]
pub struct Invalid {
    pub reason: String,
    /// The offending value; unparseable text is kept as a JSON string.
    pub raw: Value,
}

/// Terminal answer to a [`Request`].
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    Success(Success),
    Failure(Failure),
}

impl Response {
    #[must_use]
    pub fn id(&self) -> Option<&Id> {
        match self {
            Self::Success(s) => Some(&s.id),
            Self::Failure(f) => f.id.as_ref(),
        }
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    #[must_use]
    pub fn result(&self) -> Option<&Value> {
        match self {
            Self::Success(s) => Some(&s.result),
            Self::Failure(_) => None,
        }
    }

    #[must_use]
    pub fn error(&self) -> Option<&RpcError> {
        match self {
            Self::Success(_) => None,
            Self::Failure(f) => Some(&f.error),
        }
    }
}

/// The `type` of a classified frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Request,
    Notification,
    Success,
    Error,
    Invalid,
}

impl Kind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Notification => "notification",
            Self::Success => "success",
            Self::Error => "error",
            Self::Invalid => "invalid",
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One classified frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Parsed {
    Request(Request),
    Notification(Notification),
    Success(Success),
    Error(Failure),
    Invalid(Invalid),
}

impl Parsed {
    #[must_use]
    pub fn kind(&self) -> Kind {
        match self {
            Self::Request(_) => Kind::Request,
            Self::Notification(_) => Kind::Notification,
            Self::Success(_) => Kind::Success,
            Self::Error(_) => Kind::Error,
            Self::Invalid(_) => Kind::Invalid,
        }
    }

    /// Success and error frames are responses; everything else is not.
    #[must_use]
    pub fn into_response(self) -> Option<Response> {
        match self {
            Self::Success(s) => Some(Response::Success(s)),
            Self::Error(f) => Some(Response::Failure(f)),
            _ => None,
        }
    }

    fn invalid(reason: &str, raw: Value) -> Self {
        Self::Invalid(Invalid { reason: reason.to_owned(), raw })
    }
}

// =============================================================================
// CODEC
// =============================================================================

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    jsonrpc: &'static str,
    #[serde(flatten)]
    body: &'a T,
}

/// Encode a frame as one wire line, `jsonrpc` member included, `\n` appended.
///
/// # Errors
///
/// Returns [`CodecError::Encode`] when the frame payload cannot be serialized.
pub fn encode_line<T: Serialize>(frame: &T) -> Result<String, CodecError> {
    let mut line = serde_json::to_string(&Envelope { jsonrpc: VERSION, body: frame })?;
    line.push('\n');
    Ok(line)
}

/// Classify one wire line into frames.
#[must_use]
pub fn parse_line(line: &str) -> Vec<Parsed> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Array(items)) if items.is_empty() => {
            vec![Parsed::invalid("empty batch", Value::Array(items))]
        }
        Ok(Value::Array(items)) => items.into_iter().map(classify).collect(),
        Ok(value) => vec![classify(value)],
        Err(e) => vec![Parsed::invalid(&format!("parse error: {e}"), Value::String(trimmed.to_owned()))],
    }
}

/// Classify one decoded JSON value.
#[must_use]
pub fn classify(value: Value) -> Parsed {
    let Value::Object(mut obj) = value else {
        return Parsed::invalid("message is not an object", value);
    };

    if obj.get("jsonrpc").and_then(Value::as_str) != Some(VERSION) {
        return Parsed::invalid("missing or unsupported jsonrpc version", Value::Object(obj));
    }

    if obj.contains_key("method") {
        return classify_call(obj);
    }

    if obj.contains_key("result") {
        let Some(id) = obj.get("id").and_then(Id::from_value) else {
            return Parsed::invalid("success frame needs a string or integer id", Value::Object(obj));
        };
        let result = obj.remove("result").unwrap_or(Value::Null);
        return Parsed::Success(Success { id, result });
    }

    if let Some(raw_error) = obj.get("error") {
        let Some(error) = RpcError::from_value(raw_error) else {
            return Parsed::invalid("error member needs an integer code and a string message", Value::Object(obj));
        };
        let id = match obj.get("id") {
            None | Some(Value::Null) => None,
            Some(raw) => match Id::from_value(raw) {
                Some(id) => Some(id),
                None => return Parsed::invalid("error frame id must be a string or integer", Value::Object(obj)),
            },
        };
        return Parsed::Error(Failure { id, error });
    }

    Parsed::invalid("frame is neither a call nor a response", Value::Object(obj))
}

fn classify_call(mut obj: Map<String, Value>) -> Parsed {
    let Some(method) = obj.get("method").and_then(Value::as_str).map(ToOwned::to_owned) else {
        return Parsed::invalid("method must be a string", Value::Object(obj));
    };

    let params_ok = obj.get("params").map_or(true, |p| p.is_object() || p.is_array() || p.is_null());
    if !params_ok {
        return Parsed::invalid("params must be an object or array", Value::Object(obj));
    }

    let id = match obj.get("id") {
        None | Some(Value::Null) => None,
        Some(raw) => match Id::from_value(raw) {
            Some(id) => Some(id),
            None => return Parsed::invalid("request id must be a string or integer", Value::Object(obj)),
        },
    };

    let params = obj.remove("params").unwrap_or(Value::Null);
    match id {
        Some(id) => Parsed::Request(Request { id, method, params }),
        None => Parsed::Notification(Notification { method, params }),
    }
}

#[cfg(test)]
#[path = "lib_test.rs"]
mod tests;
