use std::fmt;

use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// JSON-RPC version marker stamped on every envelope.
pub const JSONRPC_VERSION: &str = "2.0";

/// Protocol version reported by `initialize`.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

// ── Error taxonomy ──

/// The fixed error-code table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Malformed body.
    ParseError = -32700,
    /// Missing or invalid required field.
    InvalidRequest = -32600,
    /// Unregistered method or tool name.
    MethodNotFound = -32601,
    InvalidParams = -32602,
    /// Handler execution failure.
    InternalError = -32603,
    ServerNotInitialized = -32001,
    ResourceNotFound = -32002,
    UnsupportedMethod = -32003,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 8] = [
        ErrorCode::ParseError,
        ErrorCode::InvalidRequest,
        ErrorCode::MethodNotFound,
        ErrorCode::InvalidParams,
        ErrorCode::InternalError,
        ErrorCode::ServerNotInitialized,
        ErrorCode::ResourceNotFound,
        ErrorCode::UnsupportedMethod,
    ];

    /// Integer value as it appears on the wire.
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Reverse lookup; `None` for codes outside the table.
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.code() == code)
    }

    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::ParseError => "Parse error",
            ErrorCode::InvalidRequest => "Invalid request",
            ErrorCode::MethodNotFound => "Method not found",
            ErrorCode::InvalidParams => "Invalid params",
            ErrorCode::InternalError => "Internal error",
            ErrorCode::ServerNotInitialized => "Server not initialized",
            ErrorCode::ResourceNotFound => "Resource not found",
            ErrorCode::UnsupportedMethod => "Unsupported method",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message(), self.code())
    }
}

// ── Request ──

/// Inbound request envelope.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Request {
    /// Caller-supplied tracing token. Numbers are accepted and kept as text.
    #[serde(
        default,
        deserialize_with = "deserialize_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<String>,
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    #[serde(default)]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Map<String, Value>>,
    /// Session token used to route the response onto an SSE stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
}

fn default_jsonrpc() -> String {
    JSONRPC_VERSION.into()
}

fn deserialize_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let value = Option::<Value>::deserialize(deserializer)?;
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(other) => id_text(&other)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom("id must be a string or a number")),
    }
}

fn id_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl Default for Request {
    fn default() -> Self {
        Request {
            id: None,
            jsonrpc: default_jsonrpc(),
            method: String::new(),
            params: None,
            session: None,
        }
    }
}

impl Request {
    pub fn new(method: impl Into<String>) -> Self {
        Request {
            method: method.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Set params from a JSON value. Anything but an object clears them.
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = match params {
            Value::Object(map) => Some(map),
            _ => None,
        };
        self
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    /// The id to echo in the response; empty when the caller sent none.
    pub fn response_id(&self) -> String {
        self.id.clone().unwrap_or_default()
    }

    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.as_ref().and_then(|p| p.get(key))
    }

    /// A string param, treating the empty string as absent.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.param(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    /// Decode an envelope from a raw HTTP body.
    ///
    /// Failures come back as ready-to-send error responses: unparsable JSON
    /// is a `ParseError` with an empty id, a well-formed body with the wrong
    /// shape is an `InvalidRequest` carrying whatever id could be recovered.
    pub fn decode(body: &[u8]) -> Result<Request, Response> {
        let value: Value = serde_json::from_slice(body).map_err(|e| {
            Response::failure(
                String::new(),
                RpcError::new(ErrorCode::ParseError, ErrorCode::ParseError.message())
                    .with_data(e.to_string()),
            )
        })?;

        if !value.is_object() {
            return Err(Response::error(
                String::new(),
                ErrorCode::InvalidRequest,
                "request must be a JSON object",
            ));
        }

        let recovered_id = value.get("id").and_then(id_text).unwrap_or_default();
        serde_json::from_value(value).map_err(|e| {
            Response::failure(
                recovered_id,
                RpcError::new(ErrorCode::InvalidRequest, ErrorCode::InvalidRequest.message())
                    .with_data(e.to_string()),
            )
        })
    }
}

// ── Response ──

/// Outbound response envelope.
///
/// Exactly one of `result` or `error` is present; the type makes the other
/// combinations unrepresentable, and deserialization rejects them.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: String,
    outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Result(Value),
    Error(RpcError),
}

impl Response {
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Response {
            id: id.into(),
            outcome: Outcome::Result(result),
        }
    }

    pub fn failure(id: impl Into<String>, error: RpcError) -> Self {
        Response {
            id: id.into(),
            outcome: Outcome::Error(error),
        }
    }

    pub fn error(id: impl Into<String>, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::failure(id, RpcError::new(code, message))
    }

    /// Build an error response from a crate error, keeping its taxonomy code.
    pub fn from_error(id: impl Into<String>, err: &McpError) -> Self {
        Self::failure(id, err.to_rpc_error())
    }

    pub fn result(&self) -> Option<&Value> {
        match &self.outcome {
            Outcome::Result(v) => Some(v),
            Outcome::Error(_) => None,
        }
    }

    pub fn error_object(&self) -> Option<&RpcError> {
        match &self.outcome {
            Outcome::Result(_) => None,
            Outcome::Error(e) => Some(e),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, Outcome::Error(_))
    }

    pub fn outcome(&self) -> &Outcome {
        &self.outcome
    }

    pub fn into_outcome(self) -> Outcome {
        self.outcome
    }
}

impl Serialize for Response {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("jsonrpc", JSONRPC_VERSION)?;
        map.serialize_entry("id", &self.id)?;
        match &self.outcome {
            Outcome::Result(value) => map.serialize_entry("result", value)?,
            Outcome::Error(err) => map.serialize_entry("error", err)?,
        }
        map.end()
    }
}

/// Wire shape used only to validate inbound responses.
#[derive(Deserialize)]
struct RawResponse {
    #[serde(default, deserialize_with = "deserialize_id")]
    id: Option<String>,
    #[serde(default, deserialize_with = "present")]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

/// Distinguishes `"result": null` (present) from a missing field.
fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl<'de> Deserialize<'de> for Response {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawResponse::deserialize(deserializer)?;
        let outcome = match (raw.result, raw.error) {
            (Some(result), None) => Outcome::Result(result),
            (None, Some(error)) => Outcome::Error(error),
            (Some(_), Some(_)) => {
                return Err(serde::de::Error::custom(
                    "response carries both result and error",
                ));
            }
            (None, None) => {
                return Err(serde::de::Error::custom(
                    "response carries neither result nor error",
                ));
            }
        };
        Ok(Response {
            id: raw.id.unwrap_or_default(),
            outcome,
        })
    }
}

/// Wire error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        RpcError {
            code: code.code(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: impl Into<Value>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// The taxonomy entry for this error, if the code is one of ours.
    pub fn kind(&self) -> Option<ErrorCode> {
        ErrorCode::from_code(self.code)
    }
}

// ── Crate error ──

/// Errors raised by registries, handlers, sessions and the transport.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("method not found: {0}")]
    MethodNotFound(String),
    #[error("resource not found: {0}")]
    ResourceNotFound(String),
    #[error("server not initialized for session {0}")]
    NotInitialized(String),
    #[error("tool already registered: {0}")]
    DuplicateTool(String),
    #[error("resource already registered: {0}")]
    DuplicateResource(String),
    #[error("prompt already registered: {0}")]
    DuplicatePrompt(String),
    #[error("invalid uri pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },
    #[error("session already exists: {0}")]
    DuplicateSession(String),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("session queue full: {0}")]
    QueueFull(String),
    #[error("session manager is shut down")]
    ShuttingDown,
    #[error("tool {tool} failed: {message}")]
    ToolExecution { tool: String, message: String },
    #[error("reading {uri} failed: {message}")]
    ResourceRead { uri: String, message: String },
    #[error("prompt {prompt} failed: {message}")]
    PromptRender { prompt: String, message: String },
    #[error("config error: {0}")]
    Config(String),
    #[error("failed to bind on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Other(String),
}

impl McpError {
    /// Taxonomy code used when this error reaches the wire.
    pub fn code(&self) -> ErrorCode {
        match self {
            McpError::Parse(_) | McpError::Json(_) => ErrorCode::ParseError,
            McpError::InvalidRequest(_)
            | McpError::DuplicateTool(_)
            | McpError::DuplicateResource(_)
            | McpError::DuplicatePrompt(_)
            | McpError::InvalidPattern { .. }
            | McpError::DuplicateSession(_)
            | McpError::SessionNotFound(_) => ErrorCode::InvalidRequest,
            McpError::InvalidParams(_) => ErrorCode::InvalidParams,
            McpError::MethodNotFound(_) => ErrorCode::MethodNotFound,
            McpError::ResourceNotFound(_) => ErrorCode::ResourceNotFound,
            McpError::NotInitialized(_) => ErrorCode::ServerNotInitialized,
            McpError::QueueFull(_)
            | McpError::ShuttingDown
            | McpError::ToolExecution { .. }
            | McpError::ResourceRead { .. }
            | McpError::PromptRender { .. }
            | McpError::Config(_)
            | McpError::Bind { .. }
            | McpError::Io(_)
            | McpError::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Wire form. Handler failures carry the underlying text as `data`.
    pub fn to_rpc_error(&self) -> RpcError {
        let err = RpcError::new(self.code(), self.to_string());
        match self {
            McpError::ToolExecution { message, .. }
            | McpError::ResourceRead { message, .. }
            | McpError::PromptRender { message, .. } => err.with_data(message.clone()),
            _ => err,
        }
    }
}
