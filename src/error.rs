//! Unified error types for the link.
//!
//! Two families live here:
//!
//! - [`Error`] — local failures (protocol violations from the peer, transport
//!   and codec faults, bad configuration). These never cross the wire.
//! - [`DsError`] — the tagged error a request can end with. It is what a
//!   responder sends back in an `error` object and what a requester handler
//!   receives in `on_error`.

use core::fmt;

use crate::rpc::value::Value;

// ---------------------------------------------------------------------------
// Top-level link error
// ---------------------------------------------------------------------------

/// Every local fallible operation funnels into this type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The peer sent something that does not follow the protocol.
    Protocol(ProtocolError),
    /// The byte transport failed.
    Transport(TransportError),
    /// A message could not be encoded or decoded.
    Codec(String),
    /// Configuration is invalid or could not be loaded.
    Config(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Protocol(e) => write!(f, "protocol: {e}"),
            Self::Transport(e) => write!(f, "transport: {e}"),
            Self::Codec(msg) => write!(f, "codec: {msg}"),
            Self::Config(msg) => write!(f, "config: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

// ---------------------------------------------------------------------------
// Protocol errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    /// The envelope is not a map.
    MalformedEnvelope,
    /// A frame lacks a required field.
    MissingField(&'static str),
    /// A field is present but has the wrong shape.
    InvalidField(&'static str),
    /// A request reused a RID that is still open.
    DuplicateRid(u32),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MalformedEnvelope => write!(f, "envelope is not a map"),
            Self::MissingField(name) => write!(f, "missing field '{name}'"),
            Self::InvalidField(name) => write!(f, "invalid field '{name}'"),
            Self::DuplicateRid(rid) => write!(f, "rid {rid} already open"),
        }
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

// ---------------------------------------------------------------------------
// Transport errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// No peer is connected.
    NotConnected,
    /// The underlying stream reported an I/O error.
    Io(std::io::ErrorKind),
    /// An encoded message exceeds the frame size limit.
    FrameTooLarge(usize),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "not connected"),
            Self::Io(kind) => write!(f, "I/O error: {kind}"),
            Self::FrameTooLarge(len) => write!(f, "frame of {len} bytes exceeds limit"),
        }
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.kind())
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Transport(e.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

impl From<postcard::Error> for Error {
    fn from(e: postcard::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Remote-visible request errors
// ---------------------------------------------------------------------------

/// Category of a request failure, as carried in the `type` field of an
/// error object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    PermissionDenied,
    InvalidMethod,
    NotImplemented,
    /// The path does not resolve to a node.
    InvalidPath,
    InvalidParameter,
    InvalidValue,
    Disconnected,
    /// The action or handler failed.
    ServerError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PermissionDenied => "permissionDenied",
            Self::InvalidMethod => "invalidMethod",
            Self::NotImplemented => "notImplemented",
            Self::InvalidPath => "invalidPath",
            Self::InvalidParameter => "invalidParameter",
            Self::InvalidValue => "invalidValue",
            Self::Disconnected => "disconnected",
            Self::ServerError => "serverError",
        }
    }

    /// Unknown type strings map to `ServerError`.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "permissionDenied" => Self::PermissionDenied,
            "invalidMethod" => Self::InvalidMethod,
            "notImplemented" => Self::NotImplemented,
            "invalidPath" => Self::InvalidPath,
            "invalidParameter" => Self::InvalidParameter,
            "invalidValue" => Self::InvalidValue,
            "disconnected" => Self::Disconnected,
            _ => Self::ServerError,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request-level error: `{type, msg, detail}` on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct DsError {
    pub kind: ErrorKind,
    pub msg: String,
    pub detail: Option<String>,
}

impl DsError {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            msg: msg.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn not_found(path: &str) -> Self {
        Self::new(ErrorKind::InvalidPath, format!("no node at {path}"))
    }

    pub fn permission_denied() -> Self {
        Self::new(ErrorKind::PermissionDenied, "permission denied")
    }

    pub fn not_implemented(what: &str) -> Self {
        Self::new(ErrorKind::NotImplemented, format!("{what} not supported"))
    }

    pub fn server(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServerError, msg)
    }

    pub fn disconnected() -> Self {
        Self::new(ErrorKind::Disconnected, "connection lost")
    }

    /// Encode as the `error` object of a response frame.
    pub fn to_value(&self) -> Value {
        let mut v = Value::map()
            .with("type", self.kind.as_str())
            .with("msg", self.msg.as_str());
        if let Some(detail) = &self.detail {
            v = v.with("detail", detail.as_str());
        }
        v
    }

    /// Decode an `error` object. A bare string is accepted as the message.
    pub fn from_value(v: &Value) -> Self {
        if let Some(msg) = v.as_str() {
            return Self::server(msg);
        }
        let kind = v
            .get("type")
            .and_then(Value::as_str)
            .map_or(ErrorKind::ServerError, ErrorKind::from_wire);
        let msg = v
            .get("msg")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let detail = v.get("detail").and_then(Value::as_str).map(str::to_string);
        Self { kind, msg, detail }
    }
}

impl fmt::Display for DsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.msg)?;
        if let Some(detail) = &self.detail {
            write!(f, " ({detail})")?;
        }
        Ok(())
    }
}

impl std::error::Error for DsError {}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Link-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;
