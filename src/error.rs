use core::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Transport,
    Protocol,
    Api,
    Server,
    State,
    Gateway,
}

/// Unified error type for the crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Gateway(#[from] GatewayClosed),
}

impl Error {
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::Transport(_) => ErrorCategory::Transport,
            Self::Protocol(_) => ErrorCategory::Protocol,
            Self::Api(_) => ErrorCategory::Api,
            Self::Server(_) => ErrorCategory::Server,
            Self::State(_) => ErrorCategory::State,
            Self::Gateway(_) => ErrorCategory::Gateway,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Transport(TransportError::Io(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Protocol(ProtocolError::Json(value))
    }
}

pub type Result<T, E = Error> = core::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[source] std::io::Error),
    #[error("request timed out")]
    Timeout,
    #[error("request canceled")]
    Canceled,
    #[error("unsupported url scheme: {0}")]
    Scheme(String),
    #[error("websocket error: {0}")]
    WebSocket(String),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("json decode/encode error: {0}")]
    Json(#[source] serde_json::Error),
    #[error("invalid frame: {0}")]
    InvalidFrame(String),
    #[error("invalid route template: {0}")]
    InvalidTemplate(String),
    #[error("missing route parameter: {0}")]
    MissingParam(String),
    #[error("compressed stream error: {0}")]
    Inflate(String),
}

/// Error response from the Accord REST API (4xx).
///
/// Carries the decoded `{code, message}` envelope plus the request trace id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: u16,
    pub code: Option<i64>,
    pub message: String,
    pub trace: String,
}

impl ApiError {
    pub fn new(
        status: u16,
        code: Option<i64>,
        message: impl Into<String>,
        trace: impl Into<String>,
    ) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            trace: trace.into(),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(
                f,
                "api error (status {}, code {}, trace {}): {}",
                self.status, code, self.trace, self.message
            ),
            None => write!(
                f,
                "api error (status {}, trace {}): {}",
                self.status, self.trace, self.message
            ),
        }
    }
}

impl std::error::Error for ApiError {}

/// 5xx response from the REST API. No body detail, only the trace id.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("server error (status {status}, trace {trace})")]
pub struct ServerError {
    pub status: u16,
    pub trace: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("client is not connected")]
    NotConnected,
    #[error("client is closed")]
    Closed,
    #[error("binary term encoding requested without a term codec")]
    MissingTermCodec,
    #[error("missing required state: {0}")]
    Missing(&'static str),
}

/// Gateway connection terminated by a close code that forbids reconnecting.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("gateway closed (code {code}): {reason}")]
pub struct GatewayClosed {
    pub code: u16,
    pub reason: String,
}
