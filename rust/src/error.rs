use parla_media::MediaError;
use parla_protocol::{ErrorPayload, ProtocolError, ERROR_SESSION_INVALID};

use crate::store::StoreError;

/// Session-wide connection failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("invalid endpoint {0}")]
    InvalidEndpoint(String),
    #[error("connect to {url} timed out after {timeout_ms} ms")]
    ConnectTimeout { url: String, timeout_ms: u64 },
    #[error("connect to {url} failed: {reason}")]
    Connect { url: String, reason: String },
    #[error("no heartbeat within {0} ms")]
    KeepAliveExpired(u64),
    #[error("gave up reconnecting after {attempts} attempts: {last_error}")]
    ReconnectExhausted { attempts: u32, last_error: String },
    #[error("connection closed")]
    Closed,
}

/// How a peer-reported error should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Network,
    Auth,
    SessionExpired,
    Unknown,
}

impl ErrorClass {
    pub fn classify(code: &str) -> Self {
        let code = code.to_ascii_uppercase();
        if code == ERROR_SESSION_INVALID || code.contains("SESSION_EXPIRED") {
            Self::SessionExpired
        } else if ["AUTH", "UNAUTHORIZED", "FORBIDDEN", "TOKEN", "CREDENTIAL"]
            .iter()
            .any(|k| code.contains(k))
        {
            Self::Auth
        } else if ["NETWORK", "TIMEOUT", "UNAVAILABLE", "CONNECTION"]
            .iter()
            .any(|k| code.contains(k))
        {
            Self::Network
        } else {
            Self::Unknown
        }
    }
}

/// An `ERROR` frame from the peer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("peer error {code}: {message}")]
pub struct PeerError {
    pub code: String,
    pub message: String,
    pub class: ErrorClass,
    pub request_id: Option<String>,
}

impl From<&ErrorPayload> for PeerError {
    fn from(payload: &ErrorPayload) -> Self {
        Self {
            code: payload.error_code.clone(),
            message: payload.error_msg.clone(),
            class: ErrorClass::classify(&payload.error_code),
            request_id: payload.request_id.clone().filter(|id| !id.is_empty()),
        }
    }
}

/// Terminal failure of a single request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("request {request_id} timed out after {timeout_ms} ms")]
    Timeout { request_id: String, timeout_ms: u64 },
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error("session invalidated")]
    SessionInvalidated,
    #[error("connection lost: {0}")]
    ConnectionLost(ConnectionError),
    #[error("request {0} is already in flight")]
    Duplicate(String),
    #[error("request {0} could not be sent")]
    NotSent(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("voice stream {0} is already open")]
    StreamAlreadyOpen(String),
    #[error("no voice stream is open")]
    NoOpenStream,
    #[error("transport is not open")]
    NotConnected,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Errors returned by [`crate::SessionHandle`] calls.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Media(#[from] MediaError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no REGISTER_ACK within {0} ms")]
    RegisterTimeout(u64),
    #[error("no SESSION_INFO within {0} ms")]
    QueryTimeout(u64),
    #[error("session is not registered")]
    NotRegistered,
    #[error("already listening")]
    AlreadyListening,
    #[error("session controller stopped")]
    Stopped,
}
