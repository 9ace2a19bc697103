use parla_protocol::FunctionCall;
use serde_json::Value;

use crate::error::{ConnectionError, PeerError, RequestError};

/// Failure carried by [`SessionEvent::Error`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Peer(#[from] PeerError),
}

/// Everything the session reports to its consumer, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Connected {
        reconnected: bool,
    },
    Disconnected {
        reason: String,
    },
    Reconnecting {
        attempt: u32,
    },
    SessionRegistered {
        session_id: String,
    },
    SessionExpired {
        message: String,
    },
    TextChunk {
        request_id: String,
        text: String,
    },
    /// Voice was handed to playback; the samples themselves are not repeated here.
    VoiceChunk {
        request_id: String,
        samples: usize,
        seq: i64,
    },
    MessageComplete {
        request_id: String,
        text: String,
        voice_chunks: u64,
    },
    Interrupted {
        request_id: String,
        reason: Option<String>,
    },
    FunctionCall {
        request_id: String,
        call: FunctionCall,
    },
    /// Request-scoped when `request_id` is set, session-wide otherwise.
    Error {
        request_id: Option<String>,
        error: EventError,
    },
    SpeechStarted {
        request_id: String,
    },
    SpeechEnded {
        request_id: String,
        duration_ms: f64,
    },
    SessionInfo(Value),
}

impl SessionEvent {
    /// Request this event belongs to, if any.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::TextChunk { request_id, .. }
            | Self::VoiceChunk { request_id, .. }
            | Self::MessageComplete { request_id, .. }
            | Self::Interrupted { request_id, .. }
            | Self::FunctionCall { request_id, .. }
            | Self::SpeechStarted { request_id }
            | Self::SpeechEnded { request_id, .. } => Some(request_id),
            Self::Error { request_id, .. } => request_id.as_deref(),
            _ => None,
        }
    }

    /// True for the single terminal event of a request.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::MessageComplete { .. } | Self::Interrupted { .. } => true,
            Self::Error { request_id, .. } => request_id.is_some(),
            _ => false,
        }
    }
}
