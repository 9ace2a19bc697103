//! Wire envelope for the agent session protocol.
//!
//! Every control message is a JSON [`Frame`]. Audio travels separately as raw
//! little-endian PCM in binary websocket messages and never appears here.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

mod payload;

pub use payload::*;

pub const PROTOCOL_VERSION: u8 = 1;

/// `streamSeq` / `textStreamSeq` / `voiceStreamSeq` value that opens a stream.
pub const STREAM_SEQ_START: i64 = 0;
/// Sequence value that terminates a stream.
pub const STREAM_SEQ_END: i64 = -1;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MsgType {
    Register,
    RegisterAck,
    Request,
    Response,
    Interrupt,
    InterruptAck,
    Error,
    Heartbeat,
    HeartbeatReply,
    Shutdown,
    SessionQuery,
    SessionInfo,
    #[serde(other)]
    Unknown,
}

impl MsgType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Register => "REGISTER",
            Self::RegisterAck => "REGISTER_ACK",
            Self::Request => "REQUEST",
            Self::Response => "RESPONSE",
            Self::Interrupt => "INTERRUPT",
            Self::InterruptAck => "INTERRUPT_ACK",
            Self::Error => "ERROR",
            Self::Heartbeat => "HEARTBEAT",
            Self::HeartbeatReply => "HEARTBEAT_REPLY",
            Self::Shutdown => "SHUTDOWN",
            Self::SessionQuery => "SESSION_QUERY",
            Self::SessionInfo => "SESSION_INFO",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for MsgType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("invalid {msg_type} payload: {source}")]
    Payload {
        msg_type: MsgType,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    pub version: u8,
    pub msg_type: MsgType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub timestamp: i64,
}

impl Frame {
    pub fn new<P: Serialize>(
        msg_type: MsgType,
        session_id: Option<&str>,
        payload: &P,
    ) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_value(payload)
            .map_err(|source| ProtocolError::Payload { msg_type, source })?;
        Ok(Self {
            version: PROTOCOL_VERSION,
            msg_type,
            session_id: session_id.map(str::to_string),
            payload,
            timestamp: chrono::Utc::now().timestamp_millis(),
        })
    }

    /// Frame with an empty payload object (HEARTBEAT, SESSION_QUERY).
    pub fn bare(msg_type: MsgType, session_id: Option<&str>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            msg_type,
            session_id: session_id.map(str::to_string),
            payload: Value::Object(Default::default()),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn heartbeat_reply(session_id: Option<&str>) -> Result<Self, ProtocolError> {
        let payload = HeartbeatReplyPayload {
            client_status: ClientStatus::Online,
        };
        Self::new(MsgType::HeartbeatReply, session_id, &payload)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let frame: Frame = serde_json::from_str(text)?;
        if frame.version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(frame.version));
        }
        Ok(frame)
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        T::deserialize(&self.payload).map_err(|source| ProtocolError::Payload {
            msg_type: self.msg_type,
            source,
        })
    }

    /// Request id carried by the payload, if any (`requestId` or `interruptRequestId`).
    pub fn request_id(&self) -> Option<&str> {
        self.payload
            .get("requestId")
            .or_else(|| self.payload.get("interruptRequestId"))
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_without_payload_decodes() {
        let raw = r#"{"version":1,"msgType":"HEARTBEAT","sessionId":"s-1","timestamp":5}"#;
        let frame = Frame::decode(raw).expect("decode heartbeat");
        assert_eq!(frame.msg_type, MsgType::Heartbeat);
        assert_eq!(frame.session_id.as_deref(), Some("s-1"));
        assert!(frame.payload.is_null());
    }

    #[test]
    fn unknown_msg_type_is_tolerated() {
        let raw = r#"{"version":1,"msgType":"BRAND_NEW","payload":{}}"#;
        let frame = Frame::decode(raw).expect("decode unknown type");
        assert_eq!(frame.msg_type, MsgType::Unknown);
    }

    #[test]
    fn rejects_other_protocol_versions() {
        let raw = r#"{"version":9,"msgType":"HEARTBEAT"}"#;
        let err = Frame::decode(raw).expect_err("version 9 must be rejected");
        assert!(matches!(err, ProtocolError::UnsupportedVersion(9)));
    }

    #[test]
    fn heartbeat_reply_reports_online() {
        let frame = Frame::heartbeat_reply(Some("abc")).expect("heartbeat reply");
        let encoded = frame.encode().expect("encode");
        let value: Value = serde_json::from_str(&encoded).expect("json");
        assert_eq!(value["msgType"], "HEARTBEAT_REPLY");
        assert_eq!(value["sessionId"], "abc");
        assert_eq!(value["payload"]["clientStatus"], "ONLINE");
        let payload: HeartbeatReplyPayload = frame.payload_as().expect("typed payload");
        assert_eq!(payload.client_status, ClientStatus::Online);
    }

    #[test]
    fn register_payload_uses_wire_field_names() {
        let payload = RegisterPayload {
            auth: AuthDescriptor::account(serde_json::json!({"account": "demo"})),
            platform: "WEB".to_string(),
            require_tts: true,
            enable_retrieval: false,
            function_declarations: Vec::new(),
            role_prompt: None,
            scene_context: None,
        };
        let frame = Frame::new(MsgType::Register, None, &payload).expect("frame");
        assert_eq!(frame.payload["requireTTS"], true);
        assert_eq!(frame.payload["enableRetrieval"], false);
        assert_eq!(frame.payload["auth"]["type"], "ACCOUNT");
        assert_eq!(frame.payload["auth"]["account"], "demo");
        assert!(frame.payload.get("rolePrompt").is_none());
        assert!(frame.session_id.is_none());
    }

    #[test]
    fn response_payload_tracks_absent_sequence_fields() {
        let raw = r#"{
            "version":1,"msgType":"RESPONSE","sessionId":"s",
            "payload":{"requestId":"r-1","content":{"text":"Hi"},"textStreamSeq":0}
        }"#;
        let frame = Frame::decode(raw).expect("decode");
        assert_eq!(frame.request_id(), Some("r-1"));
        let response: ResponsePayload = frame.payload_as().expect("response payload");
        assert_eq!(response.text_stream_seq, Some(0));
        assert_eq!(response.voice_stream_seq, None);
        assert_eq!(response.content.text.as_deref(), Some("Hi"));
        assert!(!response.interrupted);
    }

    #[test]
    fn payload_mismatch_names_the_message_type() {
        let frame = Frame::bare(MsgType::RegisterAck, None);
        let err = frame
            .payload_as::<RegisterAckPayload>()
            .expect_err("empty ack has no session id");
        assert!(
            err.to_string().contains("REGISTER_ACK"),
            "error should name the frame type, got: {err}"
        );
    }

    #[test]
    fn interrupt_ack_exposes_request_id() {
        let frame = Frame::new(
            MsgType::InterruptAck,
            Some("s"),
            &serde_json::json!({"interruptRequestId": "r-9", "stopped": true}),
        )
        .expect("frame");
        assert_eq!(frame.request_id(), Some("r-9"));
        let ack: InterruptAckPayload = frame.payload_as().expect("ack");
        assert_eq!(ack.extra.get("stopped"), Some(&Value::Bool(true)));
    }
}
