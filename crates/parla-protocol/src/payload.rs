use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// `errorCode` that invalidates the whole session.
pub const ERROR_SESSION_INVALID: &str = "SESSION_INVALID";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthKind {
    Account,
    Token,
    Anonymous,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthDescriptor {
    #[serde(rename = "type")]
    pub kind: AuthKind,
    /// Credential fields are opaque to the engine and forwarded verbatim.
    #[serde(flatten)]
    pub credentials: Map<String, Value>,
}

impl AuthDescriptor {
    pub fn new(kind: AuthKind, credentials: Value) -> Self {
        let credentials = match credentials {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self { kind, credentials }
    }

    pub fn account(credentials: Value) -> Self {
        Self::new(AuthKind::Account, credentials)
    }

    pub fn anonymous() -> Self {
        Self::new(AuthKind::Anonymous, Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    pub auth: AuthDescriptor,
    pub platform: String,
    #[serde(rename = "requireTTS")]
    pub require_tts: bool,
    pub enable_retrieval: bool,
    #[serde(default)]
    pub function_declarations: Vec<FunctionDeclaration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scene_context: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAckPayload {
    pub session_id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataType {
    Text,
    Voice,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AudioTransport {
    /// Raw PCM in out-of-band binary websocket messages.
    Binary,
}

/// Declared on the start frame of a VOICE request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFormatDescriptor {
    pub transport: AudioTransport,
    pub encoding: String,
    pub sample_rate: u32,
    pub channels: u8,
}

impl AudioFormatDescriptor {
    pub fn pcm16_mono(sample_rate: u32) -> Self {
        Self {
            transport: AudioTransport::Binary,
            encoding: "PCM_S16LE".to_string(),
            sample_rate,
            channels: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPayload {
    pub request_id: String,
    pub data_type: DataType,
    pub stream_flag: bool,
    pub stream_seq: i64,
    #[serde(rename = "requireTTS")]
    pub require_tts: bool,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_retrieval: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_calling_op: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_calling: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_session: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_format: Option<AudioFormatDescriptor>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Base64 encoded little-endian 16-bit PCM.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    pub request_id: String,
    #[serde(default)]
    pub content: ResponseContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_stream_seq: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_stream_seq: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupt_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptPayload {
    pub interrupt_request_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptAckPayload {
    pub interrupt_request_id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub error_code: String,
    #[serde(default)]
    pub error_msg: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl ErrorPayload {
    pub fn is_session_invalid(&self) -> bool {
        self.error_code == ERROR_SESSION_INVALID
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientStatus {
    Online,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatReplyPayload {
    pub client_status: ClientStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownPayload {
    pub reason: String,
}
