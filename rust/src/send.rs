//! Builds and writes every client-originated frame.

use std::collections::BTreeSet;

use parla_media::pcm::pcm16_to_le_bytes;
use parla_protocol::{
    AudioFormatDescriptor, DataType, Frame, InterruptPayload, MsgType, RegisterPayload,
    RequestPayload, STREAM_SEQ_END, STREAM_SEQ_START,
};
use serde_json::{Map, Value};

use crate::error::SendError;
use crate::transport::Transport;

/// Where outbound frames go. [`Transport`] in production.
pub trait FrameSink {
    /// False when nothing could be written.
    fn send_frame(&self, frame: &Frame) -> bool;
    fn send_binary(&self, bytes: Vec<u8>) -> bool;
}

impl FrameSink for Transport {
    fn send_frame(&self, frame: &Frame) -> bool {
        self.send(frame)
    }

    fn send_binary(&self, bytes: Vec<u8>) -> bool {
        Transport::send_binary(self, bytes)
    }
}

/// Per-request capability flags.
#[derive(Debug, Clone, PartialEq)]
pub struct Capabilities {
    pub require_tts: bool,
    pub enable_retrieval: bool,
    pub function_calling_op: Option<String>,
    pub function_calling: Option<Value>,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            require_tts: true,
            enable_retrieval: false,
            function_calling_op: None,
            function_calling: None,
        }
    }
}

/// Session settings with per-key dirty tracking. Only dirty keys are sent.
#[derive(Debug, Clone, Default)]
pub struct SessionSettings {
    values: Map<String, Value>,
    dirty: BTreeSet<String>,
}

impl SessionSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `key` dirty only if the value actually changed.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        if self.values.get(&key) == Some(&value) {
            return;
        }
        self.values.insert(key.clone(), value);
        self.dirty.insert(key);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Dirty keys and their current values, or `None` if nothing changed.
    pub fn diff(&self) -> Option<Map<String, Value>> {
        if self.dirty.is_empty() {
            return None;
        }
        let diff = self
            .dirty
            .iter()
            .filter_map(|key| self.values.get(key).map(|v| (key.clone(), v.clone())))
            .collect();
        Some(diff)
    }

    fn mark_sent(&mut self, sent: &Map<String, Value>) {
        for (key, value) in sent {
            // A newer value set after the diff was taken stays dirty.
            if self.values.get(key) == Some(value) {
                self.dirty.remove(key);
            }
        }
    }
}

#[derive(Debug, Clone)]
struct VoiceStream {
    request_id: String,
    snapshot: Capabilities,
    chunks: u64,
}

#[derive(Debug)]
pub struct SendManager<S> {
    sink: S,
    session_id: Option<String>,
    capabilities: Capabilities,
    settings: SessionSettings,
    registered_on_connection: bool,
    voice: Option<VoiceStream>,
}

impl<S: FrameSink> SendManager<S> {
    pub fn new(sink: S, capabilities: Capabilities) -> Self {
        Self {
            sink,
            session_id: None,
            capabilities,
            settings: SessionSettings::new(),
            registered_on_connection: false,
            voice: None,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn set_session_id(&mut self, session_id: Option<String>) {
        self.session_id = session_id;
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn set_capabilities(&mut self, capabilities: Capabilities) {
        self.capabilities = capabilities;
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut SessionSettings {
        &mut self.settings
    }

    /// Request id of the open voice stream, if any.
    pub fn voice_request_id(&self) -> Option<&str> {
        self.voice.as_ref().map(|v| v.request_id.as_str())
    }

    /// Forget per-connection state. Called when a new connection opens.
    pub fn reset(&mut self) {
        self.registered_on_connection = false;
        if let Some(stream) = self.voice.take() {
            tracing::debug!(
                request_id = %stream.request_id,
                "voice stream dropped with connection"
            );
        }
    }

    /// Send REGISTER. Returns false without sending if this connection
    /// already carried one.
    pub fn register(&mut self, params: &RegisterPayload) -> Result<bool, SendError> {
        if self.registered_on_connection {
            tracing::debug!("REGISTER already sent on this connection");
            return Ok(false);
        }
        let frame = Frame::new(MsgType::Register, None, params)?;
        self.write(&frame)?;
        self.registered_on_connection = true;
        tracing::info!(platform = %params.platform, "REGISTER sent");
        Ok(true)
    }

    pub fn send_text(&mut self, request_id: &str, text: &str) -> Result<(), SendError> {
        let payload = self.request_payload(
            request_id,
            DataType::Text,
            false,
            STREAM_SEQ_START,
            text,
            &self.capabilities,
            None,
        );
        self.write_request(payload)?;
        tracing::debug!(request_id, chars = text.chars().count(), "text request sent");
        Ok(())
    }

    /// Open a VOICE request. Capabilities are snapshotted and replayed on the end frame.
    pub fn start_voice(&mut self, request_id: &str, sample_rate: u32) -> Result<(), SendError> {
        if let Some(open) = &self.voice {
            return Err(SendError::StreamAlreadyOpen(open.request_id.clone()));
        }
        let snapshot = self.capabilities.clone();
        let payload = self.request_payload(
            request_id,
            DataType::Voice,
            true,
            STREAM_SEQ_START,
            "",
            &snapshot,
            Some(AudioFormatDescriptor::pcm16_mono(sample_rate)),
        );
        self.write_request(payload)?;
        self.voice = Some(VoiceStream {
            request_id: request_id.to_string(),
            snapshot,
            chunks: 0,
        });
        tracing::debug!(request_id, sample_rate, "voice stream opened");
        Ok(())
    }

    /// One binary PCM frame on the open voice stream.
    pub fn push_voice(&mut self, samples: &[i16]) -> Result<(), SendError> {
        let Some(stream) = self.voice.as_mut() else {
            return Err(SendError::NoOpenStream);
        };
        if samples.is_empty() {
            return Ok(());
        }
        if !self.sink.send_binary(pcm16_to_le_bytes(samples)) {
            return Err(SendError::NotConnected);
        }
        stream.chunks += 1;
        tracing::trace!(
            request_id = %stream.request_id,
            samples = samples.len(),
            "voice chunk sent"
        );
        Ok(())
    }

    /// Close the voice stream with `streamSeq = -1`. Returns its request id.
    pub fn end_voice(&mut self) -> Result<String, SendError> {
        let Some(stream) = self.voice.take() else {
            return Err(SendError::NoOpenStream);
        };
        let payload = self.request_payload(
            &stream.request_id,
            DataType::Voice,
            true,
            STREAM_SEQ_END,
            "",
            &stream.snapshot,
            None,
        );
        self.write_request(payload)?;
        tracing::debug!(
            request_id = %stream.request_id,
            chunks = stream.chunks,
            "voice stream closed"
        );
        Ok(stream.request_id)
    }

    /// Drop the open voice stream without an end frame.
    pub fn abort_voice(&mut self) -> Option<String> {
        self.voice.take().map(|stream| stream.request_id)
    }

    pub fn interrupt(&mut self, request_id: &str, reason: &str) -> Result<(), SendError> {
        let payload = InterruptPayload {
            interrupt_request_id: request_id.to_string(),
            reason: reason.to_string(),
        };
        let frame = Frame::new(MsgType::Interrupt, self.session_id.as_deref(), &payload)?;
        self.write(&frame)
    }

    pub fn session_query(&mut self) -> Result<(), SendError> {
        let frame = Frame::bare(MsgType::SessionQuery, self.session_id.as_deref());
        self.write(&frame)
    }

    #[allow(clippy::too_many_arguments)]
    fn request_payload(
        &self,
        request_id: &str,
        data_type: DataType,
        stream_flag: bool,
        stream_seq: i64,
        content: &str,
        caps: &Capabilities,
        audio_format: Option<AudioFormatDescriptor>,
    ) -> RequestPayload {
        RequestPayload {
            request_id: request_id.to_string(),
            data_type,
            stream_flag,
            stream_seq,
            require_tts: caps.require_tts,
            content: content.to_string(),
            enable_retrieval: Some(caps.enable_retrieval),
            function_calling_op: caps.function_calling_op.clone(),
            function_calling: caps.function_calling.clone(),
            update_session: None,
            audio_format,
        }
    }

    fn write_request(&mut self, mut payload: RequestPayload) -> Result<(), SendError> {
        payload.update_session = self.settings.diff();
        let frame = Frame::new(MsgType::Request, self.session_id.as_deref(), &payload)?;
        self.write(&frame)?;
        if let Some(sent) = payload.update_session.as_ref() {
            self.settings.mark_sent(sent);
        }
        Ok(())
    }

    fn write(&self, frame: &Frame) -> Result<(), SendError> {
        if self.sink.send_frame(frame) {
            Ok(())
        } else {
            Err(SendError::NotConnected)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Arc, Mutex};

    use parla_protocol::AuthDescriptor;
    use serde_json::json;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Wire {
        Frame(Frame),
        Binary(Vec<u8>),
    }

    /// Records everything written; can be switched offline.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct RecordingSink {
        pub(crate) wire: Arc<Mutex<Vec<Wire>>>,
        pub(crate) offline: Arc<Mutex<bool>>,
    }

    impl RecordingSink {
        pub(crate) fn frames(&self) -> Vec<Frame> {
            self.wire
                .lock()
                .expect("wire")
                .iter()
                .filter_map(|w| match w {
                    Wire::Frame(f) => Some(f.clone()),
                    Wire::Binary(_) => None,
                })
                .collect()
        }

        pub(crate) fn set_offline(&self, offline: bool) {
            *self.offline.lock().expect("offline") = offline;
        }
    }

    impl FrameSink for RecordingSink {
        fn send_frame(&self, frame: &Frame) -> bool {
            if *self.offline.lock().expect("offline") {
                return false;
            }
            self.wire.lock().expect("wire").push(Wire::Frame(frame.clone()));
            true
        }

        fn send_binary(&self, bytes: Vec<u8>) -> bool {
            if *self.offline.lock().expect("offline") {
                return false;
            }
            self.wire.lock().expect("wire").push(Wire::Binary(bytes));
            true
        }
    }

    fn manager() -> (SendManager<RecordingSink>, RecordingSink) {
        let sink = RecordingSink::default();
        let mut manager = SendManager::new(sink.clone(), Capabilities::default());
        manager.set_session_id(Some("s-1".to_string()));
        (manager, sink)
    }

    fn register_params() -> RegisterPayload {
        RegisterPayload {
            auth: AuthDescriptor::account(json!({"account": "demo"})),
            platform: "WEB".to_string(),
            require_tts: true,
            enable_retrieval: false,
            function_declarations: Vec::new(),
            role_prompt: None,
            scene_context: None,
        }
    }

    #[test]
    fn voice_request_is_start_binaries_end_in_order() {
        let (mut manager, sink) = manager();
        manager.start_voice("v-1", 16_000).expect("start");
        for i in 0..5 {
            manager.push_voice(&[i as i16; 160]).expect("push");
        }
        assert_eq!(manager.end_voice().expect("end"), "v-1");

        let wire = sink.wire.lock().expect("wire").clone();
        assert_eq!(wire.len(), 7);
        let Wire::Frame(start) = &wire[0] else { panic!("first must be a frame") };
        assert_eq!(start.payload["streamSeq"], 0);
        assert_eq!(start.payload["dataType"], "VOICE");
        assert_eq!(start.payload["audioFormat"]["transport"], "BINARY");
        assert_eq!(start.session_id.as_deref(), Some("s-1"));
        for item in &wire[1..6] {
            assert!(matches!(item, Wire::Binary(bytes) if bytes.len() == 320));
        }
        let Wire::Frame(end) = &wire[6] else { panic!("last must be a frame") };
        assert_eq!(end.payload["streamSeq"], -1);
        assert_eq!(end.payload["requestId"], "v-1");
        assert!(manager.voice_request_id().is_none());
    }

    #[test]
    fn end_frame_replays_capabilities_from_start() {
        let (mut manager, sink) = manager();
        manager.start_voice("v-2", 16_000).expect("start");
        manager.set_capabilities(Capabilities {
            require_tts: false,
            enable_retrieval: true,
            ..Capabilities::default()
        });
        manager.end_voice().expect("end");
        let frames = sink.frames();
        assert_eq!(frames[1].payload["requireTTS"], true);
        assert_eq!(frames[1].payload["enableRetrieval"], false);
    }

    #[test]
    fn second_voice_start_is_rejected() {
        let (mut manager, _sink) = manager();
        manager.start_voice("a", 16_000).expect("start");
        let err = manager.start_voice("b", 16_000).expect_err("one stream at a time");
        assert!(matches!(err, SendError::StreamAlreadyOpen(id) if id == "a"));
        assert!(matches!(manager.push_voice(&[1]), Ok(())));
        manager.end_voice().expect("end");
        assert!(matches!(manager.push_voice(&[1]), Err(SendError::NoOpenStream)));
    }

    #[test]
    fn text_request_is_a_single_frame() {
        let (mut manager, sink) = manager();
        manager.send_text("t-1", "Hello").expect("send");
        let frames = sink.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].msg_type, MsgType::Request);
        assert_eq!(frames[0].payload["content"], "Hello");
        assert_eq!(frames[0].payload["streamSeq"], 0);
        assert_eq!(frames[0].payload["streamFlag"], false);
        assert!(frames[0].payload.get("updateSession").is_none());
    }

    #[test]
    fn register_goes_out_once_per_connection() {
        let (mut manager, sink) = manager();
        assert!(manager.register(&register_params()).expect("first"));
        assert!(!manager.register(&register_params()).expect("second"));
        manager.reset();
        assert!(manager.register(&register_params()).expect("after reset"));
        let frames = sink.frames();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.msg_type == MsgType::Register));
        assert!(frames[0].session_id.is_none());
    }

    #[test]
    fn update_session_carries_only_dirty_keys_once() {
        let (mut manager, sink) = manager();
        manager.settings_mut().set("voice", json!("alloy"));
        manager.settings_mut().set("speed", json!(1.0));
        manager.send_text("t-1", "a").expect("send");
        manager.settings_mut().set("speed", json!(1.0));
        manager.settings_mut().set("speed", json!(1.25));
        manager.send_text("t-2", "b").expect("send");
        manager.send_text("t-3", "c").expect("send");

        let frames = sink.frames();
        assert_eq!(frames[0].payload["updateSession"], json!({"voice":"alloy","speed":1.0}));
        assert_eq!(frames[1].payload["updateSession"], json!({"speed":1.25}));
        assert!(frames[2].payload.get("updateSession").is_none());
    }

    #[test]
    fn failed_send_keeps_settings_dirty() {
        let (mut manager, sink) = manager();
        manager.settings_mut().set("voice", json!("verse"));
        sink.set_offline(true);
        assert!(matches!(manager.send_text("t-1", "x"), Err(SendError::NotConnected)));
        assert!(manager.settings().is_dirty());
        sink.set_offline(false);
        manager.send_text("t-2", "x").expect("send");
        assert!(!manager.settings().is_dirty());
    }

    #[test]
    fn failed_start_does_not_open_a_stream() {
        let (mut manager, sink) = manager();
        sink.set_offline(true);
        assert!(manager.start_voice("v", 16_000).is_err());
        assert!(manager.voice_request_id().is_none());
    }

    #[test]
    fn interrupt_frame_names_the_request() {
        let (mut manager, sink) = manager();
        manager.interrupt("r-9", "user").expect("interrupt");
        let frames = sink.frames();
        assert_eq!(frames[0].msg_type, MsgType::Interrupt);
        assert_eq!(frames[0].payload, json!({"interruptRequestId":"r-9","reason":"user"}));
    }
}
