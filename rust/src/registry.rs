//! Correlates inbound RESPONSE / ERROR frames with in-flight requests.
//!
//! Each request gets exactly one terminal callback: complete, error or
//! interrupted. After that its record is gone and any late frame for the
//! same id is silently dropped.

use std::collections::HashMap;
use std::time::Duration;

use parla_media::pcm::decode_base64_pcm16;
use parla_protocol::{
    DataType, ErrorPayload, Frame, FunctionCall, MsgType, ResponsePayload, STREAM_SEQ_END,
};
use tokio::time::Instant;

use crate::error::{PeerError, RequestError};

/// Final state handed to `on_complete`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedResponse {
    pub request_id: String,
    pub text: String,
    pub voice_chunks: u64,
}

type TextChunkFn = Box<dyn FnMut(&str) + Send>;
type VoiceChunkFn = Box<dyn FnMut(Vec<i16>, i64) + Send>;
type FunctionCallFn = Box<dyn FnMut(FunctionCall) + Send>;
type CompleteFn = Box<dyn FnOnce(CompletedResponse) + Send>;
type ErrorFn = Box<dyn FnOnce(RequestError) + Send>;
type InterruptedFn = Box<dyn FnOnce(Option<String>) + Send>;

/// Callbacks for one request. Every field is optional.
#[derive(Default)]
pub struct RequestHandlers {
    on_text_chunk: Option<TextChunkFn>,
    on_voice_chunk: Option<VoiceChunkFn>,
    on_function_call: Option<FunctionCallFn>,
    on_complete: Option<CompleteFn>,
    on_error: Option<ErrorFn>,
    on_interrupted: Option<InterruptedFn>,
}

impl std::fmt::Debug for RequestHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandlers")
            .field("on_text_chunk", &self.on_text_chunk.is_some())
            .field("on_voice_chunk", &self.on_voice_chunk.is_some())
            .field("on_function_call", &self.on_function_call.is_some())
            .field("on_complete", &self.on_complete.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_interrupted", &self.on_interrupted.is_some())
            .finish()
    }
}

impl RequestHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_text_chunk(mut self, f: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_text_chunk = Some(Box::new(f));
        self
    }

    /// Decoded samples plus the `voiceStreamSeq` they arrived with.
    pub fn on_voice_chunk(mut self, f: impl FnMut(Vec<i16>, i64) + Send + 'static) -> Self {
        self.on_voice_chunk = Some(Box::new(f));
        self
    }

    pub fn on_function_call(mut self, f: impl FnMut(FunctionCall) + Send + 'static) -> Self {
        self.on_function_call = Some(Box::new(f));
        self
    }

    pub fn on_complete(mut self, f: impl FnOnce(CompletedResponse) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(RequestError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Receives the interrupt reason, if the peer gave one.
    pub fn on_interrupted(mut self, f: impl FnOnce(Option<String>) + Send + 'static) -> Self {
        self.on_interrupted = Some(Box::new(f));
        self
    }
}

#[derive(Debug)]
struct StreamTracker {
    latched: bool,
    has_text: bool,
    has_voice: bool,
    text_ended: bool,
    voice_ended: bool,
}

impl StreamTracker {
    fn new() -> Self {
        Self {
            latched: false,
            has_text: false,
            has_voice: false,
            text_ended: false,
            voice_ended: false,
        }
    }

    fn observe(&mut self, response: &ResponsePayload) {
        // Which streams exist is decided by the first response only.
        if !self.latched {
            self.latched = true;
            self.has_text = response.text_stream_seq.is_some();
            self.has_voice = response.voice_stream_seq.is_some();
        }
        if response.text_stream_seq == Some(STREAM_SEQ_END) {
            self.text_ended = true;
        }
        if response.voice_stream_seq == Some(STREAM_SEQ_END) {
            self.voice_ended = true;
        }
    }

    fn is_complete(&self) -> bool {
        let text_complete = !self.has_text || self.text_ended;
        let voice_complete = !self.has_voice || self.voice_ended;
        self.latched && text_complete && voice_complete
    }
}

#[derive(Debug)]
struct PendingRequest {
    data_type: DataType,
    handlers: RequestHandlers,
    timeout: Duration,
    deadline: Instant,
    streams: StreamTracker,
    text: String,
    voice_chunks: u64,
}

impl PendingRequest {
    fn fail(mut self, err: RequestError) {
        if let Some(on_error) = self.handlers.on_error.take() {
            on_error(err);
        }
    }

    fn interrupt(mut self, reason: Option<String>) {
        if let Some(on_interrupted) = self.handlers.on_interrupted.take() {
            on_interrupted(reason);
        }
    }
}

/// What `dispatch` did with a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Routed to a live request.
    Routed,
    /// Request-scoped, but no live request had that id.
    Dropped,
    /// Not a request-scoped frame; the caller decides.
    Unhandled,
}

#[derive(Debug, Default)]
pub struct RequestRegistry {
    requests: HashMap<String, PendingRequest>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.requests.contains_key(request_id)
    }

    pub fn data_type(&self, request_id: &str) -> Option<DataType> {
        self.requests.get(request_id).map(|r| r.data_type)
    }

    /// Earliest pending deadline, for the owner's timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.requests.values().map(|r| r.deadline).min()
    }

    pub fn register(
        &mut self,
        request_id: &str,
        data_type: DataType,
        handlers: RequestHandlers,
        timeout: Duration,
    ) -> Result<(), RequestError> {
        if self.requests.contains_key(request_id) {
            return Err(RequestError::Duplicate(request_id.to_string()));
        }
        self.requests.insert(
            request_id.to_string(),
            PendingRequest {
                data_type,
                handlers,
                timeout,
                deadline: Instant::now() + timeout,
                streams: StreamTracker::new(),
                text: String::new(),
                voice_chunks: 0,
            },
        );
        tracing::debug!(request_id = %request_id, ?data_type, "request registered");
        Ok(())
    }

    pub fn dispatch(&mut self, frame: &Frame) -> Dispatch {
        match frame.msg_type {
            MsgType::Response => self.dispatch_response(frame),
            MsgType::Error => self.dispatch_error(frame),
            _ => Dispatch::Unhandled,
        }
    }

    fn dispatch_response(&mut self, frame: &Frame) -> Dispatch {
        let response: ResponsePayload = match frame.payload_as() {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(%err, "dropping malformed RESPONSE");
                return Dispatch::Dropped;
            }
        };
        let request_id = response.request_id.clone();
        let Some(pending) = self.requests.get_mut(&request_id) else {
            tracing::trace!(request_id = %request_id, "response for unknown request dropped");
            return Dispatch::Dropped;
        };

        if response.interrupted {
            if let Some(pending) = self.requests.remove(&request_id) {
                tracing::info!(
                    request_id = %request_id,
                    reason = ?response.interrupt_reason,
                    "request interrupted by peer"
                );
                pending.interrupt(response.interrupt_reason.clone());
            }
            return Dispatch::Routed;
        }

        if let Some(call) = response.function_call.clone() {
            if let Some(on_call) = pending.handlers.on_function_call.as_mut() {
                on_call(call);
            }
        }
        if let Some(text) = response.content.text.as_deref().filter(|t| !t.is_empty()) {
            pending.text.push_str(text);
            if let Some(on_text) = pending.handlers.on_text_chunk.as_mut() {
                on_text(text);
            }
        }
        if let Some(voice) = response.content.voice.as_deref().filter(|v| !v.is_empty()) {
            match decode_base64_pcm16(voice) {
                Ok(samples) => {
                    pending.voice_chunks += 1;
                    let seq = response.voice_stream_seq.unwrap_or_default();
                    if let Some(on_voice) = pending.handlers.on_voice_chunk.as_mut() {
                        on_voice(samples, seq);
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        request_id = %request_id,
                        %err,
                        "dropping undecodable voice chunk"
                    );
                }
            }
        }

        pending.streams.observe(&response);
        if pending.streams.is_complete() {
            if let Some(mut done) = self.requests.remove(&request_id) {
                tracing::debug!(
                    request_id = %request_id,
                    voice_chunks = done.voice_chunks,
                    "request complete"
                );
                if let Some(on_complete) = done.handlers.on_complete.take() {
                    on_complete(CompletedResponse {
                        request_id,
                        text: std::mem::take(&mut done.text),
                        voice_chunks: done.voice_chunks,
                    });
                }
            }
        }
        Dispatch::Routed
    }

    fn dispatch_error(&mut self, frame: &Frame) -> Dispatch {
        let payload: ErrorPayload = match frame.payload_as() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(%err, "dropping malformed ERROR");
                return Dispatch::Dropped;
            }
        };
        if payload.is_session_invalid() {
            return Dispatch::Unhandled;
        }
        let err = PeerError::from(&payload);
        let Some(request_id) = err.request_id.clone() else {
            return Dispatch::Unhandled;
        };
        match self.requests.remove(&request_id) {
            Some(pending) => {
                tracing::warn!(
                    request_id = %request_id,
                    code = %err.code,
                    "request failed: {}",
                    err.message
                );
                pending.fail(RequestError::Peer(err));
                Dispatch::Routed
            }
            None => Dispatch::Dropped,
        }
    }

    /// Local half of an interrupt. False if the request was already gone.
    pub fn interrupt_local(&mut self, request_id: &str, reason: &str) -> bool {
        match self.requests.remove(request_id) {
            Some(pending) => {
                tracing::debug!(request_id = %request_id, reason, "request interrupted locally");
                pending.interrupt(Some(reason.to_string()));
                true
            }
            None => false,
        }
    }

    /// Fail one request (e.g. its frame could not be sent).
    pub fn fail(&mut self, request_id: &str, err: RequestError) -> bool {
        match self.requests.remove(request_id) {
            Some(pending) => {
                pending.fail(err);
                true
            }
            None => false,
        }
    }

    /// Time out every request whose deadline is at or before `now`.
    pub fn expire_overdue(&mut self, now: Instant) -> Vec<String> {
        let overdue: Vec<String> = self
            .requests
            .iter()
            .filter(|(_, r)| r.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for request_id in &overdue {
            if let Some(pending) = self.requests.remove(request_id) {
                let timeout_ms = pending.timeout.as_millis() as u64;
                tracing::warn!(request_id = %request_id, timeout_ms, "request timed out");
                pending.fail(RequestError::Timeout {
                    request_id: request_id.clone(),
                    timeout_ms,
                });
            }
        }
        overdue
    }

    /// Fail everything in flight with the same error.
    pub fn fail_all(&mut self, err: RequestError) -> usize {
        let drained: Vec<(String, PendingRequest)> = self.requests.drain().collect();
        let count = drained.len();
        for (request_id, pending) in drained {
            tracing::debug!(request_id = %request_id, %err, "failing in-flight request");
            pending.fail(err.clone());
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use parla_media::pcm::encode_base64_pcm16;
    use serde_json::json;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Seen {
        Text(String),
        Voice(usize, i64),
        Call(String),
        Complete(String),
        Error(String),
        Interrupted(Option<String>),
    }

    fn recording() -> (RequestHandlers, Arc<Mutex<Vec<Seen>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (a, b, c, d, e, f) = (
            log.clone(),
            log.clone(),
            log.clone(),
            log.clone(),
            log.clone(),
            log.clone(),
        );
        let handlers = RequestHandlers::new()
            .on_text_chunk(move |t| a.lock().expect("log").push(Seen::Text(t.to_string())))
            .on_voice_chunk(move |s, seq| b.lock().expect("log").push(Seen::Voice(s.len(), seq)))
            .on_function_call(move |call| c.lock().expect("log").push(Seen::Call(call.name)))
            .on_complete(move |done| d.lock().expect("log").push(Seen::Complete(done.text)))
            .on_error(move |err| e.lock().expect("log").push(Seen::Error(err.to_string())))
            .on_interrupted(move |reason| f.lock().expect("log").push(Seen::Interrupted(reason)));
        (handlers, log)
    }

    fn terminal_count(log: &Arc<Mutex<Vec<Seen>>>) -> usize {
        log.lock()
            .expect("log")
            .iter()
            .filter(|s| {
                matches!(
                    s,
                    Seen::Complete(_) | Seen::Error(_) | Seen::Interrupted(_)
                )
            })
            .count()
    }

    fn response(payload: serde_json::Value) -> Frame {
        Frame::new(MsgType::Response, Some("s-1"), &payload).expect("frame")
    }

    fn registry_with(id: &str) -> (RequestRegistry, Arc<Mutex<Vec<Seen>>>) {
        let mut registry = RequestRegistry::new();
        let (handlers, log) = recording();
        registry
            .register(id, DataType::Text, handlers, Duration::from_secs(120))
            .expect("register");
        (registry, log)
    }

    #[test]
    fn text_only_completes_on_text_terminator() {
        let (mut registry, log) = registry_with("r1");
        registry.dispatch(&response(json!({
            "requestId": "r1", "content": {"text": "Hi"}, "textStreamSeq": 0
        })));
        registry.dispatch(&response(json!({
            "requestId": "r1", "content": {"text": " there"}, "textStreamSeq": 1
        })));
        assert!(registry.contains("r1"));
        registry.dispatch(&response(json!({"requestId":"r1","content":{},"textStreamSeq":-1})));

        let seen = log.lock().expect("log").clone();
        assert_eq!(
            seen,
            vec![
                Seen::Text("Hi".into()),
                Seen::Text(" there".into()),
                Seen::Complete("Hi there".into()),
            ]
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn dual_stream_waits_for_both_terminators_in_either_order() {
        for order in [["textStreamSeq", "voiceStreamSeq"], ["voiceStreamSeq", "textStreamSeq"]] {
            let (mut registry, log) = registry_with("r2");
            let voice = encode_base64_pcm16(&[1, 2, 3, 4]);
            registry.dispatch(&response(json!({
                "requestId":"r2","content":{"text":"a","voice":voice},
                "textStreamSeq":0,"voiceStreamSeq":0
            })));
            let mut first = json!({"requestId":"r2","content":{}});
            first[order[0]] = json!(-1);
            registry.dispatch(&response(first));
            assert_eq!(terminal_count(&log), 0, "one terminator is not enough ({order:?})");

            let mut second = json!({"requestId":"r2","content":{}});
            second[order[1]] = json!(-1);
            registry.dispatch(&response(second.clone()));
            registry.dispatch(&response(second));
            assert_eq!(terminal_count(&log), 1, "complete exactly once ({order:?})");
            assert!(log.lock().expect("log").contains(&Seen::Voice(4, 0)));
        }
    }

    #[test]
    fn voice_seen_only_after_first_frame_is_not_waited_for() {
        let (mut registry, log) = registry_with("r3");
        registry.dispatch(&response(json!({
            "requestId": "r3", "content": {"text": "x"}, "textStreamSeq": 0
        })));
        registry.dispatch(&response(json!({"requestId":"r3","content":{},"voiceStreamSeq":0})));
        registry.dispatch(&response(json!({"requestId":"r3","content":{},"textStreamSeq":-1})));
        assert_eq!(terminal_count(&log), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn interrupted_response_bypasses_completion() {
        let (mut registry, log) = registry_with("r4");
        registry.dispatch(&response(json!({
            "requestId":"r4","content":{"text":"partial"},"textStreamSeq":0
        })));
        registry.dispatch(&response(json!({
            "requestId":"r4","content":{},"interrupted":true,"interruptReason":"barge-in"
        })));
        registry.dispatch(&response(json!({"requestId":"r4","content":{},"textStreamSeq":-1})));

        let seen = log.lock().expect("log").clone();
        assert_eq!(seen.last(), Some(&Seen::Interrupted(Some("barge-in".into()))));
        assert_eq!(terminal_count(&log), 1);
    }

    #[test]
    fn unknown_request_is_dropped_silently() {
        let mut registry = RequestRegistry::new();
        let outcome =
            registry.dispatch(&response(json!({"requestId": "ghost", "content": {"text": "x"}})));
        assert_eq!(outcome, Dispatch::Dropped);
    }

    #[test]
    fn bad_voice_chunk_is_skipped_and_stream_continues() {
        let (mut registry, log) = registry_with("r5");
        registry.dispatch(&response(json!({
            "requestId":"r5","content":{"voice":"!!not base64!!"},"voiceStreamSeq":0
        })));
        let good = encode_base64_pcm16(&[7; 10]);
        registry.dispatch(&response(json!({
            "requestId":"r5","content":{"voice":good},"voiceStreamSeq":1
        })));
        registry.dispatch(&response(json!({"requestId":"r5","content":{},"voiceStreamSeq":-1})));

        let seen = log.lock().expect("log").clone();
        assert_eq!(seen, vec![Seen::Voice(10, 1), Seen::Complete(String::new())]);
    }

    #[test]
    fn function_call_is_delivered_before_completion() {
        let (mut registry, log) = registry_with("r6");
        registry.dispatch(&response(json!({
            "requestId":"r6","content":{},"functionCall":{"name":"lookup","arguments":{"q":1}},
            "textStreamSeq":-1
        })));
        let seen = log.lock().expect("log").clone();
        assert_eq!(seen, vec![Seen::Call("lookup".into()), Seen::Complete(String::new())]);
    }

    #[test]
    fn request_scoped_error_fails_only_that_request() {
        let mut registry = RequestRegistry::new();
        let (h1, log1) = recording();
        let (h2, log2) = recording();
        registry.register("a", DataType::Text, h1, Duration::from_secs(5)).expect("a");
        registry.register("b", DataType::Text, h2, Duration::from_secs(5)).expect("b");

        let frame = Frame::new(
            MsgType::Error,
            Some("s-1"),
            &json!({"errorCode":"MODEL_OVERLOADED","errorMsg":"busy","requestId":"a"}),
        )
        .expect("frame");
        assert_eq!(registry.dispatch(&frame), Dispatch::Routed);
        assert_eq!(terminal_count(&log1), 1);
        assert_eq!(terminal_count(&log2), 0);
        assert!(registry.contains("b"));
    }

    #[test]
    fn session_wide_errors_are_left_to_the_caller() {
        let (mut registry, _log) = registry_with("r7");
        let invalid = Frame::new(
            MsgType::Error,
            None,
            &json!({"errorCode":"SESSION_INVALID","errorMsg":"expired","requestId":"r7"}),
        )
        .expect("frame");
        assert_eq!(registry.dispatch(&invalid), Dispatch::Unhandled);
        let unscoped = Frame::new(MsgType::Error, None, &json!({"errorCode":"X"})).expect("frame");
        assert_eq!(registry.dispatch(&unscoped), Dispatch::Unhandled);
        assert!(registry.contains("r7"));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let (mut registry, _log) = registry_with("dup");
        let err = registry
            .register("dup", DataType::Voice, RequestHandlers::new(), Duration::from_secs(1))
            .expect_err("duplicate id");
        assert!(matches!(err, RequestError::Duplicate(id) if id == "dup"));
    }

    #[test]
    fn timeout_fires_error_once_and_late_frames_are_dropped() {
        let mut registry = RequestRegistry::new();
        let (handlers, log) = recording();
        registry
            .register("slow", DataType::Text, handlers, Duration::from_millis(50))
            .expect("register");
        let deadline = registry.next_deadline().expect("deadline");
        assert!(registry.expire_overdue(deadline - Duration::from_millis(1)).is_empty());
        assert_eq!(registry.expire_overdue(deadline), vec!["slow".to_string()]);
        assert_eq!(
            registry.dispatch(&response(json!({"requestId":"slow","textStreamSeq":-1}))),
            Dispatch::Dropped
        );
        assert_eq!(terminal_count(&log), 1);
        assert!(matches!(log.lock().expect("log")[0], Seen::Error(_)));
    }

    #[test]
    fn local_interrupt_is_idempotent() {
        let (mut registry, log) = registry_with("r8");
        assert!(registry.interrupt_local("r8", "user"));
        assert!(!registry.interrupt_local("r8", "user"));
        assert_eq!(terminal_count(&log), 1);
    }

    #[test]
    fn fail_all_terminates_every_request() {
        let mut registry = RequestRegistry::new();
        let (h1, log1) = recording();
        let (h2, log2) = recording();
        registry.register("a", DataType::Text, h1, Duration::from_secs(5)).expect("a");
        registry.register("b", DataType::Voice, h2, Duration::from_secs(5)).expect("b");
        assert_eq!(registry.fail_all(RequestError::SessionInvalidated), 2);
        assert_eq!(terminal_count(&log1) + terminal_count(&log2), 2);
        assert!(registry.is_empty());
    }
}
