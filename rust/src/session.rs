//! The session actor.
//!
//! A single tokio task owns the transport, the request registry, the
//! interrupt coordinator, the voice-activity gate and playback. Callers talk
//! to it through a cloneable [`SessionHandle`]; everything the session has to
//! say comes back on one ordered [`SessionEvent`] stream.

use std::sync::Arc;

use parla_media::{
    AudioCapturePipeline, AudioFormat, AudioSink, AudioSource, CaptureHandle, CapturedFrame,
    GateEvent, MediaError, NullSink, PlaybackScheduler, VoiceActivityGate,
};
use parla_protocol::{
    AuthDescriptor, DataType, ErrorPayload, Frame, FunctionDeclaration, MsgType,
    RegisterAckPayload, RegisterPayload,
};
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::config::EngineConfig;
use crate::error::{ConnectionError, EngineError, PeerError, RequestError};
use crate::events::SessionEvent;
use crate::interrupt::{InterruptAck, InterruptCoordinator, InterruptWaiter};
use crate::registry::{Dispatch, RequestHandlers, RequestRegistry};
use crate::send::{Capabilities, SendManager};
use crate::store::{KeyValueStore, MemoryStore, SESSION_ID_KEY};
use crate::transport::{Transport, TransportConfig, TransportEvent, TransportStats};

/// Everything REGISTER carries besides the capability flags.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterParams {
    pub auth: AuthDescriptor,
    /// Falls back to the configured platform.
    pub platform: Option<String>,
    pub function_declarations: Vec<FunctionDeclaration>,
    pub role_prompt: Option<String>,
    pub scene_context: Option<Value>,
}

impl RegisterParams {
    pub fn new(auth: AuthDescriptor) -> Self {
        Self {
            auth,
            platform: None,
            function_declarations: Vec::new(),
            role_prompt: None,
            scene_context: None,
        }
    }

    pub fn platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    pub fn function(mut self, declaration: FunctionDeclaration) -> Self {
        self.function_declarations.push(declaration);
        self
    }

    pub fn role_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.role_prompt = Some(prompt.into());
        self
    }

    pub fn scene_context(mut self, context: Value) -> Self {
        self.scene_context = Some(context);
        self
    }

    fn to_payload(&self, config: &EngineConfig, caps: &Capabilities) -> RegisterPayload {
        RegisterPayload {
            auth: self.auth.clone(),
            platform: self
                .platform
                .clone()
                .unwrap_or_else(|| config.platform.clone()),
            require_tts: caps.require_tts,
            enable_retrieval: caps.enable_retrieval,
            function_declarations: self.function_declarations.clone(),
            role_prompt: self.role_prompt.clone(),
            scene_context: self.scene_context.clone(),
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

enum Command {
    Connect {
        reply: Reply<()>,
    },
    Register {
        params: RegisterParams,
        reply: Reply<String>,
    },
    SendText {
        text: String,
        reply: Reply<String>,
    },
    StartVoice {
        reply: Reply<String>,
    },
    PushVoice {
        samples: Vec<i16>,
        reply: Reply<()>,
    },
    EndVoice {
        reply: Reply<String>,
    },
    Listen {
        capture: CaptureHandle,
        reply: Reply<()>,
    },
    StopListening {
        reply: Reply<()>,
    },
    Interrupt {
        request_id: Option<String>,
        reason: String,
        reply: oneshot::Sender<Option<InterruptWaiter>>,
    },
    UpdateSettings {
        changes: Map<String, Value>,
        reply: Reply<()>,
    },
    SetCapabilities {
        capabilities: Capabilities,
        reply: Reply<()>,
    },
    QuerySession {
        reply: Reply<Value>,
    },
    Stats {
        reply: oneshot::Sender<TransportStats>,
    },
    Shutdown {
        reason: String,
        reply: oneshot::Sender<()>,
    },
}

/// Request callbacks run inside registry dispatch; they queue here and the
/// actor drains the queue right after, so events keep wire order.
#[derive(Debug)]
enum Internal {
    Event(SessionEvent),
    Voice {
        request_id: String,
        samples: Vec<i16>,
        seq: i64,
    },
    Finished {
        request_id: String,
    },
}

/// Builds the actor and hands back its handle.
pub struct SessionController {
    config: EngineConfig,
    store: Arc<dyn KeyValueStore>,
    sink: Box<dyn AudioSink>,
}

impl SessionController {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            store: Arc::new(MemoryStore::new()),
            sink: Box::new(NullSink::default()),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_audio_sink(mut self, sink: Box<dyn AudioSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Spawn the actor on the current tokio runtime.
    pub fn spawn(self) -> SessionHandle {
        crate::tls::init_rustls_crypto_provider();

        let (command_tx, command_rx) = flume::unbounded();
        let (event_tx, event_rx) = flume::unbounded();
        let (internal_tx, internal_rx) = flume::unbounded();
        let (transport, transport_events) = Transport::new(TransportConfig::from(&self.config));

        match self.store.get(SESSION_ID_KEY) {
            Ok(Some(previous)) => {
                tracing::debug!(previous_session_id = %previous, "found stored session")
            }
            Ok(None) => {}
            Err(err) => tracing::warn!(%err, "session store unreadable"),
        }

        let capabilities = Capabilities {
            require_tts: self.config.require_tts,
            enable_retrieval: self.config.enable_retrieval,
            ..Capabilities::default()
        };
        let capture_format = self.config.capture.format();
        let actor = SessionActor {
            send: SendManager::new(transport, capabilities),
            registry: RequestRegistry::new(),
            interrupts: InterruptCoordinator::new(self.config.interrupt_timeout()),
            playback: PlaybackScheduler::new(self.sink, self.config.playback.clone()),
            gate: VoiceActivityGate::new(self.config.vad.clone(), self.config.capture.sample_rate),
            capture: None,
            capture_frames: None,
            store: self.store,
            events: event_tx,
            internal_tx,
            internal_rx,
            register_params: None,
            session_id: None,
            register_waiters: Waiters::default(),
            query_waiters: Waiters::default(),
            active_response: None,
            listening_request: None,
            config: self.config,
        };
        tokio::spawn(actor.run(command_rx, transport_events));

        SessionHandle {
            commands: command_tx,
            events: event_rx,
            capture_format,
        }
    }
}

/// Replies parked until a frame (or a deadline) resolves them.
struct Waiters<T> {
    replies: Vec<Reply<T>>,
    deadline: Option<Instant>,
}

impl<T> Default for Waiters<T> {
    fn default() -> Self {
        Self {
            replies: Vec::new(),
            deadline: None,
        }
    }
}

impl<T: Clone> Waiters<T> {
    fn park(&mut self, reply: Reply<T>, deadline: Instant) {
        self.replies.push(reply);
        self.deadline.get_or_insert(deadline);
    }

    fn resolve(&mut self, value: T) {
        self.deadline = None;
        for reply in self.replies.drain(..) {
            let _ = reply.send(Ok(value.clone()));
        }
    }

    fn fail(&mut self, err: impl Fn() -> EngineError) {
        self.deadline = None;
        for reply in self.replies.drain(..) {
            let _ = reply.send(Err(err()));
        }
    }

    fn is_overdue(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }
}

struct SessionActor {
    config: EngineConfig,
    send: SendManager<Transport>,
    registry: RequestRegistry,
    interrupts: InterruptCoordinator,
    playback: PlaybackScheduler<Box<dyn AudioSink>>,
    gate: VoiceActivityGate,
    capture: Option<CaptureHandle>,
    capture_frames: Option<flume::Receiver<CapturedFrame>>,
    store: Arc<dyn KeyValueStore>,
    events: flume::Sender<SessionEvent>,
    internal_tx: flume::Sender<Internal>,
    internal_rx: flume::Receiver<Internal>,
    register_params: Option<RegisterParams>,
    session_id: Option<String>,
    register_waiters: Waiters<String>,
    query_waiters: Waiters<Value>,
    /// Request whose response is (or may still be) streaming back.
    active_response: Option<String>,
    /// Voice request opened by the gate for the current utterance.
    listening_request: Option<String>,
}

impl SessionActor {
    async fn run(
        mut self,
        commands: flume::Receiver<Command>,
        transport_events: flume::Receiver<TransportEvent>,
    ) {
        tracing::info!(endpoint = %self.config.endpoint, "session controller started");
        loop {
            let deadline = self.next_deadline();
            let capture = self.capture_frames.clone();
            tokio::select! {
                command = commands.recv_async() => match command {
                    Ok(Command::Shutdown { reason, reply }) => {
                        self.shutdown(&reason).await;
                        let _ = reply.send(());
                        break;
                    }
                    Ok(command) => self.handle_command(command).await,
                    Err(_) => {
                        self.shutdown("session handle dropped").await;
                        break;
                    }
                },
                Ok(event) = transport_events.recv_async() => self.handle_transport_event(event),
                frame = next_capture_frame(capture) => self.handle_capture(frame),
                () = sleep_until(deadline) => self.expire(Instant::now()),
            }
            self.drain_internal();
        }
        tracing::info!("session controller stopped");
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.registry.next_deadline(),
            self.interrupts.next_deadline(),
            self.register_waiters.deadline,
            self.query_waiters.deadline,
        ]
        .into_iter()
        .flatten()
        .min()
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { reply } => {
                let result = self.send.sink_mut().connect().await.map_err(EngineError::from);
                let _ = reply.send(result);
            }
            Command::Register { params, reply } => self.register(params, reply),
            Command::SendText { text, reply } => {
                let _ = reply.send(self.send_text(&text));
            }
            Command::StartVoice { reply } => {
                let _ = reply.send(self.start_voice_request());
            }
            Command::PushVoice { samples, reply } => {
                let result = self.send.push_voice(&samples).map_err(EngineError::from);
                let _ = reply.send(result);
            }
            Command::EndVoice { reply } => {
                let result = self.send.end_voice().map_err(EngineError::from);
                if let Ok(request_id) = &result {
                    self.active_response = Some(request_id.clone());
                }
                let _ = reply.send(result);
            }
            Command::Listen { capture, reply } => {
                if self.capture.is_some() {
                    tokio::task::spawn_blocking(move || capture.stop());
                    let _ = reply.send(Err(EngineError::AlreadyListening));
                    return;
                }
                self.gate.reset();
                self.capture_frames = Some(capture.frames());
                self.capture = Some(capture);
                tracing::info!("listening");
                let _ = reply.send(Ok(()));
            }
            Command::StopListening { reply } => {
                self.stop_listening();
                let _ = reply.send(Ok(()));
            }
            Command::Interrupt {
                request_id,
                reason,
                reply,
            } => {
                let target = request_id
                    .or_else(|| self.send.voice_request_id().map(str::to_string))
                    .or_else(|| self.active_response.clone());
                let waiter = target.map(|id| self.interrupt(&id, &reason));
                if self.playback.is_playing() {
                    self.playback.stop();
                }
                let _ = reply.send(waiter);
            }
            Command::UpdateSettings { changes, reply } => {
                for (key, value) in changes {
                    self.send.settings_mut().set(key, value);
                }
                let _ = reply.send(Ok(()));
            }
            Command::SetCapabilities {
                capabilities,
                reply,
            } => {
                self.send.set_capabilities(capabilities);
                let _ = reply.send(Ok(()));
            }
            Command::QuerySession { reply } => match self.send.session_query() {
                Ok(()) => {
                    let deadline = Instant::now() + self.config.register_timeout();
                    self.query_waiters.park(reply, deadline);
                }
                Err(err) => {
                    let _ = reply.send(Err(err.into()));
                }
            },
            Command::Stats { reply } => {
                let _ = reply.send(self.send.sink().stats());
            }
            // Handled by the run loop.
            Command::Shutdown { reply, .. } => {
                let _ = reply.send(());
            }
        }
    }

    fn register(&mut self, params: RegisterParams, reply: Reply<String>) {
        let payload = params.to_payload(&self.config, self.send.capabilities());
        self.register_params = Some(params);
        match self.send.register(&payload) {
            Ok(true) => {
                let deadline = Instant::now() + self.config.register_timeout();
                self.register_waiters.park(reply, deadline);
            }
            Ok(false) => match &self.session_id {
                Some(session_id) => {
                    let _ = reply.send(Ok(session_id.clone()));
                }
                None => {
                    let deadline = Instant::now() + self.config.register_timeout();
                    self.register_waiters.park(reply, deadline);
                }
            },
            Err(err) => {
                let _ = reply.send(Err(err.into()));
            }
        }
    }

    fn send_text(&mut self, text: &str) -> Result<String, EngineError> {
        if self.session_id.is_none() {
            return Err(EngineError::NotRegistered);
        }
        let request_id = new_request_id();
        self.send.send_text(&request_id, text)?;
        self.track(&request_id, DataType::Text)?;
        self.active_response = Some(request_id.clone());
        Ok(request_id)
    }

    fn start_voice_request(&mut self) -> Result<String, EngineError> {
        if self.session_id.is_none() {
            return Err(EngineError::NotRegistered);
        }
        let request_id = new_request_id();
        self.send
            .start_voice(&request_id, self.config.capture.sample_rate)?;
        self.track(&request_id, DataType::Voice)?;
        Ok(request_id)
    }

    /// Register a request that is already on the wire. Frames are handled in
    /// order by this task, so no response can arrive in between.
    fn track(&mut self, request_id: &str, data_type: DataType) -> Result<(), EngineError> {
        let handlers = RequestEvents {
            request_id: request_id.to_string(),
            internal: self.internal_tx.clone(),
        }
        .handlers();
        self.registry
            .register(request_id, data_type, handlers, self.config.request_timeout())?;
        Ok(())
    }

    fn interrupt(&mut self, request_id: &str, reason: &str) -> InterruptWaiter {
        if self.listening_request.as_deref() == Some(request_id) {
            self.listening_request = None;
        }
        if self.active_response.as_deref() == Some(request_id) {
            self.active_response = None;
        }
        self.interrupts.interrupt(
            request_id,
            reason,
            &mut self.registry,
            &mut self.send,
            &mut self.playback,
        )
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened { reconnected } => {
                self.send.reset();
                self.emit(SessionEvent::Connected { reconnected });
                if reconnected {
                    self.reregister();
                }
            }
            TransportEvent::Frame(frame) => self.handle_frame(frame),
            TransportEvent::Binary(bytes) => match self.audio_owner() {
                Some(request_id) => {
                    let placed = self.playback.enqueue_bytes(&bytes);
                    tracing::trace!(
                        request_id = %request_id,
                        bytes = bytes.len(),
                        chunks = placed.len(),
                        "binary audio queued"
                    );
                }
                None => {
                    tracing::debug!(
                        bytes = bytes.len(),
                        "dropping binary audio with no live response"
                    );
                }
            },
            TransportEvent::Reconnecting { attempt, reason } => {
                if attempt == 1 {
                    self.emit(SessionEvent::Disconnected { reason });
                    if let Some(request_id) = self.send.abort_voice() {
                        self.listening_request = None;
                        self.registry.fail(
                            &request_id,
                            RequestError::ConnectionLost(ConnectionError::Closed),
                        );
                        self.drain_internal();
                    }
                }
                self.emit(SessionEvent::Reconnecting { attempt });
            }
            TransportEvent::Closed { reason } => {
                self.emit(SessionEvent::Disconnected { reason });
            }
            TransportEvent::Failed(err) => {
                tracing::error!(%err, "connection failed for good");
                // Otherwise already reported with the first reconnect attempt.
                if self.config.reconnect_attempts == 0 {
                    self.emit(SessionEvent::Disconnected {
                        reason: err.to_string(),
                    });
                }
                self.stop_listening();
                self.send.abort_voice();
                self.registry
                    .fail_all(RequestError::ConnectionLost(err.clone()));
                self.drain_internal();
                self.interrupts.abandon_all();
                self.register_waiters
                    .fail(|| EngineError::Connection(err.clone()));
                self.query_waiters
                    .fail(|| EngineError::Connection(err.clone()));
                self.emit(SessionEvent::Error {
                    request_id: None,
                    error: err.into(),
                });
            }
        }
    }

    /// Request that inbound binary audio belongs to: the active response,
    /// while it is still live in the registry.
    fn audio_owner(&self) -> Option<String> {
        self.active_response
            .as_ref()
            .filter(|id| self.registry.contains(id))
            .cloned()
    }

    fn reregister(&mut self) {
        let Some(params) = self.register_params.clone() else {
            return;
        };
        let payload = params.to_payload(&self.config, self.send.capabilities());
        match self.send.register(&payload) {
            Ok(_) => {
                self.register_waiters
                    .deadline
                    .get_or_insert(Instant::now() + self.config.register_timeout());
                tracing::info!("re-registering after reconnect");
            }
            Err(err) => tracing::warn!(%err, "re-register failed"),
        }
    }

    fn handle_frame(&mut self, frame: Frame) {
        match frame.msg_type {
            MsgType::RegisterAck => self.on_register_ack(&frame),
            MsgType::Response | MsgType::Error => {
                if self.registry.dispatch(&frame) == Dispatch::Unhandled
                    && frame.msg_type == MsgType::Error
                {
                    self.on_session_error(&frame);
                }
            }
            MsgType::InterruptAck => {
                self.interrupts.on_ack(&frame);
            }
            MsgType::SessionInfo => {
                self.query_waiters.resolve(frame.payload.clone());
                self.emit(SessionEvent::SessionInfo(frame.payload));
            }
            other => tracing::debug!(msg_type = %other, "ignoring frame"),
        }
    }

    fn on_register_ack(&mut self, frame: &Frame) {
        let ack: RegisterAckPayload = match frame.payload_as() {
            Ok(ack) => ack,
            Err(err) => {
                tracing::warn!(%err, "dropping malformed REGISTER_ACK");
                return;
            }
        };
        if ack.session_id.is_empty() {
            tracing::warn!("REGISTER_ACK without a session id");
            return;
        }
        let session_id = ack.session_id;
        tracing::info!(session_id = %session_id, "session registered");
        self.session_id = Some(session_id.clone());
        self.send.set_session_id(Some(session_id.clone()));
        self.send.sink().set_session_id(Some(session_id.clone()));
        if let Err(err) = self.store.set(SESSION_ID_KEY, &session_id) {
            tracing::warn!(%err, "failed to persist session id");
        }
        self.register_waiters.resolve(session_id.clone());
        self.emit(SessionEvent::SessionRegistered { session_id });
    }

    fn on_session_error(&mut self, frame: &Frame) {
        let payload: ErrorPayload = match frame.payload_as() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(%err, "dropping malformed ERROR");
                return;
            }
        };
        let err = PeerError::from(&payload);
        if payload.is_session_invalid() {
            self.invalidate_session(&err);
            return;
        }
        tracing::warn!(code = %err.code, class = ?err.class, "peer error: {}", err.message);
        self.register_waiters
            .fail(|| EngineError::Peer(err.clone()));
        self.emit(SessionEvent::Error {
            request_id: None,
            error: err.into(),
        });
    }

    fn invalidate_session(&mut self, err: &PeerError) {
        tracing::warn!(
            session_id = ?self.session_id,
            "session invalidated by peer: {}",
            err.message
        );
        self.session_id = None;
        self.send.set_session_id(None);
        self.send.sink().set_session_id(None);
        if let Some(request_id) = self.send.abort_voice() {
            tracing::debug!(request_id = %request_id, "voice stream dropped with session");
        }
        self.listening_request = None;
        self.active_response = None;
        if let Err(store_err) = self.store.remove(SESSION_ID_KEY) {
            tracing::warn!(%store_err, "failed to clear stored session id");
        }
        self.registry.fail_all(RequestError::SessionInvalidated);
        self.drain_internal();
        self.register_waiters
            .fail(|| EngineError::Peer(err.clone()));
        self.emit(SessionEvent::SessionExpired {
            message: err.message.clone(),
        });
    }

    fn handle_capture(&mut self, frame: Option<CapturedFrame>) {
        match frame {
            Some(frame) => {
                tracing::trace!(seq = frame.seq, samples = frame.samples.len(), "captured frame");
                let events = self.gate.push_frame(frame.samples);
                self.apply_gate_events(events);
            }
            None => {
                tracing::info!("capture ended");
                self.stop_listening();
            }
        }
    }

    fn apply_gate_events(&mut self, events: Vec<GateEvent>) {
        for event in events {
            match event {
                GateEvent::SpeechStart => self.on_speech_start(),
                GateEvent::Audio(samples) => {
                    if self.listening_request.is_none() {
                        continue;
                    }
                    if let Err(err) = self.send.push_voice(&samples) {
                        tracing::debug!(%err, "gated audio not sent");
                    }
                }
                GateEvent::SpeechEnd { duration_ms } => {
                    let Some(request_id) = self.listening_request.take() else {
                        continue;
                    };
                    if self.send.voice_request_id() != Some(request_id.as_str()) {
                        continue;
                    }
                    match self.send.end_voice() {
                        Ok(_) => {
                            self.active_response = Some(request_id.clone());
                            self.emit(SessionEvent::SpeechEnded {
                                request_id,
                                duration_ms,
                            });
                        }
                        Err(err) => {
                            tracing::warn!(request_id = %request_id, %err, "voice end not sent")
                        }
                    }
                }
                GateEvent::SpeechDiscarded { duration_ms } => {
                    if let Some(request_id) = self.listening_request.take() {
                        tracing::debug!(
                            request_id = %request_id,
                            duration_ms,
                            "speech too short, cancelling"
                        );
                        // Nobody waits on this ack.
                        drop(self.interrupt(&request_id, "speech discarded"));
                    }
                }
            }
        }
    }

    fn on_speech_start(&mut self) {
        self.barge_in();
        match self.start_voice_request() {
            Ok(request_id) => {
                tracing::debug!(request_id = %request_id, "speech started");
                self.listening_request = Some(request_id.clone());
                self.emit(SessionEvent::SpeechStarted { request_id });
            }
            Err(err) => tracing::debug!(%err, "speech not forwarded"),
        }
    }

    /// New speech silences whatever the agent is saying.
    fn barge_in(&mut self) {
        if let Some(active) = self.active_response.clone() {
            if self.registry.contains(&active) {
                tracing::info!(request_id = %active, "barge-in");
                drop(self.interrupt(&active, "barge-in"));
            }
        }
        if self.playback.is_playing() {
            self.playback.stop();
        }
    }

    fn stop_listening(&mut self) {
        if self.capture.is_none() && self.capture_frames.is_none() {
            return;
        }
        let events = self.gate.flush();
        self.apply_gate_events(events);
        self.capture_frames = None;
        if let Some(capture) = self.capture.take() {
            tokio::task::spawn_blocking(move || capture.stop());
        }
        tracing::info!("stopped listening");
    }

    fn expire(&mut self, now: Instant) {
        let expired = self.registry.expire_overdue(now);
        if expired.iter().any(|id| self.active_response.as_ref() == Some(id)) {
            self.active_response = None;
        }
        self.interrupts.expire_overdue(now);
        if self.register_waiters.is_overdue(now) {
            let timeout_ms = self.config.register_timeout_ms;
            if self.register_waiters.replies.is_empty() {
                tracing::warn!(timeout_ms, "re-register was not acknowledged");
            }
            self.register_waiters
                .fail(|| EngineError::RegisterTimeout(timeout_ms));
        }
        if self.query_waiters.is_overdue(now) {
            let timeout_ms = self.config.register_timeout_ms;
            self.query_waiters
                .fail(|| EngineError::QueryTimeout(timeout_ms));
        }
    }

    fn drain_internal(&mut self) {
        while let Ok(internal) = self.internal_rx.try_recv() {
            match internal {
                Internal::Event(event) => self.emit(event),
                Internal::Voice {
                    request_id,
                    samples,
                    seq,
                } => {
                    let count = samples.len();
                    self.playback.enqueue(samples);
                    self.emit(SessionEvent::VoiceChunk {
                        request_id,
                        samples: count,
                        seq,
                    });
                }
                Internal::Finished { request_id } => {
                    if self.active_response.as_deref() == Some(request_id.as_str()) {
                        self.active_response = None;
                    }
                }
            }
        }
    }

    async fn shutdown(&mut self, reason: &str) {
        tracing::info!(reason, "session shutting down");
        self.stop_listening();
        self.playback.stop();
        self.send.abort_voice();
        self.registry
            .fail_all(RequestError::ConnectionLost(ConnectionError::Closed));
        self.interrupts.abandon_all();
        self.register_waiters.fail(|| EngineError::Stopped);
        self.query_waiters.fail(|| EngineError::Stopped);
        self.drain_internal();
        let was_open = self.send.sink().is_open();
        self.send.sink_mut().disconnect(reason).await;
        if was_open {
            self.emit(SessionEvent::Disconnected {
                reason: reason.to_string(),
            });
        }
    }
}

/// Builds the callback set for one request.
#[derive(Clone)]
struct RequestEvents {
    request_id: String,
    internal: flume::Sender<Internal>,
}

impl RequestEvents {
    fn push(&self, internal: Internal) {
        let _ = self.internal.send(internal);
    }

    fn finish(&self, event: SessionEvent) {
        self.push(Internal::Event(event));
        self.push(Internal::Finished {
            request_id: self.request_id.clone(),
        });
    }

    fn handlers(self) -> RequestHandlers {
        let text = self.clone();
        let voice = self.clone();
        let call = self.clone();
        let complete = self.clone();
        let failed = self.clone();
        let interrupted = self;
        RequestHandlers::new()
            .on_text_chunk(move |chunk| {
                text.push(Internal::Event(SessionEvent::TextChunk {
                    request_id: text.request_id.clone(),
                    text: chunk.to_string(),
                }));
            })
            .on_voice_chunk(move |samples, seq| {
                voice.push(Internal::Voice {
                    request_id: voice.request_id.clone(),
                    samples,
                    seq,
                });
            })
            .on_function_call(move |function_call| {
                call.push(Internal::Event(SessionEvent::FunctionCall {
                    request_id: call.request_id.clone(),
                    call: function_call,
                }));
            })
            .on_complete(move |done| {
                complete.finish(SessionEvent::MessageComplete {
                    request_id: done.request_id,
                    text: done.text,
                    voice_chunks: done.voice_chunks,
                });
            })
            .on_error(move |err| {
                failed.finish(SessionEvent::Error {
                    request_id: Some(failed.request_id.clone()),
                    error: err.into(),
                });
            })
            .on_interrupted(move |reason| {
                interrupted.finish(SessionEvent::Interrupted {
                    request_id: interrupted.request_id.clone(),
                    reason,
                });
            })
    }
}

fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

async fn next_capture_frame(
    frames: Option<flume::Receiver<CapturedFrame>>,
) -> Option<CapturedFrame> {
    match frames {
        Some(frames) => frames.recv_async().await.ok(),
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Cloneable front door to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: flume::Sender<Command>,
    events: flume::Receiver<SessionEvent>,
    capture_format: AudioFormat,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("capture_format", &self.capture_format)
            .field("running", &!self.commands.is_disconnected())
            .finish()
    }
}

impl SessionHandle {
    async fn call<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)?
    }

    /// The session's event stream. Clones share one queue.
    pub fn events(&self) -> flume::Receiver<SessionEvent> {
        self.events.clone()
    }

    pub async fn connect(&self) -> Result<(), EngineError> {
        self.call(|reply| Command::Connect { reply }).await
    }

    /// Send REGISTER and wait for REGISTER_ACK. Returns the session id.
    pub async fn register(&self, params: RegisterParams) -> Result<String, EngineError> {
        self.call(|reply| Command::Register { params, reply }).await
    }

    /// Send a TEXT request. The reply streams back as events for the returned id.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<String, EngineError> {
        let text = text.into();
        self.call(|reply| Command::SendText { text, reply }).await
    }

    pub async fn start_voice(&self) -> Result<String, EngineError> {
        self.call(|reply| Command::StartVoice { reply }).await
    }

    pub async fn push_voice(&self, samples: Vec<i16>) -> Result<(), EngineError> {
        self.call(|reply| Command::PushVoice { samples, reply }).await
    }

    pub async fn end_voice(&self) -> Result<String, EngineError> {
        self.call(|reply| Command::EndVoice { reply }).await
    }

    /// Start hands-free capture. `open` runs on the capture thread.
    pub async fn start_listening<F>(&self, open: F) -> Result<(), EngineError>
    where
        F: FnOnce() -> Result<Box<dyn AudioSource>, MediaError> + Send + 'static,
    {
        let format = self.capture_format;
        let capture = tokio::task::spawn_blocking(move || AudioCapturePipeline::start(format, open))
            .await
            .map_err(|_| EngineError::Stopped)??;
        self.call(|reply| Command::Listen { capture, reply }).await
    }

    pub async fn stop_listening(&self) -> Result<(), EngineError> {
        self.call(|reply| Command::StopListening { reply }).await
    }

    /// Interrupt `request_id`, or whatever is active when `None`.
    ///
    /// Local teardown is done by the time the actor replies; this then waits
    /// for the ack (bounded by the interrupt timeout). `Ok(None)` if there
    /// was nothing to interrupt.
    pub async fn interrupt(
        &self,
        request_id: Option<&str>,
        reason: &str,
    ) -> Result<Option<InterruptAck>, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Interrupt {
                request_id: request_id.map(str::to_string),
                reason: reason.to_string(),
                reply: tx,
            })
            .map_err(|_| EngineError::Stopped)?;
        match rx.await.map_err(|_| EngineError::Stopped)? {
            Some(waiter) => Ok(Some(waiter.wait().await)),
            None => Ok(None),
        }
    }

    /// Stage session setting changes; they ride on the next REQUEST.
    pub async fn update_settings(&self, changes: Map<String, Value>) -> Result<(), EngineError> {
        self.call(|reply| Command::UpdateSettings { changes, reply })
            .await
    }

    pub async fn set_capabilities(&self, capabilities: Capabilities) -> Result<(), EngineError> {
        self.call(|reply| Command::SetCapabilities {
            capabilities,
            reply,
        })
        .await
    }

    /// SESSION_QUERY, resolved with the SESSION_INFO payload.
    pub async fn query_session(&self) -> Result<Value, EngineError> {
        self.call(|reply| Command::QuerySession { reply }).await
    }

    pub async fn transport_stats(&self) -> Result<TransportStats, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Stats { reply: tx })
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    /// Fail everything in flight, send SHUTDOWN and stop the actor.
    pub async fn shutdown(&self, reason: &str) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Shutdown {
                reason: reason.to_string(),
                reply: tx,
            })
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)
    }
}
