//! The single persistent websocket to the agent peer.
//!
//! One task owns the socket for its whole life, across reconnects, so writes
//! are serialized and inbound frames are delivered in arrival order. Callers
//! never block on the socket: `send` only queues, and lifecycle changes arrive
//! as [`TransportEvent`]s.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parla_protocol::{Frame, MsgType, ShutdownPayload};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::EngineConfig;
use crate::error::ConnectionError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub url: String,
    pub connect_timeout: Duration,
    pub keepalive_window: Duration,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl From<&EngineConfig> for TransportConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            url: config.endpoint.clone(),
            connect_timeout: config.connect_timeout(),
            keepalive_window: config.keepalive_window(),
            reconnect_attempts: config.reconnect_attempts,
            reconnect_delay: config.reconnect_delay(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Opened { reconnected: bool },
    /// Any inbound control frame except HEARTBEAT, which is answered here.
    Frame(Frame),
    Binary(Vec<u8>),
    Reconnecting { attempt: u32, reason: String },
    /// Caller-initiated close finished.
    Closed { reason: String },
    /// Reconnection exhausted; the transport is closed for good.
    Failed(ConnectionError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub reconnect_count: u64,
    pub last_reconnect_duration_ms: Option<u64>,
    pub heartbeats: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
}

#[derive(Debug, Default)]
struct SharedTransportStats {
    reconnect_count: AtomicU64,
    last_reconnect_duration_ms: AtomicU64,
    heartbeats: AtomicU64,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
}

impl SharedTransportStats {
    fn note_reconnect_success(&self, elapsed: Duration) {
        self.reconnect_count.fetch_add(1, Ordering::Relaxed);
        self.last_reconnect_duration_ms
            .store(elapsed.as_millis().max(1) as u64, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TransportStats {
        let last = self.last_reconnect_duration_ms.load(Ordering::Relaxed);
        TransportStats {
            reconnect_count: self.reconnect_count.load(Ordering::Relaxed),
            last_reconnect_duration_ms: (last != 0).then_some(last),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug)]
enum Outbound {
    Text(String),
    Binary(Vec<u8>),
    /// Encoded SHUTDOWN frame (if any) followed by a clean close.
    Shutdown { notice: Option<String>, reason: String },
}

/// State shared between the handle and the connection task.
#[derive(Clone)]
struct Shared {
    config: TransportConfig,
    state: Arc<Mutex<TransportState>>,
    session_id: Arc<RwLock<Option<String>>>,
    stats: Arc<SharedTransportStats>,
    events: flume::Sender<TransportEvent>,
}

impl Shared {
    fn set_state(&self, next: TransportState) {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        };
        if *state != next {
            tracing::debug!(from = ?*state, to = ?next, "transport state");
            *state = next;
        }
    }

    fn state(&self) -> TransportState {
        match self.state.lock() {
            Ok(guard) => *guard,
            Err(poison) => *poison.into_inner(),
        }
    }

    fn session_id(&self) -> Option<String> {
        match self.session_id.read() {
            Ok(guard) => guard.clone(),
            Err(poison) => poison.into_inner().clone(),
        }
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

pub struct Transport {
    shared: Shared,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("url", &self.shared.config.url)
            .field("state", &self.shared.state())
            .finish_non_exhaustive()
    }
}

impl Transport {
    pub fn new(config: TransportConfig) -> (Self, flume::Receiver<TransportEvent>) {
        let (events_tx, events_rx) = flume::unbounded();
        let shared = Shared {
            config,
            state: Arc::new(Mutex::new(TransportState::Closed)),
            session_id: Arc::new(RwLock::new(None)),
            stats: Arc::new(SharedTransportStats::default()),
            events: events_tx,
        };
        (
            Self {
                shared,
                outbound: None,
                task: None,
            },
            events_rx,
        )
    }

    pub fn state(&self) -> TransportState {
        self.shared.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == TransportState::Open
    }

    pub fn stats(&self) -> TransportStats {
        self.shared.stats.snapshot()
    }

    /// Session id echoed in heartbeat replies and shutdown notices.
    pub fn set_session_id(&self, session_id: Option<String>) {
        match self.shared.session_id.write() {
            Ok(mut slot) => *slot = session_id,
            Err(poison) => *poison.into_inner() = session_id,
        }
    }

    pub async fn connect(&mut self) -> Result<(), ConnectionError> {
        if self.task.as_ref().is_some_and(|t| !t.is_finished()) {
            tracing::debug!("connect called while transport task is live");
            return Ok(());
        }
        let config = &self.shared.config;
        url::Url::parse(&config.url)
            .map_err(|e| ConnectionError::InvalidEndpoint(format!("{}: {e}", config.url)))?;

        self.shared.set_state(TransportState::Connecting);
        let ws = match dial(&config.url, config.connect_timeout).await {
            Ok(ws) => ws,
            Err(err) => {
                self.shared.set_state(TransportState::Closed);
                tracing::warn!(url = %config.url, %err, "connect failed");
                return Err(err);
            }
        };
        tracing::info!(url = %config.url, "transport connected");

        let (tx, rx) = mpsc::unbounded_channel();
        self.outbound = Some(tx);
        self.shared.set_state(TransportState::Open);
        self.shared.emit(TransportEvent::Opened { reconnected: false });
        self.task = Some(tokio::spawn(run_connection(ws, self.shared.clone(), rx)));
        Ok(())
    }

    /// Queue a control frame. Returns false (and logs) when not open.
    pub fn send(&self, frame: &Frame) -> bool {
        if !self.writable(frame.msg_type.as_str()) {
            return false;
        }
        match frame.encode() {
            Ok(text) => self.enqueue(Outbound::Text(text)),
            Err(err) => {
                tracing::warn!(msg_type = %frame.msg_type, %err, "failed to encode frame");
                false
            }
        }
    }

    /// Queue a raw binary message. Returns false (and logs) when not open.
    pub fn send_binary(&self, bytes: Vec<u8>) -> bool {
        if !self.writable("binary") {
            return false;
        }
        self.enqueue(Outbound::Binary(bytes))
    }

    fn writable(&self, what: &str) -> bool {
        let state = self.state();
        if state != TransportState::Open {
            tracing::warn!(?state, what, "dropping outbound message, connection not open");
            return false;
        }
        true
    }

    fn enqueue(&self, msg: Outbound) -> bool {
        match &self.outbound {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }

    /// Send SHUTDOWN, close cleanly and wait for the connection task to end.
    pub async fn disconnect(&mut self, reason: &str) {
        let Some(tx) = self.outbound.take() else {
            self.shared.set_state(TransportState::Closed);
            return;
        };
        let notice = Frame::new(
            MsgType::Shutdown,
            self.shared.session_id().as_deref(),
            &ShutdownPayload {
                reason: reason.to_string(),
            },
        )
        .and_then(|frame| frame.encode())
        .map_err(|err| tracing::warn!(%err, "failed to encode shutdown notice"))
        .ok();
        let _ = tx.send(Outbound::Shutdown {
            notice,
            reason: reason.to_string(),
        });
        if let Some(task) = self.task.take() {
            let abort = task.abort_handle();
            if tokio::time::timeout(DISCONNECT_GRACE, task).await.is_err() {
                tracing::warn!("transport task did not stop in time, aborting");
                abort.abort();
                self.shared.emit(TransportEvent::Closed {
                    reason: reason.to_string(),
                });
            }
        }
        self.shared.set_state(TransportState::Closed);
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn dial(url: &str, timeout: Duration) -> Result<WsStream, ConnectionError> {
    match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url)).await {
        Err(_) => Err(ConnectionError::ConnectTimeout {
            url: url.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
        Ok(Err(err)) => Err(ConnectionError::Connect {
            url: url.to_string(),
            reason: err.to_string(),
        }),
        Ok(Ok((ws, _response))) => Ok(ws),
    }
}

enum Exit {
    /// Caller asked to close; the socket is already closed.
    Shutdown(String),
    /// Anything not caller-initiated; triggers reconnection.
    Abnormal(String),
}

async fn run_connection(
    mut ws: WsStream,
    shared: Shared,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    loop {
        match drive(&mut ws, &shared, &mut outbound).await {
            Exit::Shutdown(reason) => {
                shared.set_state(TransportState::Closed);
                tracing::info!(%reason, "transport closed");
                shared.emit(TransportEvent::Closed { reason });
                return;
            }
            Exit::Abnormal(cause) => {
                tracing::warn!(%cause, "connection lost");
                match reconnect(&shared, &mut outbound, cause).await {
                    Ok(next) => {
                        ws = next;
                        shared.set_state(TransportState::Open);
                        shared.emit(TransportEvent::Opened { reconnected: true });
                    }
                    Err(Exit::Shutdown(reason)) => {
                        shared.set_state(TransportState::Closed);
                        shared.emit(TransportEvent::Closed { reason });
                        return;
                    }
                    Err(Exit::Abnormal(last_error)) => {
                        shared.set_state(TransportState::Closed);
                        shared.emit(TransportEvent::Failed(ConnectionError::ReconnectExhausted {
                            attempts: shared.config.reconnect_attempts,
                            last_error,
                        }));
                        return;
                    }
                }
            }
        }
    }
}

async fn drive(
    ws: &mut WsStream,
    shared: &Shared,
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
) -> Exit {
    let window = shared.config.keepalive_window;
    let keepalive = tokio::time::sleep(window);
    tokio::pin!(keepalive);

    loop {
        tokio::select! {
            msg = outbound.recv() => {
                let result = match msg {
                    Some(Outbound::Text(text)) => ws.send(Message::Text(text.into())).await,
                    Some(Outbound::Binary(bytes)) => ws.send(Message::Binary(bytes.into())).await,
                    Some(Outbound::Shutdown { notice, reason }) => {
                        if let Some(notice) = notice {
                            if let Err(err) = ws.send(Message::Text(notice.into())).await {
                                tracing::debug!(%err, "shutdown notice not delivered");
                            }
                        }
                        if let Err(err) = ws.close(None).await {
                            tracing::debug!(%err, "close handshake failed");
                        }
                        return Exit::Shutdown(reason);
                    }
                    None => {
                        let _ = ws.close(None).await;
                        return Exit::Shutdown("transport dropped".to_string());
                    }
                };
                match result {
                    Ok(()) => {
                        shared.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) => return Exit::Abnormal(format!("write failed: {err}")),
                }
            }
            incoming = ws.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        shared.stats.frames_received.fetch_add(1, Ordering::Relaxed);
                        let frame = match Frame::decode(text.as_str()) {
                            Ok(frame) => frame,
                            Err(err) => {
                                tracing::warn!(%err, "dropping undecodable frame");
                                continue;
                            }
                        };
                        if frame.msg_type == MsgType::Heartbeat {
                            keepalive.as_mut().reset(Instant::now() + window);
                            shared.stats.heartbeats.fetch_add(1, Ordering::Relaxed);
                            let reply = Frame::heartbeat_reply(shared.session_id().as_deref())
                                .and_then(|frame| frame.encode());
                            match reply {
                                Ok(text) => {
                                    if let Err(err) = ws.send(Message::Text(text.into())).await {
                                        return Exit::Abnormal(format!(
                                            "heartbeat reply failed: {err}"
                                        ));
                                    }
                                }
                                Err(err) => {
                                    tracing::warn!(%err, "failed to encode heartbeat reply")
                                }
                            }
                            tracing::trace!("heartbeat answered");
                            continue;
                        }
                        shared.emit(TransportEvent::Frame(frame));
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        shared.stats.frames_received.fetch_add(1, Ordering::Relaxed);
                        shared.emit(TransportEvent::Binary(bytes.to_vec()));
                    }
                    Some(Ok(Message::Close(close))) => {
                        let detail = close
                            .map(|c| format!("{} {}", u16::from(c.code), c.reason))
                            .unwrap_or_else(|| "no close frame".to_string());
                        return Exit::Abnormal(format!("peer closed: {detail}"));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => return Exit::Abnormal(format!("read failed: {err}")),
                    None => return Exit::Abnormal("stream ended".to_string()),
                }
            }
            () = &mut keepalive => {
                let _ = ws.close(None).await;
                let err = ConnectionError::KeepAliveExpired(window.as_millis() as u64);
                return Exit::Abnormal(err.to_string());
            }
        }
    }
}

/// Fixed-delay reconnection. `Err(Exit::Shutdown)` if the caller disconnects
/// meanwhile, `Err(Exit::Abnormal(last_error))` once attempts run out.
async fn reconnect(
    shared: &Shared,
    outbound: &mut mpsc::UnboundedReceiver<Outbound>,
    cause: String,
) -> Result<WsStream, Exit> {
    shared.set_state(TransportState::Reconnecting);
    let config = &shared.config;
    let reconnect_start = Instant::now();
    let mut last_error = cause;

    for attempt in 1..=config.reconnect_attempts {
        shared.emit(TransportEvent::Reconnecting {
            attempt,
            reason: last_error.clone(),
        });
        let attempt_start = Instant::now();
        let dialed = tokio::select! {
            result = async {
                tokio::time::sleep(config.reconnect_delay).await;
                dial(&config.url, config.connect_timeout).await
            } => result,
            reason = wait_for_shutdown(outbound) => return Err(Exit::Shutdown(reason)),
        };
        match dialed {
            Ok(ws) => {
                shared
                    .stats
                    .note_reconnect_success(reconnect_start.elapsed());
                tracing::info!(
                    attempts = attempt,
                    elapsed_ms = attempt_start.elapsed().as_millis() as u64,
                    total_elapsed_ms = reconnect_start.elapsed().as_millis() as u64,
                    "transport reconnect succeeded"
                );
                return Ok(ws);
            }
            Err(err) => {
                last_error = err.to_string();
                tracing::warn!(
                    attempts = attempt,
                    retry_in_ms = config.reconnect_delay.as_millis() as u64,
                    "transport reconnect attempt failed: {last_error}"
                );
            }
        }
    }
    Err(Exit::Abnormal(last_error))
}

/// Drain messages queued while the socket is down until a shutdown arrives.
async fn wait_for_shutdown(outbound: &mut mpsc::UnboundedReceiver<Outbound>) -> String {
    loop {
        match outbound.recv().await {
            Some(Outbound::Shutdown { reason, .. }) => return reason,
            Some(_) => tracing::debug!("discarding message queued while reconnecting"),
            None => return "transport dropped".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str) -> TransportConfig {
        TransportConfig {
            url: url.to_string(),
            connect_timeout: Duration::from_millis(500),
            keepalive_window: Duration::from_secs(90),
            reconnect_attempts: 2,
            reconnect_delay: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn send_before_connect_is_a_logged_no_op() {
        let (transport, _events) = Transport::new(config("ws://127.0.0.1:1/x"));
        assert_eq!(transport.state(), TransportState::Closed);
        assert!(!transport.send(&Frame::bare(MsgType::SessionQuery, None)));
        assert!(!transport.send_binary(vec![0, 1]));
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails_and_stays_closed() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);

        let (mut transport, _events) =
            Transport::new(config(&format!("ws://127.0.0.1:{port}/agent")));
        let err = transport.connect().await.expect_err("nothing listening");
        assert!(matches!(err, ConnectionError::Connect { .. }), "{err}");
        assert_eq!(transport.state(), TransportState::Closed);
    }

    #[tokio::test]
    async fn invalid_url_is_rejected() {
        let (mut transport, _events) = Transport::new(config("not a url"));
        let err = transport.connect().await.expect_err("bad url");
        assert!(matches!(err, ConnectionError::InvalidEndpoint(_)));
    }

    #[test]
    fn stats_report_absent_reconnect_duration_as_none() {
        let stats = SharedTransportStats::default();
        assert_eq!(stats.snapshot().last_reconnect_duration_ms, None);
        stats.note_reconnect_success(Duration::from_millis(0));
        let snap = stats.snapshot();
        assert_eq!(snap.reconnect_count, 1);
        assert_eq!(snap.last_reconnect_duration_ms, Some(1));
    }
}
