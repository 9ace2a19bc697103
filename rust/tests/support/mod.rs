#![allow(dead_code)]

//! In-process agent peer for end-to-end tests.
//!
//! Accepts websocket connections on a loopback port, hands every inbound
//! message to the test, and writes whatever the test queues. Only one
//! connection is live at a time; a dropped connection is followed by the
//! client's reconnect.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parla_core::protocol::{Frame, MsgType};
use parla_core::{EngineConfig, SessionEvent};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

pub const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    Connected,
    Frame(Frame),
    Binary(Vec<u8>),
    Disconnected,
}

#[derive(Debug)]
enum Outgoing {
    Text(String),
    Binary(Vec<u8>),
    /// Drop the socket without a close handshake.
    Drop,
    /// Drop the socket and stop listening.
    Shutdown,
}

pub struct FakePeer {
    pub url: String,
    inbound: flume::Receiver<Received>,
    outbound: flume::Sender<Outgoing>,
    connections: Arc<AtomicUsize>,
}

impl FakePeer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind fake peer");
        let addr = listener.local_addr().expect("fake peer addr");
        let (in_tx, in_rx) = flume::unbounded();
        let (out_tx, out_rx) = flume::unbounded();
        let connections = Arc::new(AtomicUsize::new(0));
        tokio::spawn(accept_loop(listener, in_tx, out_rx, connections.clone()));
        Self {
            url: format!("ws://{addr}/agent"),
            inbound: in_rx,
            outbound: out_tx,
            connections,
        }
    }

    pub fn config(&self) -> EngineConfig {
        EngineConfig {
            endpoint: self.url.clone(),
            connect_timeout_ms: 2_000,
            reconnect_delay_ms: 50,
            reconnect_attempts: 3,
            ..EngineConfig::default()
        }
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub async fn next(&self) -> Received {
        tokio::time::timeout(WAIT, self.inbound.recv_async())
            .await
            .expect("peer waited too long for the client")
            .expect("peer channel closed")
    }

    /// Next control frame of `msg_type`, skipping anything else.
    pub async fn expect_frame(&self, msg_type: MsgType) -> Frame {
        loop {
            if let Received::Frame(frame) = self.next().await {
                if frame.msg_type == msg_type {
                    return frame;
                }
            }
        }
    }

    /// Next message that is not a connection notice.
    pub async fn next_message(&self) -> Received {
        loop {
            match self.next().await {
                Received::Connected | Received::Disconnected => continue,
                other => return other,
            }
        }
    }

    /// True if nothing arrives within `window`.
    pub async fn stays_quiet(&self, window: Duration) -> bool {
        tokio::time::timeout(window, self.inbound.recv_async())
            .await
            .is_err()
    }

    pub fn send(&self, msg_type: MsgType, session_id: Option<&str>, payload: Value) {
        let frame = Frame::new(msg_type, session_id, &payload).expect("peer frame");
        self.send_frame(&frame);
    }

    pub fn send_frame(&self, frame: &Frame) {
        let text = frame.encode().expect("encode peer frame");
        self.outbound.send(Outgoing::Text(text)).expect("peer running");
    }

    pub fn send_raw(&self, text: &str) {
        self.outbound
            .send(Outgoing::Text(text.to_string()))
            .expect("peer running");
    }

    pub fn send_binary(&self, bytes: Vec<u8>) {
        self.outbound.send(Outgoing::Binary(bytes)).expect("peer running");
    }

    pub fn drop_connection(&self) {
        self.outbound.send(Outgoing::Drop).expect("peer running");
    }

    /// Go away for good: later dials are refused.
    pub fn shutdown(&self) {
        self.outbound.send(Outgoing::Shutdown).expect("peer running");
    }
}

async fn accept_loop(
    listener: TcpListener,
    inbound: flume::Sender<Received>,
    outbound: flume::Receiver<Outgoing>,
    connections: Arc<AtomicUsize>,
) {
    while let Ok((stream, _)) = listener.accept().await {
        let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
            continue;
        };
        connections.fetch_add(1, Ordering::SeqCst);
        let _ = inbound.send(Received::Connected);
        loop {
            tokio::select! {
                msg = ws.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        let frame = Frame::decode(text.as_str())
                            .expect("client sent a valid frame");
                        let _ = inbound.send(Received::Frame(frame));
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        let _ = inbound.send(Received::Binary(bytes.to_vec()));
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                        let _ = inbound.send(Received::Disconnected);
                        break;
                    }
                    Some(Ok(_)) => {}
                },
                out = outbound.recv_async() => match out {
                    Ok(Outgoing::Text(text)) => {
                        let _ = ws.send(Message::Text(text.into())).await;
                    }
                    Ok(Outgoing::Binary(bytes)) => {
                        let _ = ws.send(Message::Binary(bytes.into())).await;
                    }
                    Ok(Outgoing::Drop) => {
                        let _ = inbound.send(Received::Disconnected);
                        break;
                    }
                    Ok(Outgoing::Shutdown) | Err(_) => {
                        let _ = inbound.send(Received::Disconnected);
                        return;
                    }
                },
            }
        }
    }
}

/// Wait for the first event matching `pred`, skipping the rest.
pub async fn expect_event(
    events: &flume::Receiver<SessionEvent>,
    what: &str,
    pred: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv_async())
            .await
            .unwrap_or_else(|_| panic!("no {what} event within {WAIT:?}"))
            .expect("event stream closed");
        if pred(&event) {
            return event;
        }
    }
}

/// Every event already queued or arriving within `window`.
pub async fn drain_events(
    events: &flume::Receiver<SessionEvent>,
    window: Duration,
) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(Ok(event)) = tokio::time::timeout(window, events.recv_async()).await {
        out.push(event);
    }
    out
}
