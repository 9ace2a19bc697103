//! Two-phase interrupts.
//!
//! The local phase runs synchronously inside [`InterruptCoordinator::interrupt`]:
//! playback is silenced and the request's `on_interrupted` fires before any
//! frame is written. The remote phase is the returned [`InterruptWaiter`],
//! which resolves on INTERRUPT_ACK or after the ack timeout, whichever is
//! first. A timeout is still a successful interrupt.

use std::collections::HashMap;
use std::time::Duration;

use parla_media::{AudioSink, PlaybackScheduler};
use parla_protocol::{Frame, InterruptAckPayload};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::registry::RequestRegistry;
use crate::send::{FrameSink, SendManager};

#[derive(Debug, Clone, PartialEq)]
pub struct InterruptAck {
    pub request_id: String,
    pub timed_out: bool,
    /// Present when the peer acknowledged.
    pub payload: Option<InterruptAckPayload>,
}

impl InterruptAck {
    fn timed_out(request_id: &str) -> Self {
        Self {
            request_id: request_id.to_string(),
            timed_out: true,
            payload: None,
        }
    }
}

#[derive(Debug)]
enum WaiterState {
    Ready(InterruptAck),
    Pending(oneshot::Receiver<InterruptAck>),
}

/// Remote half of an interrupt.
#[derive(Debug)]
pub struct InterruptWaiter {
    request_id: String,
    timeout: Duration,
    state: WaiterState,
}

impl InterruptWaiter {
    fn ready(ack: InterruptAck) -> Self {
        Self {
            request_id: ack.request_id.clone(),
            timeout: Duration::ZERO,
            state: WaiterState::Ready(ack),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub async fn wait(self) -> InterruptAck {
        match self.state {
            WaiterState::Ready(ack) => ack,
            WaiterState::Pending(rx) => match tokio::time::timeout(self.timeout, rx).await {
                Ok(Ok(ack)) => ack,
                Ok(Err(_closed)) => InterruptAck::timed_out(&self.request_id),
                Err(_elapsed) => {
                    tracing::info!(request_id = %self.request_id, "interrupt ack timed out");
                    InterruptAck::timed_out(&self.request_id)
                }
            },
        }
    }
}

#[derive(Debug)]
struct PendingAck {
    deadline: Instant,
    waiters: Vec<oneshot::Sender<InterruptAck>>,
}

#[derive(Debug)]
pub struct InterruptCoordinator {
    ack_timeout: Duration,
    pending: HashMap<String, PendingAck>,
}

impl InterruptCoordinator {
    pub fn new(ack_timeout: Duration) -> Self {
        Self {
            ack_timeout,
            pending: HashMap::new(),
        }
    }

    pub fn ack_timeout(&self) -> Duration {
        self.ack_timeout
    }

    pub fn is_pending(&self, request_id: &str) -> bool {
        self.pending.contains_key(request_id)
    }

    /// Interrupt `request_id`. Never waits on the network.
    ///
    /// Interrupting a request that is already gone is a no-op: no frame is
    /// sent and the waiter resolves immediately (or joins an ack still in
    /// flight for that id).
    pub fn interrupt<S: FrameSink, K: AudioSink>(
        &mut self,
        request_id: &str,
        reason: &str,
        registry: &mut RequestRegistry,
        send: &mut SendManager<S>,
        playback: &mut PlaybackScheduler<K>,
    ) -> InterruptWaiter {
        let live = registry.contains(request_id);
        let streaming = send.voice_request_id() == Some(request_id);

        if !live && !streaming {
            if let Some(pending) = self.pending.get_mut(request_id) {
                let (tx, rx) = oneshot::channel();
                pending.waiters.push(tx);
                return self.waiter(request_id, rx);
            }
            tracing::debug!(request_id, "interrupt for cleared request ignored");
            return InterruptWaiter::ready(InterruptAck {
                request_id: request_id.to_string(),
                timed_out: false,
                payload: None,
            });
        }

        // Local phase.
        playback.stop();
        if streaming {
            send.abort_voice();
        }
        registry.interrupt_local(request_id, reason);
        tracing::info!(request_id, reason, "request interrupted");

        // Remote phase.
        if let Err(err) = send.interrupt(request_id, reason) {
            tracing::warn!(request_id, %err, "INTERRUPT not sent");
            return InterruptWaiter::ready(InterruptAck::timed_out(request_id));
        }
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            request_id.to_string(),
            PendingAck {
                deadline: Instant::now() + self.ack_timeout,
                waiters: vec![tx],
            },
        );
        self.waiter(request_id, rx)
    }

    fn waiter(&self, request_id: &str, rx: oneshot::Receiver<InterruptAck>) -> InterruptWaiter {
        InterruptWaiter {
            request_id: request_id.to_string(),
            timeout: self.ack_timeout,
            state: WaiterState::Pending(rx),
        }
    }

    /// Route an INTERRUPT_ACK. Returns false for acks nobody waits on.
    pub fn on_ack(&mut self, frame: &Frame) -> bool {
        let payload: InterruptAckPayload = match frame.payload_as() {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(%err, "dropping malformed INTERRUPT_ACK");
                return false;
            }
        };
        let Some(pending) = self.pending.remove(&payload.interrupt_request_id) else {
            tracing::debug!(
                request_id = %payload.interrupt_request_id,
                "late interrupt ack dropped"
            );
            return false;
        };
        tracing::debug!(request_id = %payload.interrupt_request_id, "interrupt acknowledged");
        for waiter in pending.waiters {
            let _ = waiter.send(InterruptAck {
                request_id: payload.interrupt_request_id.clone(),
                timed_out: false,
                payload: Some(payload.clone()),
            });
        }
        true
    }

    /// Forget acks whose waiters have already given up.
    pub fn expire_overdue(&mut self, now: Instant) {
        self.pending.retain(|_, pending| pending.deadline > now);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().map(|p| p.deadline).min()
    }

    /// Resolve every outstanding waiter as timed out.
    pub fn abandon_all(&mut self) {
        for (request_id, pending) in self.pending.drain() {
            for waiter in pending.waiters {
                let _ = waiter.send(InterruptAck::timed_out(&request_id));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use parla_media::{MemorySink, PlaybackConfig};
    use parla_protocol::{DataType, MsgType};
    use serde_json::json;

    use super::*;
    use crate::registry::RequestHandlers;
    use crate::send::tests::RecordingSink;
    use crate::send::Capabilities;

    struct Fixture {
        coordinator: InterruptCoordinator,
        registry: RequestRegistry,
        send: SendManager<RecordingSink>,
        wire: RecordingSink,
        playback: PlaybackScheduler<MemorySink>,
        speaker: MemorySink,
        interrupted: Arc<Mutex<Vec<Option<String>>>>,
    }

    fn fixture() -> Fixture {
        let wire = RecordingSink::default();
        let speaker = MemorySink::new();
        let interrupted = Arc::new(Mutex::new(Vec::new()));
        let mut registry = RequestRegistry::new();
        let seen = interrupted.clone();
        registry
            .register(
                "r-1",
                DataType::Text,
                RequestHandlers::new()
                    .on_interrupted(move |reason| seen.lock().expect("seen").push(reason)),
                Duration::from_secs(120),
            )
            .expect("register");
        let mut playback = PlaybackScheduler::new(speaker.clone(), PlaybackConfig::default());
        playback.enqueue(vec![100; 4_800]);
        Fixture {
            coordinator: InterruptCoordinator::new(Duration::from_secs(15)),
            registry,
            send: SendManager::new(wire.clone(), Capabilities::default()),
            wire,
            playback,
            speaker,
            interrupted,
        }
    }

    impl Fixture {
        fn interrupt(&mut self, id: &str) -> InterruptWaiter {
            self.coordinator.interrupt(
                id,
                "user",
                &mut self.registry,
                &mut self.send,
                &mut self.playback,
            )
        }
    }

    fn ack_frame(id: &str) -> Frame {
        Frame::new(
            MsgType::InterruptAck,
            Some("s"),
            &json!({"interruptRequestId": id, "stopped": true}),
        )
        .expect("frame")
    }

    #[tokio::test(start_paused = true)]
    async fn local_teardown_happens_before_ack_and_timeout_still_resolves() {
        let mut fx = fixture();
        let waiter = fx.interrupt("r-1");

        assert_eq!(fx.interrupted.lock().expect("seen").as_slice(), &[Some("user".to_string())]);
        assert!(!fx.registry.contains("r-1"));
        assert_eq!(fx.speaker.stops(), 1);
        assert!(fx.speaker.chunks().is_empty());
        let frames = fx.wire.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].msg_type, MsgType::Interrupt);

        let ack = waiter.wait().await;
        assert!(ack.timed_out);
        assert_eq!(ack.request_id, "r-1");
    }

    #[tokio::test]
    async fn ack_resolves_with_payload() {
        let mut fx = fixture();
        let waiter = fx.interrupt("r-1");
        assert!(fx.coordinator.on_ack(&ack_frame("r-1")));
        let ack = waiter.wait().await;
        assert!(!ack.timed_out);
        let payload = ack.payload.expect("ack payload");
        assert_eq!(payload.extra.get("stopped"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn second_interrupt_is_a_no_op() {
        let mut fx = fixture();
        let first = fx.interrupt("r-1");
        let second = fx.interrupt("r-1");

        assert_eq!(fx.interrupted.lock().expect("seen").len(), 1);
        assert_eq!(fx.wire.frames().len(), 1, "only one INTERRUPT on the wire");
        assert_eq!(fx.speaker.stops(), 1);

        fx.coordinator.on_ack(&ack_frame("r-1"));
        assert!(!first.wait().await.timed_out);
        assert!(!second.wait().await.timed_out);

        let third = fx.interrupt("r-1");
        let ack = third.wait().await;
        assert!(!ack.timed_out && ack.payload.is_none());
        assert_eq!(fx.wire.frames().len(), 1);
    }

    #[tokio::test]
    async fn unsent_interrupt_keeps_local_effect() {
        let mut fx = fixture();
        fx.wire.set_offline(true);
        let ack = fx.interrupt("r-1").wait().await;
        assert!(ack.timed_out);
        assert!(!fx.registry.contains("r-1"));
        assert_eq!(fx.interrupted.lock().expect("seen").len(), 1);
    }

    #[tokio::test]
    async fn interrupting_the_open_voice_stream_closes_it() {
        let mut fx = fixture();
        fx.send.start_voice("v-1", 16_000).expect("start");
        let _waiter = fx.interrupt("v-1");
        assert!(fx.send.voice_request_id().is_none());
        let frames = fx.wire.frames();
        assert_eq!(frames.last().map(|f| f.msg_type), Some(MsgType::Interrupt));
    }

    #[tokio::test]
    async fn abandon_all_resolves_waiters_as_timed_out() {
        let mut fx = fixture();
        let waiter = fx.interrupt("r-1");
        fx.coordinator.abandon_all();
        assert!(waiter.wait().await.timed_out);
        assert!(!fx.coordinator.is_pending("r-1"));
    }
}
