//! Gapless playback of streamed speech chunks.
//!
//! Chunks are queued in arrival order and placed back to back on the sink's
//! timeline: each starts exactly where the previous one ends, or "now" if the
//! timeline has fallen behind. The first chunk after idle/stop gets a small
//! lead-in so the sink has something buffered before it starts rendering.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::pcm::{i16_to_f32, pcm16_from_le_bytes};
use crate::MediaError;

/// Output device abstraction with its own monotonic clock (seconds).
pub trait AudioSink: Send {
    fn current_time(&self) -> f64;
    fn schedule(&mut self, start_time: f64, samples: Vec<f32>, sample_rate: u32);
    /// Cancel everything scheduled and silence the output.
    fn stop(&mut self);
}

impl<S: AudioSink + ?Sized> AudioSink for Box<S> {
    fn current_time(&self) -> f64 {
        (**self).current_time()
    }

    fn schedule(&mut self, start_time: f64, samples: Vec<f32>, sample_rate: u32) {
        (**self).schedule(start_time, samples, sample_rate)
    }

    fn stop(&mut self) {
        (**self).stop()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PlaybackConfig {
    pub sample_rate: u32,
    pub initial_buffer_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            initial_buffer_ms: 60,
        }
    }
}

impl PlaybackConfig {
    pub fn validate(&self) -> Result<(), MediaError> {
        if self.sample_rate == 0 {
            return Err(MediaError::Config("playback sample rate must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct PlaybackQueueItem {
    samples: Vec<i16>,
    enqueued_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    pub start: f64,
    pub duration: f64,
}

impl ScheduledChunk {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

#[derive(Debug)]
pub struct PlaybackScheduler<S: AudioSink> {
    sink: S,
    config: PlaybackConfig,
    queue: VecDeque<PlaybackQueueItem>,
    next_start: Option<f64>,
    scheduled: u64,
    dropped: u64,
}

impl<S: AudioSink> PlaybackScheduler<S> {
    pub fn new(sink: S, config: PlaybackConfig) -> Self {
        Self {
            sink,
            config,
            queue: VecDeque::new(),
            next_start: None,
            scheduled: 0,
            dropped: 0,
        }
    }

    pub fn config(&self) -> &PlaybackConfig {
        &self.config
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Queue decoded samples and schedule everything pending.
    pub fn enqueue(&mut self, samples: Vec<i16>) -> Vec<ScheduledChunk> {
        self.queue.push_back(PlaybackQueueItem {
            samples,
            enqueued_at: Instant::now(),
        });
        self.pump()
    }

    /// Queue raw little-endian PCM. Undecodable chunks are dropped and do not
    /// disturb the timeline.
    pub fn enqueue_bytes(&mut self, bytes: &[u8]) -> Vec<ScheduledChunk> {
        match pcm16_from_le_bytes(bytes) {
            Ok(samples) => self.enqueue(samples),
            Err(err) => {
                self.dropped += 1;
                tracing::warn!(%err, "dropping undecodable playback chunk");
                Vec::new()
            }
        }
    }

    fn pump(&mut self) -> Vec<ScheduledChunk> {
        let mut placed = Vec::with_capacity(self.queue.len());
        while let Some(item) = self.queue.pop_front() {
            if item.samples.is_empty() {
                continue;
            }
            let duration = item.samples.len() as f64 / self.config.sample_rate as f64;
            let now = self.sink.current_time();
            let start = match self.next_start {
                Some(next) => next.max(now),
                None => now + self.config.initial_buffer_ms as f64 / 1000.0,
            };
            tracing::trace!(
                start,
                duration,
                queued_for_us = item.enqueued_at.elapsed().as_micros() as u64,
                "scheduling playback chunk"
            );
            self.sink
                .schedule(start, i16_to_f32(&item.samples), self.config.sample_rate);
            self.next_start = Some(start + duration);
            self.scheduled += 1;
            placed.push(ScheduledChunk { start, duration });
        }
        placed
    }

    /// Silence output now and forget the timeline.
    pub fn stop(&mut self) {
        let pending = self.queue.len();
        self.queue.clear();
        self.next_start = None;
        self.sink.stop();
        tracing::debug!(pending, "playback stopped");
    }

    /// True while scheduled audio extends past the sink's clock.
    pub fn is_playing(&self) -> bool {
        self.next_start
            .is_some_and(|next| next > self.sink.current_time())
    }

    pub fn scheduled(&self) -> u64 {
        self.scheduled
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// One entry recorded by [`MemorySink`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedChunk {
    pub start: f64,
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

#[derive(Debug, Default)]
struct MemorySinkState {
    now: f64,
    chunks: Vec<RecordedChunk>,
    stops: u64,
}

/// Sink with a manually driven clock that records what was scheduled.
/// Clones share state, so a test can keep one and hand the other away.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<MemorySinkState>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemorySinkState> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        }
    }

    pub fn set_time(&self, now: f64) {
        self.state().now = now;
    }

    pub fn advance(&self, secs: f64) {
        self.state().now += secs;
    }

    pub fn chunks(&self) -> Vec<RecordedChunk> {
        self.state().chunks.clone()
    }

    pub fn stops(&self) -> u64 {
        self.state().stops
    }
}

impl AudioSink for MemorySink {
    fn current_time(&self) -> f64 {
        self.state().now
    }

    fn schedule(&mut self, start_time: f64, samples: Vec<f32>, sample_rate: u32) {
        self.state().chunks.push(RecordedChunk {
            start: start_time,
            samples,
            sample_rate,
        });
    }

    fn stop(&mut self) {
        let mut state = self.state();
        state.chunks.clear();
        state.stops += 1;
    }
}

/// Discards audio; its clock is wall time since creation.
#[derive(Debug)]
pub struct NullSink {
    epoch: Instant,
}

impl Default for NullSink {
    fn default() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl AudioSink for NullSink {
    fn current_time(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    fn schedule(&mut self, _start_time: f64, _samples: Vec<f32>, _sample_rate: u32) {}

    fn stop(&mut self) {}
}
