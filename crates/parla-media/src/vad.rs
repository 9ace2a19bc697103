//! Energy-based voice activity gate.
//!
//! Frames arrive at a fixed cadence from the capture pipeline. While idle the
//! gate keeps a short ring of recent frames so the start of an utterance is not
//! clipped; while speaking it forwards everything, holding back silence until it
//! knows whether the pause ends the utterance. Elapsed time is measured in
//! samples, never wall clock.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::pcm::{duration_ms, rms};
use crate::MediaError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VadConfig {
    /// Normalized RMS above which an idle gate opens.
    pub speech_threshold: f32,
    /// Normalized RMS below which a frame counts as silence.
    pub silence_threshold: f32,
    pub silence_duration_ms: u64,
    pub pre_speech_padding_ms: u64,
    pub post_speech_padding_ms: u64,
    pub min_speech_duration_ms: u64,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            speech_threshold: 0.02,
            silence_threshold: 0.01,
            silence_duration_ms: 800,
            pre_speech_padding_ms: 300,
            post_speech_padding_ms: 300,
            min_speech_duration_ms: 250,
        }
    }
}

impl VadConfig {
    pub fn validate(&self) -> Result<(), MediaError> {
        let in_range = |v: f32| (0.0..=1.0).contains(&v);
        if !in_range(self.speech_threshold) || !in_range(self.silence_threshold) {
            return Err(MediaError::Config(
                "vad thresholds must be within 0.0..=1.0".to_string(),
            ));
        }
        if self.silence_threshold > self.speech_threshold {
            return Err(MediaError::Config(format!(
                "silence threshold {} above speech threshold {}",
                self.silence_threshold, self.speech_threshold
            )));
        }
        if self.silence_duration_ms == 0 {
            return Err(MediaError::Config(
                "silence duration must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Idle,
    Speaking,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VoiceActivityState {
    pub is_speaking: bool,
    /// Stream position (ms) of the frame that opened the gate.
    pub speech_start_ms: Option<f64>,
    /// Stream position (ms) where the current run of silence began.
    pub silence_start_ms: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GateEvent {
    SpeechStart,
    Audio(Vec<i16>),
    SpeechEnd { duration_ms: f64 },
    /// Segment closed but was shorter than `min_speech_duration_ms`.
    SpeechDiscarded { duration_ms: f64 },
}

#[derive(Debug)]
pub struct VoiceActivityGate {
    config: VadConfig,
    sample_rate: u32,
    state: VoiceActivityState,
    preroll: VecDeque<Vec<i16>>,
    preroll_ms: f64,
    held_silence: Vec<Vec<i16>>,
    position_samples: u64,
}

impl VoiceActivityGate {
    pub fn new(config: VadConfig, sample_rate: u32) -> Self {
        Self {
            config,
            sample_rate,
            state: VoiceActivityState::default(),
            preroll: VecDeque::new(),
            preroll_ms: 0.0,
            held_silence: Vec::new(),
            position_samples: 0,
        }
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }

    pub fn state(&self) -> &VoiceActivityState {
        &self.state
    }

    pub fn gate_state(&self) -> GateState {
        if self.state.is_speaking {
            GateState::Speaking
        } else {
            GateState::Idle
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.state.is_speaking
    }

    /// Feed one captured frame; returns what should happen downstream, in order.
    pub fn push_frame(&mut self, frame: Vec<i16>) -> Vec<GateEvent> {
        let start_ms = duration_ms(self.position_samples as usize, self.sample_rate);
        self.position_samples += frame.len() as u64;
        let end_ms = duration_ms(self.position_samples as usize, self.sample_rate);
        let level = rms(&frame);

        let mut events = Vec::new();
        if self.state.is_speaking {
            self.push_speaking(frame, level, start_ms, end_ms, &mut events);
        } else {
            self.push_idle(frame, level, start_ms, &mut events);
        }
        events
    }

    /// Close an open segment immediately (listening stopped mid-utterance).
    pub fn flush(&mut self) -> Vec<GateEvent> {
        let mut events = Vec::new();
        if self.state.is_speaking {
            let now_ms = duration_ms(self.position_samples as usize, self.sample_rate);
            self.finish_segment(now_ms, &mut events);
        }
        self.reset();
        events
    }

    pub fn reset(&mut self) {
        self.state = VoiceActivityState::default();
        self.preroll.clear();
        self.preroll_ms = 0.0;
        self.held_silence.clear();
    }

    fn push_idle(
        &mut self,
        frame: Vec<i16>,
        level: f32,
        start_ms: f64,
        events: &mut Vec<GateEvent>,
    ) {
        if level > self.config.speech_threshold {
            tracing::debug!(level, at_ms = start_ms, "speech started");
            self.state.is_speaking = true;
            self.state.speech_start_ms = Some(start_ms);
            self.state.silence_start_ms = None;
            events.push(GateEvent::SpeechStart);
            events.extend(self.preroll.drain(..).map(GateEvent::Audio));
            self.preroll_ms = 0.0;
            events.push(GateEvent::Audio(frame));
            return;
        }

        let pad = self.config.pre_speech_padding_ms as f64;
        if pad <= 0.0 {
            return;
        }
        self.preroll_ms += duration_ms(frame.len(), self.sample_rate);
        self.preroll.push_back(frame);
        // Keep the fewest recent frames that still cover the padding window.
        while self.preroll.len() > 1 {
            let oldest = self
                .preroll
                .front()
                .map(|f| duration_ms(f.len(), self.sample_rate))
                .unwrap_or(0.0);
            if self.preroll_ms - oldest < pad {
                break;
            }
            self.preroll.pop_front();
            self.preroll_ms -= oldest;
        }
    }

    fn push_speaking(
        &mut self,
        frame: Vec<i16>,
        level: f32,
        start_ms: f64,
        end_ms: f64,
        events: &mut Vec<GateEvent>,
    ) {
        if level >= self.config.silence_threshold {
            // A pause that did not last long enough is part of the utterance.
            events.extend(self.held_silence.drain(..).map(GateEvent::Audio));
            self.state.silence_start_ms = None;
            events.push(GateEvent::Audio(frame));
            return;
        }

        let silence_start = *self.state.silence_start_ms.get_or_insert(start_ms);
        self.held_silence.push(frame);
        if end_ms - silence_start >= self.config.silence_duration_ms as f64 {
            self.finish_segment(silence_start, events);
            self.reset();
        }
    }

    fn finish_segment(&mut self, speech_end_ms: f64, events: &mut Vec<GateEvent>) {
        let pad = self.config.post_speech_padding_ms as f64;
        let mut forwarded_ms = 0.0;
        for frame in self.held_silence.drain(..) {
            if forwarded_ms >= pad {
                break;
            }
            forwarded_ms += duration_ms(frame.len(), self.sample_rate);
            events.push(GateEvent::Audio(frame));
        }

        let duration_ms = speech_end_ms - self.state.speech_start_ms.unwrap_or(speech_end_ms);
        if duration_ms >= self.config.min_speech_duration_ms as f64 {
            tracing::debug!(duration_ms, "speech ended");
            events.push(GateEvent::SpeechEnd { duration_ms });
        } else {
            tracing::debug!(duration_ms, "speech segment too short, discarded");
            events.push(GateEvent::SpeechDiscarded { duration_ms });
        }
    }
}
