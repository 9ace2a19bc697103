//! Live audio pipeline: microphone capture, voice-activity gating and gapless
//! scheduled playback. Everything here is transport-agnostic; frames leave as
//! plain PCM and the session layer decides what goes on the wire.

pub mod capture;
#[cfg(feature = "device-audio")]
pub mod device;
pub mod format;
pub mod lease;
pub mod pcm;
pub mod playback;
pub mod vad;

pub use capture::{AudioCapturePipeline, AudioSource, CaptureHandle, CapturedFrame, SyntheticSource};
pub use format::{AudioFormat, CaptureConfig};
pub use playback::{
    AudioSink, MemorySink, NullSink, PlaybackConfig, PlaybackScheduler, ScheduledChunk,
};
pub use vad::{GateEvent, GateState, VadConfig, VoiceActivityGate, VoiceActivityState};

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("invalid pcm payload: {0}")]
    Decode(String),
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("audio device busy: {0}")]
    DeviceBusy(&'static str),
    #[error("audio stream failed: {0}")]
    Stream(String),
    #[error("invalid audio config: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
