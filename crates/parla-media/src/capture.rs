//! Microphone capture on a dedicated worker thread.
//!
//! The source is opened on the worker itself (device streams are not always
//! `Send`), re-chunked into fixed-size mono frames at the configured rate, and
//! handed to the async side over a flume channel. Dropping the
//! [`CaptureHandle`] stops the worker and releases the device.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::format::AudioFormat;
use crate::pcm::{read_wav_pcm16, resample_linear};
use crate::MediaError;

/// A pull-based producer of mono 16-bit samples.
pub trait AudioSource {
    fn sample_rate(&self) -> u32;

    /// Next chunk of samples. An empty chunk means "nothing yet";
    /// `Ok(None)` means the source is exhausted.
    fn read(&mut self) -> Result<Option<Vec<i16>>, MediaError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct CapturedFrame {
    pub seq: u64,
    /// Stream position of the first sample.
    pub timestamp_us: u64,
    pub samples: Vec<i16>,
}

#[derive(Debug)]
enum Pattern {
    /// Alternating one second of 440 Hz tone and one second of silence.
    ToneBursts { phase: f32, counter: u64 },
    Clip { samples: Vec<i16>, pos: usize, looped: bool },
}

/// Device-free source used by tests and headless runs.
#[derive(Debug)]
pub struct SyntheticSource {
    sample_rate: u32,
    chunk: usize,
    pattern: Pattern,
    pacing: Option<Duration>,
}

impl SyntheticSource {
    pub fn tone_bursts(sample_rate: u32, chunk: usize) -> Self {
        Self {
            sample_rate,
            chunk: chunk.max(1),
            pattern: Pattern::ToneBursts {
                phase: 0.0,
                counter: 0,
            },
            pacing: None,
        }
    }

    pub fn from_samples(sample_rate: u32, samples: Vec<i16>, chunk: usize) -> Self {
        Self {
            sample_rate,
            chunk: chunk.max(1),
            pattern: Pattern::Clip {
                samples,
                pos: 0,
                looped: false,
            },
            pacing: None,
        }
    }

    pub fn from_wav_file(path: impl AsRef<Path>, chunk: usize) -> Result<Self, MediaError> {
        let data = std::fs::read(path.as_ref())?;
        let (rate, samples) = read_wav_pcm16(&data)?;
        Ok(Self::from_samples(rate, samples, chunk))
    }

    /// Sleep for each chunk's duration so reads arrive in real time.
    pub fn paced(mut self) -> Self {
        let secs = self.chunk as f64 / self.sample_rate.max(1) as f64;
        self.pacing = Some(Duration::from_secs_f64(secs));
        self
    }

    pub fn looped(mut self) -> Self {
        if let Pattern::Clip { looped, .. } = &mut self.pattern {
            *looped = true;
        }
        self
    }
}

impl AudioSource for SyntheticSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read(&mut self) -> Result<Option<Vec<i16>>, MediaError> {
        let rate = self.sample_rate.max(1);
        let out = match &mut self.pattern {
            Pattern::ToneBursts { phase, counter } => {
                let step = (2.0f32 * std::f32::consts::PI * 440.0) / rate as f32;
                let mut out = Vec::with_capacity(self.chunk);
                for _ in 0..self.chunk {
                    let second = *counter / rate as u64;
                    let sample = if second % 2 == 0 {
                        let s = (phase.sin() * (i16::MAX as f32 * 0.3)) as i16;
                        *phase += step;
                        if *phase > 2.0 * std::f32::consts::PI {
                            *phase -= 2.0 * std::f32::consts::PI;
                        }
                        s
                    } else {
                        0
                    };
                    *counter += 1;
                    out.push(sample);
                }
                out
            }
            Pattern::Clip {
                samples,
                pos,
                looped,
            } => {
                if samples.is_empty() || (*pos >= samples.len() && !*looped) {
                    return Ok(None);
                }
                if *pos >= samples.len() {
                    *pos = 0;
                }
                let end = (*pos + self.chunk).min(samples.len());
                let out = samples[*pos..end].to_vec();
                *pos = end;
                out
            }
        };
        if let Some(pacing) = self.pacing {
            std::thread::sleep(pacing);
        }
        Ok(Some(out))
    }
}

pub struct AudioCapturePipeline;

impl AudioCapturePipeline {
    /// Open a source on a new worker thread and start producing frames.
    ///
    /// Returns once the source is open, so device errors surface here rather
    /// than as a silent empty stream.
    pub fn start<F>(format: AudioFormat, open: F) -> Result<CaptureHandle, MediaError>
    where
        F: FnOnce() -> Result<Box<dyn AudioSource>, MediaError> + Send + 'static,
    {
        if format.frame_samples == 0 || format.sample_rate == 0 {
            return Err(MediaError::Config(format!("invalid capture format {format:?}")));
        }
        let (frame_tx, frame_rx) = flume::unbounded();
        let (ready_tx, ready_rx) = flume::bounded(1);
        let running = Arc::new(AtomicBool::new(true));
        let running_worker = running.clone();

        let worker = std::thread::Builder::new()
            .name("parla-capture".to_string())
            .spawn(move || {
                let mut source = match open() {
                    Ok(source) => {
                        let _ = ready_tx.send(Ok(()));
                        source
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                capture_loop(source.as_mut(), format, &running_worker, &frame_tx);
                tracing::debug!("capture worker exiting");
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = worker.join();
                return Err(err);
            }
            Err(_) => {
                let _ = worker.join();
                return Err(MediaError::Stream(
                    "capture worker exited before opening source".to_string(),
                ));
            }
        }

        tracing::info!(
            sample_rate = format.sample_rate,
            frame_samples = format.frame_samples,
            "audio capture started"
        );
        Ok(CaptureHandle {
            frames: frame_rx,
            running,
            worker: Some(worker),
        })
    }
}

fn capture_loop(
    source: &mut dyn AudioSource,
    format: AudioFormat,
    running: &AtomicBool,
    out: &flume::Sender<CapturedFrame>,
) {
    let source_rate = source.sample_rate();
    let mut pending: Vec<i16> = Vec::with_capacity(format.frame_samples * 2);
    let mut seq = 0u64;
    let mut emitted_samples = 0u64;

    let mut emit = |samples: Vec<i16>| -> bool {
        let frame = CapturedFrame {
            seq,
            timestamp_us: emitted_samples * 1_000_000 / format.sample_rate as u64,
            samples,
        };
        emitted_samples += frame.samples.len() as u64;
        seq += 1;
        out.send(frame).is_ok()
    };

    while running.load(Ordering::Relaxed) {
        let chunk = match source.read() {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(%err, "audio source failed, stopping capture");
                break;
            }
        };
        if chunk.is_empty() {
            continue;
        }
        pending.extend(resample_linear(&chunk, source_rate, format.sample_rate));
        while pending.len() >= format.frame_samples {
            let rest = pending.split_off(format.frame_samples);
            let frame = std::mem::replace(&mut pending, rest);
            if !emit(frame) {
                return;
            }
        }
    }
    if !pending.is_empty() && running.load(Ordering::Relaxed) {
        emit(pending);
    }
}

/// Owner of a running capture worker.
pub struct CaptureHandle {
    frames: flume::Receiver<CapturedFrame>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for CaptureHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureHandle")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl CaptureHandle {
    pub fn frames(&self) -> flume::Receiver<CapturedFrame> {
        self.frames.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
            && self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("capture worker panicked");
            }
            tracing::info!("audio capture stopped");
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
