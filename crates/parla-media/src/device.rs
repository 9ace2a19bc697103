//! cpal-backed microphone source and speaker sink.
//!
//! cpal streams are not `Send` on every host, so each stream lives on the
//! thread that built it: the source is opened on the capture worker, and the
//! sink parks a dedicated output thread that owns its stream until dropped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use crate::capture::AudioSource;
use crate::lease::{DeviceKind, DeviceLease};
use crate::pcm::{f32_to_i16, first_channel, resample_linear_f32};
use crate::playback::AudioSink;
use crate::MediaError;

const READ_POLL: Duration = Duration::from_millis(10);
const READ_WAIT: Duration = Duration::from_millis(50);
/// Cap on unread capture samples (a few seconds at typical device rates).
const MAX_CAPTURE_BACKLOG: usize = 48_000 * 4;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poison) => poison.into_inner(),
    }
}

fn push_capture(queue: &Mutex<VecDeque<i16>>, samples: impl Iterator<Item = i16>) {
    let mut q = lock(queue);
    q.extend(samples);
    let overflow = q.len().saturating_sub(MAX_CAPTURE_BACKLOG);
    if overflow > 0 {
        q.drain(..overflow);
    }
}

/// Default input device, down-mixed to its first channel.
pub struct CpalSource {
    queue: Arc<Mutex<VecDeque<i16>>>,
    sample_rate: u32,
    _stream: cpal::Stream,
    _lease: DeviceLease,
}

impl CpalSource {
    /// Must be called on the thread that will read from the source.
    pub fn open() -> Result<Self, MediaError> {
        let lease = DeviceLease::acquire(DeviceKind::Microphone)?;
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| MediaError::DeviceUnavailable("no input audio device".into()))?;
        let cfg = device
            .default_input_config()
            .map_err(|e| MediaError::DeviceUnavailable(format!("input config error: {e}")))?;
        let channels = cfg.channels() as usize;
        let sample_rate = cfg.sample_rate().0;
        let queue = Arc::new(Mutex::new(VecDeque::new()));

        let q = queue.clone();
        let on_error = |err: cpal::StreamError| tracing::warn!(%err, "input stream error");
        let stream = match cfg.sample_format() {
            cpal::SampleFormat::I16 => device.build_input_stream(
                &cfg.config(),
                move |data: &[i16], _| push_capture(&q, first_channel(data, channels)),
                on_error,
                None,
            ),
            cpal::SampleFormat::U16 => device.build_input_stream(
                &cfg.config(),
                move |data: &[u16], _| {
                    push_capture(
                        &q,
                        first_channel(data, channels).map(|s| (s as i32 - 32_768) as i16),
                    )
                },
                on_error,
                None,
            ),
            cpal::SampleFormat::F32 => device.build_input_stream(
                &cfg.config(),
                move |data: &[f32], _| {
                    push_capture(&q, first_channel(data, channels).map(f32_to_i16))
                },
                on_error,
                None,
            ),
            other => {
                return Err(MediaError::DeviceUnavailable(format!(
                    "unsupported input sample format: {other:?}"
                )))
            }
        }
        .map_err(|e| MediaError::Stream(format!("build input stream failed: {e}")))?;
        stream
            .play()
            .map_err(|e| MediaError::Stream(format!("start input stream failed: {e}")))?;

        tracing::info!(sample_rate, channels, "microphone opened");
        Ok(Self {
            queue,
            sample_rate,
            _stream: stream,
            _lease: lease,
        })
    }
}

impl AudioSource for CpalSource {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn read(&mut self) -> Result<Option<Vec<i16>>, MediaError> {
        let mut waited = Duration::ZERO;
        loop {
            {
                let mut q = lock(&self.queue);
                if !q.is_empty() {
                    return Ok(Some(q.drain(..).collect()));
                }
            }
            if waited >= READ_WAIT {
                return Ok(Some(Vec::new()));
            }
            std::thread::sleep(READ_POLL);
            waited += READ_POLL;
        }
    }
}

struct TimelineItem {
    start_frame: u64,
    samples: Vec<f32>,
}

/// Output timeline shared between the scheduler and the render callback.
#[derive(Default)]
struct Timeline {
    rendered: u64,
    items: VecDeque<TimelineItem>,
}

impl Timeline {
    fn next_sample(&mut self) -> f32 {
        let t = self.rendered;
        self.rendered += 1;
        while let Some(front) = self.items.front() {
            if t >= front.start_frame + front.samples.len() as u64 {
                self.items.pop_front();
                continue;
            }
            if t >= front.start_frame {
                return front.samples[(t - front.start_frame) as usize];
            }
            return 0.0;
        }
        0.0
    }
}

/// Default output device. The clock is the number of frames rendered.
pub struct CpalSink {
    timeline: Arc<Mutex<Timeline>>,
    device_rate: u32,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl CpalSink {
    pub fn open() -> Result<Self, MediaError> {
        let lease = DeviceLease::acquire(DeviceKind::Speaker)?;
        let timeline = Arc::new(Mutex::new(Timeline::default()));
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = flume::bounded(1);

        let tl = timeline.clone();
        let run = running.clone();
        let worker = std::thread::Builder::new()
            .name("parla-playback".to_string())
            .spawn(move || {
                let _lease = lease;
                let stream = match build_output(tl) {
                    Ok((stream, rate)) => {
                        let _ = ready_tx.send(Ok(rate));
                        stream
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                while run.load(Ordering::Relaxed) {
                    std::thread::park_timeout(Duration::from_millis(200));
                }
                drop(stream);
                tracing::info!("speaker released");
            })?;

        let device_rate = match ready_rx.recv() {
            Ok(Ok(rate)) => rate,
            Ok(Err(err)) => {
                let _ = worker.join();
                return Err(err);
            }
            Err(_) => {
                let _ = worker.join();
                return Err(MediaError::Stream("playback worker exited early".into()));
            }
        };
        Ok(Self {
            timeline,
            device_rate,
            running,
            worker: Some(worker),
        })
    }
}

fn build_output(timeline: Arc<Mutex<Timeline>>) -> Result<(cpal::Stream, u32), MediaError> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| MediaError::DeviceUnavailable("no output audio device".into()))?;
    let cfg = device
        .default_output_config()
        .map_err(|e| MediaError::DeviceUnavailable(format!("output config error: {e}")))?;
    let channels = (cfg.channels() as usize).max(1);
    let rate = cfg.sample_rate().0;
    let on_error = |err: cpal::StreamError| tracing::warn!(%err, "output stream error");

    let stream = match cfg.sample_format() {
        cpal::SampleFormat::I16 => device.build_output_stream(
            &cfg.config(),
            move |data: &mut [i16], _| {
                let mut tl = lock(&timeline);
                for frame in data.chunks_mut(channels) {
                    frame.fill(f32_to_i16(tl.next_sample()));
                }
            },
            on_error,
            None,
        ),
        cpal::SampleFormat::U16 => device.build_output_stream(
            &cfg.config(),
            move |data: &mut [u16], _| {
                let mut tl = lock(&timeline);
                for frame in data.chunks_mut(channels) {
                    frame.fill((f32_to_i16(tl.next_sample()) as i32 + 32_768) as u16);
                }
            },
            on_error,
            None,
        ),
        cpal::SampleFormat::F32 => device.build_output_stream(
            &cfg.config(),
            move |data: &mut [f32], _| {
                let mut tl = lock(&timeline);
                for frame in data.chunks_mut(channels) {
                    frame.fill(tl.next_sample());
                }
            },
            on_error,
            None,
        ),
        other => {
            return Err(MediaError::DeviceUnavailable(format!(
                "unsupported output sample format: {other:?}"
            )))
        }
    }
    .map_err(|e| MediaError::Stream(format!("build output stream failed: {e}")))?;
    stream
        .play()
        .map_err(|e| MediaError::Stream(format!("start output stream failed: {e}")))?;
    tracing::info!(sample_rate = rate, channels, "speaker opened");
    Ok((stream, rate))
}

impl AudioSink for CpalSink {
    fn current_time(&self) -> f64 {
        lock(&self.timeline).rendered as f64 / self.device_rate as f64
    }

    fn schedule(&mut self, start_time: f64, samples: Vec<f32>, sample_rate: u32) {
        let samples = resample_linear_f32(&samples, sample_rate, self.device_rate);
        let start_frame = (start_time * self.device_rate as f64).round().max(0.0) as u64;
        lock(&self.timeline).items.push_back(TimelineItem {
            start_frame,
            samples,
        });
    }

    fn stop(&mut self) {
        lock(&self.timeline).items.clear();
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            worker.thread().unpark();
            let _ = worker.join();
        }
    }
}
