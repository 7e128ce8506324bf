//! File-backed audio device for headless hosts.
//!
//! The output clock runs on tokio time. Every buffer that plays to its end is
//! mixed into a recording timeline, which can be written out as a WAV file.
//! The microphone replays a WAV file (or silence) in real-time frames.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use lingua_tutor_core::error::{Result, TutorError};

use crate::codec::AudioBuffer;
use crate::platform::{AudioDevice, AudioOutput, CaptureStream, PlaybackSource};

/// One buffer that played through to its end.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayedSegment {
    pub start_at: f64,
    pub duration: f64,
}

#[derive(Default)]
struct Recording {
    samples: Vec<f32>,
    played: Vec<PlayedSegment>,
}

pub struct WavDevice {
    output_rate: u32,
    origin: Instant,
    microphone: Option<PathBuf>,
    recording: Arc<Mutex<Recording>>,
}

impl WavDevice {
    /// A device whose microphone is silent.
    pub fn new(output_rate: u32) -> Self {
        Self {
            output_rate,
            origin: Instant::now(),
            microphone: None,
            recording: Arc::new(Mutex::new(Recording::default())),
        }
    }

    /// Replay `path` as microphone input.
    pub fn with_microphone(mut self, path: impl Into<PathBuf>) -> Self {
        self.microphone = Some(path.into());
        self
    }

    /// Segments played to completion, in the order they finished.
    pub fn played(&self) -> Vec<PlayedSegment> {
        self.recording.lock().unwrap().played.clone()
    }

    /// Mixed output samples at the output rate.
    pub fn recording(&self) -> Vec<f32> {
        self.recording.lock().unwrap().samples.clone()
    }

    /// Write everything played so far as 16-bit mono WAV.
    pub fn save_wav(&self, path: &Path) -> Result<()> {
        let samples = self.recording();
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.output_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer =
            hound::WavWriter::create(path, spec).map_err(|e| TutorError::Other(e.into()))?;
        for sample in samples {
            let value = (sample * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            writer
                .write_sample(value)
                .map_err(|e| TutorError::Other(e.into()))?;
        }
        writer.finalize().map_err(|e| TutorError::Other(e.into()))?;
        info!(path = %path.display(), "Saved tutor audio");
        Ok(())
    }
}

struct WavOutput {
    sample_rate: u32,
    origin: Instant,
    closed: AtomicBool,
    recording: Arc<Mutex<Recording>>,
}

impl AudioOutput for WavOutput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn current_time(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn schedule(&self, buffer: AudioBuffer, start_at: f64) -> Result<PlaybackSource> {
        if self.is_closed() {
            return Err(TutorError::Other(anyhow::anyhow!("audio output is closed")));
        }
        let start_at = start_at.max(self.current_time());
        let duration = buffer.duration();
        let (source, control) = PlaybackSource::new(start_at, duration);

        let end = self.origin + Duration::from_secs_f64(start_at + duration);
        let offset = (start_at * self.sample_rate as f64).round() as usize;
        let recording = Arc::clone(&self.recording);
        tokio::spawn(async move {
            tokio::select! {
                _ = control.stopped() => {
                    debug!(start_at, "Playback stopped");
                }
                _ = tokio::time::sleep_until(end) => {
                    {
                        let mut recording = recording.lock().unwrap();
                        mix_into(&mut recording.samples, offset, buffer.mono_samples());
                        recording.played.push(PlayedSegment { start_at, duration });
                    }
                    control.finish();
                }
            }
        });
        Ok(source)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

fn mix_into(timeline: &mut Vec<f32>, offset: usize, samples: &[f32]) {
    if timeline.len() < offset + samples.len() {
        timeline.resize(offset + samples.len(), 0.0);
    }
    for (slot, sample) in timeline[offset..].iter_mut().zip(samples) {
        *slot = (*slot + sample).clamp(-1.0, 1.0);
    }
}

/// Read a WAV file as mono float samples at `target_rate`.
fn read_microphone_file(path: &Path, target_rate: u32) -> anyhow::Result<Vec<f32>> {
    let reader = hound::WavReader::open(path)?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            // Full scale for 8, 16, 24 and 32-bit integer samples.
            let scale = (1i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|s| s as f32 / scale))
                .collect::<std::result::Result<_, _>>()?
        }
        hound::SampleFormat::Float => reader.into_samples::<f32>().collect::<std::result::Result<_, _>>()?,
    };

    let channels = spec.channels.max(1) as usize;
    let mono: Vec<f32> = samples
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect();

    if spec.sample_rate == target_rate {
        return Ok(mono);
    }
    // Nearest-sample resampling is enough for speech input.
    let ratio = target_rate as f64 / spec.sample_rate as f64;
    let len = (mono.len() as f64 * ratio) as usize;
    Ok((0..len)
        .filter_map(|i| mono.get((i as f64 / ratio) as usize).copied())
        .collect())
}

#[async_trait]
impl AudioDevice for WavDevice {
    fn open_output(&self, sample_rate: u32) -> Result<Arc<dyn AudioOutput>> {
        if sample_rate != self.output_rate {
            return Err(TutorError::Config(format!(
                "output opened at {sample_rate} Hz but the recording runs at {} Hz",
                self.output_rate
            )));
        }
        Ok(Arc::new(WavOutput {
            sample_rate,
            origin: self.origin,
            closed: AtomicBool::new(false),
            recording: Arc::clone(&self.recording),
        }))
    }

    async fn open_capture(&self, sample_rate: u32, frame_size: usize) -> Result<CaptureStream> {
        if frame_size == 0 {
            return Err(TutorError::MediaAccess("frame size must be positive".into()));
        }
        let source = match &self.microphone {
            Some(path) => read_microphone_file(path, sample_rate)
                .map_err(|e| TutorError::MediaAccess(format!("{}: {e}", path.display())))?,
            None => Vec::new(),
        };
        let replaying = !source.is_empty();
        debug!(
            sample_rate,
            frame_size,
            samples = source.len(),
            "Opening capture"
        );

        let (tx, rx) = mpsc::channel(16);
        let stop = CancellationToken::new();
        let token = stop.clone();
        let period = Duration::from_secs_f64(frame_size as f64 / sample_rate as f64);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            let mut chunks = source.chunks(frame_size);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let frame = if replaying {
                    match chunks.next() {
                        Some(chunk) => {
                            let mut frame = chunk.to_vec();
                            frame.resize(frame_size, 0.0);
                            frame
                        }
                        None => {
                            debug!("Microphone file exhausted");
                            token.cancelled().await;
                            break;
                        }
                    }
                } else {
                    vec![0.0; frame_size]
                };
                if tx.send(frame).await.is_err() {
                    break;
                }
            }
            debug!("Capture released");
        });

        if self.microphone.is_some() && !replaying {
            warn!("Microphone file is empty");
        }
        Ok(CaptureStream::new(rx, stop))
    }
}
