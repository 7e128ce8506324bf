//! Platform audio capabilities: a clocked output that schedules buffers and
//! a microphone that yields float frames.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use lingua_tutor_core::error::Result;

use crate::codec::AudioBuffer;

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to one scheduled buffer on an [`AudioOutput`].
///
/// Stopping a source also ends it, the way a stopped Web Audio node fires `ended`.
#[derive(Debug, Clone)]
pub struct PlaybackSource {
    pub id: u64,
    /// Scheduled start on the output clock, in seconds.
    pub start_at: f64,
    /// Length in seconds.
    pub duration: f64,
    stop: CancellationToken,
    ended: CancellationToken,
}

/// The output's side of a [`PlaybackSource`].
#[derive(Debug, Clone)]
pub struct SourceControl {
    stop: CancellationToken,
    ended: CancellationToken,
}

impl PlaybackSource {
    /// Create a source and the control half the output keeps.
    pub fn new(start_at: f64, duration: f64) -> (Self, SourceControl) {
        let stop = CancellationToken::new();
        let ended = CancellationToken::new();
        let source = Self {
            id: NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed),
            start_at,
            duration,
            stop: stop.clone(),
            ended: ended.clone(),
        };
        (source, SourceControl { stop, ended })
    }

    pub fn stop(&self) {
        self.stop.cancel();
        self.ended.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn is_ended(&self) -> bool {
        self.ended.is_cancelled()
    }

    /// Resolves once playback finished or the source was stopped.
    pub async fn ended(&self) {
        self.ended.cancelled().await
    }
}

impl SourceControl {
    pub async fn stopped(&self) {
        self.stop.cancelled().await
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Mark natural end of playback.
    pub fn finish(&self) {
        self.ended.cancel();
    }
}

/// A clocked audio sink.
pub trait AudioOutput: Send + Sync {
    fn sample_rate(&self) -> u32;

    /// Output clock in seconds. Monotonic while the output is open.
    fn current_time(&self) -> f64;

    /// Start `buffer` at `start_at` on the output clock; times in the past start now.
    fn schedule(&self, buffer: AudioBuffer, start_at: f64) -> Result<PlaybackSource>;

    fn is_closed(&self) -> bool;

    fn close(&self);
}

/// A live microphone stream of mono float frames.
pub struct CaptureStream {
    frames: mpsc::Receiver<Vec<f32>>,
    stop: CancellationToken,
}

impl CaptureStream {
    pub fn new(frames: mpsc::Receiver<Vec<f32>>, stop: CancellationToken) -> Self {
        Self { frames, stop }
    }

    /// Next captured frame; `None` once the capture stopped or the device went away.
    pub async fn next_frame(&mut self) -> Option<Vec<f32>> {
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => None,
            frame = self.frames.recv() => frame,
        }
    }

    /// Token that releases the microphone when cancelled.
    pub fn stop_handle(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.cancel();
    }
}

/// Everything the audio pipeline needs from the platform.
#[async_trait]
pub trait AudioDevice: Send + Sync {
    /// Open (or reopen) a playback output.
    fn open_output(&self, sample_rate: u32) -> Result<Arc<dyn AudioOutput>>;

    /// Acquire the microphone. Fails with `TutorError::MediaAccess`.
    async fn open_capture(&self, sample_rate: u32, frame_size: usize) -> Result<CaptureStream>;
}
