//! Audio pipeline: transport codec, speech synthesis queue, live voice session.

pub mod codec;
pub mod live_session;
pub mod platform;
pub mod speech_queue;
pub mod wav_device;

pub use codec::AudioBuffer;
pub use live_session::{LiveEvent, LiveSession, LiveSessionConfig, LiveState};
pub use platform::{AudioDevice, AudioOutput, CaptureStream, PlaybackSource};
pub use speech_queue::{SpeechQueue, SpeechQueueConfig, sanitize_for_speech};
pub use wav_device::WavDevice;
