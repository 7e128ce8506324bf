//! Remote generative-AI service abstraction.
//!
//! The tutor talks to one backend species over three seams: a streamed text
//! chat ([`ChatProvider`]), one-shot speech synthesis ([`SpeechProvider`]),
//! and a bidirectional live voice session ([`LiveProvider`]). The Gemini
//! implementations live in [`gemini`] and [`live`].

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use lingua_tutor_core::error::Result;
use lingua_tutor_core::types::ChatTurn;

pub mod gemini;
pub mod live;
pub mod sse;

pub use gemini::GeminiProvider;
pub use live::GeminiLiveProvider;

/// Lazy, single-pass sequence of text fragments. Ends when the remote stream ends.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Inbound live-session events, in server order.
pub type LiveEventStream = Pin<Box<dyn Stream<Item = Result<LiveServerEvent>> + Send>>;

/// A streamed chat request: prior turns plus the new message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub system: Option<String>,
    pub history: Vec<ChatTurn>,
    pub message: String,
    pub thinking_budget: Option<u32>,
}

/// A speech synthesis request for one sanitized utterance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeechRequest {
    pub model: String,
    pub voice: String,
    pub text: String,
}

/// Live session configuration sent once when the session opens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveSetup {
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    pub input_transcription: bool,
    pub output_transcription: bool,
}

/// One transport-encoded chunk of microphone audio.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaChunk {
    pub mime_type: String,
    pub data: String,
}

/// Something the live backend told us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveServerEvent {
    /// Base64 PCM16 audio at the output sample rate.
    Audio(String),
    InputTranscription(String),
    OutputTranscription(String),
    TurnComplete,
    /// The user spoke over the model; queued playback is stale.
    Interrupted,
    /// The server will drop the connection soon; carries `timeLeft` if sent.
    /// The session stays usable until `Closed` arrives.
    GoAway(Option<String>),
    /// The socket closed.
    Closed(Option<String>),
}

/// The outbound half of an open live session.
#[async_trait]
pub trait LiveSink: Send + Sync {
    async fn send_audio(&self, chunk: MediaChunk) -> Result<()>;

    /// Request graceful termination.
    async fn close(&self) -> Result<()>;
}

/// An open live session: outbound sink plus inbound event stream.
pub struct LiveConnection {
    pub sink: Arc<dyn LiveSink>,
    pub events: LiveEventStream,
}

/// Streamed and one-shot text generation.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Provider identifier (e.g., "google").
    fn id(&self) -> &str;

    /// Stream a chat reply as text fragments.
    async fn stream_chat(&self, request: &ChatRequest) -> Result<TextStream>;

    /// Single non-streamed generation.
    async fn generate_text(&self, model: &str, prompt: &str) -> Result<String>;
}

/// Server-side text-to-speech.
#[async_trait]
pub trait SpeechProvider: Send + Sync {
    /// Synthesize speech. `Ok(None)` means the backend answered without audio.
    async fn synthesize(&self, request: &SpeechRequest) -> Result<Option<String>>;
}

/// Bidirectional low-latency voice sessions.
#[async_trait]
pub trait LiveProvider: Send + Sync {
    async fn connect(&self, setup: &LiveSetup) -> Result<LiveConnection>;
}
