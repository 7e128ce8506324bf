use thiserror::Error;

#[derive(Debug, Error)]
pub enum TutorError {
    /// Network or service failure from the chat, synthesis, or live backend.
    #[error("Remote call failed: {0}")]
    RemoteCall(String),

    /// Microphone permission or device failure.
    #[error("Media access failed: {0}")]
    MediaAccess(String),

    #[error("Text is too long for audio generation ({len} > {max}).")]
    TextTooLong { len: usize, max: usize },

    /// Malformed transport encoding.
    #[error("Decode error: {0}")]
    Decode(String),

    /// PCM payload that cannot be turned into an audio buffer.
    #[error("Audio decode error: {0}")]
    AudioDecode(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TutorError {
    /// Wrap a backend failure, keeping its full context chain.
    pub fn remote(err: impl std::fmt::Display) -> Self {
        Self::RemoteCall(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TutorError>;
