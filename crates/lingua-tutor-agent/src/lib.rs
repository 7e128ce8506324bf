//! Chat orchestration and the lesson controller.
//!
//! [`ChatService`] streams tutor replies from the chat backend,
//! [`SentenceSegmenter`] cuts the stream into speakable sentences, and
//! [`Tutor`] runs a lesson: transcript, persistence, speech and voice mode.

pub mod chat;
pub mod prompt;
pub mod segmenter;
pub mod tutor;

pub use chat::{ChatService, ChatSettings};
pub use segmenter::SentenceSegmenter;
pub use tutor::{Tutor, TutorEvent};
