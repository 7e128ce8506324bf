//! Speech synthesis queue.
//!
//! Text is sanitized, synthesized remotely, decoded, and played back to back
//! on one output. Every request carries a generation token; `cancel` bumps the
//! generation, stops whatever is audible, and drops every result that belongs
//! to an older generation.
//!
//! Requests may complete out of order. Each accepted request takes a ticket in
//! call order and results are released to the playback queue in ticket order,
//! so sentences are always heard in the order they were submitted.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, LazyLock, Mutex};

use regex::Regex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use lingua_tutor_core::config::Config;
use lingua_tutor_core::error::{Result, TutorError};
use lingua_tutor_providers::{SpeechProvider, SpeechRequest};

use crate::codec::{self, AudioBuffer};
use crate::platform::{AudioOutput, PlaybackSource};

static BRACKETED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[.*?\]").expect("static regex"));
static BOLD_LABEL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\*\*.*?:\*\*").expect("static regex"));
static MARKUP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[`*()\[\]{}]").expect("static regex"));
static LINE_BREAK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\r\n|\n|\r").expect("static regex"));
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("static regex"));

/// Strip tutor markup so only speakable text reaches the synthesizer.
///
/// Bracketed annotations go first, then the pronunciation label, then any
/// other bold label (which becomes a pause), then stray markup characters.
/// Line breaks and whitespace runs collapse to single spaces.
pub fn sanitize_for_speech(text: &str) -> String {
    let text = BRACKETED.replace_all(text, "");
    let text = text.replace("**Pronunciation:**", "");
    let text = BOLD_LABEL.replace_all(&text, ", ");
    let text = MARKUP.replace_all(&text, "");
    let text = LINE_BREAK.replace_all(&text, " ");
    let text = WHITESPACE.replace_all(&text, " ");

    let mut clean = text.trim();
    while let Some(rest) = clean.strip_prefix(',') {
        clean = rest.trim();
    }
    clean.to_string()
}

#[derive(Debug, Clone)]
pub struct SpeechQueueConfig {
    pub model: String,
    pub voice: String,
    /// Longest sanitized text accepted, in UTF-16 code units.
    pub max_chars: usize,
    /// Rate of the PCM the synthesizer returns.
    pub sample_rate: u32,
}

impl SpeechQueueConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            model: config.tts_model(),
            voice: config.tts_voice(),
            max_chars: config.tts_max_chars(),
            sample_rate: config.output_sample_rate(),
        }
    }
}

#[derive(Default)]
struct QueueState {
    generation: u64,
    next_ticket: u64,
    next_release: u64,
    /// Finished requests waiting for an earlier ticket. `None` marks a failed one.
    pending: BTreeMap<u64, Option<AudioBuffer>>,
    queue: VecDeque<AudioBuffer>,
    playing: bool,
    sources: Vec<PlaybackSource>,
}

struct Inner {
    synthesizer: Arc<dyn SpeechProvider>,
    output: Arc<dyn AudioOutput>,
    config: SpeechQueueConfig,
    state: Mutex<QueueState>,
}

/// Cloneable handle to the shared queue.
#[derive(Clone)]
pub struct SpeechQueue {
    inner: Arc<Inner>,
}

impl SpeechQueue {
    pub fn new(
        synthesizer: Arc<dyn SpeechProvider>,
        output: Arc<dyn AudioOutput>,
        config: SpeechQueueConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                synthesizer,
                output,
                config,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    /// Sanitize, synthesize, and enqueue `text` for playback.
    ///
    /// Returns `None` when nothing was started: empty or unspeakable text, a
    /// stale `generation`, or text over the length limit (reported through
    /// `on_error`). Otherwise returns the synthesis task; it completes once the
    /// result has been queued or discarded. Failures are reported through
    /// `on_error` unless the generation was cancelled in the meantime.
    pub fn speak<F>(&self, text: &str, generation: u64, on_error: F) -> Option<JoinHandle<()>>
    where
        F: FnOnce(TutorError) + Send + 'static,
    {
        if text.is_empty() {
            return None;
        }
        let clean = sanitize_for_speech(text);
        // Measured in UTF-16 code units: astral characters such as emoji count twice.
        let len = clean.encode_utf16().count();
        if len < 2 {
            trace!(text, "Nothing speakable");
            return None;
        }

        let ticket = {
            let mut state = self.inner.state.lock().unwrap();
            if generation != state.generation {
                debug!(generation, current = state.generation, "Ignoring stale speech request");
                return None;
            }
            if len > self.inner.config.max_chars {
                drop(state);
                warn!(len, max = self.inner.config.max_chars, "Speech text too long");
                on_error(TutorError::TextTooLong {
                    len,
                    max: self.inner.config.max_chars,
                });
                return None;
            }
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            ticket
        };

        let inner = Arc::clone(&self.inner);
        Some(tokio::spawn(async move {
            match inner.synthesize(&clean).await {
                Ok(buffer) => {
                    inner.release(generation, ticket, Some(buffer));
                }
                Err(e) => {
                    if inner.release(generation, ticket, None) {
                        error!(%e, "Speech synthesis failed");
                        on_error(e);
                    }
                }
            }
        }))
    }

    /// Stop playback, drop everything queued or in flight, and start a new
    /// generation. Returns the new generation token.
    pub fn cancel(&self) -> u64 {
        let mut state = self.inner.state.lock().unwrap();
        for source in state.sources.drain(..) {
            source.stop();
        }
        state.queue.clear();
        state.pending.clear();
        state.next_ticket = 0;
        state.next_release = 0;
        state.playing = false;
        state.generation += 1;
        info!(generation = state.generation, "Speech cancelled");
        state.generation
    }

    pub fn current_generation(&self) -> u64 {
        self.inner.state.lock().unwrap().generation
    }

    /// Buffers waiting to play.
    pub fn queued_len(&self) -> usize {
        self.inner.state.lock().unwrap().queue.len()
    }

    pub fn is_playing(&self) -> bool {
        self.inner.state.lock().unwrap().playing
    }
}

impl Inner {
    async fn synthesize(&self, text: &str) -> Result<AudioBuffer> {
        let request = SpeechRequest {
            model: self.config.model.clone(),
            voice: self.config.voice.clone(),
            text: text.to_string(),
        };
        let audio = self
            .synthesizer
            .synthesize(&request)
            .await?
            .ok_or_else(|| TutorError::RemoteCall("API did not return audio data.".into()))?;
        let bytes = codec::decode(&audio)?;
        codec::decode_audio_data(&bytes, self.config.sample_rate, 1)
    }

    /// Hand a finished ticket to the reorder buffer and move every ticket that
    /// is now in order onto the playback queue. Returns `false` when the
    /// ticket belongs to a cancelled generation.
    fn release(self: &Arc<Self>, generation: u64, ticket: u64, buffer: Option<AudioBuffer>) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.generation != generation {
            debug!(generation, ticket, "Discarding stale speech result");
            return false;
        }
        state.pending.insert(ticket, buffer);
        loop {
            let next = state.next_release;
            let Some(slot) = state.pending.remove(&next) else {
                break;
            };
            state.next_release += 1;
            if let Some(buffer) = slot {
                state.queue.push_back(buffer);
            }
        }
        if !state.playing {
            self.play_next(&mut state);
        }
        true
    }

    fn play_next(self: &Arc<Self>, state: &mut QueueState) {
        while let Some(buffer) = state.queue.pop_front() {
            let start_at = self.output.current_time();
            match self.output.schedule(buffer, start_at) {
                Ok(source) => {
                    state.playing = true;
                    state.sources.push(source.clone());
                    let inner = Arc::clone(self);
                    let generation = state.generation;
                    tokio::spawn(async move {
                        source.ended().await;
                        inner.on_source_ended(&source, generation);
                    });
                    return;
                }
                Err(e) => {
                    error!(%e, "Failed to start speech playback");
                }
            }
        }
        state.playing = false;
    }

    fn on_source_ended(self: &Arc<Self>, source: &PlaybackSource, generation: u64) {
        let mut state = self.state.lock().unwrap();
        state.sources.retain(|s| s.id != source.id);
        if state.generation != generation || source.is_stopped() {
            return;
        }
        state.playing = false;
        self.play_next(&mut state);
    }
}
