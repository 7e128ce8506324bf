//! Lesson controller.
//!
//! [`Tutor`] owns the transcript and wires the chat service, the speech queue
//! and the live voice session together. Every user action cancels the current
//! speech generation before doing anything else, so the tutor never talks
//! over the learner.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use lingua_tutor_core::error::Result;
use lingua_tutor_core::history_store::{CHAT_HISTORY_KEY, HistoryStore};
use lingua_tutor_core::types::{Message, Role};
use lingua_tutor_media::{LiveEvent, LiveSession, SpeechQueue};

use crate::chat::ChatService;
use crate::prompt::{GREETING, WELCOME_BACK_FALLBACK};
use crate::segmenter::SentenceSegmenter;

pub const REPLY_ERROR: &str = "An error occurred. Please try again.";
pub const MICROPHONE_ERROR: &str = "Could not access microphone.";
pub const VOICE_ERROR: &str = "Voice chat error. Please try again.";
pub const LISTENING: &str = "Listening...";

/// Transcript and status changes, in the order they happened.
#[derive(Debug, Clone, PartialEq)]
pub enum TutorEvent {
    MessageAdded { index: usize, message: Message },
    /// The streaming reply at `index` grew; `text` is the full text so far.
    MessageUpdated { index: usize, text: String },
    MessageReplaced { index: usize, message: Message },
    /// The transcript was replaced wholesale; `MessageAdded` events follow.
    TranscriptReset,
    /// Live transcription status line. Empty clears it.
    Heard(String),
    VoiceActive(bool),
}

#[derive(Debug, Default)]
struct LessonState {
    messages: Vec<Message>,
    generation: u64,
    sending: bool,
    recording: bool,
    voice_epoch: u64,
    deep_mode: bool,
}

struct TutorInner {
    chat: ChatService,
    speech: SpeechQueue,
    live: LiveSession,
    store: Arc<dyn HistoryStore>,
    state: Mutex<LessonState>,
    events: mpsc::UnboundedSender<TutorEvent>,
}

#[derive(Clone)]
pub struct Tutor {
    inner: Arc<TutorInner>,
}

impl Tutor {
    pub fn new(
        chat: ChatService,
        speech: SpeechQueue,
        live: LiveSession,
        store: Arc<dyn HistoryStore>,
    ) -> (Self, mpsc::UnboundedReceiver<TutorEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let tutor = Self {
            inner: Arc::new(TutorInner {
                chat,
                speech,
                live,
                store,
                state: Mutex::new(LessonState::default()),
                events,
            }),
        };
        (tutor, rx)
    }

    /// Load the stored transcript and greet the learner.
    ///
    /// A fresh lesson opens with the fixed greeting; a resumed one gets a
    /// generated welcome-back line (or a fixed fallback if that fails).
    pub async fn start_lesson(&self) {
        let stored = match self.inner.store.load(CHAT_HISTORY_KEY).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(%e, "Could not load transcript, starting fresh");
                Vec::new()
            }
        };

        if stored.is_empty() {
            info!("Starting new lesson");
            self.reset_transcript(vec![Message::model(GREETING)]);
            let generation = self.cancel_speech();
            self.speak(GREETING, generation);
            return;
        }

        info!(messages = stored.len(), "Resuming lesson");
        self.reset_transcript(stored.clone());
        let welcome = match self.inner.chat.generate_welcome_back_message(&stored).await {
            Ok(text) => text,
            Err(e) => {
                error!(%e, "Failed to generate welcome message");
                WELCOME_BACK_FALLBACK.to_string()
            }
        };
        self.push_message(Message::model(welcome.as_str()));
        let generation = self.cancel_speech();
        self.speak(&welcome, generation);
    }

    /// Send a typed message and stream the reply, speaking it sentence by sentence.
    ///
    /// Blank input, or input while a reply is still streaming, is ignored.
    pub async fn send(&self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        let (history, deep_mode) = {
            let mut state = self.inner.state.lock().unwrap();
            if state.sending {
                debug!("Reply still streaming, ignoring input");
                return;
            }
            state.sending = true;
            (state.messages.clone(), state.deep_mode)
        };

        self.push_message(Message::user(text));
        let generation = self.cancel_speech();

        let mut placeholder = None;
        match self
            .stream_reply(&history, text, deep_mode, generation, &mut placeholder)
            .await
        {
            Ok(reply) => {
                let mut snapshot = history;
                snapshot.push(Message::user(text));
                snapshot.push(Message::model(reply));
                self.persist(&snapshot).await;
            }
            Err(e) => {
                error!(%e, "Chat request failed");
                self.report_reply_failure(placeholder);
            }
        }

        self.inner.state.lock().unwrap().sending = false;
    }

    async fn stream_reply(
        &self,
        history: &[Message],
        text: &str,
        deep_mode: bool,
        generation: u64,
        placeholder: &mut Option<usize>,
    ) -> Result<String> {
        let mut stream = self
            .inner
            .chat
            .send_message_stream(history, text, deep_mode)
            .await?;
        let index = self.push_message(Message::model(""));
        *placeholder = Some(index);

        let mut segmenter = SentenceSegmenter::new();
        let mut reply = String::new();
        while let Some(fragment) = stream.next().await {
            let fragment = fragment?;
            reply.push_str(&fragment);
            self.update_message(index, &reply);
            for sentence in segmenter.push(&fragment) {
                self.speak(&sentence, generation);
            }
        }
        if let Some(rest) = segmenter.finish() {
            self.speak(&rest, generation);
        }

        debug!(len = reply.len(), "Reply complete");
        Ok(reply)
    }

    /// Replace an empty reply placeholder with the error, or append it.
    fn report_reply_failure(&self, placeholder: Option<usize>) {
        let message = Message::error(REPLY_ERROR);
        let mut state = self.inner.state.lock().unwrap();
        let replace = placeholder.filter(|&i| {
            state
                .messages
                .get(i)
                .is_some_and(|m| m.role == Role::Model && m.text.is_empty())
        });
        match replace {
            Some(index) => {
                state.messages[index] = message.clone();
                self.emit(TutorEvent::MessageReplaced { index, message });
            }
            None => {
                self.push_locked(&mut state, message);
            }
        }
    }

    /// Open a live voice session. A microphone failure becomes a transcript entry.
    pub async fn start_voice(&self) {
        let (epoch, deep_mode) = {
            let mut state = self.inner.state.lock().unwrap();
            if state.recording {
                return;
            }
            state.recording = true;
            state.voice_epoch += 1;
            (state.voice_epoch, state.deep_mode)
        };
        self.emit(TutorEvent::VoiceActive(true));
        self.emit(TutorEvent::Heard(LISTENING.to_string()));

        let (tx, rx) = mpsc::unbounded_channel();
        match self.inner.live.connect(tx, deep_mode).await {
            Ok(()) => {
                tokio::spawn(self.clone().pump_live(epoch, rx));
            }
            Err(e) => {
                error!(%e, "Failed to start recording");
                self.push_message(Message::error(MICROPHONE_ERROR));
                self.end_voice(epoch);
            }
        }
    }

    pub fn stop_voice(&self) {
        let epoch = self.inner.state.lock().unwrap().voice_epoch;
        self.end_voice(epoch);
        self.inner.live.close();
    }

    /// Silence the tutor, then start or stop voice mode.
    pub async fn toggle_voice(&self) {
        self.cancel_speech();
        if self.is_recording() {
            self.stop_voice();
        } else {
            self.start_voice().await;
        }
    }

    async fn pump_live(self, epoch: u64, mut events: mpsc::UnboundedReceiver<LiveEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                LiveEvent::Opened => info!(epoch, "Voice session opened"),
                LiveEvent::Heard(text) => {
                    if self.voice_current(epoch) {
                        self.emit(TutorEvent::Heard(text));
                    }
                }
                LiveEvent::TurnComplete(messages) => {
                    let snapshot = {
                        let mut state = self.inner.state.lock().unwrap();
                        for message in messages {
                            self.push_locked(&mut state, message);
                        }
                        state.messages.clone()
                    };
                    self.persist(&snapshot).await;
                    if self.voice_current(epoch) {
                        self.emit(TutorEvent::Heard(String::new()));
                    }
                }
                LiveEvent::AudioDropped(e) => {
                    warn!(%e, "Live audio chunk dropped");
                    self.push_message(Message::error(format!("Audio Error: {e}")));
                }
                LiveEvent::Error(e) => {
                    error!(%e, "Live session error");
                    self.push_message(Message::error(VOICE_ERROR));
                    if self.end_voice(epoch) {
                        self.inner.live.close();
                    }
                }
                LiveEvent::Closed => {
                    info!(epoch, "Voice session closed");
                    self.end_voice(epoch);
                }
            }
        }
        debug!(epoch, "Voice event pump finished");
    }

    fn voice_current(&self, epoch: u64) -> bool {
        let state = self.inner.state.lock().unwrap();
        state.recording && state.voice_epoch == epoch
    }

    /// Leave voice mode if `epoch` is still the active one.
    fn end_voice(&self, epoch: u64) -> bool {
        {
            let mut state = self.inner.state.lock().unwrap();
            if !state.recording || state.voice_epoch != epoch {
                return false;
            }
            state.recording = false;
        }
        self.emit(TutorEvent::VoiceActive(false));
        self.emit(TutorEvent::Heard(String::new()));
        true
    }

    /// Start over: greeting only, stored transcript removed.
    pub async fn clear(&self) {
        self.reset_transcript(vec![Message::model(GREETING)]);
        if let Err(e) = self.inner.store.clear(CHAT_HISTORY_KEY).await {
            warn!(%e, "Could not clear stored transcript");
        }
        let generation = self.cancel_speech();
        self.speak(GREETING, generation);
        info!("Lesson cleared");
    }

    pub fn set_deep_mode(&self, enabled: bool) {
        self.inner.state.lock().unwrap().deep_mode = enabled;
        info!(enabled, "Deep grammar mode");
    }

    pub fn deep_mode(&self) -> bool {
        self.inner.state.lock().unwrap().deep_mode
    }

    pub fn messages(&self) -> Vec<Message> {
        self.inner.state.lock().unwrap().messages.clone()
    }

    pub fn is_recording(&self) -> bool {
        self.inner.state.lock().unwrap().recording
    }

    pub fn is_sending(&self) -> bool {
        self.inner.state.lock().unwrap().sending
    }

    /// The speech generation the tutor is currently speaking under.
    pub fn generation(&self) -> u64 {
        self.inner.state.lock().unwrap().generation
    }

    pub fn speech(&self) -> &SpeechQueue {
        &self.inner.speech
    }

    pub fn live(&self) -> &LiveSession {
        &self.inner.live
    }

    fn emit(&self, event: TutorEvent) {
        let _ = self.inner.events.send(event);
    }

    fn cancel_speech(&self) -> u64 {
        let generation = self.inner.speech.cancel();
        self.inner.state.lock().unwrap().generation = generation;
        generation
    }

    fn speak(&self, text: &str, generation: u64) {
        let tutor = self.clone();
        self.inner.speech.speak(text, generation, move |e| {
            tutor.push_message(Message::error(format!("Audio Error: {e}")));
        });
    }

    fn push_message(&self, message: Message) -> usize {
        let mut state = self.inner.state.lock().unwrap();
        self.push_locked(&mut state, message)
    }

    fn push_locked(&self, state: &mut LessonState, message: Message) -> usize {
        state.messages.push(message.clone());
        let index = state.messages.len() - 1;
        self.emit(TutorEvent::MessageAdded { index, message });
        index
    }

    fn update_message(&self, index: usize, text: &str) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(message) = state.messages.get_mut(index) {
            if message.role == Role::Model {
                message.text = text.to_string();
                self.emit(TutorEvent::MessageUpdated {
                    index,
                    text: text.to_string(),
                });
            }
        }
    }

    fn reset_transcript(&self, messages: Vec<Message>) {
        let mut state = self.inner.state.lock().unwrap();
        state.messages.clear();
        self.emit(TutorEvent::TranscriptReset);
        for message in messages {
            self.push_locked(&mut state, message);
        }
    }

    async fn persist(&self, messages: &[Message]) {
        if let Err(e) = self.inner.store.save(CHAT_HISTORY_KEY, messages).await {
            warn!(%e, "Could not save transcript");
        }
    }
}
