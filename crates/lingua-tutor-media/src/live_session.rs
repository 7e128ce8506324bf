//! Realtime voice session.
//!
//! Microphone frames are converted to PCM16 and streamed to the live backend.
//! Audio coming back is scheduled gaplessly on the output clock, interruptions
//! flush everything queued, and transcription fragments are collected into a
//! user/model message pair at each turn boundary.
//!
//! At most one session runs at a time. Each connect starts a new epoch;
//! callbacks from an older epoch find the epoch changed and do nothing.

use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use lingua_tutor_core::config::Config;
use lingua_tutor_core::error::{Result, TutorError};
use lingua_tutor_core::types::Message;
use lingua_tutor_providers::{
    LiveEventStream, LiveProvider, LiveServerEvent, LiveSetup, LiveSink, MediaChunk,
};

use crate::codec::{self, AudioBuffer};
use crate::platform::{AudioDevice, AudioOutput, CaptureStream, PlaybackSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveState {
    Idle,
    Connecting,
    Active,
    Closing,
}

/// What the session reports to its owner.
#[derive(Debug)]
pub enum LiveEvent {
    Opened,
    /// Accumulated user speech for the current turn.
    Heard(String),
    /// The finished turn, user message first. Never empty.
    TurnComplete(Vec<Message>),
    /// One inbound audio chunk could not be played. The session keeps running.
    AudioDropped(TutorError),
    /// The session failed and has been cleaned up.
    Error(TutorError),
    /// The server ended the session.
    Closed,
}

#[derive(Debug, Clone)]
pub struct LiveSessionConfig {
    pub model: String,
    pub voice: String,
    pub system_instruction: String,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub frame_size: usize,
}

impl LiveSessionConfig {
    pub fn from_config(config: &Config, system_instruction: impl Into<String>) -> Self {
        Self {
            model: config.live_model(),
            voice: config.live_voice(),
            system_instruction: system_instruction.into(),
            input_sample_rate: config.input_sample_rate(),
            output_sample_rate: config.output_sample_rate(),
            frame_size: config.frame_size(),
        }
    }

    fn setup(&self) -> LiveSetup {
        LiveSetup {
            model: self.model.clone(),
            voice: self.voice.clone(),
            system_instruction: self.system_instruction.clone(),
            input_transcription: true,
            output_transcription: true,
        }
    }
}

/// Back-to-back scheduling cursor for streamed audio.
#[derive(Debug, Default)]
pub struct PlaybackSchedule {
    next_start: f64,
    sources: Vec<PlaybackSource>,
}

impl PlaybackSchedule {
    /// Schedule `buffer` right after everything already queued, or now if the
    /// queue has drained. Returns the start time.
    pub fn schedule(&mut self, output: &dyn AudioOutput, buffer: AudioBuffer) -> Result<f64> {
        self.sources.retain(|s| !s.is_ended());
        let start_at = self.next_start.max(output.current_time());
        let duration = buffer.duration();
        let source = output.schedule(buffer, start_at)?;
        self.next_start = start_at + duration;
        self.sources.push(source);
        Ok(start_at)
    }

    /// Stop every scheduled source and reset the cursor.
    pub fn interrupt(&mut self) {
        for source in self.sources.drain(..) {
            source.stop();
        }
        self.next_start = 0.0;
    }

    pub fn next_start(&self) -> f64 {
        self.next_start
    }

    /// Sources scheduled and not yet finished.
    pub fn active(&self) -> usize {
        self.sources.iter().filter(|s| !s.is_ended()).count()
    }
}

/// Transcription accumulated over one turn.
#[derive(Debug, Default)]
pub struct TurnTranscript {
    input: String,
    output: String,
}

impl TurnTranscript {
    /// Append user speech; returns everything heard so far this turn.
    pub fn push_input(&mut self, text: &str) -> &str {
        self.input.push_str(text);
        &self.input
    }

    pub fn push_output(&mut self, text: &str) {
        self.output.push_str(text);
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    /// Close the turn: user message (if any) then model message (if any).
    pub fn flush(&mut self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(2);
        let input = std::mem::take(&mut self.input);
        let output = std::mem::take(&mut self.output);
        if !input.trim().is_empty() {
            messages.push(Message::user(input.trim()));
        }
        if !output.trim().is_empty() {
            messages.push(Message::model(output.trim()));
        }
        messages
    }

    pub fn reset(&mut self) {
        self.input.clear();
        self.output.clear();
    }
}

type SessionHandle = Shared<BoxFuture<'static, std::result::Result<Arc<dyn LiveSink>, String>>>;

struct SessionState {
    phase: LiveState,
    epoch: u64,
    session: Option<SessionHandle>,
    capture_stop: Option<CancellationToken>,
    output: Arc<dyn AudioOutput>,
    schedule: PlaybackSchedule,
    transcript: TurnTranscript,
    events: Option<mpsc::UnboundedSender<LiveEvent>>,
}

struct LiveInner {
    provider: Arc<dyn LiveProvider>,
    device: Arc<dyn AudioDevice>,
    config: LiveSessionConfig,
    state: Mutex<SessionState>,
}

/// Handle to the (single) live voice session.
#[derive(Clone)]
pub struct LiveSession {
    inner: Arc<LiveInner>,
}

impl LiveSession {
    pub fn new(
        provider: Arc<dyn LiveProvider>,
        device: Arc<dyn AudioDevice>,
        config: LiveSessionConfig,
    ) -> Result<Self> {
        let output = device.open_output(config.output_sample_rate)?;
        Ok(Self {
            inner: Arc::new(LiveInner {
                provider,
                device,
                config,
                state: Mutex::new(SessionState {
                    phase: LiveState::Idle,
                    epoch: 0,
                    session: None,
                    capture_stop: None,
                    output,
                    schedule: PlaybackSchedule::default(),
                    transcript: TurnTranscript::default(),
                    events: None,
                }),
            }),
        })
    }

    /// Acquire the microphone and open a session, reporting through `events`.
    ///
    /// A no-op while another session is connecting or active. Fails with
    /// `TutorError::MediaAccess` when the microphone cannot be opened; backend
    /// failures arrive later as [`LiveEvent::Error`].
    pub async fn connect(
        &self,
        events: mpsc::UnboundedSender<LiveEvent>,
        deep_mode: bool,
    ) -> Result<()> {
        let epoch = {
            let mut state = self.inner.state.lock().unwrap();
            if state.phase != LiveState::Idle {
                warn!(phase = ?state.phase, "A live session is already connecting or active");
                return Ok(());
            }
            state.phase = LiveState::Connecting;
            state.epoch += 1;
            state.events = Some(events);
            state.transcript.reset();
            state.epoch
        };
        // The live model has no thinking tier; the flag only shows up in logs.
        debug!(epoch, deep_mode, "Connecting live session");

        let capture = match self
            .inner
            .device
            .open_capture(self.inner.config.input_sample_rate, self.inner.config.frame_size)
            .await
        {
            Ok(capture) => capture,
            Err(e) => {
                error!(%e, "Could not open microphone");
                self.inner.cleanup(epoch);
                return Err(match e {
                    TutorError::MediaAccess(_) => e,
                    other => TutorError::MediaAccess(other.to_string()),
                });
            }
        };

        {
            let mut state = self.inner.state.lock().unwrap();
            if state.epoch != epoch || state.phase == LiveState::Idle {
                capture.stop();
                return Ok(());
            }
            state.capture_stop = Some(capture.stop_handle());
        }

        let opener = tokio::spawn(Arc::clone(&self.inner).open_session(epoch));
        let session: SessionHandle = async move {
            match opener.await {
                Ok(result) => result,
                Err(e) => Err(e.to_string()),
            }
        }
        .boxed()
        .shared();

        {
            let mut state = self.inner.state.lock().unwrap();
            if state.epoch == epoch && state.phase != LiveState::Idle {
                state.session = Some(session.clone());
            }
        }

        tokio::spawn(Arc::clone(&self.inner).pump_microphone(epoch, capture, session));
        Ok(())
    }

    /// Ask the backend to end the session and release every local resource.
    pub fn close(&self) {
        let (epoch, session) = {
            let mut state = self.inner.state.lock().unwrap();
            if state.phase == LiveState::Idle {
                return;
            }
            state.phase = LiveState::Closing;
            (state.epoch, state.session.clone())
        };
        info!(epoch, "Closing live session");

        if let Some(session) = session {
            tokio::spawn(async move {
                if let Ok(sink) = session.await {
                    if let Err(e) = sink.close().await {
                        debug!(%e, "Live session close request failed");
                    }
                }
            });
        }
        self.inner.cleanup(epoch);
    }

    pub fn state(&self) -> LiveState {
        self.inner.state.lock().unwrap().phase
    }

    pub fn is_active(&self) -> bool {
        self.state() == LiveState::Active
    }

    pub fn output(&self) -> Arc<dyn AudioOutput> {
        Arc::clone(&self.inner.state.lock().unwrap().output)
    }

    /// Where the next received chunk would start, in output seconds.
    pub fn next_start(&self) -> f64 {
        self.inner.state.lock().unwrap().schedule.next_start()
    }

    pub fn active_sources(&self) -> usize {
        self.inner.state.lock().unwrap().schedule.active()
    }
}

impl LiveInner {
    fn is_current(&self, epoch: u64) -> bool {
        let state = self.state.lock().unwrap();
        state.epoch == epoch && state.phase != LiveState::Idle
    }

    fn emit(&self, epoch: u64, event: LiveEvent) {
        let state = self.state.lock().unwrap();
        emit_locked(&state, epoch, event);
    }

    async fn open_session(
        self: Arc<Self>,
        epoch: u64,
    ) -> std::result::Result<Arc<dyn LiveSink>, String> {
        let setup = self.config.setup();
        match self.provider.connect(&setup).await {
            Ok(connection) => {
                {
                    let mut state = self.state.lock().unwrap();
                    if state.epoch != epoch || state.phase != LiveState::Connecting {
                        drop(state);
                        debug!(epoch, "Live session closed while connecting");
                        let sink = connection.sink;
                        tokio::spawn(async move {
                            let _ = sink.close().await;
                        });
                        return Err("session closed while connecting".into());
                    }
                    state.phase = LiveState::Active;
                    emit_locked(&state, epoch, LiveEvent::Opened);
                }
                info!(epoch, model = %setup.model, "Live session opened");
                tokio::spawn(Arc::clone(&self).receive(epoch, connection.events));
                Ok(connection.sink)
            }
            Err(e) => {
                error!(%e, "Live session failed to open");
                let message = e.to_string();
                self.emit(epoch, LiveEvent::Error(e));
                self.cleanup(epoch);
                Err(message)
            }
        }
    }

    async fn receive(self: Arc<Self>, epoch: u64, mut events: LiveEventStream) {
        while let Some(event) = events.next().await {
            if !self.is_current(epoch) {
                return;
            }
            match event {
                Ok(LiveServerEvent::Closed(reason)) => {
                    info!(epoch, reason = ?reason, "Live session closed by server");
                    self.emit(epoch, LiveEvent::Closed);
                    self.cleanup(epoch);
                    return;
                }
                Ok(event) => self.handle_server_event(epoch, event),
                Err(e) => {
                    error!(%e, "Live session error");
                    self.emit(epoch, LiveEvent::Error(e));
                    self.cleanup(epoch);
                    return;
                }
            }
        }
        if self.is_current(epoch) {
            info!(epoch, "Live session stream ended");
            self.emit(epoch, LiveEvent::Closed);
            self.cleanup(epoch);
        }
    }

    fn handle_server_event(&self, epoch: u64, event: LiveServerEvent) {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        match event {
            LiveServerEvent::Audio(data) => {
                let buffer = codec::decode(&data).and_then(|bytes| {
                    codec::decode_audio_data(&bytes, self.config.output_sample_rate, 1)
                });
                let scheduled =
                    buffer.and_then(|b| state.schedule.schedule(state.output.as_ref(), b));
                if let Err(e) = scheduled {
                    warn!(%e, "Dropping live audio chunk");
                    emit_locked(state, epoch, LiveEvent::AudioDropped(e));
                }
            }
            LiveServerEvent::Interrupted => {
                debug!(epoch, "Model interrupted");
                state.schedule.interrupt();
            }
            LiveServerEvent::InputTranscription(text) => {
                let heard = state.transcript.push_input(&text).to_string();
                emit_locked(state, epoch, LiveEvent::Heard(heard));
            }
            LiveServerEvent::OutputTranscription(text) => {
                state.transcript.push_output(&text);
            }
            LiveServerEvent::TurnComplete => {
                let messages = state.transcript.flush();
                if !messages.is_empty() {
                    emit_locked(state, epoch, LiveEvent::TurnComplete(messages));
                }
            }
            LiveServerEvent::GoAway(time_left) => {
                warn!(epoch, time_left = ?time_left, "Live server will disconnect soon");
            }
            LiveServerEvent::Closed(_) => {}
        }
    }

    async fn pump_microphone(
        self: Arc<Self>,
        epoch: u64,
        mut capture: CaptureStream,
        session: SessionHandle,
    ) {
        let mime_type = codec::pcm16_mime(self.config.input_sample_rate);
        while let Some(frame) = capture.next_frame().await {
            if !self.is_current(epoch) {
                break;
            }
            let chunk = MediaChunk {
                mime_type: mime_type.clone(),
                data: codec::encode(&codec::float_to_pcm16(&frame)),
            };
            let sink = match session.clone().await {
                Ok(sink) => sink,
                Err(reason) => {
                    debug!(epoch, %reason, "Live session never opened");
                    break;
                }
            };
            if let Err(e) = sink.send_audio(chunk).await {
                if self.is_current(epoch) {
                    error!(%e, "Failed to stream microphone audio");
                    self.emit(epoch, LiveEvent::Error(e));
                    self.cleanup(epoch);
                }
                break;
            }
        }
        capture.stop();
        debug!(epoch, "Microphone pump stopped");
    }

    /// Release everything the session holds. Safe to call repeatedly; a call
    /// for an older epoch leaves the current session alone.
    fn cleanup(&self, epoch: u64) {
        let mut state = self.state.lock().unwrap();
        if state.epoch != epoch {
            return;
        }
        if let Some(stop) = state.capture_stop.take() {
            stop.cancel();
        }
        state.session = None;
        state.schedule.interrupt();
        state.transcript.reset();
        state.events = None;
        if state.output.is_closed() {
            match self.device.open_output(self.config.output_sample_rate) {
                Ok(output) => state.output = output,
                Err(e) => warn!(%e, "Could not reopen audio output"),
            }
        }
        if state.phase != LiveState::Idle {
            debug!(epoch, "Live session cleaned up");
        }
        state.phase = LiveState::Idle;
    }
}

fn emit_locked(state: &SessionState, epoch: u64, event: LiveEvent) {
    if state.epoch != epoch {
        return;
    }
    if let Some(events) = &state.events {
        let _ = events.send(event);
    }
}
