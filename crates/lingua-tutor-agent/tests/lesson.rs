//! End-to-end lesson tests over fake backends and the WAV device.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use lingua_tutor_agent::prompt::{GREETING, WELCOME_BACK_FALLBACK};
use lingua_tutor_agent::tutor::{LISTENING, MICROPHONE_ERROR, REPLY_ERROR, VOICE_ERROR};
use lingua_tutor_agent::{ChatService, ChatSettings, Tutor, TutorEvent};
use lingua_tutor_core::config::Config;
use lingua_tutor_core::error::{Result, TutorError};
use lingua_tutor_core::history_store::{CHAT_HISTORY_KEY, HistoryStore, MemoryHistoryStore};
use lingua_tutor_core::types::{Message, Role};
use lingua_tutor_media::codec;
use lingua_tutor_media::{
    AudioDevice, LiveSession, LiveSessionConfig, SpeechQueue, SpeechQueueConfig, WavDevice,
};
use lingua_tutor_providers::{
    ChatProvider, ChatRequest, LiveConnection, LiveProvider, LiveServerEvent, LiveSetup, LiveSink,
    MediaChunk, SpeechProvider, SpeechRequest, TextStream,
};

enum Reply {
    Fragments(Vec<&'static str>),
    FailAfter(Vec<&'static str>),
    Refuse,
}

#[derive(Default)]
struct FakeChat {
    replies: Mutex<VecDeque<Reply>>,
    welcome: Option<&'static str>,
    requests: Mutex<Vec<ChatRequest>>,
}

#[async_trait]
impl ChatProvider for FakeChat {
    fn id(&self) -> &str {
        "fake"
    }

    async fn stream_chat(&self, request: &ChatRequest) -> Result<TextStream> {
        self.requests.lock().unwrap().push(request.clone());
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Reply::Fragments(vec!["Okay."]));
        let items: Vec<Result<String>> = match reply {
            Reply::Fragments(parts) => parts.into_iter().map(|p| Ok(p.to_string())).collect(),
            Reply::FailAfter(parts) => parts
                .into_iter()
                .map(|p| Ok(p.to_string()))
                .chain(std::iter::once(Err(TutorError::RemoteCall("stream reset".into()))))
                .collect(),
            Reply::Refuse => return Err(TutorError::RemoteCall("503 Service Unavailable".into())),
        };
        Ok(Box::pin(tokio_stream::iter(items)))
    }

    async fn generate_text(&self, _model: &str, _prompt: &str) -> Result<String> {
        self.welcome
            .map(str::to_string)
            .ok_or_else(|| TutorError::RemoteCall("quota exceeded".into()))
    }
}

#[derive(Default)]
struct FakeSpeech {
    calls: Mutex<Vec<String>>,
    fail: bool,
}

#[async_trait]
impl SpeechProvider for FakeSpeech {
    async fn synthesize(&self, request: &SpeechRequest) -> Result<Option<String>> {
        self.calls.lock().unwrap().push(request.text.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;
        if self.fail {
            return Err(TutorError::RemoteCall("voice unavailable".into()));
        }
        let frames = request.text.chars().count() * 2_400;
        Ok(Some(codec::encode(&vec![0u8; frames * 2])))
    }
}

type ServerTx = mpsc::UnboundedSender<Result<LiveServerEvent>>;

#[derive(Default)]
struct FakeLive {
    server: Mutex<Option<ServerTx>>,
}

struct NullSink;

#[async_trait]
impl LiveSink for NullSink {
    async fn send_audio(&self, _chunk: MediaChunk) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl LiveProvider for FakeLive {
    async fn connect(&self, _setup: &LiveSetup) -> Result<LiveConnection> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let (tx, rx) = mpsc::unbounded_channel();
        *self.server.lock().unwrap() = Some(tx);
        let events = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(LiveConnection {
            sink: Arc::new(NullSink),
            events: Box::pin(events),
        })
    }
}

impl FakeLive {
    fn push(&self, event: LiveServerEvent) {
        let server = self.server.lock().unwrap();
        server.as_ref().unwrap().send(Ok(event)).unwrap();
    }

    fn fail(&self, error: TutorError) {
        let server = self.server.lock().unwrap();
        server.as_ref().unwrap().send(Err(error)).unwrap();
    }
}

struct Lesson {
    tutor: Tutor,
    events: mpsc::UnboundedReceiver<TutorEvent>,
    chat: Arc<FakeChat>,
    speech: Arc<FakeSpeech>,
    live: Arc<FakeLive>,
    store: Arc<MemoryHistoryStore>,
    device: Arc<WavDevice>,
}

impl Lesson {
    fn build(chat: FakeChat, speech: FakeSpeech, device: WavDevice) -> Self {
        let config = Config::default();
        let chat = Arc::new(chat);
        let speech = Arc::new(speech);
        let live = Arc::new(FakeLive::default());
        let store = Arc::new(MemoryHistoryStore::new());
        let device = Arc::new(device);

        let output = device.open_output(24_000).unwrap();
        let queue = SpeechQueue::new(
            speech.clone(),
            output,
            SpeechQueueConfig::from_config(&config),
        );
        let session = LiveSession::new(
            live.clone(),
            device.clone(),
            LiveSessionConfig::from_config(&config, "Sprich langsam."),
        )
        .unwrap();
        let service = ChatService::new(chat.clone(), ChatSettings::from_config(&config));
        let (tutor, events) = Tutor::new(service, queue, session, store.clone());

        Self {
            tutor,
            events,
            chat,
            speech,
            live,
            store,
            device,
        }
    }

    fn new(chat: FakeChat) -> Self {
        Self::build(chat, FakeSpeech::default(), WavDevice::new(24_000))
    }

    fn speech_calls(&self) -> Vec<String> {
        self.speech.calls.lock().unwrap().clone()
    }

    fn drain_events(&mut self) -> Vec<TutorEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

fn replies(list: Vec<Reply>) -> FakeChat {
    FakeChat {
        replies: Mutex::new(list.into()),
        ..Default::default()
    }
}

async fn settle(seconds: u64) {
    tokio::time::sleep(Duration::from_secs(seconds)).await;
}

#[tokio::test(start_paused = true)]
async fn test_fresh_lesson_greets_once() {
    let lesson = Lesson::new(FakeChat::default());
    lesson.tutor.start_lesson().await;
    settle(5).await;

    let messages = lesson.tutor.messages();
    assert_eq!(messages, vec![Message::model(GREETING)]);
    assert_eq!(lesson.speech_calls(), vec![GREETING.to_string()]);
    assert_eq!(lesson.device.played().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_resumed_lesson_welcomes_back() {
    let lesson = Lesson::new(FakeChat {
        welcome: Some("Willkommen zurück! Letztes Mal ging es um das Wetter. Wie ist es heute?"),
        ..Default::default()
    });
    let stored = vec![
        Message::model(GREETING),
        Message::user("Es regnet."),
        Message::model("Oh, schade! Magst du Regen?"),
    ];
    lesson.store.save(CHAT_HISTORY_KEY, &stored).await.unwrap();

    lesson.tutor.start_lesson().await;
    settle(1).await;

    let messages = lesson.tutor.messages();
    assert_eq!(messages.len(), 4);
    assert_eq!(&messages[..3], stored.as_slice());
    assert!(messages[3].text.starts_with("Willkommen zurück!"));
    assert_eq!(lesson.speech_calls(), vec![messages[3].text.clone()]);
}

#[tokio::test(start_paused = true)]
async fn test_welcome_back_failure_uses_fallback() {
    let lesson = Lesson::new(FakeChat::default());
    lesson
        .store
        .save(CHAT_HISTORY_KEY, &[Message::model(GREETING), Message::user("Hallo")])
        .await
        .unwrap();

    lesson.tutor.start_lesson().await;
    settle(1).await;

    let messages = lesson.tutor.messages();
    assert_eq!(messages.last().unwrap(), &Message::model(WELCOME_BACK_FALLBACK));
    assert_eq!(lesson.speech_calls(), vec![WELCOME_BACK_FALLBACK.to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_send_streams_and_speaks_sentences() {
    let mut lesson = Lesson::new(replies(vec![Reply::Fragments(vec![
        "Guten Tag! Wie",
        " geht's? [how are you]",
        " Sehr gut",
    ])]));
    lesson.tutor.start_lesson().await;
    settle(5).await;
    lesson.drain_events();

    lesson.tutor.send("Hallo").await;
    settle(10).await;

    let full = "Guten Tag! Wie geht's? [how are you] Sehr gut";
    let messages = lesson.tutor.messages();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[1], Message::user("Hallo"));
    assert_eq!(messages[2], Message::model(full));

    let mut calls = lesson.speech_calls();
    calls.sort();
    let mut expected = vec![
        GREETING.to_string(),
        "Guten Tag!".to_string(),
        "Wie geht's?".to_string(),
        "Sehr gut".to_string(),
    ];
    expected.sort();
    assert_eq!(calls, expected);

    // Reply sentences play in the order they were written.
    let played: Vec<f64> = lesson.device.played().iter().map(|p| p.duration).collect();
    assert_eq!(played.len(), 4);
    assert!((played[1] - 1.0).abs() < 1e-6);
    assert!((played[2] - 1.1).abs() < 1e-6);
    assert!((played[3] - 0.8).abs() < 1e-6);

    let events = lesson.drain_events();
    assert!(matches!(&events[0], TutorEvent::MessageAdded { index: 1, .. }));
    assert!(matches!(&events[1], TutorEvent::MessageAdded { index: 2, message } if message.text.is_empty()));
    let updates: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            TutorEvent::MessageUpdated { index: 2, text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(updates.len(), 3);
    assert_eq!(updates[2], full);

    let stored = lesson.store.load(CHAT_HISTORY_KEY).await.unwrap();
    assert_eq!(stored, messages);

    let request = lesson.chat.requests.lock().unwrap()[0].clone();
    assert_eq!(request.history.len(), 1);
    assert_eq!(request.message, "Hallo");
    assert!(!lesson.tutor.is_sending());
}

#[tokio::test(start_paused = true)]
async fn test_deep_mode_selects_deep_tier() {
    let lesson = Lesson::new(FakeChat::default());
    lesson.tutor.start_lesson().await;
    lesson.tutor.set_deep_mode(true);
    lesson.tutor.send("Erkläre den Genitiv.").await;

    let request = lesson.chat.requests.lock().unwrap()[0].clone();
    assert_eq!(request.model, "gemini-2.5-pro");
    assert_eq!(request.thinking_budget, Some(32_768));
}

#[tokio::test(start_paused = true)]
async fn test_blank_input_is_ignored() {
    let lesson = Lesson::new(FakeChat::default());
    lesson.tutor.start_lesson().await;
    lesson.tutor.send("   \n").await;
    assert_eq!(lesson.tutor.messages().len(), 1);
    assert!(lesson.chat.requests.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_refused_request_adds_error_entry() {
    let lesson = Lesson::new(replies(vec![Reply::Refuse]));
    lesson.tutor.start_lesson().await;
    lesson.tutor.send("Hallo").await;

    let messages = lesson.tutor.messages();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[1], Message::user("Hallo"));
    assert_eq!(messages[2], Message::error(REPLY_ERROR));
    assert!(!lesson.tutor.is_sending());
    assert!(lesson.store.load(CHAT_HISTORY_KEY).await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stream_failure_keeps_partial_reply() {
    let lesson = Lesson::new(replies(vec![
        Reply::FailAfter(vec!["Das ist"]),
        Reply::FailAfter(vec![]),
    ]));
    lesson.tutor.start_lesson().await;

    lesson.tutor.send("Eins").await;
    let messages = lesson.tutor.messages();
    assert_eq!(messages[2], Message::model("Das ist"));
    assert_eq!(messages[3], Message::error(REPLY_ERROR));

    // Nothing arrived: the empty placeholder becomes the error.
    lesson.tutor.send("Zwei").await;
    let messages = lesson.tutor.messages();
    assert_eq!(messages.len(), 6);
    assert_eq!(messages[4], Message::user("Zwei"));
    assert_eq!(messages[5], Message::error(REPLY_ERROR));

    // Error entries are never sent back to the backend.
    let requests = lesson.chat.requests.lock().unwrap();
    assert!(requests[1].history.iter().all(|t| t.role != "error"));
    assert_eq!(requests[1].history.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_speech_failure_becomes_transcript_entry() {
    let lesson = Lesson::build(
        FakeChat::default(),
        FakeSpeech {
            fail: true,
            ..Default::default()
        },
        WavDevice::new(24_000),
    );
    lesson.tutor.start_lesson().await;
    settle(1).await;

    let messages = lesson.tutor.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].role, Role::Error);
    assert!(messages[1].text.starts_with("Audio Error: "));
    assert!(messages[1].text.contains("voice unavailable"));
}

#[tokio::test(start_paused = true)]
async fn test_new_message_silences_previous_reply() {
    let lesson = Lesson::new(replies(vec![Reply::Fragments(vec!["Ja."])]));
    lesson.tutor.start_lesson().await;
    let before = lesson.tutor.generation();
    settle(1).await;
    assert!(lesson.tutor.speech().is_playing());

    lesson.tutor.send("Stopp").await;
    assert!(lesson.tutor.generation() > before);
    settle(5).await;
    // The greeting was cut off, only the reply finished.
    assert_eq!(lesson.device.played().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_voice_turn_is_recorded() {
    let mut lesson = Lesson::new(FakeChat::default());
    lesson.tutor.start_lesson().await;
    lesson.drain_events();

    lesson.tutor.toggle_voice().await;
    assert!(lesson.tutor.is_recording());
    tokio::time::sleep(Duration::from_millis(100)).await;

    lesson.live.push(LiveServerEvent::InputTranscription("Ich lerne".into()));
    lesson.live.push(LiveServerEvent::InputTranscription(" Deutsch".into()));
    lesson.live.push(LiveServerEvent::OutputTranscription("Super! Seit wann?".into()));
    lesson.live.push(LiveServerEvent::TurnComplete);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let messages = lesson.tutor.messages();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[1], Message::user("Ich lerne Deutsch"));
    assert_eq!(messages[2], Message::model("Super! Seit wann?"));
    assert_eq!(lesson.store.load(CHAT_HISTORY_KEY).await.unwrap(), messages);

    let events = lesson.drain_events();
    assert_eq!(events[0], TutorEvent::VoiceActive(true));
    assert_eq!(events[1], TutorEvent::Heard(LISTENING.into()));
    assert!(events.contains(&TutorEvent::Heard("Ich lerne Deutsch".into())));
    assert_eq!(events.last(), Some(&TutorEvent::Heard(String::new())));

    lesson.tutor.toggle_voice().await;
    assert!(!lesson.tutor.is_recording());
    assert!(!lesson.tutor.live().is_active());
}

#[tokio::test(start_paused = true)]
async fn test_server_close_ends_voice_mode() {
    let lesson = Lesson::new(FakeChat::default());
    lesson.tutor.start_lesson().await;
    lesson.tutor.start_voice().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    lesson.live.push(LiveServerEvent::Closed(None));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!lesson.tutor.is_recording());
    assert_eq!(lesson.tutor.messages().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_undecodable_live_audio_keeps_voice_mode() {
    let lesson = Lesson::new(FakeChat::default());
    lesson.tutor.start_lesson().await;
    lesson.tutor.start_voice().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    lesson.live.push(LiveServerEvent::Audio("not base64!".into()));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(lesson.tutor.is_recording());
    assert!(lesson.tutor.live().is_active());
    let last = lesson.tutor.messages().last().unwrap().clone();
    assert_eq!(last.role, Role::Error);
    assert!(last.text.starts_with("Audio Error: "));
}

#[tokio::test(start_paused = true)]
async fn test_live_session_error_stops_voice_mode() {
    let lesson = Lesson::new(FakeChat::default());
    lesson.tutor.start_lesson().await;
    lesson.tutor.start_voice().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    lesson.live.fail(TutorError::RemoteCall("connection reset".into()));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(!lesson.tutor.is_recording());
    assert!(!lesson.tutor.live().is_active());
    assert_eq!(lesson.tutor.messages().last().unwrap(), &Message::error(VOICE_ERROR));
}

#[tokio::test(start_paused = true)]
async fn test_go_away_keeps_voice_mode() {
    let lesson = Lesson::new(FakeChat::default());
    lesson.tutor.start_lesson().await;
    lesson.tutor.start_voice().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    lesson.live.push(LiveServerEvent::GoAway(Some("50s".into())));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(lesson.tutor.is_recording());
    assert!(lesson.tutor.live().is_active());
    assert_eq!(lesson.tutor.messages().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_microphone_failure_is_reported() {
    let lesson = Lesson::build(
        FakeChat::default(),
        FakeSpeech::default(),
        WavDevice::new(24_000).with_microphone("/nonexistent/mic.wav"),
    );
    lesson.tutor.start_lesson().await;
    lesson.tutor.toggle_voice().await;

    assert!(!lesson.tutor.is_recording());
    assert_eq!(lesson.tutor.messages().last().unwrap(), &Message::error(MICROPHONE_ERROR));
}

#[tokio::test(start_paused = true)]
async fn test_clear_resets_lesson() {
    let lesson = Lesson::new(FakeChat::default());
    lesson.tutor.start_lesson().await;
    lesson.tutor.send("Hallo").await;
    assert_eq!(lesson.store.load(CHAT_HISTORY_KEY).await.unwrap().len(), 3);

    lesson.tutor.clear().await;
    assert_eq!(lesson.tutor.messages(), vec![Message::model(GREETING)]);
    assert!(lesson.store.load(CHAT_HISTORY_KEY).await.unwrap().is_empty());
    settle(1).await;
    assert_eq!(
        lesson.speech_calls().iter().filter(|c| *c == GREETING).count(),
        2
    );
}
