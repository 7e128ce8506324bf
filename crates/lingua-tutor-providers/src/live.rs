//! Gemini Live API client over WebSocket (`BidiGenerateContent`).
//!
//! The first frame is a `setup` message; the server acknowledges with
//! `setupComplete`. After that the client streams `realtimeInput` audio
//! chunks and the server answers with `serverContent` messages carrying
//! audio, transcriptions, and turn signals.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use lingua_tutor_core::error::{Result, TutorError};

use crate::{LiveConnection, LiveProvider, LiveServerEvent, LiveSetup, LiveSink, MediaChunk};

pub const DEFAULT_WS_BASE_URL: &str = "wss://generativelanguage.googleapis.com";

const LIVE_PATH: &str =
    "/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

const SETUP_TIMEOUT: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct GeminiLiveProvider {
    pub base_url: String,
    api_key: String,
}

impl GeminiLiveProvider {
    pub fn new(api_key: impl Into<String>, base_url: Option<&str>) -> Self {
        Self {
            base_url: base_url
                .unwrap_or(DEFAULT_WS_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key: api_key.into(),
        }
    }

    fn url(&self) -> String {
        format!("{}{}?key={}", self.base_url, LIVE_PATH, self.api_key)
    }
}

/// Build the `setup` frame for a session.
pub fn setup_message(setup: &LiveSetup) -> serde_json::Value {
    let mut body = json!({
        "model": format!("models/{}", setup.model),
        "generationConfig": {
            "responseModalities": ["AUDIO"],
            "speechConfig": {
                "voiceConfig": {
                    "prebuiltVoiceConfig": { "voiceName": setup.voice }
                }
            },
            "thinkingConfig": { "thinkingBudget": 0 }
        },
        "systemInstruction": {
            "parts": [{ "text": setup.system_instruction }]
        }
    });
    if setup.input_transcription {
        body["inputAudioTranscription"] = json!({});
    }
    if setup.output_transcription {
        body["outputAudioTranscription"] = json!({});
    }
    json!({ "setup": body })
}

/// Build a `realtimeInput` frame carrying one audio chunk.
pub fn audio_message(chunk: &MediaChunk) -> serde_json::Value {
    json!({
        "realtimeInput": {
            "mediaChunks": [{
                "mimeType": chunk.mime_type,
                "data": chunk.data,
            }]
        }
    })
}

/// Parse one server frame into events, in the order they must be applied:
/// audio, interruption, input transcription, output transcription, turn end.
pub fn parse_server_message(text: &str) -> anyhow::Result<Vec<LiveServerEvent>> {
    let json: serde_json::Value = serde_json::from_str(text)?;
    let mut events = Vec::new();

    if let Some(server_content) = json.get("serverContent") {
        if let Some(parts) = server_content
            .get("modelTurn")
            .and_then(|t| t.get("parts"))
            .and_then(|p| p.as_array())
        {
            for part in parts {
                if let Some(data) = part
                    .get("inlineData")
                    .and_then(|d| d.get("data"))
                    .and_then(|d| d.as_str())
                {
                    events.push(LiveServerEvent::Audio(data.to_string()));
                }
            }
        }

        if flag(server_content, "interrupted") {
            events.push(LiveServerEvent::Interrupted);
        }

        if let Some(text) = transcription_text(server_content, "inputTranscription") {
            events.push(LiveServerEvent::InputTranscription(text));
        }
        if let Some(text) = transcription_text(server_content, "outputTranscription") {
            events.push(LiveServerEvent::OutputTranscription(text));
        }

        if flag(server_content, "turnComplete") {
            events.push(LiveServerEvent::TurnComplete);
        }
    }

    if let Some(go_away) = json.get("goAway") {
        let time_left = go_away
            .get("timeLeft")
            .and_then(|t| t.as_str())
            .map(str::to_string);
        events.push(LiveServerEvent::GoAway(time_left));
    }

    Ok(events)
}

fn flag(content: &serde_json::Value, key: &str) -> bool {
    content.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
}

fn transcription_text(content: &serde_json::Value, key: &str) -> Option<String> {
    content
        .get(key)
        .and_then(|t| t.get("text"))
        .and_then(|t| t.as_str())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}

/// Text payload of a frame; the Live API sends JSON in binary frames too.
fn frame_text(message: &Message) -> Option<&str> {
    match message {
        Message::Text(text) => Some(text.as_str()),
        Message::Binary(data) => std::str::from_utf8(data).ok(),
        _ => None,
    }
}

async fn await_setup_complete(read: &mut SplitStream<WsStream>) -> anyhow::Result<()> {
    while let Some(message) = read.next().await {
        let message = message?;
        if let Message::Close(frame) = &message {
            let reason = frame
                .as_ref()
                .map(|f| f.reason.to_string())
                .unwrap_or_default();
            anyhow::bail!("Live session closed during setup: {reason}");
        }
        if let Some(text) = frame_text(&message) {
            if text.contains("setupComplete") {
                return Ok(());
            }
            trace!(text, "Ignoring frame before setupComplete");
        }
    }
    anyhow::bail!("Live session ended before setupComplete")
}

struct GeminiLiveSink {
    write: Mutex<SplitSink<WsStream, Message>>,
}

#[async_trait]
impl LiveSink for GeminiLiveSink {
    async fn send_audio(&self, chunk: MediaChunk) -> Result<()> {
        let frame = audio_message(&chunk).to_string();
        self.write
            .lock()
            .await
            .send(Message::text(frame))
            .await
            .map_err(TutorError::remote)
    }

    async fn close(&self) -> Result<()> {
        debug!("Closing live session");
        self.write
            .lock()
            .await
            .send(Message::Close(None))
            .await
            .map_err(TutorError::remote)
    }
}

#[async_trait]
impl LiveProvider for GeminiLiveProvider {
    async fn connect(&self, setup: &LiveSetup) -> Result<LiveConnection> {
        info!(model = %setup.model, voice = %setup.voice, "Opening live session");

        let (socket, _response) = tokio_tungstenite::connect_async(self.url())
            .await
            .map_err(TutorError::remote)?;
        let (mut write, mut read) = socket.split();

        write
            .send(Message::text(setup_message(setup).to_string()))
            .await
            .map_err(TutorError::remote)?;

        tokio::time::timeout(SETUP_TIMEOUT, await_setup_complete(&mut read))
            .await
            .map_err(|_| TutorError::RemoteCall("Timed out waiting for setupComplete".into()))?
            .map_err(TutorError::remote)?;

        debug!("Live session setup complete");

        let events = read.flat_map(|message| {
            let events: Vec<Result<LiveServerEvent>> = match message {
                Ok(Message::Close(frame)) => {
                    let reason = frame.map(|f| f.reason.to_string()).filter(|r| !r.is_empty());
                    vec![Ok(LiveServerEvent::Closed(reason))]
                }
                Ok(message) => match frame_text(&message) {
                    Some(text) => match parse_server_message(text) {
                        Ok(events) => events.into_iter().map(Ok).collect(),
                        Err(e) => {
                            warn!(%e, "Unparseable live frame");
                            Vec::new()
                        }
                    },
                    None => Vec::new(),
                },
                Err(e) => vec![Err(TutorError::remote(e))],
            };
            futures::stream::iter(events)
        });

        Ok(LiveConnection {
            sink: std::sync::Arc::new(GeminiLiveSink {
                write: Mutex::new(write),
            }),
            events: Box::pin(events),
        })
    }
}
