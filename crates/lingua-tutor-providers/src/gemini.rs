//! Google Generative AI (Gemini) REST client.
//!
//! Streaming chat uses `streamGenerateContent` with SSE; the welcome-back
//! greeting and speech synthesis use plain `generateContent`.
//! Auth is via API key in query parameter.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::StreamExt;
use tracing::{debug, trace};

use lingua_tutor_core::error::{Result, TutorError};
use lingua_tutor_core::types::ChatTurn;

use crate::sse::sse_data_stream;
use crate::{ChatProvider, ChatRequest, SpeechProvider, SpeechRequest, TextStream};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";

pub struct GeminiProvider {
    pub base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl GeminiProvider {
    pub fn new(api_key: impl Into<String>, base_url: Option<&str>) -> Self {
        Self {
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            api_key: api_key.into(),
            client: reqwest::Client::new(),
        }
    }

    fn endpoint(&self, model: &str, method: &str) -> String {
        format!(
            "{}/v1beta/models/{}:{}",
            self.base_url, model, method
        )
    }

    async fn generate_content(
        &self,
        model: &str,
        body: &GeminiRequest,
    ) -> anyhow::Result<GenerateContentResponse> {
        let response = self
            .client
            .post(self.endpoint(model, "generateContent"))
            .query(&[("key", self.api_key.as_str())])
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Gemini API error {status}: {body}");
        }

        Ok(response.json().await?)
    }
}

// --- Gemini request/response types ---

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GeminiRequest {
    contents: Vec<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiPart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thought: Option<bool>,
    #[serde(default)]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    #[serde(default)]
    #[allow(dead_code)]
    mime_type: Option<String>,
    data: String,
}

impl GenerateContentResponse {
    /// Visible text of the first candidate; thought summaries are skipped.
    fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|content| {
                content
                    .parts
                    .iter()
                    .filter(|p| p.thought != Some(true))
                    .filter_map(|p| p.text.as_deref())
                    .collect::<String>()
            })
            .unwrap_or_default()
    }

    /// Base64 audio of the first candidate's first part.
    fn first_audio(&self) -> Option<String> {
        self.candidates
            .first()?
            .content
            .as_ref()?
            .parts
            .first()?
            .inline_data
            .as_ref()
            .map(|d| d.data.clone())
            .filter(|d| !d.is_empty())
    }
}

fn turn_contents(history: &[ChatTurn], message: &str) -> Vec<serde_json::Value> {
    history
        .iter()
        .map(|turn| json!({ "role": turn.role, "parts": [{ "text": turn.text }] }))
        .chain(std::iter::once(
            json!({ "role": "user", "parts": [{ "text": message }] }),
        ))
        .collect()
}

pub(crate) fn chat_body(request: &ChatRequest) -> GeminiRequest {
    GeminiRequest {
        contents: turn_contents(&request.history, &request.message),
        system_instruction: request
            .system
            .as_ref()
            .map(|s| json!({ "parts": [{ "text": s }] })),
        generation_config: request
            .thinking_budget
            .map(|budget| json!({ "thinkingConfig": { "thinkingBudget": budget } })),
    }
}

pub(crate) fn speech_body(request: &SpeechRequest) -> GeminiRequest {
    GeminiRequest {
        contents: vec![json!({ "parts": [{ "text": request.text }] })],
        system_instruction: None,
        generation_config: Some(json!({
            "responseModalities": ["AUDIO"],
            "speechConfig": {
                "voiceConfig": {
                    "prebuiltVoiceConfig": { "voiceName": request.voice }
                }
            }
        })),
    }
}

#[async_trait]
impl ChatProvider for GeminiProvider {
    fn id(&self) -> &str {
        "google"
    }

    async fn stream_chat(&self, request: &ChatRequest) -> Result<TextStream> {
        let body = chat_body(request);

        debug!(
            model = %request.model,
            turns = request.history.len(),
            thinking_budget = ?request.thinking_budget,
            "Streaming Gemini chat"
        );

        let response = self
            .client
            .post(self.endpoint(&request.model, "streamGenerateContent"))
            .query(&[("alt", "sse"), ("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(TutorError::remote)?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(TutorError::RemoteCall(format!(
                "Gemini API error {status}: {body}"
            )));
        }

        let fragments = sse_data_stream(response).filter_map(|event| match event {
            Ok(data) => {
                let chunk: GenerateContentResponse = match serde_json::from_str(data.trim()) {
                    Ok(c) => c,
                    Err(e) => {
                        trace!(%e, "Failed to parse Gemini chunk");
                        return None;
                    }
                };
                if let Some(reason) = chunk
                    .candidates
                    .first()
                    .and_then(|c| c.finish_reason.as_deref())
                {
                    if reason != "STOP" {
                        trace!(reason, "Gemini finish reason");
                    }
                }
                let text = chunk.text();
                if text.is_empty() { None } else { Some(Ok(text)) }
            }
            Err(e) => Some(Err(TutorError::remote(e))),
        });

        Ok(Box::pin(fragments))
    }

    async fn generate_text(&self, model: &str, prompt: &str) -> Result<String> {
        let body = GeminiRequest {
            contents: vec![json!({ "role": "user", "parts": [{ "text": prompt }] })],
            system_instruction: None,
            generation_config: None,
        };

        debug!(model, prompt_len = prompt.len(), "Gemini generateContent");

        let response = self
            .generate_content(model, &body)
            .await
            .map_err(TutorError::remote)?;
        Ok(response.text())
    }
}

#[async_trait]
impl SpeechProvider for GeminiProvider {
    async fn synthesize(&self, request: &SpeechRequest) -> Result<Option<String>> {
        debug!(
            model = %request.model,
            voice = %request.voice,
            text_len = request.text.len(),
            "Gemini speech synthesis"
        );

        let response = self
            .generate_content(&request.model, &speech_body(request))
            .await
            .map_err(TutorError::remote)?;
        Ok(response.first_audio())
    }
}
