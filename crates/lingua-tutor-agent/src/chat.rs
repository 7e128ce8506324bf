//! Text chat with the tutor: streamed replies and the welcome-back greeting.

use std::sync::Arc;

use tracing::{debug, info};

use lingua_tutor_core::config::Config;
use lingua_tutor_core::error::{Result, TutorError};
use lingua_tutor_core::types::{Message, history_turns};
use lingua_tutor_providers::{ChatProvider, ChatRequest, TextStream};

use crate::prompt::{chat_system_prompt, welcome_back_prompt};

/// Model tier settings for the chat service.
#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub fast_model: String,
    pub deep_model: String,
    pub deep_thinking_budget: u32,
    pub welcome_model: String,
    pub system_prompt: String,
}

impl ChatSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            fast_model: config.fast_model(),
            deep_model: config.deep_model(),
            deep_thinking_budget: config.deep_thinking_budget(),
            welcome_model: config.welcome_model(),
            system_prompt: chat_system_prompt(config),
        }
    }
}

pub struct ChatService {
    provider: Arc<dyn ChatProvider>,
    settings: ChatSettings,
}

impl ChatService {
    pub fn new(provider: Arc<dyn ChatProvider>, settings: ChatSettings) -> Self {
        Self { provider, settings }
    }

    pub fn settings(&self) -> &ChatSettings {
        &self.settings
    }

    /// Build the request for one turn. Error entries never reach the backend.
    pub fn request(&self, history: &[Message], message: &str, deep_mode: bool) -> ChatRequest {
        let (model, thinking_budget) = if deep_mode {
            (
                self.settings.deep_model.clone(),
                Some(self.settings.deep_thinking_budget),
            )
        } else {
            (self.settings.fast_model.clone(), None)
        };
        ChatRequest {
            model,
            system: Some(self.settings.system_prompt.clone()),
            history: history_turns(history),
            message: message.to_string(),
            thinking_budget,
        }
    }

    /// Start a streamed reply to `message` given the prior transcript.
    pub async fn send_message_stream(
        &self,
        history: &[Message],
        message: &str,
        deep_mode: bool,
    ) -> Result<TextStream> {
        let request = self.request(history, message, deep_mode);
        info!(
            provider = self.provider.id(),
            model = %request.model,
            deep_mode,
            turns = request.history.len(),
            "Sending chat message"
        );
        self.provider.stream_chat(&request).await
    }

    /// A short greeting that recalls the last topic and asks a warm-up question.
    pub async fn generate_welcome_back_message(&self, history: &[Message]) -> Result<String> {
        let prompt = welcome_back_prompt(&history_turns(history));
        debug!(model = %self.settings.welcome_model, "Generating welcome-back message");
        let text = self
            .provider
            .generate_text(&self.settings.welcome_model, &prompt)
            .await?;
        let text = text.trim();
        if text.is_empty() {
            return Err(TutorError::RemoteCall(
                "empty welcome-back message".into(),
            ));
        }
        Ok(text.to_string())
    }
}
