use serde::{Deserialize, Serialize};

/// Who produced a transcript entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    /// The tutor. Gemini calls this role `model`, so the transcript does too.
    Model,
    /// An inline failure notice; never sent back to the backend.
    Error,
}

/// One transcript entry. Insertion order is chronological.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub text: String,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            text: text.into(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            role: Role::Error,
            text: text.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.role == Role::Error
    }
}

/// A prior turn as sent to the chat backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    /// `"user"` or `"model"`.
    pub role: String,
    pub text: String,
}

/// Convert a transcript into backend turns, dropping error entries.
pub fn history_turns(messages: &[Message]) -> Vec<ChatTurn> {
    messages
        .iter()
        .filter_map(|m| {
            let role = match m.role {
                Role::User => "user",
                Role::Model => "model",
                Role::Error => return None,
            };
            Some(ChatTurn {
                role: role.into(),
                text: m.text.clone(),
            })
        })
        .collect()
}
