//! Key-value transcript storage: one JSON snapshot of the whole transcript per key.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Result, TutorError};
use crate::types::Message;

/// The single key the lesson transcript lives under.
pub const CHAT_HISTORY_KEY: &str = "chatHistory";

/// Save/load facility for whole-transcript snapshots.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Load the snapshot stored under `key`. Missing keys load as empty.
    async fn load(&self, key: &str) -> Result<Vec<Message>>;

    /// Overwrite the snapshot under `key`.
    async fn save(&self, key: &str, messages: &[Message]) -> Result<()>;

    /// Remove the snapshot under `key`.
    async fn clear(&self, key: &str) -> Result<()>;
}

/// File-based store: `<base>/<key>.json` holding a JSON array of messages.
pub struct JsonHistoryStore {
    base: PathBuf,
}

impl JsonHistoryStore {
    pub fn new(base: PathBuf) -> Self {
        Self { base }
    }

    /// Default store location: `~/.lingua_tutor/history/`
    pub fn default_path() -> PathBuf {
        crate::config::data_dir().join("history")
    }

    fn key_path(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty()
            || !key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(TutorError::Storage(format!("invalid history key: {key:?}")));
        }
        Ok(self.base.join(format!("{key}.json")))
    }
}

#[async_trait]
impl HistoryStore for JsonHistoryStore {
    async fn load(&self, key: &str) -> Result<Vec<Message>> {
        let path = self.key_path(key)?;
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = tokio::fs::read_to_string(&path).await?;
        if data.trim().is_empty() {
            return Ok(Vec::new());
        }
        let messages: Vec<Message> = serde_json::from_str(&data)
            .map_err(|e| TutorError::Storage(format!("corrupt history snapshot: {e}")))?;
        debug!(key, entries = messages.len(), "Loaded transcript");
        Ok(messages)
    }

    async fn save(&self, key: &str, messages: &[Message]) -> Result<()> {
        let path = self.key_path(key)?;
        tokio::fs::create_dir_all(&self.base).await?;
        let data = serde_json::to_string(messages)?;
        // Atomic write: write to temp then rename
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data.as_bytes()).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(key, entries = messages.len(), "Saved transcript");
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<()> {
        let path = self.key_path(key)?;
        if path.exists() {
            tokio::fs::remove_file(&path).await?;
        }
        debug!(key, "Cleared transcript");
        Ok(())
    }
}

/// In-process store for tests and `--ephemeral` runs.
#[derive(Default)]
pub struct MemoryHistoryStore {
    entries: Mutex<HashMap<String, Vec<Message>>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn load(&self, key: &str) -> Result<Vec<Message>> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .unwrap_or_default())
    }

    async fn save(&self, key: &str, messages: &[Message]) -> Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), messages.to_vec());
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transcript() -> Vec<Message> {
        vec![
            Message::model("Hallo! Wie geht es Ihnen?"),
            Message::user("Mir geht es gut."),
        ]
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonHistoryStore::new(dir.path().to_path_buf());

        store.save(CHAT_HISTORY_KEY, &transcript()).await.unwrap();
        let loaded = store.load(CHAT_HISTORY_KEY).await.unwrap();
        assert_eq!(loaded, transcript());
        assert!(dir.path().join("chatHistory.json").exists());
    }

    #[tokio::test]
    async fn test_missing_key_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonHistoryStore::new(dir.path().join("nested"));
        assert!(store.load(CHAT_HISTORY_KEY).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_overwrites_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonHistoryStore::new(dir.path().to_path_buf());

        store.save(CHAT_HISTORY_KEY, &transcript()).await.unwrap();
        store
            .save(CHAT_HISTORY_KEY, &[Message::model("Neu")])
            .await
            .unwrap();
        let loaded = store.load(CHAT_HISTORY_KEY).await.unwrap();
        assert_eq!(loaded, vec![Message::model("Neu")]);
    }

    #[tokio::test]
    async fn test_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonHistoryStore::new(dir.path().to_path_buf());

        store.save(CHAT_HISTORY_KEY, &transcript()).await.unwrap();
        store.clear(CHAT_HISTORY_KEY).await.unwrap();
        assert!(store.load(CHAT_HISTORY_KEY).await.unwrap().is_empty());
        // Clearing twice is fine
        store.clear(CHAT_HISTORY_KEY).await.unwrap();
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("chatHistory.json"), "{not json").unwrap();
        let store = JsonHistoryStore::new(dir.path().to_path_buf());
        let err = store.load(CHAT_HISTORY_KEY).await.unwrap_err();
        assert!(matches!(err, TutorError::Storage(_)));
    }

    #[tokio::test]
    async fn test_rejects_path_like_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonHistoryStore::new(dir.path().to_path_buf());
        assert!(store.load("../etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryHistoryStore::new();
        store.save(CHAT_HISTORY_KEY, &transcript()).await.unwrap();
        assert_eq!(store.load(CHAT_HISTORY_KEY).await.unwrap().len(), 2);
        store.clear(CHAT_HISTORY_KEY).await.unwrap();
        assert!(store.load(CHAT_HISTORY_KEY).await.unwrap().is_empty());
    }
}
