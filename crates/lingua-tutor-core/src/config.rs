//! Configuration loading and validation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const DEFAULT_FAST_MODEL: &str = "gemini-2.5-flash";
pub const DEFAULT_DEEP_MODEL: &str = "gemini-2.5-pro";
pub const DEFAULT_DEEP_THINKING_BUDGET: u32 = 32_768;
pub const DEFAULT_TTS_MODEL: &str = "gemini-2.5-flash-preview-tts";
pub const DEFAULT_TTS_VOICE: &str = "Kore";
pub const DEFAULT_TTS_MAX_CHARS: usize = 4000;
pub const DEFAULT_LIVE_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";
pub const DEFAULT_LIVE_VOICE: &str = "Zephyr";
pub const INPUT_SAMPLE_RATE: u32 = 16_000;
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;
pub const DEFAULT_FRAME_SIZE: usize = 4096;

/// Top-level Lingua Tutor configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat: Option<ChatConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts: Option<TtsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub live: Option<LiveConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// Gemini endpoint and credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl ProviderConfig {
    /// Resolve the API key: check `api_key` field first, then `api_key_env` environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

/// Text chat model tiers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fast_model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub deep_model: Option<String>,

    /// Thinking budget for the deep tier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deep_thinking_budget: Option<u32>,

    /// Model for the non-streamed welcome-back greeting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub welcome_model: Option<String>,

    /// Replaces the built-in tutor persona.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

/// Text-to-speech configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TtsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Prebuilt voice name (default: "Kore").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    /// Hard cap on sanitized characters per request (default: 4000).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_chars: Option<usize>,
}

/// Live voice session configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LiveConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_sample_rate: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_sample_rate: Option<u32>,

    /// Microphone samples per outbound chunk.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_size: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for transcript snapshots (default: `~/.lingua_tutor/history`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "lingua_tutor_media=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("static regex");
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&raw);

        let config: Config = json5::from_str(&substituted)
            .map_err(|e| crate::error::TutorError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Default config file path.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    /// API key from config, falling back to `GEMINI_API_KEY` then `GOOGLE_AI_API_KEY`.
    pub fn api_key(&self) -> Option<String> {
        self.provider
            .as_ref()
            .and_then(|p| p.resolve_api_key())
            .or_else(|| {
                ["GEMINI_API_KEY", "GOOGLE_AI_API_KEY"]
                    .iter()
                    .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
            })
    }

    pub fn base_url(&self) -> Option<&str> {
        self.provider.as_ref().and_then(|p| p.base_url.as_deref())
    }

    pub fn fast_model(&self) -> String {
        self.chat
            .as_ref()
            .and_then(|c| c.fast_model.clone())
            .unwrap_or_else(|| DEFAULT_FAST_MODEL.to_string())
    }

    pub fn deep_model(&self) -> String {
        self.chat
            .as_ref()
            .and_then(|c| c.deep_model.clone())
            .unwrap_or_else(|| DEFAULT_DEEP_MODEL.to_string())
    }

    pub fn deep_thinking_budget(&self) -> u32 {
        self.chat
            .as_ref()
            .and_then(|c| c.deep_thinking_budget)
            .unwrap_or(DEFAULT_DEEP_THINKING_BUDGET)
    }

    pub fn welcome_model(&self) -> String {
        self.chat
            .as_ref()
            .and_then(|c| c.welcome_model.clone())
            .unwrap_or_else(|| DEFAULT_FAST_MODEL.to_string())
    }

    pub fn chat_system_prompt(&self) -> Option<&str> {
        self.chat.as_ref().and_then(|c| c.system_prompt.as_deref())
    }

    pub fn tts_model(&self) -> String {
        self.tts
            .as_ref()
            .and_then(|t| t.model.clone())
            .unwrap_or_else(|| DEFAULT_TTS_MODEL.to_string())
    }

    pub fn tts_voice(&self) -> String {
        self.tts
            .as_ref()
            .and_then(|t| t.voice.clone())
            .unwrap_or_else(|| DEFAULT_TTS_VOICE.to_string())
    }

    pub fn tts_max_chars(&self) -> usize {
        self.tts
            .as_ref()
            .and_then(|t| t.max_chars)
            .unwrap_or(DEFAULT_TTS_MAX_CHARS)
    }

    pub fn live_model(&self) -> String {
        self.live
            .as_ref()
            .and_then(|l| l.model.clone())
            .unwrap_or_else(|| DEFAULT_LIVE_MODEL.to_string())
    }

    pub fn live_voice(&self) -> String {
        self.live
            .as_ref()
            .and_then(|l| l.voice.clone())
            .unwrap_or_else(|| DEFAULT_LIVE_VOICE.to_string())
    }

    pub fn live_system_prompt(&self) -> Option<&str> {
        self.live.as_ref().and_then(|l| l.system_prompt.as_deref())
    }

    pub fn input_sample_rate(&self) -> u32 {
        self.live
            .as_ref()
            .and_then(|l| l.input_sample_rate)
            .unwrap_or(INPUT_SAMPLE_RATE)
    }

    pub fn output_sample_rate(&self) -> u32 {
        self.live
            .as_ref()
            .and_then(|l| l.output_sample_rate)
            .unwrap_or(OUTPUT_SAMPLE_RATE)
    }

    pub fn frame_size(&self) -> usize {
        self.live
            .as_ref()
            .and_then(|l| l.frame_size)
            .unwrap_or(DEFAULT_FRAME_SIZE)
    }

    /// Transcript snapshot directory.
    pub fn storage_dir(&self) -> PathBuf {
        self.storage
            .as_ref()
            .and_then(|s| s.dir.as_ref())
            .map(|d| {
                let expanded = shellexpand::tilde(d);
                PathBuf::from(expanded.as_ref())
            })
            .unwrap_or_else(|| data_dir().join("history"))
    }

    /// Get a config value by dotted path (e.g. "tts.voice", "chat.deep_model").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if self.api_key().is_none() {
            warnings.push(
                "No Gemini API key configured (provider.api_key, provider.api_key_env, or GEMINI_API_KEY)"
                    .to_string(),
            );
        }

        if let Some(live) = &self.live {
            if live.input_sample_rate == Some(0) {
                errors.push("live.input_sample_rate cannot be 0".to_string());
            }
            if live.output_sample_rate == Some(0) {
                errors.push("live.output_sample_rate cannot be 0".to_string());
            }
            if live.frame_size == Some(0) {
                errors.push("live.frame_size cannot be 0".to_string());
            }
        }

        if self.tts.as_ref().and_then(|t| t.max_chars) == Some(0) {
            errors.push("tts.max_chars cannot be 0".to_string());
        }

        if let Some(logging) = &self.logging {
            if logging.format != "plain" && logging.format != "json" {
                warnings.push(format!(
                    "Unknown logging.format '{}', falling back to plain",
                    logging.format
                ));
            }
        }

        (warnings, errors)
    }
}

/// Base directory for Lingua Tutor data: `~/.lingua_tutor/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".lingua_tutor")
}
