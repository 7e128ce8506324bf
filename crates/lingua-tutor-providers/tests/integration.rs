//! Provider integration tests against the real Gemini API.
//!
//! These tests are skipped when `GEMINI_API_KEY` is not set.
//! Run with: `cargo test -p lingua-tutor-providers --test integration`

use lingua_tutor_providers::{
    ChatProvider, ChatRequest, GeminiProvider, SpeechProvider, SpeechRequest,
};
use tokio_stream::StreamExt;

fn gemini_key() -> Option<String> {
    std::env::var("GEMINI_API_KEY")
        .ok()
        .filter(|k| !k.is_empty())
}

#[tokio::test]
async fn test_gemini_streaming_chat() {
    let Some(api_key) = gemini_key() else {
        eprintln!("Skipping: GEMINI_API_KEY not set");
        return;
    };

    let provider = GeminiProvider::new(api_key, None);
    let request = ChatRequest {
        model: "gemini-2.5-flash".into(),
        system: Some("You are a helpful assistant. Follow instructions exactly.".into()),
        history: vec![],
        message: "Reply with exactly the word 'hallo'.".into(),
        thinking_budget: None,
    };

    let mut stream = provider
        .stream_chat(&request)
        .await
        .expect("Stream creation failed");
    let mut text = String::new();
    while let Some(fragment) = stream.next().await {
        text.push_str(&fragment.expect("Stream fragment error"));
    }

    assert!(
        text.to_lowercase().contains("hallo"),
        "Expected 'hallo' in response, got: {text}"
    );
}

#[tokio::test]
async fn test_gemini_speech_synthesis() {
    let Some(api_key) = gemini_key() else {
        eprintln!("Skipping: GEMINI_API_KEY not set");
        return;
    };

    let provider = GeminiProvider::new(api_key, None);
    let audio = provider
        .synthesize(&SpeechRequest {
            model: "gemini-2.5-flash-preview-tts".into(),
            voice: "Kore".into(),
            text: "Guten Morgen!".into(),
        })
        .await
        .expect("Synthesis failed");

    let audio = audio.expect("No audio returned");
    assert!(!audio.is_empty());
}
