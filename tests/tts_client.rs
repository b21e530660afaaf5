mod common;

use serde_json::json;

use common::{audio_response, empty_response, silence, MockGemini};
use voice_relay::error::SynthesisError;
use voice_relay::tts::{GeminiTts, SpeechSynthesizer};

#[tokio::test]
async fn sends_voice_model_and_key() {
    let gemini = MockGemini::start(vec![(200, audio_response(&silence(240)))]).await;
    let tts = GeminiTts::new(gemini.config()).unwrap();

    let audio = tts.synthesize("  good morning  ").await.unwrap();
    assert_eq!(audio.pcm.len(), 480);
    assert_eq!(audio.sample_rate, 24_000);

    let requests = gemini.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(
        request.path,
        "/v1beta/models/gemini-2.5-flash-preview-tts:generateContent"
    );
    assert_eq!(request.api_key.as_deref(), Some("test-key"));
    assert_eq!(request.prompt(), "good morning");
    assert_eq!(
        request.body.pointer("/generationConfig/responseModalities/0"),
        Some(&json!("AUDIO"))
    );
    assert_eq!(
        request
            .body
            .pointer("/generationConfig/speechConfig/voiceConfig/prebuiltVoiceConfig/voiceName"),
        Some(&json!("Kore"))
    );
}

#[tokio::test]
async fn empty_answer_is_retried_with_audio_only_instruction() {
    let gemini = MockGemini::start(vec![
        (200, empty_response()),
        (200, audio_response(&silence(240))),
    ])
    .await;
    let config = gemini.config();
    let prefix = config.audio_only_prompt.clone();
    let tts = GeminiTts::new(config).unwrap();

    let audio = tts.synthesize("read me").await.unwrap();
    assert_eq!(audio.pcm.len(), 480);

    let requests = gemini.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].prompt(), "read me");
    assert_eq!(requests[1].prompt(), format!("{prefix}read me"));
}

#[tokio::test]
async fn exhausted_attempts_surface_last_error() {
    let gemini = MockGemini::start(vec![(200, empty_response())]).await;
    let tts = GeminiTts::new(gemini.config()).unwrap();

    let err = tts.synthesize("hello").await.unwrap_err();
    match err {
        SynthesisError::MissingAudio { finish_reason } => {
            assert_eq!(finish_reason.as_deref(), Some("OTHER"));
        }
        other => panic!("expected MissingAudio, got {other}"),
    }
    assert_eq!(gemini.requests().len(), 2);
}

#[tokio::test]
async fn http_error_carries_service_message() {
    let body = json!({ "error": { "code": 400, "message": "API key not valid." } });
    let gemini = MockGemini::start(vec![(400, body)]).await;
    let tts = GeminiTts::new(gemini.config()).unwrap();

    let err = tts.synthesize("hello").await.unwrap_err();
    match &err {
        SynthesisError::Http { status, message } => {
            assert_eq!(*status, 400);
            assert_eq!(message, "API key not valid.");
        }
        other => panic!("expected Http, got {other}"),
    }
    assert_eq!(err.to_string(), "API key not valid.");
}

#[tokio::test]
async fn http_error_without_message_uses_status() {
    let gemini = MockGemini::start(vec![(503, json!({}))]).await;
    let tts = GeminiTts::new(gemini.config()).unwrap();

    let err = tts.synthesize("hello").await.unwrap_err();
    assert!(matches!(err, SynthesisError::Http { status: 503, .. }));
    assert!(err.to_string().contains("503"));
}

#[tokio::test]
async fn snake_case_payload_is_accepted() {
    let response = json!({
        "candidates": [{
            "content": { "parts": [
                { "inline_data": {
                    "mime_type": "audio/L16;codec=pcm;rate=16000",
                    "data": "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA",
                } }
            ] }
        }]
    });
    let gemini = MockGemini::start(vec![(200, response)]).await;
    let tts = GeminiTts::new(gemini.config()).unwrap();

    let audio = tts.synthesize("hello").await.unwrap();
    assert_eq!(audio.pcm.len(), 24);
    assert_eq!(audio.sample_rate, 16_000);
}

#[tokio::test]
async fn empty_text_makes_no_request() {
    let gemini = MockGemini::start(vec![(200, audio_response(&silence(240)))]).await;
    let tts = GeminiTts::new(gemini.config()).unwrap();

    let err = tts.synthesize(" \t ").await.unwrap_err();
    assert!(matches!(err, SynthesisError::EmptyText));
    assert!(gemini.requests().is_empty());
}
