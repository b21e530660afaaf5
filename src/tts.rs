//! Gemini text-to-speech client.
//!
//! Sends one `generateContent` request per attempt asking for an
//! audio-only response, then digs the base64 inline audio out of the
//! response. The service occasionally answers with conversational text
//! (or no parts at all, finish reason `OTHER`), so a failed first attempt
//! is retried with the text wrapped in an explicit "speak this" instruction.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::config::TtsConfig;
use crate::error::SynthesisError;
use crate::transcode::SOURCE_SAMPLE_RATE;

/// Payloads that decode to this many bytes or fewer are not audio.
const MIN_AUDIO_BYTES: usize = 16;

const DEFAULT_MIME: &str = "audio/L16";

/// Raw PCM returned by the synthesizer: signed 16-bit little-endian, mono.
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    pub pcm: Vec<u8>,
    pub sample_rate: u32,
    pub mime_type: String,
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio, SynthesisError>;
}

/// Inline audio located inside one response part, still base64-encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InlineAudio<'a> {
    pub data: &'a str,
    pub mime_type: Option<&'a str>,
}

pub type Extractor = for<'a> fn(&'a Value) -> Option<InlineAudio<'a>>;

/// Extraction strategies tried in order against every part.
pub const EXTRACTORS: &[(&str, Extractor)] = &[
    ("inlineData", inline_data_camel),
    ("inline_data", inline_data_snake),
];

pub fn inline_data_camel(part: &Value) -> Option<InlineAudio<'_>> {
    let inline = part.get("inlineData")?;
    Some(InlineAudio {
        data: inline.get("data")?.as_str()?,
        mime_type: inline.get("mimeType").and_then(Value::as_str),
    })
}

pub fn inline_data_snake(part: &Value) -> Option<InlineAudio<'_>> {
    let inline = part.get("inline_data")?;
    Some(InlineAudio {
        data: inline.get("data")?.as_str()?,
        mime_type: inline.get("mime_type").and_then(Value::as_str),
    })
}

/// Trim and cap the text at `max_chars` characters.
pub fn bounded_text(text: &str, max_chars: usize) -> Result<String, SynthesisError> {
    let bounded: String = text.trim().chars().take(max_chars).collect();
    let bounded = bounded.trim_end().to_string();
    if bounded.is_empty() {
        return Err(SynthesisError::EmptyText);
    }
    Ok(bounded)
}

/// Read the `rate=` parameter of an `audio/L16;codec=pcm;rate=24000` mime type.
pub fn sample_rate_from_mime(mime: &str) -> Option<u32> {
    mime.split(';')
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.trim().parse().ok())
}

/// Pull the first usable audio payload out of a `generateContent` response.
pub fn extract_audio(response: &Value) -> Result<SynthesizedAudio, SynthesisError> {
    let candidate = response.get("candidates").and_then(|c| c.get(0));
    let parts = candidate
        .and_then(|c| c.pointer("/content/parts"))
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);

    for (index, part) in parts.iter().enumerate() {
        for &(strategy, extract) in EXTRACTORS {
            let Some(inline) = extract(part) else {
                continue;
            };
            match BASE64.decode(inline.data) {
                Ok(pcm) if pcm.len() > MIN_AUDIO_BYTES => {
                    let mime_type = inline.mime_type.unwrap_or(DEFAULT_MIME).to_string();
                    let sample_rate = sample_rate_from_mime(&mime_type).unwrap_or(SOURCE_SAMPLE_RATE);
                    debug!(part = index, strategy, bytes = pcm.len(), %mime_type, "found inline audio");
                    return Ok(SynthesizedAudio {
                        pcm,
                        sample_rate,
                        mime_type,
                    });
                }
                Ok(pcm) => debug!(part = index, strategy, bytes = pcm.len(), "inline audio too short"),
                Err(e) => debug!(part = index, strategy, "inline audio is not base64: {e}"),
            }
        }
    }

    let finish_reason = candidate
        .and_then(|c| c.get("finishReason").or_else(|| c.get("finish_reason")))
        .and_then(Value::as_str)
        .map(String::from);
    let candidates = response
        .get("candidates")
        .and_then(Value::as_array)
        .map_or(0, Vec::len);

    warn!(
        candidates,
        part_count = parts.len(),
        finish_reason = finish_reason.as_deref().unwrap_or("none"),
        has_content = candidate.and_then(|c| c.get("content")).is_some(),
        "TTS response has no audio payload"
    );

    Err(SynthesisError::MissingAudio { finish_reason })
}

/// Gemini `generateContent` speech client.
pub struct GeminiTts {
    config: TtsConfig,
    client: Client,
}

impl GeminiTts {
    pub fn new(config: TtsConfig) -> Result<Self, SynthesisError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self { config, client })
    }

    fn url(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.config.endpoint.trim_end_matches('/'),
            self.config.model
        )
    }

    /// The prompt sent on a given (1-based) attempt.
    fn prompt_for(&self, text: &str, attempt: u32) -> String {
        if attempt <= 1 {
            text.to_string()
        } else {
            format!("{}{text}", self.config.audio_only_prompt)
        }
    }

    async fn request_once(&self, text: &str) -> Result<SynthesizedAudio, SynthesisError> {
        let body = json!({
            "contents": [{ "parts": [{ "text": text }] }],
            "generationConfig": {
                "responseModalities": ["AUDIO"],
                "speechConfig": {
                    "voiceConfig": {
                        "prebuiltVoiceConfig": { "voiceName": self.config.voice }
                    }
                }
            }
        });

        let resp = self
            .client
            .post(self.url())
            .header("x-goog-api-key", &self.config.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        let data = resp.json::<Value>().await.ok();

        if !status.is_success() {
            let message = data
                .as_ref()
                .and_then(|d| d.pointer("/error/message"))
                .and_then(Value::as_str)
                .map(String::from)
                .unwrap_or_else(|| format!("Gemini TTS HTTP {}", status.as_u16()));
            return Err(SynthesisError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let data = data.ok_or_else(|| SynthesisError::Decode("response body is not JSON".into()))?;
        extract_audio(&data)
    }
}

#[async_trait]
impl SpeechSynthesizer for GeminiTts {
    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio, SynthesisError> {
        let text = bounded_text(text, self.config.max_chars)?;
        let attempts = self.config.attempts.max(1);
        let delay = Duration::from_millis(self.config.retry_delay_ms);

        let mut last_err = None;
        for attempt in 1..=attempts {
            let prompt = self.prompt_for(&text, attempt);
            info!(attempt, len = prompt.chars().count(), "TTS request");

            match self.request_once(&prompt).await {
                Ok(audio) => return Ok(audio),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    warn!(attempt, attempts, "TTS attempt failed: {e}");
                    last_err = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        Err(last_err.unwrap_or(SynthesisError::MissingAudio { finish_reason: None }))
    }
}
