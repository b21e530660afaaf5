//! Configuration management for voice-relay.
//!
//! Loads config from a YAML file in standard locations, then lets the
//! process environment (and `.env`) override the deployment-specific keys.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DiscordConfig {
    pub token: String,
    pub guild_id: u64,
    pub text_channel_id: u64,
    pub voice_channel_id: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub voice: String,
    pub max_chars: usize,
    pub attempts: u32,
    pub retry_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub audio_only_prompt: String,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://generativelanguage.googleapis.com".into(),
            api_key: String::new(),
            model: "gemini-2.5-flash-preview-tts".into(),
            voice: "Kore".into(),
            max_chars: 500,
            attempts: 2,
            retry_delay_ms: 500,
            request_timeout_secs: 30,
            audio_only_prompt:
                "Read the following aloud. Respond with audio only, do not reply with text: ".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub resident: bool,
    pub ready_timeout_secs: u64,
    pub liveness_interval_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// 0 retries forever.
    pub max_connect_attempts: u32,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            resident: true,
            ready_timeout_secs: 35,
            liveness_interval_secs: 20,
            backoff_base_ms: 1000,
            backoff_max_ms: 15000,
            max_connect_attempts: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// 0 means unbounded.
    pub max_pending: usize,
    /// 0 disables the staleness drop.
    pub max_age_secs: u64,
    pub error_window_ms: u64,
    pub error_cooldown_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_pending: 0,
            max_age_secs: 0,
            error_window_ms: 10_000,
            error_cooldown_ms: 1200,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub cooldown_ms: u64,
    pub long_text_threshold: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "0.0.0.0".into(),
            port: 10000,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub discord: DiscordConfig,
    pub tts: TtsConfig,
    pub voice: VoiceConfig,
    pub queue: QueueConfig,
    pub ingest: IngestConfig,
    pub health: HealthConfig,
}

impl Config {
    /// Load configuration from YAML file.
    ///
    /// Searches standard locations if no path is provided:
    /// 1. ./voice-relay.yaml
    /// 2. ~/.config/voice-relay/config.yaml
    /// 3. /etc/voice-relay/config.yaml
    ///
    /// This is only the file layer. Call [`Config::apply_env`] on the result
    /// so deployment variables (`DISCORD_TOKEN`, `GUILD_ID`, ...) win over
    /// the file, then [`Config::validate`].
    pub fn load(path: Option<&Path>) -> Self {
        let resolved = path.map(PathBuf::from).or_else(|| {
            let candidates = [
                std::env::current_dir().ok().map(|d| d.join("voice-relay.yaml")),
                dirs::home_dir().map(|h| h.join(".config/voice-relay/config.yaml")),
                Some(PathBuf::from("/etc/voice-relay/config.yaml")),
            ];
            candidates.into_iter().flatten().find(|p| p.exists())
        });

        let Some(config_path) = resolved else {
            info!("No config file found, using defaults");
            return Self::default();
        };

        match std::fs::read_to_string(&config_path) {
            Ok(contents) => match serde_yml::from_str(&contents) {
                Ok(config) => {
                    info!("Loaded config from {}", config_path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {e}, using defaults", config_path.display());
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read {}: {e}, using defaults", config_path.display());
                Self::default()
            }
        }
    }

    /// Override deployment keys from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Override deployment keys from an arbitrary key lookup.
    ///
    /// Empty values are treated as unset so a blank line in `.env` does not
    /// wipe out a value from the YAML file.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("DISCORD_TOKEN") {
            self.discord.token = v;
        }
        if let Some(v) = get("GUILD_ID") {
            self.discord.guild_id = parse_number("GUILD_ID", &v)?;
        }
        if let Some(v) = get("TEXT_CHANNEL_ID") {
            self.discord.text_channel_id = parse_number("TEXT_CHANNEL_ID", &v)?;
        }
        if let Some(v) = get("VOICE_CHANNEL_ID") {
            self.discord.voice_channel_id = parse_number("VOICE_CHANNEL_ID", &v)?;
        }
        if let Some(v) = get("GEMINI_API_KEY") {
            self.tts.api_key = v;
        }
        if let Some(v) = get("GEMINI_TTS_MODEL") {
            self.tts.model = v;
        }
        if let Some(v) = get("GEMINI_VOICE_NAME") {
            self.tts.voice = v;
        }
        if let Some(v) = get("COOLDOWN_MS") {
            self.ingest.cooldown_ms = parse_number("COOLDOWN_MS", &v)?;
        }
        if let Some(v) = get("LONG_TEXT_THRESHOLD") {
            self.ingest.long_text_threshold = parse_number("LONG_TEXT_THRESHOLD", &v)?;
        }
        if let Some(v) = get("PORT") {
            self.health.port = parse_number("PORT", &v)?;
        }
        Ok(())
    }

    /// Check that every required key is present.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut missing = Vec::new();
        if self.discord.token.is_empty() {
            missing.push("DISCORD_TOKEN");
        }
        if self.discord.guild_id == 0 {
            missing.push("GUILD_ID");
        }
        if self.discord.text_channel_id == 0 {
            missing.push("TEXT_CHANNEL_ID");
        }
        if self.discord.voice_channel_id == 0 {
            missing.push("VOICE_CHANNEL_ID");
        }
        if self.tts.api_key.is_empty() {
            missing.push("GEMINI_API_KEY");
        }
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        if self.tts.attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "tts.attempts",
                reason: "must be at least 1".into(),
            });
        }
        if self.voice.ready_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "voice.ready_timeout_secs",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    pub fn cooldown(&self) -> Option<Duration> {
        (self.ingest.cooldown_ms > 0).then(|| Duration::from_millis(self.ingest.cooldown_ms))
    }

    pub fn long_text_threshold(&self) -> Option<usize> {
        (self.ingest.long_text_threshold > 0).then_some(self.ingest.long_text_threshold)
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        key,
        reason: format!("expected a number, got {value:?}"),
    })
}
