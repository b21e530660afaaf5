//! Error types, one per failure class.
//!
//! Only `ConfigError` is ever fatal (at boot). Everything else is logged by
//! the speech queue and degrades to skipping a single utterance.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required settings: {}", .0.join(", "))]
    Missing(Vec<&'static str>),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Failure of a single voice connect attempt.
///
/// `Clone` so the outcome of one in-flight attempt can be handed to every
/// caller waiting on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectError {
    #[error("voice channel not found: {0}")]
    ChannelNotFound(u64),
    #[error("target is not a voice channel: {0}")]
    NotVoiceChannel(u64),
    #[error("voice connection not ready within {0:?}")]
    ReadyTimeout(Duration),
    #[error("voice join failed: {0}")]
    Join(String),
    #[error("connect attempt abandoned")]
    Aborted,
    #[error("gave up after {attempts} connect attempts: {last}")]
    Exhausted { attempts: u32, last: Box<ConnectError> },
}

impl ConnectError {
    /// Errors that point at a bad channel id rather than a flaky network.
    pub fn is_misconfiguration(&self) -> bool {
        matches!(self, Self::ChannelNotFound(_) | Self::NotVoiceChannel(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SynthesisError {
    #[error("empty tts text")]
    EmptyText,
    #[error("{message}")]
    Http { status: u16, message: String },
    #[error("tts request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid audio payload: {0}")]
    Decode(String),
    #[error("tts response is missing the inline audio payload")]
    MissingAudio { finish_reason: Option<String> },
}

impl SynthesisError {
    /// Whether another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::EmptyText)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    #[error("pcm buffer has an odd byte length ({0})")]
    OddLength(usize),
    #[error("resampler setup failed: {0}")]
    Setup(String),
    #[error("resampling failed: {0}")]
    Resample(String),
    #[error("transcode task failed: {0}")]
    Join(String),
}

#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error("player is not subscribed to a voice session")]
    NotSubscribed,
    #[error("voice session {0} is not ready")]
    SessionNotReady(u64),
    #[error("audio sink error: {0}")]
    Sink(String),
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("speech queue is full ({capacity} pending)")]
    Full { capacity: usize },
}

/// Why a dequeued task did not play.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("no voice session: {0}")]
    NoSession(#[from] ConnectError),
    #[error(transparent)]
    Synthesis(#[from] SynthesisError),
    #[error(transparent)]
    Transcode(#[from] TranscodeError),
    #[error(transparent)]
    Playback(#[from] PlaybackError),
}
