//! Voice session lifecycle: connect, watch, tear down, reconnect.

pub mod backoff;
pub mod manager;
pub mod player;
pub mod session;

pub use backoff::{Backoff, BackoffPolicy, RetryMode};
pub use manager::{
    is_transient_voice_error, SessionSettings, SessionSnapshot, SlotStatus, VoiceSessionManager,
};
pub use player::{Player, PlayerStatus};
pub use session::{
    signal_channel, ConnectionSignal, SessionStatus, SignalSender, VoiceConnection,
    VoiceConnector, VoiceSession, VoiceTarget,
};
