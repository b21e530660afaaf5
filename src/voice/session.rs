//! Voice session types and the seams the platform adapter implements.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{ConnectError, PlaybackError};
use crate::lock;
use crate::transcode::PcmStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoiceTarget {
    pub guild_id: u64,
    pub channel_id: u64,
}

/// Out-of-band events raised by a live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSignal {
    Disconnected,
    Error(String),
}

/// Handed to the connector with every attempt; the adapter reports
/// disconnects and errors through it for the lifetime of the connection.
#[derive(Debug, Clone)]
pub struct SignalSender {
    tx: mpsc::UnboundedSender<ConnectionSignal>,
}

impl SignalSender {
    pub fn disconnected(&self) {
        // A closed receiver means the session is already gone.
        let _ = self.tx.send(ConnectionSignal::Disconnected);
    }

    pub fn error(&self, message: impl Into<String>) {
        let _ = self.tx.send(ConnectionSignal::Error(message.into()));
    }
}

pub fn signal_channel() -> (SignalSender, mpsc::UnboundedReceiver<ConnectionSignal>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (SignalSender { tx }, rx)
}

/// A connected voice channel that can play audio.
#[async_trait]
pub trait VoiceConnection: Send + Sync {
    /// Submit PCM and wait until the sink goes idle (Ok) or errors.
    async fn play(&self, audio: PcmStream) -> Result<(), PlaybackError>;

    async fn destroy(&self);
}

/// Opens voice connections on the chat platform.
#[async_trait]
pub trait VoiceConnector: Send + Sync {
    /// Resolve the channel, join it, and return once the connection is ready.
    ///
    /// Must fail with `ChannelNotFound` / `NotVoiceChannel` when the target
    /// id does not name a voice-capable channel of the guild.
    async fn connect(
        &self,
        target: VoiceTarget,
        signals: SignalSender,
    ) -> Result<Arc<dyn VoiceConnection>, ConnectError>;

    /// Drop whatever a failed or timed-out attempt left behind.
    async fn abandon(&self, guild_id: u64);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Connecting,
    Ready,
    Disconnected,
    Destroyed,
}

/// One live connection. Replaced, never repaired: a reconnect builds a new
/// session with a new id.
pub struct VoiceSession {
    id: u64,
    target: VoiceTarget,
    connection: Arc<dyn VoiceConnection>,
    status: Mutex<SessionStatus>,
    last_error_at: Mutex<Option<Instant>>,
    closed: CancellationToken,
    released: CancellationToken,
}

impl std::fmt::Debug for VoiceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceSession")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("status", &self.status())
            .finish()
    }
}

impl VoiceSession {
    pub(crate) fn new(id: u64, target: VoiceTarget, connection: Arc<dyn VoiceConnection>) -> Self {
        Self {
            id,
            target,
            connection,
            status: Mutex::new(SessionStatus::Connecting),
            last_error_at: Mutex::new(None),
            closed: CancellationToken::new(),
            released: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn target(&self) -> VoiceTarget {
        self.target
    }

    pub fn status(&self) -> SessionStatus {
        *lock(&self.status)
    }

    pub fn is_ready(&self) -> bool {
        self.status() == SessionStatus::Ready
    }

    pub fn connection(&self) -> Arc<dyn VoiceConnection> {
        self.connection.clone()
    }

    pub fn last_error_at(&self) -> Option<Instant> {
        *lock(&self.last_error_at)
    }

    pub(crate) fn record_error(&self, at: Instant) {
        *lock(&self.last_error_at) = Some(at);
    }

    /// Connecting → Ready, once the manager has stored the session.
    pub(crate) fn mark_ready(&self) {
        let mut status = lock(&self.status);
        if *status == SessionStatus::Connecting {
            *status = SessionStatus::Ready;
        }
    }

    pub(crate) fn mark_disconnected(&self) {
        let mut status = lock(&self.status);
        if *status == SessionStatus::Ready {
            *status = SessionStatus::Disconnected;
        }
    }

    /// Resolves once the session has been destroyed.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Idempotent. Every caller returns only once the connection has been
    /// released, including callers that arrive while another one is still
    /// releasing it.
    pub(crate) async fn destroy(&self) {
        let first = {
            let mut status = lock(&self.status);
            let first = *status != SessionStatus::Destroyed;
            *status = SessionStatus::Destroyed;
            first
        };
        if !first {
            self.released.cancelled().await;
            return;
        }
        self.closed.cancel();
        self.connection.destroy().await;
        self.released.cancel();
    }
}
