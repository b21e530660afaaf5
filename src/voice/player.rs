//! The single audio output per guild, rebound to each new session.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tracing::{debug, error, info};

use crate::error::PlaybackError;
use crate::lock;
use crate::transcode::PcmStream;

use super::session::VoiceSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerStatus {
    Idle,
    Playing,
    Error,
}

pub struct Player {
    guild_id: u64,
    status: Mutex<PlayerStatus>,
    bound: Mutex<Option<Arc<VoiceSession>>>,
}

impl Player {
    pub fn new(guild_id: u64) -> Self {
        Self {
            guild_id,
            status: Mutex::new(PlayerStatus::Idle),
            bound: Mutex::new(None),
        }
    }

    pub fn status(&self) -> PlayerStatus {
        *lock(&self.status)
    }

    /// Id of the session the player currently feeds.
    pub fn bound_session(&self) -> Option<u64> {
        lock(&self.bound).as_ref().map(|s| s.id())
    }

    /// Route output to `session` from now on.
    pub fn subscribe(&self, session: Arc<VoiceSession>) {
        debug!(guild = self.guild_id, session = session.id(), "player subscribed");
        *lock(&self.bound) = Some(session);
    }

    fn set_status(&self, status: PlayerStatus) {
        *lock(&self.status) = status;
    }

    /// Play one utterance and wait for it to finish.
    pub async fn play(&self, audio: PcmStream) -> Result<(), PlaybackError> {
        let session = lock(&self.bound).clone().ok_or(PlaybackError::NotSubscribed)?;
        if !session.is_ready() {
            return Err(PlaybackError::SessionNotReady(session.id()));
        }

        let duration = audio.duration();
        self.set_status(PlayerStatus::Playing);
        info!(guild = self.guild_id, session = session.id(), ?duration, "playing");

        let result = session.connection().play(audio).await;
        match &result {
            Ok(()) => {
                self.set_status(PlayerStatus::Idle);
                info!(guild = self.guild_id, "idle");
            }
            Err(e) => {
                self.set_status(PlayerStatus::Error);
                error!(guild = self.guild_id, "audio player error: {e}");
            }
        }
        result
    }
}
