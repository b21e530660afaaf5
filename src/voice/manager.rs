//! Voice session manager.
//!
//! Per guild: NoSession → Connecting → Ready → {Disconnected|Errored} →
//! Destroyed → NoSession. The manager itself never terminates; it keeps
//! cycling as connections come and go.
//!
//! At most one connect loop runs per guild. The loop lives in its own task
//! and publishes a single outcome over a watch channel; every concurrent
//! `ensure_session` caller waits on that same outcome.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::ConnectError;
use crate::lock;

use super::backoff::{Backoff, BackoffPolicy};
use super::player::Player;
use super::session::{
    signal_channel, ConnectionSignal, VoiceConnector, VoiceSession, VoiceTarget,
};

/// Error messages that mean the voice UDP/WebSocket setup fell over in a
/// way the driver's own recovery does not reliably fix.
const TRANSIENT_ERROR_PATTERNS: &[&str] = &[
    "ip discovery",
    "socket closed",
    "operation was aborted",
    "handshake",
    "voice_connection",
];

pub fn is_transient_voice_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    TRANSIENT_ERROR_PATTERNS.iter().any(|p| lower.contains(p))
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub voice_channel_id: u64,
    pub ready_timeout: Duration,
    pub liveness_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            voice_channel_id: config.discord.voice_channel_id,
            ready_timeout: Duration::from_secs(config.voice.ready_timeout_secs),
            liveness_interval: Duration::from_secs(config.voice.liveness_interval_secs),
            backoff: BackoffPolicy::from_config(&config.voice),
        }
    }
}

type ConnectOutcome = Result<Arc<VoiceSession>, ConnectError>;

/// What a new connect loop must clean up before it joins.
enum Leftover {
    /// A session that stopped being ready but may still hold the call.
    Session(Arc<VoiceSession>),
    /// A connect loop that died without publishing an outcome.
    DeadAttempt,
}

/// A receiver whose connect loop is gone without having published.
fn is_dead_attempt(rx: &watch::Receiver<Option<ConnectOutcome>>) -> bool {
    rx.has_changed().is_err() && rx.borrow().is_none()
}

enum SlotState {
    Empty,
    Connecting(watch::Receiver<Option<ConnectOutcome>>),
    Ready(Arc<VoiceSession>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    NoSession,
    Connecting,
    Ready,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub status: SlotStatus,
    pub session_id: Option<u64>,
    pub last_error_ms_ago: Option<u64>,
}

/// Everything the manager keeps for one guild.
struct GuildVoice {
    guild_id: u64,
    state: Mutex<SlotState>,
    player: OnceLock<Arc<Player>>,
    last_error_at: Mutex<Option<Instant>>,
}

impl GuildVoice {
    fn new(guild_id: u64) -> Self {
        Self {
            guild_id,
            state: Mutex::new(SlotState::Empty),
            player: OnceLock::new(),
            last_error_at: Mutex::new(None),
        }
    }

    fn player(&self) -> Arc<Player> {
        self.player
            .get_or_init(|| Arc::new(Player::new(self.guild_id)))
            .clone()
    }

    fn ready_session(&self) -> Option<Arc<VoiceSession>> {
        match &*lock(&self.state) {
            SlotState::Ready(session) if session.is_ready() => Some(session.clone()),
            _ => None,
        }
    }
}

struct ManagerInner {
    connector: Arc<dyn VoiceConnector>,
    settings: SessionSettings,
    guilds: Mutex<HashMap<u64, Arc<GuildVoice>>>,
    next_session_id: AtomicU64,
}

/// Registry of per-guild voice sessions.
#[derive(Clone)]
pub struct VoiceSessionManager {
    inner: Arc<ManagerInner>,
}

impl VoiceSessionManager {
    pub fn new(connector: Arc<dyn VoiceConnector>, settings: SessionSettings) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                connector,
                settings,
                guilds: Mutex::new(HashMap::new()),
                next_session_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.inner.settings
    }

    fn slot(&self, guild_id: u64) -> Arc<GuildVoice> {
        lock(&self.inner.guilds)
            .entry(guild_id)
            .or_insert_with(|| Arc::new(GuildVoice::new(guild_id)))
            .clone()
    }

    /// Return a ready session for the guild, connecting if needed.
    ///
    /// If a connect loop is already running, waits for its outcome instead
    /// of starting another one.
    pub async fn ensure_session(&self, guild_id: u64) -> Result<Arc<VoiceSession>, ConnectError> {
        let slot = self.slot(guild_id);

        let mut rx = {
            let mut state = lock(&slot.state);
            match &*state {
                SlotState::Ready(session) if session.is_ready() => return Ok(session.clone()),
                SlotState::Connecting(rx) if !is_dead_attempt(rx) => rx.clone(),
                _ => {
                    let (tx, rx) = watch::channel(None);
                    let leftover = match std::mem::replace(&mut *state, SlotState::Connecting(rx.clone())) {
                        SlotState::Ready(session) => Some(Leftover::Session(session)),
                        SlotState::Connecting(_) => {
                            warn!(guild = guild_id, "previous connect attempt died, starting over");
                            Some(Leftover::DeadAttempt)
                        }
                        SlotState::Empty => None,
                    };
                    tokio::spawn(self.clone().connect_loop(slot.clone(), leftover, tx));
                    rx
                }
            }
        };

        // A dead loop stays in the slot; the next caller replaces it.
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome.unwrap_or_else(|| {
            error!(guild = guild_id, "voice connect task ended without a result");
            Err(ConnectError::Aborted)
        })
    }

    async fn connect_loop(
        self,
        slot: Arc<GuildVoice>,
        leftover: Option<Leftover>,
        tx: watch::Sender<Option<ConnectOutcome>>,
    ) {
        let guild = slot.guild_id;
        // The old call must be released before its replacement joins the
        // same channel.
        match leftover {
            Some(Leftover::Session(stale)) => {
                debug!(guild, session = stale.id(), "clearing stale session");
                stale.destroy().await;
            }
            Some(Leftover::DeadAttempt) => self.inner.connector.abandon(guild).await,
            None => {}
        }

        let mut backoff = Backoff::new(self.inner.settings.backoff);

        let outcome = loop {
            let attempt = backoff.failures() + 1;
            info!(guild, attempt, "voice connect attempt");

            match self.connect_once(&slot).await {
                Ok(ready) => break Ok(ready),
                Err(e) if e.is_misconfiguration() => {
                    error!(guild, "voice target misconfigured, not retrying: {e}");
                    break Err(e);
                }
                Err(e) => {
                    error!(guild, attempt, "voice connect failed: {e}");
                    match backoff.next_delay() {
                        Some(delay) => {
                            info!(guild, delay_ms = delay.as_millis() as u64, "backing off");
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            break Err(ConnectError::Exhausted {
                                attempts: backoff.failures(),
                                last: Box::new(e),
                            })
                        }
                    }
                }
            }
        };

        let published = match outcome {
            Ok((session, signals)) => {
                session.mark_ready();
                *lock(&slot.state) = SlotState::Ready(session.clone());
                tokio::spawn(self.clone().watch_signals(slot.clone(), session.clone(), signals));
                info!(guild, session = session.id(), "voice ready");
                Ok(session)
            }
            Err(e) => {
                *lock(&slot.state) = SlotState::Empty;
                Err(e)
            }
        };
        tx.send_replace(Some(published));
    }

    async fn connect_once(
        &self,
        slot: &GuildVoice,
    ) -> Result<(Arc<VoiceSession>, mpsc::UnboundedReceiver<ConnectionSignal>), ConnectError> {
        let target = VoiceTarget {
            guild_id: slot.guild_id,
            channel_id: self.inner.settings.voice_channel_id,
        };
        let (signals, signal_rx) = signal_channel();
        let ready_timeout = self.inner.settings.ready_timeout;

        let result = match tokio::time::timeout(ready_timeout, self.inner.connector.connect(target, signals)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectError::ReadyTimeout(ready_timeout)),
        };

        match result {
            Ok(connection) => {
                let id = self.inner.next_session_id.fetch_add(1, Ordering::Relaxed);
                let session = Arc::new(VoiceSession::new(id, target, connection));
                slot.player().subscribe(session.clone());
                Ok((session, signal_rx))
            }
            Err(e) => {
                self.inner.connector.abandon(slot.guild_id).await;
                Err(e)
            }
        }
    }

    async fn watch_signals(
        self,
        slot: Arc<GuildVoice>,
        session: Arc<VoiceSession>,
        mut signals: mpsc::UnboundedReceiver<ConnectionSignal>,
    ) {
        let guild = slot.guild_id;
        loop {
            let signal = tokio::select! {
                _ = session.closed() => return,
                signal = signals.recv() => signal,
            };

            match signal {
                Some(ConnectionSignal::Error(message)) => {
                    error!(guild, session = session.id(), "voice connection error: {message}");
                    let now = Instant::now();
                    *lock(&slot.last_error_at) = Some(now);
                    session.record_error(now);
                    if is_transient_voice_error(&message) {
                        self.teardown(&slot, &session, "transient-error").await;
                        return;
                    }
                }
                Some(ConnectionSignal::Disconnected) => {
                    warn!(guild, session = session.id(), "voice disconnected, will reconnect");
                    session.mark_disconnected();
                    self.teardown(&slot, &session, "disconnected").await;
                    return;
                }
                None => return,
            }
        }
    }

    /// Destroy `session`, then clear the slot if it still holds it.
    ///
    /// The session stays in the slot while its call is released, so a
    /// concurrent `ensure_session` hands it to the next connect loop, which
    /// waits for the release before joining.
    async fn teardown(&self, slot: &GuildVoice, session: &Arc<VoiceSession>, reason: &str) {
        warn!(guild = slot.guild_id, session = session.id(), reason, "destroying voice session");
        session.destroy().await;

        let mut state = lock(&slot.state);
        if matches!(&*state, SlotState::Ready(current) if current.id() == session.id()) {
            *state = SlotState::Empty;
        }
    }

    /// Tear down the guild's current session so the next `ensure_session`
    /// builds a fresh one. No-op while no session is held.
    pub async fn disconnect(&self, guild_id: u64, reason: &str) {
        let slot = self.slot(guild_id);
        let session = match &*lock(&slot.state) {
            SlotState::Ready(session) => Some(session.clone()),
            _ => None,
        };
        if let Some(session) = session {
            self.teardown(&slot, &session, reason).await;
        }
    }

    pub fn current_session(&self, guild_id: u64) -> Option<Arc<VoiceSession>> {
        self.slot(guild_id).ready_session()
    }

    /// The guild's player, created on first use.
    pub fn player(&self, guild_id: u64) -> Arc<Player> {
        self.slot(guild_id).player()
    }

    pub fn last_error_at(&self, guild_id: u64) -> Option<Instant> {
        *lock(&self.slot(guild_id).last_error_at)
    }

    /// Whether a connection error was seen within `window`.
    pub fn had_recent_error(&self, guild_id: u64, window: Duration) -> bool {
        self.last_error_at(guild_id)
            .is_some_and(|at| at.elapsed() < window)
    }

    pub fn snapshot(&self, guild_id: u64) -> SessionSnapshot {
        let slot = self.slot(guild_id);
        let (status, session_id) = match &*lock(&slot.state) {
            SlotState::Ready(session) if session.is_ready() => (SlotStatus::Ready, Some(session.id())),
            SlotState::Connecting(rx) if !is_dead_attempt(rx) => (SlotStatus::Connecting, None),
            _ => (SlotStatus::NoSession, None),
        };
        let last_error_ms_ago = lock(&slot.last_error_at).map(|at| at.elapsed().as_millis() as u64);
        SessionSnapshot {
            status,
            session_id,
            last_error_ms_ago,
        }
    }

    /// Periodically re-establish the guild's session if none is held.
    pub fn spawn_liveness(&self, guild_id: u64, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = self.clone();
        let period = self.inner.settings.liveness_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                if manager.current_session(guild_id).is_some() {
                    continue;
                }

                debug!(guild = guild_id, "liveness check: no voice session");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = manager.ensure_session(guild_id) => {
                        if let Err(e) = result {
                            error!(guild = guild_id, "liveness reconnect failed: {e}");
                        }
                    }
                }
            }
            debug!(guild = guild_id, "liveness loop stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_patterns_match_known_failures() {
        assert!(is_transient_voice_error("Cannot perform IP discovery - socket closed"));
        assert!(is_transient_voice_error("socket closed"));
        assert!(is_transient_voice_error("The operation was aborted"));
        assert!(is_transient_voice_error("WebSocket handshake timed out"));
        assert!(is_transient_voice_error("VOICE_CONNECTION_TIMEOUT"));
        assert!(!is_transient_voice_error("Missing Permissions"));
    }

    #[test]
    fn settings_follow_config() {
        let mut config = Config::default();
        config.discord.voice_channel_id = 42;
        config.voice.ready_timeout_secs = 15;
        let settings = SessionSettings::from_config(&config);
        assert_eq!(settings.voice_channel_id, 42);
        assert_eq!(settings.ready_timeout, Duration::from_secs(15));
        assert_eq!(settings.liveness_interval, Duration::from_secs(20));
    }
}
