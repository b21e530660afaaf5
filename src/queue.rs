//! Speech queue: serialized FIFO playback.
//!
//! Producers append to the tail and return immediately. A single drain task
//! pops tasks one at a time and drives each through session → synthesis →
//! transcode → player before touching the next. Each task runs in its own
//! child task, so a panic fails that task and the drain moves on. The `draining` flag, flipped
//! under the same lock as the queue itself, guarantees at most one drain task.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::error::{QueueError, TaskError};
use crate::lock;
use crate::transcode::Transcoder;
use crate::tts::SpeechSynthesizer;
use crate::voice::VoiceSessionManager;

/// Capacity and staleness rules for pending tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePolicy {
    /// `None` = unbounded.
    pub max_pending: Option<usize>,
    /// Tasks older than this when dequeued are dropped. `None` = never.
    pub max_age: Option<Duration>,
    /// A playback error this soon after a voice error tears the session down.
    pub error_window: Duration,
    /// Pause after such a teardown.
    pub error_cooldown: Duration,
}

impl QueuePolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            max_pending: (config.max_pending > 0).then_some(config.max_pending),
            max_age: (config.max_age_secs > 0).then(|| Duration::from_secs(config.max_age_secs)),
            error_window: Duration::from_millis(config.error_window_ms),
            error_cooldown: Duration::from_millis(config.error_cooldown_ms),
        }
    }
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

#[derive(Debug, Clone)]
pub struct PlaybackTask {
    pub guild_id: u64,
    pub text: String,
    pub enqueued_at: Instant,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub enqueued: u64,
    pub played: u64,
    pub failed: u64,
    pub skipped: u64,
    pub dropped_stale: u64,
    pub rejected: u64,
}

struct QueueState {
    tasks: VecDeque<PlaybackTask>,
    draining: bool,
}

struct QueueInner {
    state: Mutex<QueueState>,
    idle: watch::Sender<bool>,
    stats: Mutex<QueueStats>,
    sessions: VoiceSessionManager,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    transcoder: Transcoder,
    policy: QueuePolicy,
}

#[derive(Clone)]
pub struct SpeechQueue {
    inner: Arc<QueueInner>,
}

impl SpeechQueue {
    pub fn new(
        sessions: VoiceSessionManager,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        transcoder: Transcoder,
        policy: QueuePolicy,
    ) -> Self {
        let (idle, _) = watch::channel(true);
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState {
                    tasks: VecDeque::new(),
                    draining: false,
                }),
                idle,
                stats: Mutex::new(QueueStats::default()),
                sessions,
                synthesizer,
                transcoder,
                policy,
            }),
        }
    }

    /// Append a task and make sure a drain task is running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue(&self, guild_id: u64, text: impl Into<String>) -> Result<(), QueueError> {
        let task = PlaybackTask {
            guild_id,
            text: text.into(),
            enqueued_at: Instant::now(),
        };

        let start_drain = {
            let mut state = lock(&self.inner.state);
            if let Some(capacity) = self.inner.policy.max_pending {
                if state.tasks.len() >= capacity {
                    lock(&self.inner.stats).rejected += 1;
                    warn!(guild = guild_id, capacity, "speech queue full, rejecting task");
                    return Err(QueueError::Full { capacity });
                }
            }
            state.tasks.push_back(task);
            lock(&self.inner.stats).enqueued += 1;
            debug!(guild = guild_id, pending = state.tasks.len(), "task enqueued");

            if state.draining {
                false
            } else {
                state.draining = true;
                self.inner.idle.send_replace(false);
                true
            }
        };

        if start_drain {
            tokio::spawn(self.clone().drain());
        }
        Ok(())
    }

    async fn drain(self) {
        debug!("drain loop started");
        loop {
            let task = {
                let mut state = lock(&self.inner.state);
                match state.tasks.pop_front() {
                    Some(task) => task,
                    None => {
                        state.draining = false;
                        self.inner.idle.send_replace(true);
                        break;
                    }
                }
            };
            let guild = task.guild_id;
            let worker = self.clone();
            if let Err(e) = tokio::spawn(async move { worker.process(task).await }).await {
                error!(guild, "speech task aborted: {e}");
                lock(&self.inner.stats).failed += 1;
            }
        }
        debug!("drain loop finished");
    }

    async fn process(&self, task: PlaybackTask) {
        let guild = task.guild_id;
        let policy = self.inner.policy;

        if task.text.trim().is_empty() {
            lock(&self.inner.stats).skipped += 1;
            return;
        }

        if let Some(max_age) = policy.max_age {
            let age = task.enqueued_at.elapsed();
            if age > max_age {
                warn!(guild, age_ms = age.as_millis() as u64, "dropping stale speech task");
                lock(&self.inner.stats).dropped_stale += 1;
                return;
            }
        }

        match self.speak(&task).await {
            Ok(()) => {
                lock(&self.inner.stats).played += 1;
            }
            Err(TaskError::NoSession(e)) => {
                warn!(guild, "no voice session available, skipping: {e}");
                lock(&self.inner.stats).skipped += 1;
            }
            Err(e) => {
                error!(guild, "speech task failed: {e}");
                lock(&self.inner.stats).failed += 1;

                let playback_failed = matches!(e, TaskError::Playback(_));
                if playback_failed && self.inner.sessions.had_recent_error(guild, policy.error_window) {
                    warn!(guild, "playback error right after a voice error, resetting session");
                    self.inner.sessions.disconnect(guild, "recent-voice-error").await;
                    tokio::time::sleep(policy.error_cooldown).await;
                }
            }
        }
    }

    async fn speak(&self, task: &PlaybackTask) -> Result<(), TaskError> {
        let session = self.inner.sessions.ensure_session(task.guild_id).await?;
        let audio = self.inner.synthesizer.synthesize(&task.text).await?;
        info!(
            guild = task.guild_id,
            session = session.id(),
            bytes = audio.pcm.len(),
            rate = audio.sample_rate,
            "synthesized"
        );
        let stream = self.inner.transcoder.transcode_audio(audio).await?;
        self.inner.sessions.player(task.guild_id).play(stream).await?;
        Ok(())
    }

    /// Tasks waiting behind the one in flight.
    pub fn pending(&self) -> usize {
        lock(&self.inner.state).tasks.len()
    }

    pub fn is_draining(&self) -> bool {
        lock(&self.inner.state).draining
    }

    pub fn stats(&self) -> QueueStats {
        *lock(&self.inner.stats)
    }

    pub fn policy(&self) -> QueuePolicy {
        self.inner.policy
    }

    /// Resolves once the queue is empty and no task is in flight.
    pub async fn wait_idle(&self) {
        let mut idle = self.inner.idle.subscribe();
        // The sender lives in `inner`, which `self` keeps alive.
        let _ = idle.wait_for(|idle| *idle).await;
    }
}
