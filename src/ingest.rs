//! Inbound message filter.
//!
//! Accepts a chat message only if it comes from a human, in the configured
//! guild and text channel, with non-blank content, and outside the author's
//! cooldown. Accepted text is optionally shortened before being queued.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::Config;
use crate::lock;
use crate::queue::SpeechQueue;

const ELLIPSIS: &str = "…";

/// Platform-neutral view of a chat message.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub author_id: u64,
    pub author_name: String,
    pub author_is_bot: bool,
    pub channel_id: u64,
    pub guild_id: Option<u64>,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    Bot,
    WrongGuild,
    WrongChannel,
    Empty,
    Cooldown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Speak(String),
    Ignore(IgnoreReason),
}

/// Keep the first `threshold` characters and mark the cut with "…".
pub fn truncate_long_text(text: &str, threshold: usize) -> String {
    if text.chars().count() <= threshold {
        return text.to_string();
    }
    let mut short: String = text.chars().take(threshold).collect();
    short.push_str(ELLIPSIS);
    short
}

pub struct IngestFilter {
    guild_id: u64,
    text_channel_id: u64,
    cooldown: Option<Duration>,
    long_text_threshold: Option<usize>,
    last_spoken: Mutex<HashMap<u64, Instant>>,
}

impl IngestFilter {
    pub fn new(
        guild_id: u64,
        text_channel_id: u64,
        cooldown: Option<Duration>,
        long_text_threshold: Option<usize>,
    ) -> Self {
        Self {
            guild_id,
            text_channel_id,
            cooldown,
            long_text_threshold,
            last_spoken: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.discord.guild_id,
            config.discord.text_channel_id,
            config.cooldown(),
            config.long_text_threshold(),
        )
    }

    pub fn admit(&self, msg: &InboundMessage) -> Verdict {
        self.admit_at(msg, Instant::now())
    }

    /// Decide on `msg` as if it arrived at `now`. An accepted message starts
    /// the author's cooldown.
    pub fn admit_at(&self, msg: &InboundMessage, now: Instant) -> Verdict {
        if msg.author_is_bot {
            return Verdict::Ignore(IgnoreReason::Bot);
        }
        if msg.guild_id != Some(self.guild_id) {
            return Verdict::Ignore(IgnoreReason::WrongGuild);
        }
        if msg.channel_id != self.text_channel_id {
            return Verdict::Ignore(IgnoreReason::WrongChannel);
        }

        let text = msg.content.trim();
        if text.is_empty() {
            return Verdict::Ignore(IgnoreReason::Empty);
        }

        if let Some(cooldown) = self.cooldown {
            let mut last_spoken = lock(&self.last_spoken);
            if let Some(last) = last_spoken.get(&msg.author_id) {
                if now.saturating_duration_since(*last) < cooldown {
                    return Verdict::Ignore(IgnoreReason::Cooldown);
                }
            }
            last_spoken.insert(msg.author_id, now);
        }

        let text = match self.long_text_threshold {
            Some(threshold) => truncate_long_text(text, threshold),
            None => text.to_string(),
        };
        Verdict::Speak(text)
    }
}

/// Filter plus queue: the glue the gateway handler calls per message.
pub struct MessageIngest {
    filter: IngestFilter,
    queue: SpeechQueue,
}

impl MessageIngest {
    pub fn new(filter: IngestFilter, queue: SpeechQueue) -> Self {
        Self { filter, queue }
    }

    pub fn handle(&self, msg: &InboundMessage) -> Verdict {
        let verdict = self.filter.admit(msg);
        match &verdict {
            Verdict::Speak(text) => {
                debug!(author = %msg.author_name, chars = text.chars().count(), "queueing message");
                if let Some(guild) = msg.guild_id {
                    if let Err(e) = self.queue.enqueue(guild, text.clone()) {
                        warn!(author = %msg.author_name, "message dropped: {e}");
                    }
                }
            }
            Verdict::Ignore(IgnoreReason::Cooldown) => {
                debug!(author = %msg.author_name, "author on cooldown");
            }
            Verdict::Ignore(_) => {}
        }
        verdict
    }
}
