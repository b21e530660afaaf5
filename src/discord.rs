//! Discord adapter: serenity gateway handler and songbird voice connector.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serenity::client::{Client, Context, EventHandler};
use serenity::http::{Http, HttpError};
use serenity::model::channel::{Channel, ChannelType, Message};
use serenity::model::gateway::{GatewayIntents, Ready};
use serenity::model::id::{ChannelId, GuildId};
use songbird::events::{
    CoreEvent, Event, EventContext, EventHandler as VoiceEventHandler, TrackEvent,
};
use songbird::input::{Input, RawAdapter};
use songbird::tracks::{PlayMode, Track};
use songbird::{Call, SerenityInit, Songbird};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ConnectError, PlaybackError};
use crate::ingest::{InboundMessage, MessageIngest};
use crate::lock;
use crate::transcode::PcmStream;
use crate::voice::{SignalSender, VoiceConnection, VoiceConnector, VoiceSessionManager, VoiceTarget};

pub struct DiscordConnector {
    songbird: Arc<Songbird>,
    http: Arc<Http>,
}

impl DiscordConnector {
    pub fn new(songbird: Arc<Songbird>, http: Arc<Http>) -> Self {
        Self { songbird, http }
    }

    async fn check_channel(&self, target: VoiceTarget) -> Result<(), ConnectError> {
        let channel = match self.http.get_channel(ChannelId::new(target.channel_id)).await {
            Ok(channel) => channel,
            Err(serenity::Error::Http(HttpError::UnsuccessfulRequest(resp)))
                if matches!(resp.status_code.as_u16(), 403 | 404) =>
            {
                return Err(ConnectError::ChannelNotFound(target.channel_id));
            }
            Err(e) => return Err(ConnectError::Join(format!("channel lookup failed: {e}"))),
        };

        match channel {
            Channel::Guild(gc) if gc.guild_id.get() != target.guild_id => {
                Err(ConnectError::ChannelNotFound(target.channel_id))
            }
            Channel::Guild(gc) if matches!(gc.kind, ChannelType::Voice | ChannelType::Stage) => Ok(()),
            _ => Err(ConnectError::NotVoiceChannel(target.channel_id)),
        }
    }
}

#[async_trait]
impl VoiceConnector for DiscordConnector {
    async fn connect(
        &self,
        target: VoiceTarget,
        signals: SignalSender,
    ) -> Result<Arc<dyn VoiceConnection>, ConnectError> {
        self.check_channel(target).await?;

        let guild = GuildId::new(target.guild_id);
        let call = self
            .songbird
            .join(guild, ChannelId::new(target.channel_id))
            .await
            .map_err(|e| ConnectError::Join(e.to_string()))?;

        {
            let mut handler = call.lock().await;
            if let Err(e) = handler.deafen(true).await {
                warn!(guild = target.guild_id, "self-deafen failed: {e}");
            }
            // Handlers from a previous session would report into a dead channel.
            handler.remove_all_global_events();
            handler.add_global_event(
                Event::Core(CoreEvent::DriverDisconnect),
                DisconnectNotifier { signals },
            );
        }

        info!(guild = target.guild_id, channel = target.channel_id, "joined voice channel");
        Ok(Arc::new(SongbirdConnection {
            guild,
            songbird: self.songbird.clone(),
            call,
        }))
    }

    async fn abandon(&self, guild_id: u64) {
        if let Err(e) = self.songbird.remove(GuildId::new(guild_id)).await {
            debug!(guild = guild_id, "nothing to abandon: {e}");
        }
    }
}

struct DisconnectNotifier {
    signals: SignalSender,
}

#[async_trait]
impl VoiceEventHandler for DisconnectNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        if let EventContext::DriverDisconnect(data) = ctx {
            if let Some(reason) = &data.reason {
                self.signals.error(format!("{reason:?}"));
            }
            self.signals.disconnected();
        }
        None
    }
}

type TrackOutcome = Result<(), PlaybackError>;

/// Reports the first end-or-error of a track.
#[derive(Clone)]
struct TrackNotifier {
    done: Arc<Mutex<Option<oneshot::Sender<TrackOutcome>>>>,
}

#[async_trait]
impl VoiceEventHandler for TrackNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        if let EventContext::Track(tracks) = ctx {
            let outcome = match tracks.first().map(|(state, _)| &state.playing) {
                Some(PlayMode::Errored(e)) => Err(PlaybackError::Sink(format!("{e:?}"))),
                _ => Ok(()),
            };
            if let Some(tx) = lock(&self.done).take() {
                let _ = tx.send(outcome);
            }
        }
        None
    }
}

pub struct SongbirdConnection {
    guild: GuildId,
    songbird: Arc<Songbird>,
    call: Arc<tokio::sync::Mutex<Call>>,
}

/// s16le interleaved → f32le interleaved, the layout `RawAdapter` reads.
fn to_f32_bytes(pcm: &[u8]) -> Vec<u8> {
    pcm.chunks_exact(2)
        .flat_map(|b| (i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0).to_le_bytes())
        .collect()
}

#[async_trait]
impl VoiceConnection for SongbirdConnection {
    async fn play(&self, audio: PcmStream) -> Result<(), PlaybackError> {
        let rate = audio.sample_rate();
        let channels = u32::from(audio.channels());
        let samples = to_f32_bytes(&audio.into_bytes());
        let input: Input = RawAdapter::new(Cursor::new(samples), rate, channels).into();

        let (tx, rx) = oneshot::channel();
        let notifier = TrackNotifier {
            done: Arc::new(Mutex::new(Some(tx))),
        };

        // Start paused so the end event cannot fire before it is registered.
        let handle = self.call.lock().await.play(Track::new(input).pause());
        handle
            .add_event(Event::Track(TrackEvent::End), notifier.clone())
            .map_err(|e| PlaybackError::Sink(e.to_string()))?;
        handle
            .add_event(Event::Track(TrackEvent::Error), notifier)
            .map_err(|e| PlaybackError::Sink(e.to_string()))?;
        handle.play().map_err(|e| PlaybackError::Sink(e.to_string()))?;

        rx.await
            .unwrap_or_else(|_| Err(PlaybackError::Sink("track dropped before finishing".into())))
    }

    async fn destroy(&self) {
        if let Err(e) = self.songbird.remove(self.guild).await {
            debug!(guild = self.guild.get(), "voice call already gone: {e}");
        }
    }
}

/// Gateway event handler: resident-mode startup and message ingest.
pub struct RelayHandler {
    guild_id: u64,
    resident: bool,
    sessions: VoiceSessionManager,
    ingest: Arc<MessageIngest>,
    shutdown: CancellationToken,
    started: AtomicBool,
}

impl RelayHandler {
    pub fn new(
        guild_id: u64,
        resident: bool,
        sessions: VoiceSessionManager,
        ingest: Arc<MessageIngest>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            guild_id,
            resident,
            sessions,
            ingest,
            shutdown,
            started: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl EventHandler for RelayHandler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!(user = %ready.user.name, "Discord gateway ready");

        // Ready fires again after every gateway resume.
        if !self.resident || self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let sessions = self.sessions.clone();
        let guild = self.guild_id;
        tokio::spawn(async move {
            if let Err(e) = sessions.ensure_session(guild).await {
                error!(guild, "initial voice connect failed: {e}");
            }
        });
        self.sessions.spawn_liveness(guild, self.shutdown.child_token());
    }

    async fn message(&self, _ctx: Context, msg: Message) {
        let inbound = InboundMessage {
            author_id: msg.author.id.get(),
            author_name: msg.author.name.clone(),
            author_is_bot: msg.author.bot,
            channel_id: msg.channel_id.get(),
            guild_id: msg.guild_id.map(|g| g.get()),
            content: msg.content,
        };
        self.ingest.handle(&inbound);
    }
}

/// Run the gateway client until it stops or `shutdown` fires.
pub async fn run_client(
    token: &str,
    handler: RelayHandler,
    songbird: Arc<Songbird>,
    shutdown: CancellationToken,
) -> Result<(), serenity::Error> {
    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT
        | GatewayIntents::GUILD_VOICE_STATES;

    let mut client = Client::builder(token, intents)
        .event_handler(handler)
        .register_songbird_with(songbird)
        .await?;

    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        info!("Shutting down gateway");
        shard_manager.shutdown_all().await;
    });

    client.start().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pcm_is_widened_to_f32() {
        let pcm: Vec<u8> = [0i16, 16384, -32768].iter().flat_map(|v| v.to_le_bytes()).collect();
        let floats: Vec<f32> = to_f32_bytes(&pcm)
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        assert_eq!(floats, vec![0.0, 0.5, -1.0]);
    }
}
