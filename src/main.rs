//! voice-relay: speak a Discord text channel into a voice channel.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use serenity::http::Http;
use songbird::Songbird;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use voice_relay::config::Config;
use voice_relay::discord::{self, DiscordConnector, RelayHandler};
use voice_relay::health::{start_health_server, HealthState};
use voice_relay::ingest::{IngestFilter, MessageIngest};
use voice_relay::queue::{QueuePolicy, SpeechQueue};
use voice_relay::transcode::Transcoder;
use voice_relay::tts::GeminiTts;
use voice_relay::voice::{SessionSettings, VoiceSessionManager};

#[derive(Parser, Debug)]
#[command(name = "voice-relay", about = "Read a Discord text channel aloud in a voice channel")]
struct Args {
    /// Path to config.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,
}

/// Log which required settings are present, never their values.
fn log_env_check(config: &Config) {
    let checks = [
        ("DISCORD_TOKEN", !config.discord.token.is_empty()),
        ("GUILD_ID", config.discord.guild_id != 0),
        ("TEXT_CHANNEL_ID", config.discord.text_channel_id != 0),
        ("VOICE_CHANNEL_ID", config.discord.voice_channel_id != 0),
        ("GEMINI_API_KEY", !config.tts.api_key.is_empty()),
    ];
    for (key, present) in checks {
        if present {
            info!("ENV {key}: set");
        } else {
            warn!("ENV {key}: missing");
        }
    }
    info!(
        model = %config.tts.model,
        voice = %config.tts.voice,
        cooldown_ms = config.ingest.cooldown_ms,
        long_text_threshold = config.ingest.long_text_threshold,
        resident = config.voice.resident,
        "Settings"
    );
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging (suppress noisy gateway/voice internals)
    let filter = if args.verbose {
        EnvFilter::new("debug,serenity=info,songbird=info,hyper=info,rustls=info,tungstenite=info")
    } else {
        EnvFilter::new("info,serenity=warn,songbird=warn,hyper=warn,rustls=warn,tungstenite=warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("voice-relay starting");

    if let Err(e) = dotenvy::dotenv() {
        debug!("No .env loaded: {e}");
    }

    let mut config = Config::load(args.config.as_deref());
    if let Err(e) = config.apply_env() {
        error!("{e}");
        std::process::exit(1);
    }
    log_env_check(&config);
    if let Err(e) = config.validate() {
        error!("{e}");
        std::process::exit(1);
    }

    let shutdown = CancellationToken::new();
    let guild_id = config.discord.guild_id;

    let http = Arc::new(Http::new(&config.discord.token));
    let songbird = Songbird::serenity();
    let connector = Arc::new(DiscordConnector::new(songbird.clone(), http));
    let sessions = VoiceSessionManager::new(connector, SessionSettings::from_config(&config));

    let synthesizer = Arc::new(GeminiTts::new(config.tts.clone())?);
    let queue = SpeechQueue::new(
        sessions.clone(),
        synthesizer,
        Transcoder::new(),
        QueuePolicy::from_config(&config.queue),
    );

    if config.health.enabled {
        let addr = format!("{}:{}", config.health.host, config.health.port);
        let state = HealthState {
            guild_id,
            sessions: sessions.clone(),
            queue: queue.clone(),
        };
        start_health_server(state, &addr, shutdown.clone()).await;
    }

    let ingest = Arc::new(MessageIngest::new(IngestFilter::from_config(&config), queue));
    let handler = RelayHandler::new(
        guild_id,
        config.voice.resident,
        sessions,
        ingest,
        shutdown.clone(),
    );

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received");
                shutdown.cancel();
            }
        });
    }

    discord::run_client(&config.discord.token, handler, songbird, shutdown).await?;

    info!("voice-relay stopped");
    Ok(())
}
