//! Liveness HTTP endpoint for hosting platforms.
//!
//! `/` and `/healthz` answer a fixed `OK`; `/status` reports the voice
//! session and queue as JSON. Failing to bind is logged, never fatal.

use std::net::SocketAddr;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::queue::{QueueStats, SpeechQueue};
use crate::voice::{PlayerStatus, SessionSnapshot, SlotStatus, VoiceSessionManager};

#[derive(Clone)]
pub struct HealthState {
    pub guild_id: u64,
    pub sessions: VoiceSessionManager,
    pub queue: SpeechQueue,
}

#[derive(Serialize)]
struct StatusResponse {
    guild_id: u64,
    session: SessionSnapshot,
    connecting: bool,
    player: PlayerStatus,
    queue_pending: usize,
    draining: bool,
    queue: QueueStats,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/", get(handle_ok))
        .route("/healthz", get(handle_ok))
        .route("/status", get(handle_status))
        .with_state(state)
}

async fn handle_ok() -> &'static str {
    "OK"
}

async fn handle_status(State(state): State<HealthState>) -> Json<StatusResponse> {
    let session = state.sessions.snapshot(state.guild_id);
    Json(StatusResponse {
        guild_id: state.guild_id,
        connecting: session.status == SlotStatus::Connecting,
        session,
        player: state.sessions.player(state.guild_id).status(),
        queue_pending: state.queue.pending(),
        draining: state.queue.is_draining(),
        queue: state.queue.stats(),
    })
}

/// Bind `addr` and serve until `shutdown` fires. Returns the bound address.
pub async fn start_health_server(
    state: HealthState,
    addr: &str,
    shutdown: CancellationToken,
) -> Option<SocketAddr> {
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            warn!("Failed to bind health server on {addr}: {e}");
            return None;
        }
    };
    let local = listener.local_addr().ok();
    info!("Health server listening on {addr}");

    let app = router(state);
    tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            warn!("Health server error: {e}");
        }
    });
    local
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::config::Config;
    use crate::error::{ConnectError, SynthesisError};
    use crate::queue::QueuePolicy;
    use crate::transcode::Transcoder;
    use crate::tts::{SpeechSynthesizer, SynthesizedAudio};
    use crate::voice::{SessionSettings, SignalSender, VoiceConnection, VoiceConnector, VoiceTarget};

    struct Unreachable;

    #[async_trait]
    impl VoiceConnector for Unreachable {
        async fn connect(
            &self,
            target: VoiceTarget,
            _signals: SignalSender,
        ) -> Result<Arc<dyn VoiceConnection>, ConnectError> {
            Err(ConnectError::ChannelNotFound(target.channel_id))
        }

        async fn abandon(&self, _guild_id: u64) {}
    }

    #[async_trait]
    impl SpeechSynthesizer for Unreachable {
        async fn synthesize(&self, _text: &str) -> Result<SynthesizedAudio, SynthesisError> {
            Err(SynthesisError::MissingAudio { finish_reason: None })
        }
    }

    fn state() -> HealthState {
        let sessions = VoiceSessionManager::new(
            Arc::new(Unreachable),
            SessionSettings::from_config(&Config::default()),
        );
        let queue = SpeechQueue::new(
            sessions.clone(),
            Arc::new(Unreachable),
            Transcoder::new(),
            QueuePolicy::default(),
        );
        HealthState {
            guild_id: 99,
            sessions,
            queue,
        }
    }

    #[tokio::test]
    async fn serves_ok_and_status() {
        let shutdown = CancellationToken::new();
        let addr = start_health_server(state(), "127.0.0.1:0", shutdown.clone())
            .await
            .expect("bind");

        let body = reqwest::get(format!("http://{addr}/")).await.unwrap().text().await.unwrap();
        assert_eq!(body, "OK");
        let body = reqwest::get(format!("http://{addr}/healthz")).await.unwrap().text().await.unwrap();
        assert_eq!(body, "OK");

        let status: serde_json::Value = reqwest::get(format!("http://{addr}/status"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["guild_id"], 99);
        assert_eq!(status["session"]["status"], "no_session");
        assert_eq!(status["connecting"], false);
        assert_eq!(status["player"], "idle");
        assert_eq!(status["queue_pending"], 0);
        assert_eq!(status["draining"], false);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn bind_failure_is_not_fatal() {
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        assert!(start_health_server(state(), &addr, CancellationToken::new()).await.is_none());
    }
}
