//! Recording fakes shared by the integration tests.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};

use voice_relay::config::TtsConfig;
use voice_relay::error::{ConnectError, PlaybackError, SynthesisError};
use voice_relay::transcode::PcmStream;
use voice_relay::tts::{SpeechSynthesizer, SynthesizedAudio};
use voice_relay::voice::{
    BackoffPolicy, SessionSettings, SignalSender, VoiceConnection, VoiceConnector, VoiceTarget,
};

pub const GUILD: u64 = 1;
pub const VOICE_CHANNEL: u64 = 20;

pub fn settings() -> SessionSettings {
    SessionSettings {
        voice_channel_id: VOICE_CHANNEL,
        ready_timeout: Duration::from_secs(35),
        liveness_interval: Duration::from_secs(20),
        backoff: BackoffPolicy::default(),
    }
}

/// Poll `cond` on a short sleep until it holds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

/// Everything played on any connection, in order.
#[derive(Default)]
pub struct PlaySink {
    plays: Mutex<Vec<i32>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    fail_next: AtomicU32,
}

impl PlaySink {
    pub fn plays(&self) -> Vec<i32> {
        self.plays.lock().unwrap().clone()
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }
}

/// Recover the id [`FakeSynth`] encoded in the first sample.
fn label(sample: i16) -> i32 {
    (sample as f32 / 100.0).round() as i32
}

/// Join and release order across every connection of one connector.
pub type EventLog = Arc<Mutex<Vec<&'static str>>>;

pub struct FakeConnection {
    sink: Arc<PlaySink>,
    play_time: Duration,
    destroy_time: Duration,
    events: EventLog,
    destroyed: AtomicBool,
}

impl FakeConnection {
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VoiceConnection for FakeConnection {
    async fn play(&self, audio: PcmStream) -> Result<(), PlaybackError> {
        let now = self.sink.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.sink.max_active.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.play_time).await;
        self.sink.active.fetch_sub(1, Ordering::SeqCst);

        let failing = self
            .sink
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PlaybackError::Sink("fake sink error".into()));
        }

        let bytes = audio.into_bytes();
        let first = match bytes.get(..2) {
            Some(b) => i16::from_le_bytes([b[0], b[1]]),
            None => 0,
        };
        self.sink.plays.lock().unwrap().push(label(first));
        Ok(())
    }

    async fn destroy(&self) {
        self.events.lock().unwrap().push("destroy-start");
        if !self.destroy_time.is_zero() {
            tokio::time::sleep(self.destroy_time).await;
        }
        self.destroyed.store(true, Ordering::SeqCst);
        self.events.lock().unwrap().push("destroy-end");
    }
}

pub struct FakeConnector {
    connect_calls: AtomicU32,
    abandon_calls: AtomicU32,
    connect_delay: Duration,
    play_time: Duration,
    destroy_time: Duration,
    panic_next: AtomicBool,
    events: EventLog,
    failures: Mutex<VecDeque<ConnectError>>,
    signals: Mutex<Vec<SignalSender>>,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
    pub sink: Arc<PlaySink>,
}

impl FakeConnector {
    pub fn new(connect_delay: Duration, play_time: Duration) -> Self {
        Self {
            connect_calls: AtomicU32::new(0),
            abandon_calls: AtomicU32::new(0),
            connect_delay,
            play_time,
            destroy_time: Duration::ZERO,
            panic_next: AtomicBool::new(false),
            events: EventLog::default(),
            failures: Mutex::new(VecDeque::new()),
            signals: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
            sink: Arc::new(PlaySink::default()),
        }
    }

    /// Connections take this long to release their call.
    pub fn with_destroy_time(mut self, destroy_time: Duration) -> Self {
        self.destroy_time = destroy_time;
        self
    }

    /// Panic inside the next connect attempt.
    pub fn panic_next(&self) {
        self.panic_next.store(true, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<&'static str> {
        self.events.lock().unwrap().clone()
    }

    /// Fail the next attempts with these errors, in order.
    pub fn fail_with(&self, errors: impl IntoIterator<Item = ConnectError>) {
        self.failures.lock().unwrap().extend(errors);
    }

    pub fn connects(&self) -> u32 {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn abandons(&self) -> u32 {
        self.abandon_calls.load(Ordering::SeqCst)
    }

    /// Signal sender handed out with the n-th successful connect.
    pub fn signals(&self, n: usize) -> SignalSender {
        self.signals.lock().unwrap()[n].clone()
    }

    pub fn connection(&self, n: usize) -> Arc<FakeConnection> {
        self.connections.lock().unwrap()[n].clone()
    }
}

#[async_trait]
impl VoiceConnector for FakeConnector {
    async fn connect(
        &self,
        target: VoiceTarget,
        signals: SignalSender,
    ) -> Result<Arc<dyn VoiceConnection>, ConnectError> {
        assert_eq!(target.channel_id, VOICE_CHANNEL);
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("connector blew up");
        }
        tokio::time::sleep(self.connect_delay).await;

        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }

        let connection = Arc::new(FakeConnection {
            sink: self.sink.clone(),
            play_time: self.play_time,
            destroy_time: self.destroy_time,
            events: self.events.clone(),
            destroyed: AtomicBool::new(false),
        });
        self.events.lock().unwrap().push("join");
        self.signals.lock().unwrap().push(signals);
        self.connections.lock().unwrap().push(connection.clone());
        Ok(connection)
    }

    async fn abandon(&self, _guild_id: u64) {
        self.abandon_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Speaks integer texts: "7" becomes a 10ms 48kHz buffer whose samples
/// all equal 700, which survives the transcoder's passthrough path.
/// The text "panic" panics.
pub struct FakeSynth {
    calls: Mutex<Vec<String>>,
    delay: fn(i32) -> Duration,
}

impl FakeSynth {
    pub fn new(delay: fn(i32) -> Duration) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            delay,
        }
    }

    pub fn instant() -> Self {
        Self::new(|_| Duration::ZERO)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for FakeSynth {
    async fn synthesize(&self, text: &str) -> Result<SynthesizedAudio, SynthesisError> {
        self.calls.lock().unwrap().push(text.to_string());
        if text == "panic" {
            panic!("synthesizer blew up");
        }
        let id: i32 = text.trim().parse().unwrap_or(0);
        tokio::time::sleep((self.delay)(id)).await;

        let sample = (id * 100) as i16;
        let pcm = std::iter::repeat(sample.to_le_bytes()).take(480).flatten().collect();
        Ok(SynthesizedAudio {
            pcm,
            sample_rate: 48_000,
            mime_type: "audio/L16;rate=48000".into(),
        })
    }
}

/// A successful Gemini response carrying `pcm` as camelCase inline data.
pub fn audio_response(pcm: &[u8]) -> Value {
    json!({
        "candidates": [{
            "content": { "parts": [
                { "inlineData": {
                    "mimeType": "audio/L16;codec=pcm;rate=24000",
                    "data": BASE64.encode(pcm),
                } }
            ] },
            "finishReason": "STOP"
        }]
    })
}

/// The "answered with nothing" failure.
pub fn empty_response() -> Value {
    json!({ "candidates": [{ "content": { "parts": [] }, "finishReason": "OTHER" }] })
}

pub fn silence(frames: usize) -> Vec<u8> {
    vec![0u8; frames * 2]
}

#[derive(Clone, Default)]
struct MockState {
    script: Arc<Mutex<VecDeque<(u16, Value)>>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub path: String,
    pub api_key: Option<String>,
    pub body: Value,
}

impl RecordedRequest {
    pub fn prompt(&self) -> &str {
        self.body
            .pointer("/contents/0/parts/0/text")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }
}

/// In-process stand-in for the Gemini API.
pub struct MockGemini {
    pub addr: SocketAddr,
    state: MockState,
}

impl MockGemini {
    /// Serve `script` responses in order; the last one repeats.
    pub async fn start(script: Vec<(u16, Value)>) -> Self {
        let state = MockState::default();
        state.script.lock().unwrap().extend(script);

        let app = Router::new().fallback(handle_generate).with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn config(&self) -> TtsConfig {
        TtsConfig {
            endpoint: format!("http://{}", self.addr),
            api_key: "test-key".into(),
            retry_delay_ms: 10,
            request_timeout_secs: 5,
            ..TtsConfig::default()
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.state.requests.lock().unwrap().clone()
    }
}

async fn handle_generate(
    State(state): State<MockState>,
    uri: axum::http::Uri,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    state.requests.lock().unwrap().push(RecordedRequest {
        path: uri.path().to_string(),
        api_key: headers
            .get("x-goog-api-key")
            .and_then(|v| v.to_str().ok())
            .map(String::from),
        body,
    });

    let mut script = state.script.lock().unwrap();
    let (status, body) = if script.len() > 1 {
        script.pop_front().unwrap()
    } else {
        script.front().cloned().unwrap_or((500, json!({})))
    };
    (StatusCode::from_u16(status).unwrap(), Json(body))
}
