//! Shared harness for the server integration tests.
//!
//! Spins the full router up on an ephemeral port with test doubles behind
//! the media-room and synthesis seams, and provides small WebSocket helpers.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{stream, SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};
use voxrelay_server::config::Config;
use voxrelay_server::generate::TemplateResponder;
use voxrelay_server::{app, AppState};
use voxrelay_voice::{
    AudioChunkStream, AudioFrame, AudioPublication, LiveKitConfig, MediaRoom, SpeechSynthesizer,
    SynthesisRequest, TrackOptions, VoiceError, VoiceService,
};

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const DEFAULT_PROMPT: &str = "You are a friendly travel assistant.";

/// Counts what the agent does in its rooms.
#[derive(Debug, Default)]
pub struct CountingRoom {
    pub joins: AtomicUsize,
    pub frames: Arc<AtomicUsize>,
    pub closes: Arc<AtomicUsize>,
    pub refuse: bool,
}

#[derive(Debug)]
struct CountingPublication {
    frames: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
    expected_len: usize,
}

#[async_trait]
impl MediaRoom for CountingRoom {
    async fn join(
        &self,
        _endpoint: &str,
        _token: &str,
        track: &TrackOptions,
    ) -> Result<Box<dyn AudioPublication>, VoiceError> {
        if self.refuse {
            return Err(VoiceError::Connection("room refused the agent".into()));
        }
        self.joins.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountingPublication {
            frames: self.frames.clone(),
            closes: self.closes.clone(),
            expected_len: track.format.frame_len(),
        }))
    }
}

#[async_trait]
impl AudioPublication for CountingPublication {
    fn track_sid(&self) -> String {
        "TR_test".to_string()
    }

    async fn capture_frame(&self, frame: &AudioFrame) -> Result<(), VoiceError> {
        assert_eq!(frame.data.len(), self.expected_len, "short frame published");
        self.frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), VoiceError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// What a [`ScriptedSynthesizer`] does once its chunks are out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptEnd {
    Finish,
    /// Never ends, keeping the turn in `Speaking`.
    HoldOpen,
    /// Fails the stream mid-utterance.
    Fail,
}

/// Replays fixed PCM chunks at 24 kHz.
#[derive(Debug, Clone)]
pub struct ScriptedSynthesizer {
    pub chunks: Vec<Vec<u8>>,
    pub end: ScriptEnd,
    /// Never returns from `synthesize` at all.
    pub stall_start: bool,
}

impl ScriptedSynthesizer {
    pub fn new(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            chunks,
            end: ScriptEnd::Finish,
            stall_start: false,
        }
    }

    pub fn held_open(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            end: ScriptEnd::HoldOpen,
            ..Self::new(chunks)
        }
    }

    pub fn failing_after(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            end: ScriptEnd::Fail,
            ..Self::new(chunks)
        }
    }

    pub fn never_starting() -> Self {
        Self {
            stall_start: true,
            ..Self::new(Vec::new())
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for ScriptedSynthesizer {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn source_sample_rate(&self) -> u32 {
        24_000
    }

    fn default_voice(&self) -> &str {
        "test-voice"
    }

    fn default_model(&self) -> &str {
        "test-model"
    }

    async fn synthesize(&self, _request: SynthesisRequest) -> Result<AudioChunkStream, VoiceError> {
        if self.stall_start {
            std::future::pending::<()>().await;
        }
        let chunks: Vec<Result<Bytes, VoiceError>> = self
            .chunks
            .iter()
            .map(|c| Ok(Bytes::from(c.clone())))
            .collect();
        let script = stream::iter(chunks);
        Ok(match self.end {
            ScriptEnd::Finish => script.boxed(),
            ScriptEnd::HoldOpen => script.chain(stream::pending()).boxed(),
            ScriptEnd::Fail => script
                .chain(stream::once(async {
                    Err(VoiceError::Synthesis("backend dropped the stream".into()))
                }))
                .boxed(),
        })
    }
}

/// Backend that is configured but cannot be reached.
#[derive(Debug)]
pub struct UnreachableSynthesizer;

#[async_trait]
impl SpeechSynthesizer for UnreachableSynthesizer {
    fn name(&self) -> &'static str {
        "unreachable"
    }

    fn source_sample_rate(&self) -> u32 {
        24_000
    }

    fn default_voice(&self) -> &str {
        ""
    }

    fn default_model(&self) -> &str {
        ""
    }

    async fn synthesize(&self, _request: SynthesisRequest) -> Result<AudioChunkStream, VoiceError> {
        Err(VoiceError::SynthesisUnavailable("connection refused".into()))
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    pub room: Arc<CountingRoom>,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.livekit = LiveKitConfig::new("ws://localhost:7880", "devkey", "secret");
    config
}

pub async fn spawn_server(
    synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
    room: CountingRoom,
) -> TestServer {
    spawn_server_with(test_config(), synthesizer, room).await
}

pub async fn spawn_server_with(
    config: Config,
    synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
    room: CountingRoom,
) -> TestServer {
    let room = Arc::new(room);
    let state = AppState::with_backends(
        &config,
        Arc::new(VoiceService::new(config.livekit.clone())),
        room.clone(),
        synthesizer,
        Arc::new(TemplateResponder),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    TestServer { addr, state, room }
}

pub async fn connect(server: &TestServer) -> WsClient {
    let (ws, _) = connect_async(format!("ws://{}/stream", server.addr))
        .await
        .expect("Failed to connect");
    ws
}

pub async fn send_json(ws: &mut WsClient, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

pub async fn send_transcript(ws: &mut WsClient, text: &str, room: &str, identity: &str) {
    send_json(
        ws,
        json!({ "type": "user_transcript", "text": text, "room": room, "identity": identity }),
    )
    .await;
}

/// Next JSON event from the server, failing the test after five seconds.
pub async fn next_event(ws: &mut WsClient) -> Value {
    try_next_event(ws, Duration::from_secs(5))
        .await
        .expect("Timed out waiting for a control event")
}

/// Next JSON event, or `None` if nothing arrives within `wait`.
pub async fn try_next_event(ws: &mut WsClient, wait: Duration) -> Option<Value> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let msg = tokio::time::timeout_at(deadline, ws.next()).await.ok()?;
        match msg {
            Some(Ok(Message::Text(text))) => return Some(serde_json::from_str(&text).unwrap()),
            Some(Ok(_)) => continue,
            other => panic!("control channel ended: {:?}", other),
        }
    }
}

/// Collects the three events of a completed text turn.
pub async fn expect_reply(ws: &mut WsClient) -> String {
    let thinking = next_event(ws).await;
    assert_eq!(thinking, json!({ "type": "thinking", "thinking": true }));

    let transcript = next_event(ws).await;
    assert_eq!(transcript["type"], "transcript");
    assert_eq!(transcript["speaker"], "agent");

    let done = next_event(ws).await;
    assert_eq!(done, json!({ "type": "thinking", "thinking": false }));

    transcript["text"].as_str().unwrap().to_string()
}

/// Polls `condition` until it holds, failing the test after five seconds.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("Timed out waiting until {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A 16-bit PCM ramp `samples` long.
pub fn pcm(samples: usize) -> Vec<u8> {
    (0..samples)
        .flat_map(|i| ((i % 1000) as i16).to_le_bytes())
        .collect()
}
