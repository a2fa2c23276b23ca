//! voxrelay server library logic.

pub mod api;
pub mod api_ws;
pub mod config;
pub mod generate;
pub mod sessions;
pub mod turn;

use axum::{
    routing::{get, post},
    Extension, Json, Router,
};
use config::{Config, SynthesisProvider};
use generate::ResponseGenerator;
use serde_json::{json, Value};
use sessions::{ChannelUsage, PromptStore, TurnTracker};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use turn::{SpeechSettings, TurnCoordinator};
use voxrelay_voice::{
    ElevenLabsSynthesizer, MediaRoom, PiperSynthesizer, PublisherRegistry, PublisherSettings,
    SpeechSynthesizer, TrackOptions, VoiceService,
};

/// Application state shared across all request handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Token issuer for browser participants.
    pub voice_service: Arc<VoiceService>,
    /// Prompt store, turn tracker and publishers, plus the turn pipeline.
    pub coordinator: Arc<TurnCoordinator>,
    /// Which control channels drive which sessions.
    pub channels: Arc<ChannelUsage>,
    /// Transcripts longer than this are dropped.
    pub max_transcript_bytes: usize,
}

impl AppState {
    /// Builds the state with the backends named in `config`.
    pub fn from_config(config: &Config) -> Self {
        let voice_service = Arc::new(VoiceService::new(config.livekit.clone()));
        let synthesizer = build_synthesizer(config, voice_service.is_enabled());
        let generator = generate::build_generator(&config.generation);
        Self::with_backends(config, voice_service, default_room(), synthesizer, generator)
    }

    /// Builds the state around explicit backends.
    pub fn with_backends(
        config: &Config,
        voice_service: Arc<VoiceService>,
        room: Arc<dyn MediaRoom>,
        synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
        generator: Arc<dyn ResponseGenerator>,
    ) -> Self {
        let format = config.audio.format();
        let publishers = Arc::new(PublisherRegistry::new(
            voice_service.clone(),
            room,
            PublisherSettings {
                agent_identity_prefix: config.session.agent_identity_prefix.clone(),
                track: TrackOptions {
                    name: config.session.track_name.clone(),
                    format,
                    queue_size_ms: config.audio.queue_size_ms,
                },
                connect_timeout: config.publisher.connect_timeout(),
            },
        ));

        let coordinator = Arc::new(TurnCoordinator::new(
            Arc::new(PromptStore::new(config.session.default_system_prompt.clone())),
            Arc::new(TurnTracker::new()),
            publishers,
            generator,
            synthesizer,
            SpeechSettings {
                format,
                chunk_timeout: config.synthesis.chunk_timeout(),
                latency_hint: config.synthesis.elevenlabs.latency_hint,
            },
        ));

        Self {
            voice_service,
            coordinator,
            channels: Arc::new(ChannelUsage::new()),
            max_transcript_bytes: config.session.max_transcript_bytes,
        }
    }
}

/// Picks the synthesis backend. Any reason the agent cannot speak leaves it
/// text-only instead of failing startup.
fn build_synthesizer(config: &Config, room_enabled: bool) -> Option<Arc<dyn SpeechSynthesizer>> {
    if config.synthesis.provider == SynthesisProvider::None {
        tracing::info!("speech synthesis disabled, replies are text only");
        return None;
    }
    if !room_enabled {
        tracing::warn!("LiveKit configuration missing, replies are text only");
        return None;
    }

    let built = match config.synthesis.provider {
        SynthesisProvider::Elevenlabs => ElevenLabsSynthesizer::new(config.synthesis.elevenlabs.clone())
            .map(|s| Arc::new(s) as Arc<dyn SpeechSynthesizer>),
        SynthesisProvider::Piper => PiperSynthesizer::new(config.synthesis.piper.clone())
            .map(|s| Arc::new(s) as Arc<dyn SpeechSynthesizer>),
        SynthesisProvider::None => return None,
    };

    match built {
        Ok(synthesizer) => {
            tracing::info!(backend = synthesizer.name(), "speech synthesis enabled");
            Some(synthesizer)
        }
        Err(e) => {
            tracing::warn!("speech synthesis unavailable, replies are text only: {}", e);
            None
        }
    }
}

#[cfg(feature = "livekit")]
fn default_room() -> Arc<dyn MediaRoom> {
    Arc::new(voxrelay_voice::LiveKitRoom::new())
}

#[cfg(not(feature = "livekit"))]
fn default_room() -> Arc<dyn MediaRoom> {
    tracing::warn!("built without the `livekit` feature, agent audio goes to a simulated room");
    Arc::new(voxrelay_voice::SimulatedRoom::new())
}

/// Health check handler.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/token", get(api::token_handler))
        .route("/start_session", post(api::start_session_handler))
        .route("/stop_session", post(api::stop_session_handler))
        .route("/stream", get(api_ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
