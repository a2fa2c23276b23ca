use crate::audio::AudioFormat;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

fn default_token_ttl_seconds() -> u64 {
    3600
}

#[derive(Clone, Serialize, Deserialize)]
pub struct LiveKitConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default, skip_serializing)]
    pub api_secret: String,
    /// JWT token TTL in seconds for LiveKit join tokens. Default: 3600 (1 hour).
    #[serde(default = "default_token_ttl_seconds")]
    pub token_ttl_seconds: u64,
}

impl Default for LiveKitConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: String::new(),
            api_secret: String::new(),
            token_ttl_seconds: default_token_ttl_seconds(),
        }
    }
}

impl fmt::Debug for LiveKitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveKitConfig")
            .field("url", &self.url)
            .field("api_key", &self.api_key)
            .field("api_secret", &"[REDACTED]")
            .field("token_ttl_seconds", &self.token_ttl_seconds)
            .finish()
    }
}

impl LiveKitConfig {
    pub fn new(
        url: impl Into<String>,
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            token_ttl_seconds: default_token_ttl_seconds(),
        }
    }

    /// Returns `true` when the endpoint and both credentials are present.
    pub fn is_complete(&self) -> bool {
        !self.url.trim().is_empty()
            && !self.api_key.trim().is_empty()
            && !self.api_secret.trim().is_empty()
    }
}

/// Shape of the outgoing audio track.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Publish sample rate in Hz.
    #[serde(default = "default_publish_rate")]
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub num_channels: u32,
    /// Duration of one published frame.
    #[serde(default = "default_frame_duration_ms")]
    pub frame_duration_ms: u32,
    /// How much audio the room's source may buffer before `capture_frame`
    /// starts applying backpressure.
    #[serde(default = "default_queue_size_ms")]
    pub queue_size_ms: u32,
}

fn default_publish_rate() -> u32 {
    48_000
}

fn default_channels() -> u32 {
    1
}

fn default_frame_duration_ms() -> u32 {
    10
}

fn default_queue_size_ms() -> u32 {
    1000
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_publish_rate(),
            num_channels: default_channels(),
            frame_duration_ms: default_frame_duration_ms(),
            queue_size_ms: default_queue_size_ms(),
        }
    }
}

impl AudioConfig {
    pub fn format(&self) -> AudioFormat {
        AudioFormat::new(self.sample_rate, self.num_channels, self.frame_duration_ms)
    }
}

/// Settings for the ElevenLabs streaming endpoint.
#[derive(Clone, Serialize, Deserialize)]
pub struct ElevenLabsConfig {
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(default = "default_elevenlabs_url")]
    pub base_url: String,
    #[serde(default = "default_voice_id")]
    pub voice_id: String,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    /// PCM rate requested from the backend (`output_format=pcm_<rate>`).
    #[serde(default = "default_elevenlabs_rate")]
    pub sample_rate: u32,
    /// `optimize_streaming_latency` hint, 0 (off) to 4 (most aggressive).
    #[serde(default = "default_latency_hint")]
    pub latency_hint: u8,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Longest silence tolerated between reads of one response, headers
    /// included.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

fn default_elevenlabs_url() -> String {
    "https://api.elevenlabs.io".to_string()
}

fn default_voice_id() -> String {
    // "Rachel", one of the stock voices.
    "21m00Tcm4TlvDq8ikWAM".to_string()
}

fn default_model_id() -> String {
    "eleven_turbo_v2".to_string()
}

fn default_elevenlabs_rate() -> u32 {
    24_000
}

fn default_latency_hint() -> u8 {
    3
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_read_timeout_ms() -> u64 {
    10_000
}

impl Default for ElevenLabsConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: default_elevenlabs_url(),
            voice_id: default_voice_id(),
            model_id: default_model_id(),
            sample_rate: default_elevenlabs_rate(),
            latency_hint: default_latency_hint(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl fmt::Debug for ElevenLabsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElevenLabsConfig")
            .field("api_key", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .field("voice_id", &self.voice_id)
            .field("model_id", &self.model_id)
            .field("sample_rate", &self.sample_rate)
            .field("latency_hint", &self.latency_hint)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("read_timeout_ms", &self.read_timeout_ms)
            .finish()
    }
}

/// Settings for a local piper binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PiperConfig {
    #[serde(default = "default_piper_binary")]
    pub binary: PathBuf,
    #[serde(default = "default_voices_dir")]
    pub voices_dir: PathBuf,
    /// Model file, relative to `voices_dir` or absolute.
    #[serde(default = "default_piper_model")]
    pub model: String,
    #[serde(default)]
    pub config_path: Option<String>,
    #[serde(default)]
    pub speaker_id: Option<u32>,
    /// Speech speed multiplier (1.0 is normal).
    #[serde(default = "default_speed")]
    pub speed: f32,
    /// Native output rate of the model.
    #[serde(default = "default_piper_rate")]
    pub sample_rate: u32,
}

fn default_piper_binary() -> PathBuf {
    PathBuf::from("piper")
}

fn default_voices_dir() -> PathBuf {
    PathBuf::from("assets/voices")
}

fn default_piper_model() -> String {
    "en_US-lessac-medium.onnx".to_string()
}

fn default_speed() -> f32 {
    1.0
}

fn default_piper_rate() -> u32 {
    22_050
}

impl Default for PiperConfig {
    fn default() -> Self {
        Self {
            binary: default_piper_binary(),
            voices_dir: default_voices_dir(),
            model: default_piper_model(),
            config_path: None,
            speaker_id: None,
            speed: default_speed(),
            sample_rate: default_piper_rate(),
        }
    }
}
