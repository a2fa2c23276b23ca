//! Server configuration loading from file and environment variables.

use serde::Deserialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;
use voxrelay_voice::{AudioConfig, ElevenLabsConfig, LiveKitConfig, PiperConfig};

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Media room endpoint and token issuer credentials.
    #[serde(default)]
    pub livekit: LiveKitConfig,

    /// Conversation defaults.
    #[serde(default)]
    pub session: SessionConfig,

    /// Speech synthesis backend.
    #[serde(default)]
    pub synthesis: SynthesisConfig,

    /// Shape of the published audio track.
    #[serde(default)]
    pub audio: AudioConfig,

    /// Agent room connection settings.
    #[serde(default)]
    pub publisher: PublisherConfig,

    /// Response generation backend.
    #[serde(default)]
    pub generation: GenerationConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "voxrelay_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Prompt used for sessions that never called `/start_session`.
    #[serde(default = "default_system_prompt")]
    pub default_system_prompt: String,

    /// The agent joins rooms as `<prefix><user identity>`.
    #[serde(default = "default_agent_identity_prefix")]
    pub agent_identity_prefix: String,

    /// Name of the agent's published audio track.
    #[serde(default = "default_track_name")]
    pub track_name: String,

    /// Transcripts longer than this are dropped.
    #[serde(default = "default_max_transcript_bytes")]
    pub max_transcript_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SynthesisProvider {
    #[default]
    Elevenlabs,
    Piper,
    /// Text-only replies.
    None,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SynthesisConfig {
    #[serde(default)]
    pub provider: SynthesisProvider,

    /// Longest wait for the next audio chunk before the turn gives up on audio.
    #[serde(default = "default_chunk_timeout_ms")]
    pub chunk_timeout_ms: u64,

    #[serde(default)]
    pub elevenlabs: ElevenLabsConfig,

    #[serde(default)]
    pub piper: PiperConfig,
}

impl SynthesisConfig {
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublisherConfig {
    /// Bound on joining the room and publishing the agent track.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl PublisherConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationProvider {
    /// Canned reply that echoes the prompt and the user's words.
    #[default]
    Template,
    /// OpenAI-compatible chat completions endpoint.
    Openai,
}

#[derive(Clone, Deserialize)]
pub struct GenerationConfig {
    #[serde(default)]
    pub provider: GenerationProvider,

    #[serde(default = "default_generation_url")]
    pub base_url: String,

    #[serde(default = "default_generation_model")]
    pub model: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_generation_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

impl fmt::Debug for GenerationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationConfig")
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("api_key", &"[REDACTED]")
            .field("timeout_secs", &self.timeout_secs)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    8000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_system_prompt() -> String {
    "You are a friendly travel assistant.".to_string()
}

fn default_agent_identity_prefix() -> String {
    "agent-".to_string()
}

fn default_track_name() -> String {
    "agent-voice".to_string()
}

fn default_max_transcript_bytes() -> usize {
    4096
}

fn default_chunk_timeout_ms() -> u64 {
    10_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_generation_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_generation_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_generation_timeout_secs() -> u64 {
    30
}

fn default_max_tokens() -> u32 {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_system_prompt: default_system_prompt(),
            agent_identity_prefix: default_agent_identity_prefix(),
            track_name: default_track_name(),
            max_transcript_bytes: default_max_transcript_bytes(),
        }
    }
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            provider: SynthesisProvider::default(),
            chunk_timeout_ms: default_chunk_timeout_ms(),
            elevenlabs: ElevenLabsConfig::default(),
            piper: PiperConfig::default(),
        }
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: GenerationProvider::default(),
            base_url: default_generation_url(),
            model: default_generation_model(),
            api_key: String::new(),
            timeout_secs: default_generation_timeout_secs(),
            max_tokens: default_max_tokens(),
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `VOXRELAY_HOST` overrides `server.host`
/// - `VOXRELAY_PORT` overrides `server.port`
/// - `VOXRELAY_LOG_LEVEL` overrides `logging.level`
/// - `VOXRELAY_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `LIVEKIT_URL`, `LIVEKIT_API_KEY`, `LIVEKIT_API_SECRET` override `livekit.*`
/// - `SYSTEM_PROMPT` overrides `session.default_system_prompt`
/// - `ELEVENLABS_API_KEY` overrides `synthesis.elevenlabs.api_key`
/// - `OPENAI_API_KEY` overrides `generation.api_key`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |name| std::env::var(name).ok());
    Ok(config)
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(host) = var("VOXRELAY_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Some(port) = var("VOXRELAY_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Some(level) = var("VOXRELAY_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("VOXRELAY_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(url) = var("LIVEKIT_URL") {
        config.livekit.url = url;
    }
    if let Some(key) = var("LIVEKIT_API_KEY") {
        config.livekit.api_key = key;
    }
    if let Some(secret) = var("LIVEKIT_API_SECRET") {
        config.livekit.api_secret = secret;
    }
    if let Some(prompt) = var("SYSTEM_PROMPT") {
        config.session.default_system_prompt = prompt;
    }
    if let Some(key) = var("ELEVENLABS_API_KEY") {
        config.synthesis.elevenlabs.api_key = key;
    }
    if let Some(key) = var("OPENAI_API_KEY") {
        config.generation.api_key = key;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn defaults_without_file() {
        let config = load_config(Some("/definitely/not/here.toml")).unwrap();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.audio.sample_rate, 48_000);
        assert_eq!(config.audio.frame_duration_ms, 10);
        assert_eq!(config.synthesis.provider, SynthesisProvider::Elevenlabs);
        assert_eq!(config.generation.provider, GenerationProvider::Template);
        assert_eq!(config.publisher.connect_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn parses_sections_from_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
port = 9100

[livekit]
url = "ws://lk:7880"
api_key = "devkey"
api_secret = "secret"

[session]
default_system_prompt = "Be brief."
agent_identity_prefix = "bot-"

[synthesis]
provider = "piper"
chunk_timeout_ms = 2500

[synthesis.piper]
sample_rate = 16000

[generation]
provider = "openai"
model = "small-model"
"#
        )
        .unwrap();

        let config = load_config(file.path().to_str()).unwrap();
        assert_eq!(config.server.port, 9100);
        assert!(config.livekit.is_complete());
        assert_eq!(config.session.default_system_prompt, "Be brief.");
        assert_eq!(config.session.agent_identity_prefix, "bot-");
        assert_eq!(config.session.track_name, "agent-voice");
        assert_eq!(config.synthesis.provider, SynthesisProvider::Piper);
        assert_eq!(config.synthesis.chunk_timeout(), Duration::from_millis(2500));
        assert_eq!(config.synthesis.piper.sample_rate, 16_000);
        assert_eq!(config.generation.provider, GenerationProvider::Openai);
        assert_eq!(config.generation.model, "small-model");
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server\nport = ").unwrap();
        assert!(matches!(
            load_config(file.path().to_str()),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("VOXRELAY_PORT", "9999"),
            ("VOXRELAY_LOG_JSON", "1"),
            ("LIVEKIT_URL", "wss://cloud"),
            ("LIVEKIT_API_KEY", "k"),
            ("LIVEKIT_API_SECRET", "s"),
            ("SYSTEM_PROMPT", "You are a pirate."),
            ("ELEVENLABS_API_KEY", "xi"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        apply_env_overrides(&mut config, |name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.server.port, 9999);
        assert!(config.logging.json);
        assert!(config.livekit.is_complete());
        assert_eq!(config.session.default_system_prompt, "You are a pirate.");
        assert_eq!(config.synthesis.elevenlabs.api_key, "xi");
        assert!(config.generation.api_key.is_empty());
    }

    #[test]
    fn secrets_are_redacted() {
        let mut config = Config::default();
        config.generation.api_key = "sk-hidden".to_string();
        config.livekit.api_secret = "lk-hidden".to_string();
        config.synthesis.elevenlabs.api_key = "xi-hidden".to_string();

        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("hidden"));
    }
}
