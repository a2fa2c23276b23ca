//! Streaming text-to-speech adapters.
//!
//! A [`SpeechSynthesizer`] turns one utterance into an [`AudioChunkStream`]:
//! raw little-endian 16-bit PCM at [`SpeechSynthesizer::source_sample_rate`],
//! interleaved over [`SpeechSynthesizer::source_channels`] and delivered in
//! generation order as the backend produces it. Chunks are not
//! framed and may be any size; empty chunks never reach the consumer.
//!
//! The stream has a single consumer and can be dropped at any point. Dropping
//! it closes the HTTP response body or kills the child process, so a cancelled
//! turn leaves nothing running behind it.

use crate::config::{ElevenLabsConfig, PiperConfig};
use crate::error::VoiceError;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdout, Command};

/// Maximum text input size for TTS (64 KiB). Prevents resource exhaustion from
/// oversized synthesis requests.
const MAX_TTS_INPUT_BYTES: usize = 64 * 1024;

/// Read size for piper's stdout.
const PIPER_READ_CHUNK: usize = 4096;

/// Lazily produced PCM chunks.
pub type AudioChunkStream = BoxStream<'static, Result<Bytes, VoiceError>>;

/// Everything a backend needs to render one utterance.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    pub text: String,
    /// Backend-specific voice selector (voice id, speaker index, ...).
    pub voice: String,
    /// Backend-specific model selector.
    pub model: String,
    /// PCM rate the backend should produce.
    pub sample_rate: u32,
    /// Streaming latency hint, 0 (quality) to 4 (fastest first byte).
    pub latency_hint: u8,
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync + fmt::Debug {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Rate of the PCM this backend emits.
    fn source_sample_rate(&self) -> u32;

    /// Interleaved channels in the PCM this backend emits.
    fn source_channels(&self) -> u32 {
        1
    }

    /// Default voice and model when the session does not pick its own.
    fn default_voice(&self) -> &str;
    fn default_model(&self) -> &str;

    /// Starts synthesis. Returns [`VoiceError::SynthesisUnavailable`] when the
    /// backend is unconfigured or unreachable; nothing is yielded in that case.
    async fn synthesize(&self, request: SynthesisRequest) -> Result<AudioChunkStream, VoiceError>;
}

fn check_text(text: &str) -> Result<(), VoiceError> {
    if text.len() > MAX_TTS_INPUT_BYTES {
        return Err(VoiceError::Synthesis(format!(
            "text exceeds maximum size: {} bytes (limit: {} bytes)",
            text.len(),
            MAX_TTS_INPUT_BYTES
        )));
    }
    Ok(())
}

/// Drops empty chunks and boxes the stream.
pub fn non_empty_chunks<S>(chunks: S) -> AudioChunkStream
where
    S: futures_util::Stream<Item = Result<Bytes, VoiceError>> + Send + 'static,
{
    chunks
        .try_filter(|chunk| futures_util::future::ready(!chunk.is_empty()))
        .boxed()
}

/// ElevenLabs streaming synthesis over HTTP.
pub struct ElevenLabsSynthesizer {
    client: reqwest::Client,
    config: ElevenLabsConfig,
}

impl fmt::Debug for ElevenLabsSynthesizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElevenLabsSynthesizer")
            .field("config", &self.config)
            .finish()
    }
}

#[derive(Serialize)]
struct ElevenLabsBody<'a> {
    text: &'a str,
    model_id: &'a str,
}

impl ElevenLabsSynthesizer {
    /// Fails with [`VoiceError::Config`] when no API key is configured.
    pub fn new(config: ElevenLabsConfig) -> Result<Self, VoiceError> {
        if config.api_key.trim().is_empty() {
            return Err(VoiceError::Config(
                "ElevenLabs API key is not configured".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .read_timeout(Duration::from_millis(config.read_timeout_ms))
            .build()
            .map_err(|e| VoiceError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    fn stream_url(&self, voice: &str) -> String {
        format!(
            "{}/v1/text-to-speech/{}/stream",
            self.config.base_url.trim_end_matches('/'),
            voice
        )
    }
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsSynthesizer {
    fn name(&self) -> &'static str {
        "elevenlabs"
    }

    fn source_sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    fn default_voice(&self) -> &str {
        &self.config.voice_id
    }

    fn default_model(&self) -> &str {
        &self.config.model_id
    }

    async fn synthesize(&self, request: SynthesisRequest) -> Result<AudioChunkStream, VoiceError> {
        check_text(&request.text)?;
        if request.text.trim().is_empty() {
            return Ok(stream::empty().boxed());
        }

        let header_wait = Duration::from_millis(self.config.read_timeout_ms);
        let sent = self
            .client
            .post(self.stream_url(&request.voice))
            .query(&[
                (
                    "optimize_streaming_latency",
                    request.latency_hint.min(4).to_string(),
                ),
                ("output_format", format!("pcm_{}", request.sample_rate)),
            ])
            .header("xi-api-key", &self.config.api_key)
            .json(&ElevenLabsBody {
                text: &request.text,
                model_id: &request.model,
            })
            .send();
        let response = tokio::time::timeout(header_wait, sent)
            .await
            .map_err(|_| {
                VoiceError::SynthesisUnavailable(format!(
                    "ElevenLabs sent no response within {:?}",
                    header_wait
                ))
            })?
            .map_err(|e| {
                if e.is_connect() || e.is_timeout() {
                    VoiceError::SynthesisUnavailable(format!("ElevenLabs unreachable: {}", e))
                } else {
                    VoiceError::Synthesis(format!("ElevenLabs request failed: {}", e))
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(VoiceError::SynthesisUnavailable(format!(
                "ElevenLabs rejected the API key ({})",
                status
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::Synthesis(format!(
                "ElevenLabs returned {}: {}",
                status, body
            )));
        }

        Ok(non_empty_chunks(response.bytes_stream().map_err(|e| {
            VoiceError::Synthesis(format!("ElevenLabs stream interrupted: {}", e))
        })))
    }
}

/// Local synthesis through a piper binary writing raw PCM to stdout.
#[derive(Debug, Clone)]
pub struct PiperSynthesizer {
    config: PiperConfig,
}

impl PiperSynthesizer {
    pub fn new(config: PiperConfig) -> Result<Self, VoiceError> {
        if config.speed < 0.1 || config.speed > 10.0 {
            return Err(VoiceError::Config(
                "Speed must be between 0.1 and 10.0".to_string(),
            ));
        }
        Ok(Self { config })
    }

    fn resolve(&self, path: &str) -> PathBuf {
        if Path::new(path).is_absolute() {
            PathBuf::from(path)
        } else {
            self.config.voices_dir.join(path)
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for PiperSynthesizer {
    fn name(&self) -> &'static str {
        "piper"
    }

    fn source_sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    fn default_voice(&self) -> &str {
        ""
    }

    fn default_model(&self) -> &str {
        &self.config.model
    }

    async fn synthesize(&self, request: SynthesisRequest) -> Result<AudioChunkStream, VoiceError> {
        check_text(&request.text)?;
        if request.text.trim().is_empty() {
            return Ok(stream::empty().boxed());
        }

        let model = if request.model.is_empty() {
            &self.config.model
        } else {
            &request.model
        };
        let model_path = self.resolve(model);
        if !model_path.exists() {
            return Err(VoiceError::SynthesisUnavailable(format!(
                "Model file not found: {:?}",
                model_path
            )));
        }

        let mut command = Command::new(&self.config.binary);
        command
            .arg("--model")
            .arg(model_path)
            .arg("--output_raw")
            // Length scale is the inverse of speed.
            .arg("--length_scale")
            .arg((1.0 / self.config.speed).to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        if let Some(config) = &self.config.config_path {
            command.arg("--config").arg(self.resolve(config));
        }

        // A numeric voice selects a speaker within a multi-speaker model.
        let speaker = request.voice.parse::<u32>().ok().or(self.config.speaker_id);
        if let Some(speaker) = speaker {
            command.arg("--speaker").arg(speaker.to_string());
        }

        let mut child = command.spawn().map_err(|e| {
            VoiceError::SynthesisUnavailable(format!("Failed to spawn piper: {}", e))
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| VoiceError::Synthesis("Failed to open stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| VoiceError::Synthesis("Failed to open stdout".to_string()))?;

        // Written from a separate task so a full stdout pipe cannot deadlock us.
        let text = format!("{}\n", request.text);
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(text.as_bytes()).await {
                tracing::warn!("failed to write to piper stdin: {}", e);
            }
        });

        Ok(non_empty_chunks(piper_output(child, stdout)))
    }
}

fn piper_output(
    child: Child,
    stdout: ChildStdout,
) -> impl futures_util::Stream<Item = Result<Bytes, VoiceError>> + Send + 'static {
    stream::unfold(Some((child, stdout)), |state| async move {
        let (mut child, mut stdout) = state?;
        let mut buf = vec![0u8; PIPER_READ_CHUNK];
        match stdout.read(&mut buf).await {
            Ok(0) => match child.wait().await {
                Ok(status) if status.success() => None,
                Ok(status) => Some((
                    Err(VoiceError::Synthesis(format!("piper exited with {}", status))),
                    None,
                )),
                Err(e) => Some((
                    Err(VoiceError::Synthesis(format!("Failed to wait for piper: {}", e))),
                    None,
                )),
            },
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(Bytes::from(buf)), Some((child, stdout))))
            }
            Err(e) => Some((
                Err(VoiceError::Synthesis(format!("Failed to read piper output: {}", e))),
                None,
            )),
        }
    })
}
