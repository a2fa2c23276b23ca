use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("LiveKit token error: {0}")]
    LiveKit(#[from] livekit_api::access_token::AccessTokenError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    /// No synthesis backend is configured or reachable. Callers treat this
    /// as a degraded mode rather than a failure.
    #[error("Speech synthesis unavailable: {0}")]
    SynthesisUnavailable(String),

    /// The synthesis backend failed after it started producing audio.
    #[error("Speech synthesis failed: {0}")]
    Synthesis(String),

    #[error("Room connection error: {0}")]
    Connection(String),

    #[error("No publisher connected for session {0}")]
    NotConnected(String),

    #[error("Audio processing error: {0}")]
    Audio(String),
}

impl VoiceError {
    /// Returns `true` for the degraded-mode condition.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::SynthesisUnavailable(_))
    }
}
