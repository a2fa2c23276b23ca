//! Voice pipeline for the voxrelay agent.
//!
//! Issues LiveKit access tokens, turns streamed text-to-speech output into
//! fixed-size 48 kHz frames, and publishes those frames into a media room
//! as a virtual participant.
//!
//! The flow for one utterance is:
//!
//! 1. a [`SpeechSynthesizer`] yields raw PCM byte chunks as the backend
//!    produces them;
//! 2. a [`FramePipeline`] resamples each chunk to the publish rate and cuts it
//!    into exact-size [`AudioFrame`]s;
//! 3. the [`PublisherRegistry`] lazily joins the room for the session and
//!    pushes each frame onto the session's live audio track.
//!
//! The media room itself sits behind the [`MediaRoom`] seam. With the
//! `livekit` feature it is a real LiveKit room; without it a
//! [`SimulatedRoom`] consumes frames at real-time pace.

pub mod audio;
pub mod config;
pub mod error;
pub mod publisher;
pub mod room;
#[cfg(feature = "livekit")]
pub mod rtc;
pub mod service;
pub mod tts;

pub use audio::{AudioFormat, AudioFrame, FramePipeline, Framer, Resampler};
pub use config::{AudioConfig, ElevenLabsConfig, LiveKitConfig, PiperConfig};
pub use error::VoiceError;
pub use publisher::{PublisherRegistry, PublisherSettings, PublisherStatus};
pub use room::{AudioPublication, MediaRoom, SimulatedRoom, TrackOptions};
#[cfg(feature = "livekit")]
pub use rtc::LiveKitRoom;
pub use service::{RoomCredentials, VoiceService};
pub use tts::{
    AudioChunkStream, ElevenLabsSynthesizer, PiperSynthesizer, SpeechSynthesizer,
    SynthesisRequest,
};
