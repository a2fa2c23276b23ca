//! Media-room seam.
//!
//! The publisher only needs two things from a media transport: join a room
//! with a published audio track, and feed frames into that track. Both live
//! behind the traits below so the pipeline can run against LiveKit
//! (`livekit` feature), the simulated room, or a test double.

use crate::audio::{AudioFormat, AudioFrame};
use crate::error::VoiceError;
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// The outgoing track to create on join.
#[derive(Debug, Clone)]
pub struct TrackOptions {
    pub name: String,
    pub format: AudioFormat,
    /// Audio the source may queue before capture applies backpressure.
    pub queue_size_ms: u32,
}

/// A media transport the agent can join.
#[async_trait]
pub trait MediaRoom: Send + Sync + fmt::Debug {
    /// Connects to `endpoint` with `token`, creates an audio source shaped
    /// like `track.format`, and publishes a track fed by that source.
    async fn join(
        &self,
        endpoint: &str,
        token: &str,
        track: &TrackOptions,
    ) -> Result<Box<dyn AudioPublication>, VoiceError>;
}

/// A live room connection with one published audio track.
#[async_trait]
pub trait AudioPublication: Send + Sync + fmt::Debug {
    /// Server-assigned id of the published track.
    fn track_sid(&self) -> String;

    /// Queues one frame for playout. Waits while the source buffer is full.
    async fn capture_frame(&self, frame: &AudioFrame) -> Result<(), VoiceError>;

    /// Unpublishes the track and leaves the room.
    async fn close(&self) -> Result<(), VoiceError>;
}

/// A room that consumes frames at real-time pace without any network.
///
/// Used when the binary is built without WebRTC support. Frames are
/// accepted until `queue_size_ms` of audio is queued ahead of the wall
/// clock; beyond that `capture_frame` sleeps, just as a real source would
/// hold the caller back.
#[derive(Debug, Default)]
pub struct SimulatedRoom {
    next_track: AtomicU64,
}

impl SimulatedRoom {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MediaRoom for SimulatedRoom {
    async fn join(
        &self,
        endpoint: &str,
        token: &str,
        track: &TrackOptions,
    ) -> Result<Box<dyn AudioPublication>, VoiceError> {
        info!(
            endpoint = %endpoint,
            track = %track.name,
            "simulated room join with token length {}",
            token.len()
        );

        let n = self.next_track.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Box::new(SimulatedPublication {
            track_sid: format!("TR_sim{}", n),
            queue: Duration::from_millis(u64::from(track.queue_size_ms)),
            playout_end: Mutex::new(None),
        }))
    }
}

#[derive(Debug)]
struct SimulatedPublication {
    track_sid: String,
    queue: Duration,
    /// Wall-clock instant at which the last queued frame finishes playing.
    playout_end: Mutex<Option<Instant>>,
}

#[async_trait]
impl AudioPublication for SimulatedPublication {
    fn track_sid(&self) -> String {
        self.track_sid.clone()
    }

    async fn capture_frame(&self, frame: &AudioFrame) -> Result<(), VoiceError> {
        let wait = {
            let mut end = self
                .playout_end
                .lock()
                .map_err(|_| VoiceError::Connection("simulated track lock poisoned".into()))?;
            let now = Instant::now();
            let start = (*end).filter(|t| *t > now).unwrap_or(now);
            let finish = start + frame.duration();
            *end = Some(finish);
            (finish - now).checked_sub(self.queue)
        };

        if let Some(wait) = wait {
            tokio::time::sleep(wait).await;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), VoiceError> {
        info!(track = %self.track_sid, "simulated room leave");
        Ok(())
    }
}
