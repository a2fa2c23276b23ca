//! LiveKit-backed media room.

use crate::audio::AudioFrame;
use crate::error::VoiceError;
use crate::room::{AudioPublication, MediaRoom, TrackOptions};
use async_trait::async_trait;
use livekit::options::TrackPublishOptions;
use livekit::prelude::{LocalAudioTrack, LocalTrack, Room, RoomOptions, TrackSource};
use livekit::webrtc::audio_frame::AudioFrame as RtcAudioFrame;
use livekit::webrtc::audio_source::native::NativeAudioSource;
use livekit::webrtc::audio_source::{AudioSourceOptions, RtcAudioSource};
use std::borrow::Cow;
use std::fmt;
use tracing::{debug, info};

/// Joins LiveKit rooms over WebRTC.
#[derive(Debug, Default)]
pub struct LiveKitRoom;

impl LiveKitRoom {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaRoom for LiveKitRoom {
    async fn join(
        &self,
        endpoint: &str,
        token: &str,
        track: &TrackOptions,
    ) -> Result<Box<dyn AudioPublication>, VoiceError> {
        let (room, mut events) = Room::connect(endpoint, token, RoomOptions::default())
            .await
            .map_err(|e| VoiceError::Connection(format!("failed to join room: {}", e)))?;

        // The event channel is unbounded; keep it drained.
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                debug!(?event, "room event");
            }
        });

        let source = NativeAudioSource::new(
            AudioSourceOptions::default(),
            track.format.sample_rate,
            track.format.num_channels,
            track.queue_size_ms,
        );
        let local_track = LocalAudioTrack::create_audio_track(
            &track.name,
            RtcAudioSource::Native(source.clone()),
        );

        let publication = room
            .local_participant()
            .publish_track(
                LocalTrack::Audio(local_track),
                TrackPublishOptions {
                    source: TrackSource::Microphone,
                    ..Default::default()
                },
            )
            .await;

        let publication = match publication {
            Ok(p) => p,
            Err(e) => {
                let _ = room.close().await;
                return Err(VoiceError::Connection(format!(
                    "failed to publish audio track: {}",
                    e
                )));
            }
        };

        let track_sid = publication.sid().to_string();
        info!(room = %room.name(), track = %track_sid, "published agent audio track");

        Ok(Box::new(LiveKitPublication {
            room,
            source,
            track_sid,
        }))
    }
}

struct LiveKitPublication {
    room: Room,
    source: NativeAudioSource,
    track_sid: String,
}

impl fmt::Debug for LiveKitPublication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveKitPublication")
            .field("room", &self.room.name())
            .field("track_sid", &self.track_sid)
            .finish()
    }
}

#[async_trait]
impl AudioPublication for LiveKitPublication {
    fn track_sid(&self) -> String {
        self.track_sid.clone()
    }

    async fn capture_frame(&self, frame: &AudioFrame) -> Result<(), VoiceError> {
        let rtc_frame = RtcAudioFrame {
            data: Cow::Borrowed(&frame.data),
            sample_rate: frame.sample_rate,
            num_channels: frame.num_channels,
            samples_per_channel: frame.samples_per_channel,
        };
        self.source
            .capture_frame(&rtc_frame)
            .await
            .map_err(|e| VoiceError::Connection(format!("capture_frame failed: {}", e)))
    }

    async fn close(&self) -> Result<(), VoiceError> {
        self.room
            .close()
            .await
            .map_err(|e| VoiceError::Connection(format!("failed to leave room: {}", e)))
    }
}
