//! Per-session audio publishers.
//!
//! Each [`SessionKey`] owns at most one room connection with one published
//! track. Connections are created lazily by [`PublisherRegistry::ensure_connected`]
//! and live until [`PublisherRegistry::close`].
//!
//! Locking: the slot map sits behind a short `std::sync::Mutex` that is never
//! held across an await. Connection setup for one key is serialized by that
//! key's async gate, so concurrent callers for the same session wait for a
//! single join while other sessions proceed untouched.

use crate::audio::AudioFrame;
use crate::error::VoiceError;
use crate::room::{AudioPublication, MediaRoom, TrackOptions};
use crate::service::VoiceService;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};
use voxrelay_types::SessionKey;

/// How the agent presents itself in a room.
#[derive(Debug, Clone)]
pub struct PublisherSettings {
    /// Prepended to the user's identity to form the agent's identity.
    pub agent_identity_prefix: String,
    pub track: TrackOptions,
    pub connect_timeout: Duration,
}

impl PublisherSettings {
    pub fn agent_identity(&self, key: &SessionKey) -> String {
        format!("{}{}", self.agent_identity_prefix, key.identity)
    }
}

/// Observable connection state of one session's publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherStatus {
    Disconnected,
    Connecting,
    Connected,
}

enum PublisherState {
    Disconnected,
    Connecting,
    Connected(Arc<dyn AudioPublication>),
}

impl PublisherState {
    fn status(&self) -> PublisherStatus {
        match self {
            Self::Disconnected => PublisherStatus::Disconnected,
            Self::Connecting => PublisherStatus::Connecting,
            Self::Connected(_) => PublisherStatus::Connected,
        }
    }
}

struct PublisherSlot {
    /// Serializes connect and close for this key.
    gate: tokio::sync::Mutex<()>,
    state: Mutex<PublisherState>,
}

impl PublisherSlot {
    fn new() -> Self {
        Self {
            gate: tokio::sync::Mutex::new(()),
            state: Mutex::new(PublisherState::Disconnected),
        }
    }

    fn state(&self) -> MutexGuard<'_, PublisherState> {
        // State transitions are single assignments; a poisoned lock still
        // holds a coherent value.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Resets a slot left in `Connecting` when the connecting future is dropped.
struct ConnectingGuard<'a> {
    slot: &'a PublisherSlot,
    armed: bool,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            *self.slot.state() = PublisherState::Disconnected;
        }
    }
}

/// Owns every live publisher, keyed by session.
pub struct PublisherRegistry {
    voice: Arc<VoiceService>,
    room: Arc<dyn MediaRoom>,
    settings: PublisherSettings,
    slots: Mutex<HashMap<SessionKey, Arc<PublisherSlot>>>,
}

impl std::fmt::Debug for PublisherRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublisherRegistry")
            .field("room", &self.room)
            .field("settings", &self.settings)
            .field("sessions", &self.len())
            .finish()
    }
}

impl PublisherRegistry {
    pub fn new(
        voice: Arc<VoiceService>,
        room: Arc<dyn MediaRoom>,
        settings: PublisherSettings,
    ) -> Self {
        Self {
            voice,
            room,
            settings,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &PublisherSettings {
        &self.settings
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<SessionKey, Arc<PublisherSlot>>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slot_for(&self, key: &SessionKey) -> Arc<PublisherSlot> {
        self.slots()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(PublisherSlot::new()))
            .clone()
    }

    fn is_current(&self, key: &SessionKey, slot: &Arc<PublisherSlot>) -> bool {
        self.slots()
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    /// Reserves an empty slot for `key` without connecting.
    pub fn register(&self, key: &SessionKey) {
        self.slot_for(key);
    }

    /// Joins the room and publishes the agent track for `key` unless that
    /// already happened. Concurrent callers for one key share a single join.
    pub async fn ensure_connected(&self, key: &SessionKey) -> Result<(), VoiceError> {
        loop {
            let slot = self.slot_for(key);
            let _gate = slot.gate.lock().await;

            // A close may have replaced the slot while we waited on the gate.
            if !self.is_current(key, &slot) {
                continue;
            }

            {
                let mut state = slot.state();
                if matches!(*state, PublisherState::Connected(_)) {
                    return Ok(());
                }
                *state = PublisherState::Connecting;
            }

            let mut guard = ConnectingGuard {
                slot: &slot,
                armed: true,
            };

            let result = self.connect(key).await;
            guard.armed = false;

            return match result {
                Ok(publication) => {
                    info!(
                        session = %key,
                        track = %publication.track_sid(),
                        "agent publisher connected"
                    );
                    *slot.state() = PublisherState::Connected(publication);
                    Ok(())
                }
                Err(e) => {
                    warn!(session = %key, "agent publisher failed to connect: {}", e);
                    *slot.state() = PublisherState::Disconnected;
                    Err(e)
                }
            };
        }
    }

    async fn connect(&self, key: &SessionKey) -> Result<Arc<dyn AudioPublication>, VoiceError> {
        let identity = self.settings.agent_identity(key);
        let token = self
            .voice
            .generate_join_token(&key.room, &identity, &identity)?;

        let joined = tokio::time::timeout(
            self.settings.connect_timeout,
            self.room
                .join(self.voice.get_url(), &token, &self.settings.track),
        )
        .await
        .map_err(|_| {
            VoiceError::Connection(format!(
                "timed out after {:?} joining room {}",
                self.settings.connect_timeout, key.room
            ))
        })??;

        Ok(Arc::from(joined))
    }

    /// Queues one frame on the session's track, waiting under backpressure.
    pub async fn push_frame(&self, key: &SessionKey, frame: &AudioFrame) -> Result<(), VoiceError> {
        let format = self.settings.track.format;
        if !frame.matches(&format) {
            return Err(VoiceError::Audio(format!(
                "frame of {} samples does not match the publish format ({} samples)",
                frame.data.len(),
                format.frame_len()
            )));
        }

        let publication = {
            let slots = self.slots();
            let slot = slots
                .get(key)
                .ok_or_else(|| VoiceError::NotConnected(key.to_string()))?;
            let state = slot.state();
            match &*state {
                PublisherState::Connected(publication) => Arc::clone(publication),
                _ => return Err(VoiceError::NotConnected(key.to_string())),
            }
        };

        publication.capture_frame(frame).await
    }

    /// Leaves the room for `key` and forgets the session. Unknown keys are a
    /// no-op.
    pub async fn close(&self, key: &SessionKey) {
        let Some(slot) = self.slots().remove(key) else {
            return;
        };

        let _gate = slot.gate.lock().await;
        let previous = std::mem::replace(&mut *slot.state(), PublisherState::Disconnected);
        if let PublisherState::Connected(publication) = previous {
            match publication.close().await {
                Ok(()) => info!(session = %key, "agent publisher closed"),
                Err(e) => warn!(session = %key, "error closing agent publisher: {}", e),
            }
        } else {
            debug!(session = %key, "closed publisher that never connected");
        }
    }

    /// Closes every publisher, used at shutdown.
    pub async fn close_all(&self) {
        let keys: Vec<SessionKey> = self.slots().keys().cloned().collect();
        for key in keys {
            self.close(&key).await;
        }
    }

    pub fn status(&self, key: &SessionKey) -> PublisherStatus {
        match self.slots().get(key) {
            Some(slot) => slot.state().status(),
            None => PublisherStatus::Disconnected,
        }
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
