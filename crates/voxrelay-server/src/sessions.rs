//! Per-session state: registered prompts, in-flight turns and the control
//! channels driving each session.
//!
//! Every registry here is keyed by [`SessionKey`] and guarded by `std::sync`
//! locks. Every acquisition is a brief map operation that never spans an
//! `.await`, so a synchronous lock is safe here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use thiserror::Error;
use tokio::sync::watch;
use voxrelay_types::{SessionKey, TurnPhase};

/// What a session registered through `/start_session`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub system_prompt: String,
    /// Synthesis voice override.
    pub voice: Option<String>,
    /// Synthesis model override.
    pub model: Option<String>,
}

/// Maps sessions to their prompt and voice overrides.
#[derive(Debug)]
pub struct PromptStore {
    default_prompt: String,
    entries: RwLock<HashMap<SessionKey, SessionSettings>>,
}

impl PromptStore {
    pub fn new(default_prompt: impl Into<String>) -> Self {
        Self {
            default_prompt: default_prompt.into(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn default_prompt(&self) -> &str {
        &self.default_prompt
    }

    /// Registers or replaces the session's settings. A blank prompt falls
    /// back to the default.
    pub fn start(
        &self,
        key: SessionKey,
        system_prompt: Option<String>,
        voice: Option<String>,
        model: Option<String>,
    ) {
        let system_prompt = system_prompt
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| self.default_prompt.clone());

        let settings = SessionSettings {
            system_prompt,
            voice: voice.filter(|v| !v.trim().is_empty()),
            model: model.filter(|m| !m.trim().is_empty()),
        };

        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(key, settings);
    }

    /// Forgets the session. Returns whether it was registered.
    pub fn stop(&self, key: &SessionKey) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.remove(key).is_some()
    }

    /// Settings for `key`, or the defaults when it never started.
    pub fn resolve(&self, key: &SessionKey) -> SessionSettings {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(key).cloned().unwrap_or_else(|| SessionSettings {
            system_prompt: self.default_prompt.clone(),
            voice: None,
            model: None,
        })
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TurnError {
    /// A turn is already running for this session.
    #[error("session {0} already has a turn in progress ({1})")]
    Busy(SessionKey, &'static str),
}

#[derive(Debug)]
struct ActiveTurn {
    id: u64,
    phase: TurnPhase,
    cancel: watch::Sender<bool>,
}

/// Tracks the one turn each session may have in flight.
#[derive(Debug, Default)]
pub struct TurnTracker {
    next_id: AtomicU64,
    active: Mutex<HashMap<SessionKey, ActiveTurn>>,
}

impl TurnTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn active(&self) -> MutexGuard<'_, HashMap<SessionKey, ActiveTurn>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Moves the session from `Idle` to `Thinking`.
    ///
    /// The returned guard moves it back to `Idle` when dropped, whichever way
    /// the turn ends.
    pub fn begin(self: &Arc<Self>, key: &SessionKey) -> Result<TurnGuard, TurnError> {
        let mut active = self.active();
        if let Some(turn) = active.get(key) {
            return Err(TurnError::Busy(key.clone(), turn.phase.label()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (cancel, cancelled) = watch::channel(false);
        active.insert(
            key.clone(),
            ActiveTurn {
                id,
                phase: TurnPhase::Thinking,
                cancel,
            },
        );

        Ok(TurnGuard {
            tracker: Arc::clone(self),
            key: key.clone(),
            id,
            cancelled,
        })
    }

    pub fn phase(&self, key: &SessionKey) -> TurnPhase {
        self.active()
            .get(key)
            .map(|turn| turn.phase)
            .unwrap_or_default()
    }

    /// Signals the session's in-flight turn to stop and returns the session
    /// to `Idle` at once, so a new turn may begin while the old one unwinds.
    /// Returns `false` when the session is idle.
    pub fn cancel(&self, key: &SessionKey) -> bool {
        match self.active().remove(key) {
            Some(turn) => {
                turn.cancel.send_replace(true);
                true
            }
            None => false,
        }
    }

    pub fn active_count(&self) -> usize {
        self.active().len()
    }

    fn set_phase(&self, key: &SessionKey, id: u64, phase: TurnPhase) {
        if let Some(turn) = self.active().get_mut(key) {
            if turn.id == id {
                turn.phase = phase;
            }
        }
    }

    fn finish(&self, key: &SessionKey, id: u64) {
        let mut active = self.active();
        if active.get(key).is_some_and(|turn| turn.id == id) {
            active.remove(key);
        }
    }
}

/// Counts the control channels that have sent transcripts for each session.
#[derive(Debug, Default)]
pub struct ChannelUsage {
    channels: Mutex<HashMap<SessionKey, usize>>,
}

impl ChannelUsage {
    pub fn new() -> Self {
        Self::default()
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<SessionKey, usize>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records one more channel driving `key`.
    pub fn attach(&self, key: &SessionKey) {
        *self.channels().entry(key.clone()).or_insert(0) += 1;
    }

    /// Drops one channel's claim on `key`. Returns `true` when no channel
    /// drives the session any more.
    pub fn detach(&self, key: &SessionKey) -> bool {
        let mut channels = self.channels();
        match channels.get_mut(key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            _ => {
                channels.remove(key);
                true
            }
        }
    }

    pub fn count(&self, key: &SessionKey) -> usize {
        self.channels().get(key).copied().unwrap_or(0)
    }
}

/// Ownership of a session's current turn.
#[derive(Debug)]
pub struct TurnGuard {
    tracker: Arc<TurnTracker>,
    key: SessionKey,
    id: u64,
    cancelled: watch::Receiver<bool>,
}

impl TurnGuard {
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn set_phase(&self, phase: TurnPhase) {
        self.tracker.set_phase(&self.key, self.id, phase);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Completes once the turn has been cancelled.
    pub fn cancelled(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.cancelled.clone();
        async move {
            // An Err means the sender is gone, which only happens once the
            // turn was removed; treat that as cancelled too.
            let _ = rx.wait_for(|cancelled| *cancelled).await;
        }
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.tracker.finish(&self.key, self.id);
    }
}
