//! Shared types for the voxrelay workspace.
//!
//! This crate holds the vocabulary every other crate speaks: the session key
//! that scopes prompts, turns and room publishers, the per-session turn phase,
//! and the JSON messages exchanged over the control channel.
//!
//! It depends on nothing but `serde`, so both the voice pipeline and the
//! server can use it without pulling in each other.

use serde::{Deserialize, Serialize};
use std::fmt;

mod control;
pub use control::{ControlEvent, InboundMessage, Speaker};

/// Identifies one logical conversation: a participant in a room.
///
/// Used as the lookup key for the prompt store, the turn tracker and the
/// publisher registry, so it must stay stable for the session's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey {
    /// Media room name.
    pub room: String,
    /// Identity of the human participant the agent is talking to.
    pub identity: String,
}

impl SessionKey {
    pub fn new(room: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            room: room.into(),
            identity: identity.into(),
        }
    }

    /// Returns `true` when either component is blank.
    pub fn is_incomplete(&self) -> bool {
        self.room.trim().is_empty() || self.identity.trim().is_empty()
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.room, self.identity)
    }
}

/// Where a session currently is in its generate-then-speak cycle.
///
/// Transitions are strictly `Idle -> Thinking -> Speaking -> Idle`; any failure
/// jumps straight back to `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnPhase {
    /// No turn in flight; the next transcript is accepted.
    #[default]
    Idle,
    /// A response is being generated.
    Thinking,
    /// The response text was delivered and audio is being published.
    Speaking,
}

impl TurnPhase {
    /// Returns the string label for this phase.
    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
        }
    }
}
