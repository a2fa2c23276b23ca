//! Control-channel message definitions.
//!
//! The browser client and the server exchange small JSON objects tagged by a
//! `type` field. Inbound types the server does not understand deserialize to
//! [`InboundMessage::Unknown`] so newer clients keep working against older
//! servers.

use serde::{Deserialize, Serialize};

use crate::SessionKey;

/// Messages received from the client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum InboundMessage {
    /// The user finished speaking; `text` is the transcript of the utterance.
    #[serde(rename = "user_transcript")]
    UserTranscript {
        #[serde(default)]
        text: String,
        #[serde(default)]
        room: String,
        #[serde(default)]
        identity: String,
    },
    /// Any other message type. Ignored.
    #[serde(other)]
    Unknown,
}

impl InboundMessage {
    /// Session key addressed by a transcript, if this is one.
    pub fn session_key(&self) -> Option<SessionKey> {
        match self {
            Self::UserTranscript { room, identity, .. } => {
                Some(SessionKey::new(room.clone(), identity.clone()))
            }
            Self::Unknown => None,
        }
    }
}

/// Who produced a transcript line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Agent,
    User,
}

/// Messages sent to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlEvent {
    /// The agent started (`true`) or stopped (`false`) working on a reply.
    Thinking { thinking: bool },
    /// A line of conversation to display.
    Transcript { speaker: Speaker, text: String },
}

impl ControlEvent {
    pub fn thinking(thinking: bool) -> Self {
        Self::Thinking { thinking }
    }

    pub fn agent_transcript(text: impl Into<String>) -> Self {
        Self::Transcript {
            speaker: Speaker::Agent,
            text: text.into(),
        }
    }
}
