//! Control-channel WebSocket handler.
//!
//! One connection carries transcripts in and turn events out for any number
//! of sessions. Each transcript runs as its own task so the receive loop
//! never waits on a turn.
//!
//! When the connection ends, the turns it started are aborted. A session it
//! sent transcripts for is stopped once no other open connection drives it;
//! that also forgets a prompt registered through `/start_session`.

use crate::turn::TurnOutcome;
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Extension, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use voxrelay_types::{InboundMessage, SessionKey};

/// Outbound queue depth per connection.
const OUTBOUND_QUEUE: usize = 256;

/// Handler for `GET /stream`.
pub async fn ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    // Turn tasks write here; a single task owns the socket's send half so
    // events from concurrent turns never interleave mid-frame.
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    tracing::debug!("control channel opened");

    // Sessions this connection drives, with the last turn it started for each.
    let mut sessions: HashMap<SessionKey, Option<JoinHandle<TurnOutcome>>> = HashMap::new();

    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!("control channel read failed: {}", e);
                break;
            }
        };

        match msg {
            Message::Text(text) => handle_text(&state, text.as_str(), &tx, &mut sessions),
            Message::Close(_) => break,
            _ => {}
        }
    }

    let driven = sessions.len();
    for (key, turn) in sessions {
        if let Some(turn) = turn.filter(|turn| !turn.is_finished()) {
            tracing::debug!(session = %key, "aborting turn of closed control channel");
            turn.abort();
        }
        if state.channels.detach(&key) {
            state.coordinator.stop_session(&key).await;
        } else {
            tracing::debug!(session = %key, "session still driven by another control channel");
        }
    }
    send_task.abort();

    tracing::debug!(sessions = driven, "control channel closed");
}

fn handle_text(
    state: &AppState,
    text: &str,
    tx: &mpsc::Sender<String>,
    sessions: &mut HashMap<SessionKey, Option<JoinHandle<TurnOutcome>>>,
) {
    let message = match serde_json::from_str::<InboundMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!("failed to parse control message: {}", e);
            return;
        }
    };

    let InboundMessage::UserTranscript {
        text,
        room,
        identity,
    } = message
    else {
        tracing::debug!("ignoring control message of unknown type");
        return;
    };

    let key = SessionKey::new(room, identity);
    if key.is_incomplete() {
        tracing::warn!(session = %key, "transcript without room or identity, ignoring");
        return;
    }
    if text.len() > state.max_transcript_bytes {
        tracing::warn!(
            session = %key,
            bytes = text.len(),
            limit = state.max_transcript_bytes,
            "transcript too long, ignoring"
        );
        return;
    }
    if text.trim().is_empty() {
        tracing::debug!(session = %key, "empty transcript, ignoring");
        return;
    }

    let slot = sessions.entry(key.clone()).or_insert_with(|| {
        state.channels.attach(&key);
        None
    });
    match state.coordinator.submit(&key, text, tx.clone()) {
        Ok(turn) => *slot = Some(turn),
        Err(e) => tracing::debug!(session = %key, "ignoring transcript: {}", e),
    }
}
