//! HTTP handlers for credentials and session lifecycle.

use crate::AppState;
use axum::{
    extract::{Extension, Json, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use voxrelay_types::SessionKey;
use voxrelay_voice::{RoomCredentials, VoiceError};

/// Query parameters for `GET /token`.
#[derive(Debug, Deserialize)]
pub struct TokenParams {
    #[serde(default)]
    pub identity: String,
    #[serde(default)]
    pub room: String,
}

/// Request body for `POST /start_session`.
#[derive(Debug, Deserialize)]
pub struct StartSessionRequest {
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Synthesis voice for this session's replies.
    #[serde(default)]
    pub voice: Option<String>,
    /// Synthesis model for this session's replies.
    #[serde(default)]
    pub model: Option<String>,
    pub room: String,
    pub identity: String,
}

/// Request body for `POST /stop_session`.
#[derive(Debug, Deserialize)]
pub struct StopSessionRequest {
    pub room: String,
    pub identity: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    fn ok() -> Json<Self> {
        Json(Self {
            status: "ok".to_string(),
        })
    }
}

/// API error type mapping to HTTP status codes.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid input: {0}")]
    BadRequest(String),
    /// The server lacks the settings this endpoint needs.
    #[error("{0}")]
    Configuration(String),
    #[error("internal server error: {0}")]
    InternalServerError(String),
}

impl From<VoiceError> for ApiError {
    fn from(e: VoiceError) -> Self {
        match e {
            VoiceError::Config(msg) => ApiError::Configuration(msg),
            other => ApiError::InternalServerError(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Configuration(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            ApiError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        let body = Json(serde_json::json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

fn session_key(room: String, identity: String) -> Result<SessionKey, ApiError> {
    let key = SessionKey::new(room, identity);
    if key.is_incomplete() {
        return Err(ApiError::BadRequest(
            "room and identity are required".to_string(),
        ));
    }
    Ok(key)
}

/// Handler for `GET /token`.
///
/// Issues a join token for a browser participant together with the room
/// endpoint it is valid for.
pub async fn token_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<TokenParams>,
) -> Result<Json<RoomCredentials>, ApiError> {
    if !state.voice_service.is_enabled() {
        return Err(ApiError::Configuration(
            "LiveKit configuration missing".to_string(),
        ));
    }
    let key = session_key(params.room, params.identity)?;

    let credentials = state
        .voice_service
        .issue_credentials(&key.identity, &key.room)
        .map_err(|e| {
            tracing::error!(session = %key, "failed to issue join token: {}", e);
            ApiError::from(e)
        })?;

    tracing::info!(session = %key, "issued participant token");
    Ok(Json(credentials))
}

/// Handler for `POST /start_session`.
pub async fn start_session_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<StartSessionRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    let key = session_key(payload.room, payload.identity)?;
    state
        .coordinator
        .start_session(key, payload.system_prompt, payload.voice, payload.model);
    Ok(StatusResponse::ok())
}

/// Handler for `POST /stop_session`.
pub async fn stop_session_handler(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<StopSessionRequest>,
) -> Result<Json<StatusResponse>, ApiError> {
    let key = session_key(payload.room, payload.identity)?;
    state.coordinator.stop_session(&key).await;
    Ok(StatusResponse::ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn configuration_error_is_500_with_message() {
        let response = ApiError::from(VoiceError::Config(
            "LiveKit configuration missing".to_string(),
        ))
        .into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_json(response).await["error"],
            "LiveKit configuration missing"
        );
    }

    #[tokio::test]
    async fn bad_request_is_400() {
        let response = session_key("".to_string(), "u1".to_string())
            .unwrap_err()
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(response).await["error"]
            .as_str()
            .unwrap()
            .contains("room and identity"));
    }
}
