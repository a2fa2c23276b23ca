use crate::config::LiveKitConfig;
use crate::error::VoiceError;
use livekit_api::access_token::{AccessToken, VideoGrants};
use serde::Serialize;
use std::time::Duration;

/// A signed join token together with the endpoint it is valid for.
#[derive(Debug, Clone, Serialize)]
pub struct RoomCredentials {
    pub token: String,
    pub url: String,
}

/// Issues LiveKit access tokens for browser participants and for the agent.
#[derive(Debug)]
pub struct VoiceService {
    config: LiveKitConfig,
}

impl VoiceService {
    pub fn new(config: LiveKitConfig) -> Self {
        Self { config }
    }

    /// Returns `true` when the room endpoint and issuer credentials are set.
    pub fn is_enabled(&self) -> bool {
        self.config.is_complete()
    }

    pub fn get_url(&self) -> &str {
        &self.config.url
    }

    /// Issues a join token for a human participant.
    pub fn issue_credentials(
        &self,
        identity: &str,
        room_name: &str,
    ) -> Result<RoomCredentials, VoiceError> {
        let token = self.generate_join_token(room_name, identity, identity)?;
        Ok(RoomCredentials {
            token,
            url: self.config.url.clone(),
        })
    }

    /// Signs a time-bounded token granting `participant_identity` entry to
    /// `room_name` with publish and subscribe rights.
    pub fn generate_join_token(
        &self,
        room_name: &str,
        participant_identity: &str,
        participant_name: &str,
    ) -> Result<String, VoiceError> {
        if !self.is_enabled() {
            return Err(VoiceError::Config(
                "LiveKit configuration missing".to_string(),
            ));
        }

        let token = AccessToken::with_api_key(&self.config.api_key, &self.config.api_secret)
            .with_identity(participant_identity)
            .with_name(participant_name)
            .with_grants(VideoGrants {
                room_join: true,
                room: room_name.to_string(),
                can_publish: true,
                can_subscribe: true,
                can_publish_data: true,
                ..Default::default()
            })
            .with_ttl(Duration::from_secs(self.config.token_ttl_seconds));

        token.to_jwt().map_err(VoiceError::LiveKit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_credentials_are_a_config_error() {
        let service = VoiceService::new(LiveKitConfig::new("ws://localhost:7880", "", ""));
        assert!(!service.is_enabled());

        match service.issue_credentials("u1", "r1") {
            Err(VoiceError::Config(msg)) => assert!(msg.contains("configuration missing")),
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn credentials_carry_the_room_url() {
        let service =
            VoiceService::new(LiveKitConfig::new("ws://localhost:7880", "devkey", "secret"));
        let creds = service.issue_credentials("u1", "r1").expect("token");
        assert_eq!(creds.url, "ws://localhost:7880");
        assert_eq!(creds.token.split('.').count(), 3, "expected a JWT");
    }
}
