use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use voxrelay_voice::{LiveKitConfig, VoiceError, VoiceService};

const URL: &str = "ws://localhost:7880";
const KEY: &str = "devkey";
const SECRET: &str = "secret";

#[derive(Deserialize)]
struct Claims {
    sub: String,
    iss: String,
    exp: u64,
    nbf: u64,
    video: VideoClaims,
}

#[derive(Deserialize)]
struct VideoClaims {
    room: String,
    #[serde(rename = "roomJoin")]
    room_join: bool,
    #[serde(rename = "canPublish")]
    can_publish: bool,
    #[serde(rename = "canSubscribe")]
    can_subscribe: bool,
}

fn decode_claims(token: &str) -> Claims {
    let validation = Validation::new(Algorithm::HS256);
    let key = DecodingKey::from_secret(SECRET.as_bytes());
    decode::<Claims>(token, &key, &validation)
        .expect("Failed to decode token")
        .claims
}

#[test]
fn test_participant_token_grants_room_access() {
    let service = VoiceService::new(LiveKitConfig::new(URL, KEY, SECRET));

    let creds = service
        .issue_credentials("u1", "r1")
        .expect("Failed to issue credentials");
    assert_eq!(creds.url, URL);

    let claims = decode_claims(&creds.token);
    assert_eq!(claims.sub, "u1");
    assert_eq!(claims.iss, KEY);
    assert_eq!(claims.video.room, "r1");
    assert!(claims.video.room_join, "roomJoin should be true");
    assert!(claims.video.can_publish, "canPublish should be true");
    assert!(claims.video.can_subscribe, "canSubscribe should be true");
}

#[test]
fn test_token_is_time_bounded() {
    let mut config = LiveKitConfig::new(URL, KEY, SECRET);
    config.token_ttl_seconds = 600;
    let service = VoiceService::new(config);

    let token = service
        .generate_join_token("r1", "agent-u1", "agent-u1")
        .expect("Failed to generate token");
    let claims = decode_claims(&token);

    let lifetime = claims.exp - claims.nbf;
    assert!(
        (595..=605).contains(&lifetime),
        "unexpected token lifetime {}",
        lifetime
    );
}

#[test]
fn test_token_signed_with_other_secret_is_rejected() {
    let service = VoiceService::new(LiveKitConfig::new(URL, KEY, "another-secret"));
    let token = service.generate_join_token("r1", "u1", "u1").unwrap();

    let validation = Validation::new(Algorithm::HS256);
    let key = DecodingKey::from_secret(SECRET.as_bytes());
    assert!(decode::<Claims>(&token, &key, &validation).is_err());
}

#[test]
fn test_missing_configuration() {
    for config in [
        LiveKitConfig::new("", KEY, SECRET),
        LiveKitConfig::new(URL, "", SECRET),
        LiveKitConfig::new(URL, KEY, ""),
    ] {
        let service = VoiceService::new(config);
        match service.issue_credentials("u1", "r1") {
            Err(VoiceError::Config(msg)) => assert_eq!(msg, "LiveKit configuration missing"),
            other => panic!("Expected Config error, got {:?}", other),
        }
    }
}

#[test]
fn test_config_from_toml() {
    let config: LiveKitConfig = toml::from_str(
        r#"
        url = "wss://example.livekit.cloud"
        api_key = "key"
        api_secret = "shh"
        "#,
    )
    .unwrap();
    assert!(config.is_complete());
    assert_eq!(config.token_ttl_seconds, 3600);
    assert!(!format!("{:?}", config).contains("shh"));
}
