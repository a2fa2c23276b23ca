use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use voxrelay_voice::{
    ElevenLabsConfig, ElevenLabsSynthesizer, PiperConfig, PiperSynthesizer, SpeechSynthesizer,
    SynthesisRequest, VoiceError,
};

#[derive(Debug, Clone)]
struct Captured {
    voice: String,
    query: HashMap<String, String>,
    api_key: Option<String>,
    body: serde_json::Value,
}

#[derive(Clone, Default)]
struct FakeBackend {
    captured: Arc<Mutex<Option<Captured>>>,
}

async fn stream_pcm(
    State(backend): State<FakeBackend>,
    Path(voice): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Response {
    let api_key = headers
        .get("xi-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    *backend.captured.lock().unwrap() = Some(Captured {
        voice,
        query,
        api_key: api_key.clone(),
        body,
    });

    match api_key.as_deref() {
        Some("good-key") => {}
        Some("broken-key") => return (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response(),
        _ => return StatusCode::UNAUTHORIZED.into_response(),
    }

    // Uneven chunk sizes, one of them empty.
    let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
        Ok(Bytes::from(vec![1u8; 301])),
        Ok(Bytes::new()),
        Ok(Bytes::from(vec![2u8; 1999])),
        Ok(Bytes::from(vec![3u8; 700])),
    ];
    Body::from_stream(stream::iter(chunks)).into_response()
}

async fn spawn_backend() -> (String, FakeBackend) {
    let backend = FakeBackend::default();
    let app = Router::new()
        .route("/v1/text-to-speech/{voice}/stream", post(stream_pcm))
        .with_state(backend.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}", addr), backend)
}

fn config(base_url: &str, api_key: &str) -> ElevenLabsConfig {
    ElevenLabsConfig {
        api_key: api_key.to_string(),
        base_url: base_url.to_string(),
        connect_timeout_secs: 2,
        ..Default::default()
    }
}

fn request(text: &str, synth: &dyn SpeechSynthesizer) -> SynthesisRequest {
    SynthesisRequest {
        text: text.to_string(),
        voice: synth.default_voice().to_string(),
        model: synth.default_model().to_string(),
        sample_rate: synth.source_sample_rate(),
        latency_hint: 3,
    }
}

#[tokio::test]
async fn test_elevenlabs_streams_non_empty_chunks_in_order() {
    let (url, backend) = spawn_backend().await;
    let synth = ElevenLabsSynthesizer::new(config(&url, "good-key")).unwrap();

    let stream = synth
        .synthesize(request("Hello there", &synth))
        .await
        .expect("synthesis should start");
    let chunks: Vec<Bytes> = stream.map(|c| c.unwrap()).collect().await;

    assert!(chunks.iter().all(|c| !c.is_empty()), "empty chunk leaked");
    let joined: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
    assert_eq!(joined.len(), 3000);
    assert!(joined[..301].iter().all(|b| *b == 1));
    assert!(joined[301..2300].iter().all(|b| *b == 2));
    assert!(joined[2300..].iter().all(|b| *b == 3));

    let captured = backend.captured.lock().unwrap().clone().unwrap();
    assert_eq!(captured.voice, "21m00Tcm4TlvDq8ikWAM");
    assert_eq!(captured.api_key.as_deref(), Some("good-key"));
    assert_eq!(captured.query["output_format"], "pcm_24000");
    assert_eq!(captured.query["optimize_streaming_latency"], "3");
    assert_eq!(captured.body["text"], "Hello there");
    assert_eq!(captured.body["model_id"], "eleven_turbo_v2");
}

#[tokio::test]
async fn test_elevenlabs_rejected_key_is_unavailable() {
    let (url, _backend) = spawn_backend().await;
    let synth = ElevenLabsSynthesizer::new(config(&url, "wrong-key")).unwrap();

    let err = synth
        .synthesize(request("Hello", &synth))
        .await
        .err()
        .expect("expected an error");
    assert!(err.is_unavailable(), "got {:?}", err);
}

#[tokio::test]
async fn test_elevenlabs_server_error_is_a_synthesis_failure() {
    let (url, _backend) = spawn_backend().await;
    let synth = ElevenLabsSynthesizer::new(config(&url, "broken-key")).unwrap();

    match synth.synthesize(request("Hello", &synth)).await {
        Err(VoiceError::Synthesis(msg)) => assert!(msg.contains("500"), "{}", msg),
        Err(other) => panic!("Expected Synthesis error, got {:?}", other),
        Ok(_) => panic!("Expected Synthesis error, got a stream"),
    }
}

#[tokio::test]
async fn test_elevenlabs_unreachable_is_unavailable() {
    // Reserve a port, then free it so nothing listens there.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let synth = ElevenLabsSynthesizer::new(config(&format!("http://{}", addr), "good-key")).unwrap();
    let err = synth
        .synthesize(request("Hello", &synth))
        .await
        .err()
        .expect("expected an error");
    assert!(err.is_unavailable(), "got {:?}", err);
}

#[tokio::test]
async fn test_elevenlabs_silent_backend_is_unavailable() {
    // Accepts connections and never answers.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });

    let synth = ElevenLabsSynthesizer::new(ElevenLabsConfig {
        read_timeout_ms: 200,
        ..config(&format!("http://{}", addr), "good-key")
    })
    .unwrap();
    let err = tokio::time::timeout(
        std::time::Duration::from_secs(3),
        synth.synthesize(request("Hello", &synth)),
    )
    .await
    .expect("synthesis waited past its read timeout")
    .err()
    .expect("expected an error");
    assert!(err.is_unavailable(), "got {:?}", err);
}

#[tokio::test]
async fn test_elevenlabs_empty_text_yields_nothing() {
    let (url, backend) = spawn_backend().await;
    let synth = ElevenLabsSynthesizer::new(config(&url, "good-key")).unwrap();

    let stream = synth.synthesize(request("   ", &synth)).await.unwrap();
    assert_eq!(stream.count().await, 0);
    assert!(backend.captured.lock().unwrap().is_none());
}

#[test]
fn test_elevenlabs_requires_api_key() {
    match ElevenLabsSynthesizer::new(config("http://localhost", "  ")) {
        Err(VoiceError::Config(msg)) => assert!(msg.contains("API key")),
        other => panic!("Expected Config error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_piper_missing_model_file() {
    let temp_dir = tempfile::tempdir().unwrap();
    let synth = PiperSynthesizer::new(PiperConfig {
        voices_dir: temp_dir.path().to_path_buf(),
        model: "missing.onnx".to_string(),
        ..Default::default()
    })
    .unwrap();

    match synth.synthesize(request("Hello", &synth)).await {
        Err(VoiceError::SynthesisUnavailable(msg)) => {
            assert!(msg.contains("Model file not found"), "{}", msg)
        }
        Err(other) => panic!("Expected SynthesisUnavailable, got {:?}", other),
        Ok(_) => panic!("Expected SynthesisUnavailable, got a stream"),
    }
}

#[tokio::test]
async fn test_piper_missing_binary() {
    let temp_dir = tempfile::tempdir().unwrap();
    std::fs::File::create(temp_dir.path().join("test.onnx")).unwrap();

    let synth = PiperSynthesizer::new(PiperConfig {
        binary: temp_dir.path().join("no-such-piper"),
        voices_dir: temp_dir.path().to_path_buf(),
        model: "test.onnx".to_string(),
        ..Default::default()
    })
    .unwrap();

    match synth.synthesize(request("Hello", &synth)).await {
        Err(VoiceError::SynthesisUnavailable(msg)) => {
            assert!(msg.contains("Failed to spawn piper"), "{}", msg)
        }
        Err(other) => panic!("Expected SynthesisUnavailable, got {:?}", other),
        Ok(_) => panic!("Expected SynthesisUnavailable, got a stream"),
    }
}

#[test]
fn test_piper_invalid_speed() {
    for speed in [0.0, 10.5] {
        let result = PiperSynthesizer::new(PiperConfig {
            speed,
            ..Default::default()
        });
        match result {
            Err(VoiceError::Config(msg)) => assert!(msg.contains("Speed must be between")),
            other => panic!("Expected Config error for speed {}, got {:?}", speed, other),
        }
    }
}

#[cfg(unix)]
fn fake_piper(dir: &std::path::Path, script: &str) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-piper");
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", script)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[cfg(unix)]
#[tokio::test]
async fn test_piper_streams_stdout() {
    let temp_dir = tempfile::tempdir().unwrap();
    std::fs::File::create(temp_dir.path().join("test.onnx")).unwrap();
    let binary = fake_piper(temp_dir.path(), "cat >/dev/null; head -c 8820 /dev/zero");

    let synth = PiperSynthesizer::new(PiperConfig {
        binary,
        voices_dir: temp_dir.path().to_path_buf(),
        model: "test.onnx".to_string(),
        ..Default::default()
    })
    .unwrap();

    let stream = synth.synthesize(request("Hello", &synth)).await.unwrap();
    let total: usize = stream.map(|c| c.unwrap().len()).fold(0, |a, n| async move { a + n }).await;
    assert_eq!(total, 8820);
}

#[cfg(unix)]
#[tokio::test]
async fn test_piper_failure_surfaces_as_chunk_error() {
    let temp_dir = tempfile::tempdir().unwrap();
    std::fs::File::create(temp_dir.path().join("test.onnx")).unwrap();
    let binary = fake_piper(temp_dir.path(), "cat >/dev/null; exit 3");

    let synth = PiperSynthesizer::new(PiperConfig {
        binary,
        voices_dir: temp_dir.path().to_path_buf(),
        model: "test.onnx".to_string(),
        ..Default::default()
    })
    .unwrap();

    let results: Vec<_> = synth
        .synthesize(request("Hello", &synth))
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(results.len(), 1);
    assert!(matches!(results[0], Err(VoiceError::Synthesis(_))));
}
