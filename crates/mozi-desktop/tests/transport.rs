//! End-to-end transport tests over a real listener on 127.0.0.1:0.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use mozi_channels::{ChannelAdapter, ChannelEvent, EventSink};
use mozi_core::config::schema::LocalDesktopConfig;
use mozi_core::text::to_base64;
use mozi_core::types::{OutboundMessage, Phase};
use mozi_desktop::DesktopTransport;
use mozi_media::{MediaError, SttEngine, TtsAudio, TtsEngine};

struct StubStt;

#[async_trait]
impl SttEngine for StubStt {
    async fn transcribe(&self, wav: Vec<u8>) -> Result<String, MediaError> {
        // The transport must hand us a well-formed WAV container.
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        Ok("hello from speech".to_string())
    }
}

struct FailingStt;

#[async_trait]
impl SttEngine for FailingStt {
    async fn transcribe(&self, _wav: Vec<u8>) -> Result<String, MediaError> {
        Err(MediaError::Stt("vendor exploded".into()))
    }
}

struct StubTts;

#[async_trait]
impl TtsEngine for StubTts {
    async fn synthesize(&self, text: &str, voice: Option<&str>) -> Result<TtsAudio, MediaError> {
        Ok(TtsAudio {
            bytes: text.as_bytes().repeat(100),
            mime_type: "audio/mpeg".into(),
            duration_ms: Some(1200),
            voice: voice.map(str::to_string),
        })
    }
}

struct Harness {
    transport: Arc<DesktopTransport>,
    addr: SocketAddr,
    events: mpsc::Receiver<ChannelEvent>,
}

async fn start(
    auth_token: Option<&str>,
    stt: Option<Arc<dyn SttEngine>>,
    tts: Option<Arc<dyn TtsEngine>>,
) -> Harness {
    let config = LocalDesktopConfig {
        enabled: true,
        host: "127.0.0.1".into(),
        port: 0,
        auth_token: auth_token.map(str::to_string),
        allowed_origins: Vec::new(),
        peer_id: "desktop-default".into(),
        agent_id: None,
        dm_scope: None,
    };
    let (tx, events) = mpsc::channel(64);
    let sink = EventSink::new("local-desktop", tx);
    let transport = Arc::new(DesktopTransport::new(config, sink, stt, tts, None));
    transport.connect().await.expect("bind failed");
    let addr = transport.local_addr().await.unwrap();
    Harness {
        transport,
        addr,
        events,
    }
}

/// Minimal HTTP/1.1 request over a raw socket; returns the whole response.
async fn http(addr: SocketAddr, method: &str, path: &str, body: Option<&str>) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let body = body.unwrap_or("");
    let request = format!(
        "{method} {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\
         Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response)).await;
    String::from_utf8_lossy(&response).into_owned()
}

/// Open an SSE connection and return the readable half once `ready` was
/// observed.
async fn open_sse(addr: SocketAddr, query: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request =
        format!("GET /events{query} HTTP/1.1\r\nHost: {addr}\r\nAccept: text/event-stream\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    read_until(&mut stream, &["ready"]).await;
    stream
}

/// Read until every needle appears (in any position); returns the buffer.
async fn read_until(stream: &mut TcpStream, needles: &[&str]) -> String {
    let mut buffer = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut chunk = [0u8; 4096];
    loop {
        let text = String::from_utf8_lossy(&buffer).into_owned();
        if needles.iter().all(|n| text.contains(n)) {
            return text;
        }
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("timed out waiting for SSE content");
        let n = tokio::time::timeout(remaining, stream.read(&mut chunk))
            .await
            .expect("read timed out")
            .expect("read failed");
        assert!(n > 0, "connection closed before needles arrived");
        buffer.extend_from_slice(&chunk[..n]);
    }
}

#[tokio::test]
async fn desktop_inbound_injects_a_message() {
    let mut harness = start(None, None, None).await;
    let response = http(
        harness.addr,
        "POST",
        "/inbound",
        Some(r#"{"text":"hello local"}"#),
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 202"));
    assert!(response.contains(r#""accepted":true"#));
    assert!(response.contains(r#""id""#));

    match tokio::time::timeout(Duration::from_secs(2), harness.events.recv())
        .await
        .unwrap()
        .unwrap()
    {
        ChannelEvent::Message(msg) => {
            assert_eq!(msg.text, "hello local");
            assert_eq!(msg.peer_id, "desktop-default");
            assert_eq!(msg.sender_id, "desktop-user");
            assert!(msg.media.is_empty());
        }
        other => panic!("expected message event, got {other:?}"),
    }
    harness.transport.disconnect().await.unwrap();
}

#[tokio::test]
async fn sse_streams_phase_then_assistant_in_order() {
    let harness = start(None, None, None).await;
    let mut sse = open_sse(harness.addr, "?peerId=desktop-default").await;

    harness
        .transport
        .emit_phase(
            "desktop-default",
            Phase::Thinking,
            Some(serde_json::json!({ "sessionKey": "s1" })),
        )
        .await
        .unwrap();
    harness
        .transport
        .send("desktop-default", &OutboundMessage::text("reply from runtime"))
        .await
        .unwrap();

    let text = read_until(&mut sse, &["thinking", "reply from runtime"]).await;
    let thinking_at = text.find("thinking").unwrap();
    let reply_at = text.find("reply from runtime").unwrap();
    assert!(thinking_at < reply_at, "phase must precede the assistant message");
    assert!(text.contains(r#""sessionKey":"s1""#));
    harness.transport.disconnect().await.unwrap();
}

#[tokio::test]
async fn auth_token_is_enforced_everywhere_but_widget_config() {
    let harness = start(Some("local-token"), None, None).await;

    let denied = http(harness.addr, "GET", "/events?peerId=x", None).await;
    assert!(denied.starts_with("HTTP/1.1 401"));

    let denied_health = http(harness.addr, "GET", "/health", None).await;
    assert!(denied_health.starts_with("HTTP/1.1 401"));

    let allowed = http(
        harness.addr,
        "GET",
        "/health?token=local-token",
        None,
    )
    .await;
    assert!(allowed.starts_with("HTTP/1.1 200"));

    let widget = http(harness.addr, "GET", "/widget-config", None).await;
    assert!(widget.starts_with("HTTP/1.1 200"));
    assert!(widget.contains(r#""authToken":"local-token""#));
    assert!(widget.contains(r#""peerId":"desktop-default""#));

    harness.transport.disconnect().await.unwrap();
}

async fn connect_audio(addr: SocketAddr, query: &str) -> tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<TcpStream>,
> {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/audio{query}"))
        .await
        .expect("ws connect failed");
    ws
}

async fn next_json(
    ws: &mut tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>,
) -> serde_json::Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("ws receive timed out")
            .expect("ws closed")
            .expect("ws error");
        if let WsMessage::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test]
async fn audio_round_trip_transcribes_and_injects() {
    let mut harness = start(None, Some(Arc::new(StubStt)), None).await;
    let mut sse = open_sse(harness.addr, "?peerId=desktop-default").await;
    let mut ws = connect_audio(harness.addr, "?peerId=desktop-default").await;

    let ready = next_json(&mut ws).await;
    assert_eq!(ready["type"], "audio_ready");
    assert_eq!(ready["peerId"], "desktop-default");

    let chunk = serde_json::json!({
        "type": "audio_chunk",
        "streamId": "s1",
        "seq": 0,
        "sampleRate": 16000,
        "channels": 1,
        "encoding": "pcm_s16le",
        "chunkBase64": to_base64(&[1, 2, 3, 4]),
    });
    ws.send(WsMessage::Text(chunk.to_string().into()))
        .await
        .unwrap();
    ws.send(WsMessage::Text(
        serde_json::json!({ "type": "audio_commit", "streamId": "s1" })
            .to_string()
            .into(),
    ))
    .await
    .unwrap();

    // SSE: listening phase, then the final transcript.
    let text = read_until(&mut sse, &["listening", "hello from speech"]).await;
    assert!(text.contains(r#""isUser":true"#));
    assert!(text.contains(r#""isFinal":true"#));
    assert!(text.contains(r#""streamId":"s1""#));

    // Pipeline injection with empty media.
    match tokio::time::timeout(Duration::from_secs(2), harness.events.recv())
        .await
        .unwrap()
        .unwrap()
    {
        ChannelEvent::Message(msg) => {
            assert_eq!(msg.text, "hello from speech");
            assert!(msg.media.is_empty());
        }
        other => panic!("expected message event, got {other:?}"),
    }
    harness.transport.disconnect().await.unwrap();
}

#[tokio::test]
async fn second_audio_client_displaces_the_first() {
    let harness = start(None, None, None).await;
    let mut first = connect_audio(harness.addr, "?peerId=desktop-default").await;
    assert_eq!(next_json(&mut first).await["type"], "audio_ready");

    let mut second = connect_audio(harness.addr, "?peerId=desktop-default").await;
    assert_eq!(next_json(&mut second).await["type"], "audio_ready");

    // The first socket receives close 1000 "replaced".
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let msg = tokio::time::timeout_at(deadline, first.next())
            .await
            .expect("no close before timeout");
        match msg {
            Some(Ok(WsMessage::Close(Some(frame)))) => {
                assert_eq!(u16::from(frame.code), 1000);
                assert_eq!(frame.reason.as_str(), "replaced");
                break;
            }
            Some(Ok(_)) => continue,
            other => panic!("expected close frame, got {other:?}"),
        }
    }
    harness.transport.disconnect().await.unwrap();
}

#[tokio::test]
async fn ping_pong_echoes_timestamp() {
    let harness = start(None, None, None).await;
    let mut ws = connect_audio(harness.addr, "?peerId=desktop-default").await;
    next_json(&mut ws).await; // audio_ready

    ws.send(WsMessage::Text(
        serde_json::json!({ "type": "ping", "ts": 424242 }).to_string().into(),
    ))
    .await
    .unwrap();
    let pong = next_json(&mut ws).await;
    assert_eq!(pong["type"], "pong");
    assert_eq!(pong["ts"], 424242);
    harness.transport.disconnect().await.unwrap();
}

#[tokio::test]
async fn invalid_audio_frames_get_typed_errors() {
    let harness = start(None, Some(Arc::new(StubStt)), None).await;
    let mut ws = connect_audio(harness.addr, "?peerId=desktop-default").await;
    next_json(&mut ws).await; // audio_ready

    // Zero-byte chunk.
    ws.send(WsMessage::Text(
        serde_json::json!({
            "type": "audio_chunk", "streamId": "s1", "seq": 0,
            "sampleRate": 16000, "channels": 1,
            "encoding": "pcm_s16le", "chunkBase64": "",
        })
        .to_string()
        .into(),
    ))
    .await
    .unwrap();
    let err = next_json(&mut ws).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["code"], "invalid_payload");
    assert_eq!(err["retryable"], false);

    // Wrong encoding.
    ws.send(WsMessage::Text(
        serde_json::json!({
            "type": "audio_chunk", "streamId": "s1", "seq": 0,
            "sampleRate": 16000, "channels": 1,
            "encoding": "opus", "chunkBase64": to_base64(&[1, 2]),
        })
        .to_string()
        .into(),
    ))
    .await
    .unwrap();
    assert_eq!(next_json(&mut ws).await["code"], "invalid_payload");

    // Unknown frame type.
    ws.send(WsMessage::Text(
        serde_json::json!({ "type": "telepathy" }).to_string().into(),
    ))
    .await
    .unwrap();
    let err = next_json(&mut ws).await;
    assert_eq!(err["code"], "unsupported_message");

    // Commit of a never-opened stream.
    ws.send(WsMessage::Text(
        serde_json::json!({ "type": "audio_commit", "streamId": "ghost" })
            .to_string()
            .into(),
    ))
    .await
    .unwrap();
    assert_eq!(next_json(&mut ws).await["code"], "invalid_payload");

    harness.transport.disconnect().await.unwrap();
}

#[tokio::test]
async fn stt_failure_sends_retryable_error_and_error_phase() {
    let harness = start(None, Some(Arc::new(FailingStt)), None).await;
    let mut sse = open_sse(harness.addr, "?peerId=desktop-default").await;
    let mut ws = connect_audio(harness.addr, "?peerId=desktop-default").await;
    next_json(&mut ws).await; // audio_ready

    ws.send(WsMessage::Text(
        serde_json::json!({
            "type": "audio_chunk", "streamId": "s1", "seq": 0,
            "sampleRate": 16000, "channels": 1,
            "encoding": "pcm_s16le", "chunkBase64": to_base64(&[1, 2, 3, 4]),
        })
        .to_string()
        .into(),
    ))
    .await
    .unwrap();
    ws.send(WsMessage::Text(
        serde_json::json!({ "type": "audio_commit", "streamId": "s1" })
            .to_string()
            .into(),
    ))
    .await
    .unwrap();

    let err = next_json(&mut ws).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["code"], "stt_failed");
    assert_eq!(err["retryable"], true);

    let text = read_until(&mut sse, &["listening", "error"]).await;
    assert!(text.find("listening").unwrap() < text.rfind("error").unwrap());
    harness.transport.disconnect().await.unwrap();
}

#[tokio::test]
async fn tts_streams_meta_chunks_and_audio_ready() {
    let harness = start(None, None, Some(Arc::new(StubTts))).await;
    let mut sse = open_sse(harness.addr, "?peerId=desktop-default").await;
    let mut ws = connect_audio(harness.addr, "?peerId=desktop-default").await;
    next_json(&mut ws).await; // audio_ready

    harness
        .transport
        .send("desktop-default", &OutboundMessage::text("speak this"))
        .await
        .unwrap();

    let meta = next_json(&mut ws).await;
    assert_eq!(meta["type"], "audio_meta");
    assert_eq!(meta["mimeType"], "audio/mpeg");
    assert_eq!(meta["text"], "speak this");
    let stream_id = meta["streamId"].as_str().unwrap().to_string();

    let mut seq = 0u64;
    loop {
        let frame = next_json(&mut ws).await;
        assert_eq!(frame["type"], "audio_chunk");
        assert_eq!(frame["streamId"], stream_id.as_str());
        assert_eq!(frame["seq"], seq);
        let payload = frame["chunkBase64"].as_str().unwrap();
        assert!(payload.len() <= 32 * 1024);
        if frame["isLast"] == true {
            break;
        }
        seq += 1;
    }

    let text = read_until(&mut sse, &["audio_ready"]).await;
    assert!(text.contains(&stream_id));
    harness.transport.disconnect().await.unwrap();
}
