//! Wire payloads for the SSE stream and the audio WebSocket.

use serde::{Deserialize, Serialize};

use mozi_core::types::Phase;

/// Events broadcast to SSE clients as unnamed `data:` frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SseEvent {
    Phase {
        peer_id: String,
        phase: Phase,
        payload: serde_json::Value,
        timestamp: i64,
    },
    AssistantMessage {
        id: String,
        peer_id: String,
        payload: AssistantPayload,
        timestamp: i64,
    },
    Transcript {
        peer_id: String,
        text: String,
        is_user: bool,
        is_final: bool,
        stream_id: String,
        timestamp: i64,
    },
    AudioReady {
        peer_id: String,
        stream_id: String,
        mime_type: String,
        duration_ms: Option<u64>,
        timestamp: i64,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct AssistantPayload {
    pub text: String,
    pub media: Vec<serde_json::Value>,
}

/// Inbound audio-WS frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AudioInFrame {
    Ping {
        #[serde(default)]
        ts: Option<i64>,
    },
    AudioChunk {
        #[serde(default)]
        stream_id: Option<String>,
        #[serde(default)]
        seq: Option<u64>,
        #[serde(default)]
        sample_rate: Option<u32>,
        #[serde(default)]
        channels: Option<u16>,
        #[serde(default)]
        encoding: Option<String>,
        #[serde(default)]
        chunk_base64: Option<String>,
    },
    AudioCommit {
        stream_id: String,
    },
}

/// Outbound audio-WS frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AudioOutFrame {
    AudioReady {
        peer_id: String,
        ts: i64,
    },
    Pong {
        ts: i64,
    },
    AudioMeta {
        stream_id: String,
        mime_type: String,
        duration_ms: Option<u64>,
        text: String,
        voice: Option<String>,
    },
    AudioChunk {
        stream_id: String,
        seq: u64,
        mime_type: String,
        chunk_base64: String,
        is_last: bool,
    },
    Error {
        code: AudioErrorCode,
        message: String,
        retryable: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioErrorCode {
    Unauthorized,
    InvalidPayload,
    UnsupportedMessage,
    UnsupportedAudioFormat,
    SttFailed,
    TtsFailed,
    InternalError,
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_event_wire_shape() {
        let ev = SseEvent::Transcript {
            peer_id: "desktop-default".into(),
            text: "hi".into(),
            is_user: true,
            is_final: true,
            stream_id: "s1".into(),
            timestamp: 123,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "transcript");
        assert_eq!(json["peerId"], "desktop-default");
        assert_eq!(json["isUser"], true);
        assert_eq!(json["isFinal"], true);
        assert_eq!(json["streamId"], "s1");
    }

    #[test]
    fn audio_in_frame_parses_snake_case_types() {
        let frame: AudioInFrame = serde_json::from_str(
            r#"{"type":"audio_chunk","streamId":"s1","seq":0,"sampleRate":16000,
                "channels":1,"encoding":"pcm_s16le","chunkBase64":"AQID"}"#,
        )
        .unwrap();
        match frame {
            AudioInFrame::AudioChunk {
                stream_id,
                sample_rate,
                encoding,
                ..
            } => {
                assert_eq!(stream_id.as_deref(), Some("s1"));
                assert_eq!(sample_rate, Some(16000));
                assert_eq!(encoding.as_deref(), Some("pcm_s16le"));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn error_frame_wire_shape() {
        let ev = AudioOutFrame::Error {
            code: AudioErrorCode::SttFailed,
            message: "vendor 500".into(),
            retryable: true,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "stt_failed");
        assert_eq!(json["retryable"], true);
    }
}
