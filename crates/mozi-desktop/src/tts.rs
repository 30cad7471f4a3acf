//! Outbound TTS streaming: synthesize the assistant reply and frame it
//! over the peer's audio WebSocket, closing with an SSE `audio_ready`.

use std::sync::Arc;

use tracing::{debug, info, warn};

use mozi_media::frame::chunk_base64;

use crate::events::{now_ms, AudioErrorCode, AudioOutFrame, SseEvent};
use crate::state::DesktopState;
use crate::ws::send_frame;

/// Synthesize `text` for `peer_id` and stream the audio frames.
///
/// No audio client or no TTS engine is a quiet no-op — the SSE
/// `assistant_message` the caller already broadcast stands alone.
pub async fn stream_tts(state: Arc<DesktopState>, peer_id: String, text: String) {
    if text.is_empty() {
        return;
    }
    let Some(out_tx) = state.audio_clients.get(&peer_id).map(|c| c.tx.clone()) else {
        return;
    };
    let Some(tts) = state.tts.clone() else {
        debug!(peer = %peer_id, "no TTS engine configured");
        return;
    };

    let audio = match tts.synthesize(&text, state.tts_voice.as_deref()).await {
        Ok(audio) => audio,
        Err(e) => {
            warn!(peer = %peer_id, error = %e, "TTS synthesis failed");
            send_frame(
                &out_tx,
                &AudioOutFrame::Error {
                    code: AudioErrorCode::TtsFailed,
                    message: e.to_string(),
                    retryable: true,
                },
            )
            .await;
            return;
        }
    };

    let stream_id = uuid::Uuid::new_v4().to_string();
    send_frame(
        &out_tx,
        &AudioOutFrame::AudioMeta {
            stream_id: stream_id.clone(),
            mime_type: audio.mime_type.clone(),
            duration_ms: audio.duration_ms,
            text,
            voice: audio.voice.clone(),
        },
    )
    .await;

    let payloads = chunk_base64(&audio.bytes);
    let last = payloads.len() - 1;
    for (seq, payload) in payloads.into_iter().enumerate() {
        send_frame(
            &out_tx,
            &AudioOutFrame::AudioChunk {
                stream_id: stream_id.clone(),
                seq: seq as u64,
                mime_type: audio.mime_type.clone(),
                chunk_base64: payload,
                is_last: seq == last,
            },
        )
        .await;
    }

    info!(peer = %peer_id, stream = %stream_id, bytes = audio.bytes.len(), "TTS streamed");
    state.broadcast(
        &peer_id,
        SseEvent::AudioReady {
            peer_id: peer_id.clone(),
            stream_id,
            mime_type: audio.mime_type,
            duration_ms: audio.duration_ms,
            timestamp: now_ms(),
        },
    );
}
