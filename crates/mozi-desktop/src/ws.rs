//! Audio-duplex WebSocket: inbound PCM chunk accumulation, commit-to-STT,
//! and the writer lane TTS frames go out on.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use mozi_core::text::from_base64;
use mozi_core::types::{InboundMessage, PeerKind, Phase};
use mozi_media::wav::pcm_s16le_to_wav;

use crate::events::{now_ms, AudioErrorCode, AudioInFrame, AudioOutFrame, SseEvent};
use crate::http::{authorized, EventsQuery};
use crate::state::{AudioClient, AudioInboundStream, DesktopState, WsOut};

const EXPECTED_ENCODING: &str = "pcm_s16le";
/// Writer-lane depth; TTS chunk bursts queue here.
const WS_OUT_CAPACITY: usize = 256;

/// `GET /audio?peerId=…` upgrade handler.
pub async fn audio_upgrade(
    State(state): State<Arc<DesktopState>>,
    Query(q): Query<EventsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !authorized(&state, &headers, q.token.as_deref()) {
        return (axum::http::StatusCode::UNAUTHORIZED, "unauthorized").into_response();
    }
    let peer_id = q.peer_id.unwrap_or_else(|| state.config.peer_id.clone());
    ws.on_upgrade(move |socket| handle_audio_socket(state, peer_id, socket))
}

async fn handle_audio_socket(state: Arc<DesktopState>, peer_id: String, socket: WebSocket) {
    let client_id = uuid::Uuid::new_v4().to_string();
    let (out_tx, mut out_rx) = tokio::sync::mpsc::channel::<WsOut>(WS_OUT_CAPACITY);

    // One audio client per peer: displace the previous connection.
    if let Some(previous) = state.audio_clients.insert(
        peer_id.clone(),
        AudioClient {
            client_id: client_id.clone(),
            tx: out_tx.clone(),
        },
    ) {
        info!(peer = %peer_id, "displacing previous audio client");
        let _ = previous
            .tx
            .send(WsOut::Close {
                code: 1000,
                reason: "replaced",
            })
            .await;
    }
    info!(peer = %peer_id, client = %client_id, "audio client attached");

    send_frame(
        &out_tx,
        &AudioOutFrame::AudioReady {
            peer_id: peer_id.clone(),
            ts: now_ms(),
        },
    )
    .await;

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            out = out_rx.recv() => {
                match out {
                    Some(WsOut::Frame(json)) => {
                        if sink.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(WsOut::Close { code, reason }) => {
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code,
                                reason: reason.into(),
                            })))
                            .await;
                        break;
                    }
                    None => break,
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_text_frame(&state, &peer_id, &out_tx, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(peer = %peer_id, error = %e, "audio socket read error");
                        break;
                    }
                }
            }
        }
    }

    // Only the current registration cleans up — a displaced client must
    // not tear down its replacement's state.
    let still_current = state
        .audio_clients
        .get(&peer_id)
        .map(|c| c.client_id == client_id)
        .unwrap_or(false);
    if still_current {
        state.audio_clients.remove(&peer_id);
        state.clear_streams_for(&peer_id);
    }
    info!(peer = %peer_id, client = %client_id, "audio client detached");
}

async fn handle_text_frame(
    state: &Arc<DesktopState>,
    peer_id: &str,
    out_tx: &tokio::sync::mpsc::Sender<WsOut>,
    text: &str,
) {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => {
            send_error(out_tx, AudioErrorCode::InvalidPayload, "malformed JSON frame", false).await;
            return;
        }
    };
    let frame: AudioInFrame = match serde_json::from_value(value.clone()) {
        Ok(f) => f,
        Err(_) => {
            // Known-but-malformed parses as invalid payload; an unknown
            // type is unsupported.
            let known = matches!(
                value.get("type").and_then(|t| t.as_str()),
                Some("ping") | Some("audio_chunk") | Some("audio_commit")
            );
            let (code, msg) = if known {
                (AudioErrorCode::InvalidPayload, "malformed frame fields")
            } else {
                (AudioErrorCode::UnsupportedMessage, "unsupported message type")
            };
            send_error(out_tx, code, msg, false).await;
            return;
        }
    };

    match frame {
        AudioInFrame::Ping { ts } => {
            send_frame(
                out_tx,
                &AudioOutFrame::Pong {
                    ts: ts.unwrap_or_else(now_ms),
                },
            )
            .await;
        }
        AudioInFrame::AudioChunk {
            stream_id,
            seq,
            sample_rate,
            channels,
            encoding,
            chunk_base64,
        } => {
            let Some(stream_id) = stream_id.filter(|s| !s.is_empty()) else {
                send_error(out_tx, AudioErrorCode::InvalidPayload, "missing streamId", false).await;
                return;
            };
            if encoding.as_deref() != Some(EXPECTED_ENCODING) {
                send_error(
                    out_tx,
                    AudioErrorCode::InvalidPayload,
                    "encoding must be pcm_s16le",
                    false,
                )
                .await;
                return;
            }
            let Some(chunk_base64) = chunk_base64 else {
                send_error(out_tx, AudioErrorCode::InvalidPayload, "missing chunkBase64", false)
                    .await;
                return;
            };
            let bytes = match from_base64(&chunk_base64) {
                Ok(b) if !b.is_empty() => b,
                Ok(_) => {
                    send_error(out_tx, AudioErrorCode::InvalidPayload, "empty audio chunk", false)
                        .await;
                    return;
                }
                Err(_) => {
                    send_error(
                        out_tx,
                        AudioErrorCode::InvalidPayload,
                        "chunkBase64 is not valid base64",
                        false,
                    )
                    .await;
                    return;
                }
            };

            let key = (peer_id.to_string(), stream_id.clone());
            let mut entry = state
                .audio_streams
                .entry(key)
                .or_insert_with(|| AudioInboundStream {
                    sample_rate: sample_rate.unwrap_or(16_000),
                    channels: channels.unwrap_or(1),
                    buffer: Vec::new(),
                });
            // Arrival order is the contract; seq is logged, never used to
            // reorder.
            debug!(peer = %peer_id, stream = %stream_id, seq = seq.unwrap_or(0), bytes = bytes.len(), "audio chunk");
            entry.buffer.extend_from_slice(&bytes);
        }
        AudioInFrame::AudioCommit { stream_id } => {
            commit_stream(state, peer_id, out_tx, &stream_id).await;
        }
    }
}

/// Finalize an inbound stream: WAV-wrap, transcribe, inject the message.
async fn commit_stream(
    state: &Arc<DesktopState>,
    peer_id: &str,
    out_tx: &tokio::sync::mpsc::Sender<WsOut>,
    stream_id: &str,
) {
    let Some((_, stream)) = state
        .audio_streams
        .remove(&(peer_id.to_string(), stream_id.to_string()))
    else {
        send_error(out_tx, AudioErrorCode::InvalidPayload, "unknown streamId", false).await;
        return;
    };

    state.broadcast(
        peer_id,
        SseEvent::Phase {
            peer_id: peer_id.to_string(),
            phase: Phase::Listening,
            payload: serde_json::json!({ "streamId": stream_id }),
            timestamp: now_ms(),
        },
    );

    let wav = match pcm_s16le_to_wav(&stream.buffer, stream.sample_rate, stream.channels) {
        Ok(wav) => wav,
        Err(e) => {
            warn!(peer = %peer_id, stream = %stream_id, error = %e, "WAV framing failed");
            send_error(out_tx, AudioErrorCode::InvalidPayload, "undecodable PCM buffer", false)
                .await;
            emit_phase_error(state, peer_id);
            return;
        }
    };

    let transcript = match &state.stt {
        Some(stt) => stt.transcribe(wav).await,
        None => Err(mozi_media::MediaError::Stt("no STT engine configured".into())),
    };

    match transcript {
        Ok(text) => {
            info!(peer = %peer_id, stream = %stream_id, chars = text.len(), "transcription complete");
            state.broadcast(
                peer_id,
                SseEvent::Transcript {
                    peer_id: peer_id.to_string(),
                    text: text.clone(),
                    is_user: true,
                    is_final: true,
                    stream_id: stream_id.to_string(),
                    timestamp: now_ms(),
                },
            );
            let msg = InboundMessage::text_message(
                "local-desktop",
                peer_id,
                PeerKind::Dm,
                "desktop-user",
                text,
            );
            state.sink.message(msg).await;
        }
        Err(e) => {
            warn!(peer = %peer_id, stream = %stream_id, error = %e, "transcription failed");
            send_error(out_tx, AudioErrorCode::SttFailed, &e.to_string(), true).await;
            emit_phase_error(state, peer_id);
        }
    }
}

fn emit_phase_error(state: &DesktopState, peer_id: &str) {
    state.broadcast(
        peer_id,
        SseEvent::Phase {
            peer_id: peer_id.to_string(),
            phase: Phase::Error,
            payload: serde_json::Value::Null,
            timestamp: now_ms(),
        },
    );
}

pub async fn send_frame(tx: &tokio::sync::mpsc::Sender<WsOut>, frame: &AudioOutFrame) {
    if let Ok(json) = serde_json::to_string(frame) {
        let _ = tx.send(WsOut::Frame(json)).await;
    }
}

async fn send_error(
    tx: &tokio::sync::mpsc::Sender<WsOut>,
    code: AudioErrorCode,
    message: &str,
    retryable: bool,
) {
    send_frame(
        tx,
        &AudioOutFrame::Error {
            code,
            message: message.to_string(),
            retryable,
        },
    )
    .await;
}
