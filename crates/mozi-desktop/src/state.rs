//! Shared transport state: SSE client registry, audio-WS client registry,
//! in-flight inbound audio streams.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use mozi_channels::EventSink;
use mozi_core::config::schema::LocalDesktopConfig;
use mozi_media::{SttEngine, TtsEngine};

use crate::events::SseEvent;

/// One connected SSE client.
pub struct SseClient {
    pub peer_id: String,
    pub tx: mpsc::Sender<SseEvent>,
}

/// Frames queued for an audio-WS writer task.
#[derive(Debug, Clone)]
pub enum WsOut {
    Frame(String),
    Close { code: u16, reason: &'static str },
}

/// One attached audio-WS client. At most one per peer id.
pub struct AudioClient {
    pub client_id: String,
    pub tx: mpsc::Sender<WsOut>,
}

/// One in-flight inbound audio stream, keyed by `(peer_id, stream_id)`.
/// Chunks concatenate in arrival order; seq numbers are not used for
/// reordering.
pub struct AudioInboundStream {
    pub sample_rate: u32,
    pub channels: u16,
    pub buffer: Vec<u8>,
}

pub struct DesktopState {
    pub config: LocalDesktopConfig,
    pub sink: EventSink,
    pub stt: Option<Arc<dyn SttEngine>>,
    pub tts: Option<Arc<dyn TtsEngine>>,
    pub tts_voice: Option<String>,
    /// SSE clients by client id.
    pub sse_clients: DashMap<String, SseClient>,
    /// Audio clients by peer id.
    pub audio_clients: DashMap<String, AudioClient>,
    /// Inbound streams by `(peer_id, stream_id)`.
    pub audio_streams: DashMap<(String, String), AudioInboundStream>,
}

impl DesktopState {
    pub fn new(
        config: LocalDesktopConfig,
        sink: EventSink,
        stt: Option<Arc<dyn SttEngine>>,
        tts: Option<Arc<dyn TtsEngine>>,
        tts_voice: Option<String>,
    ) -> Self {
        Self {
            config,
            sink,
            stt,
            tts,
            tts_voice,
            sse_clients: DashMap::new(),
            audio_clients: DashMap::new(),
            audio_streams: DashMap::new(),
        }
    }

    /// Deliver an event to every SSE client subscribed to `peer_id`,
    /// preserving per-client FIFO order.
    pub fn broadcast(&self, peer_id: &str, event: SseEvent) {
        for client in self.sse_clients.iter() {
            if client.peer_id != peer_id {
                continue;
            }
            if client.tx.try_send(event.clone()).is_err() {
                // Slow or gone; the reader's drop guard cleans it up.
                debug!(client = %client.key(), "SSE queue full, event dropped");
            }
        }
    }

    /// Drop every inbound stream belonging to a peer.
    pub fn clear_streams_for(&self, peer_id: &str) {
        self.audio_streams.retain(|(p, _), _| p != peer_id);
    }
}
