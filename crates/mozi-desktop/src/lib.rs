//! Local desktop transport: an HTTP/1.1 loopback server exposing inbound
//! injection, a per-peer SSE event stream, the widget bootstrap config,
//! and the audio-duplex WebSocket. Implements [`ChannelAdapter`] so the
//! rest of the runtime treats the desktop widget like any other channel.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::routing::{get, post};
use axum::Router;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use mozi_channels::{ChannelAdapter, ChannelError, ChannelStatus, EventSink};
use mozi_core::config::schema::LocalDesktopConfig;
use mozi_core::types::{OutboundMessage, Phase};
use mozi_media::{SttEngine, TtsEngine};

pub mod events;
pub mod http;
pub mod state;
pub mod tts;
pub mod ws;

use events::{now_ms, AssistantPayload, SseEvent};
use state::{DesktopState, WsOut};

pub const CHANNEL_ID: &str = "local-desktop";

struct ServerHandle {
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

pub struct DesktopTransport {
    state: Arc<DesktopState>,
    server: tokio::sync::Mutex<Option<ServerHandle>>,
    status: Mutex<ChannelStatus>,
}

impl DesktopTransport {
    pub fn new(
        config: LocalDesktopConfig,
        sink: EventSink,
        stt: Option<Arc<dyn SttEngine>>,
        tts: Option<Arc<dyn TtsEngine>>,
        tts_voice: Option<String>,
    ) -> Self {
        Self {
            state: Arc::new(DesktopState::new(config, sink, stt, tts, tts_voice)),
            server: tokio::sync::Mutex::new(None),
            status: Mutex::new(ChannelStatus::Disconnected),
        }
    }

    /// The bound address once connected (useful with a port-0 config).
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.server.lock().await.as_ref().map(|s| s.addr)
    }

    fn set_status(&self, status: ChannelStatus) {
        *self.status.lock().expect("status lock poisoned") = status;
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/widget-config", get(http::widget_config))
            .route("/health", get(http::health))
            .route("/inbound", post(http::inbound))
            .route("/events", get(http::events))
            .route("/audio", get(ws::audio_upgrade))
            .layer(axum::middleware::from_fn_with_state(
                Arc::clone(&self.state),
                http::cors_middleware,
            ))
            .layer(tower_http::trace::TraceLayer::new_for_http())
            .with_state(Arc::clone(&self.state))
    }
}

#[async_trait]
impl ChannelAdapter for DesktopTransport {
    fn id(&self) -> &str {
        CHANNEL_ID
    }

    fn display_name(&self) -> &str {
        "Local Desktop"
    }

    async fn connect(&self) -> Result<(), ChannelError> {
        let mut server = self.server.lock().await;
        if server.is_some() {
            return Ok(());
        }
        self.set_status(ChannelStatus::Connecting);

        let bind = format!("{}:{}", self.state.config.host, self.state.config.port);
        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .map_err(|e| ChannelError::Fatal(format!("bind {bind}: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| ChannelError::Fatal(e.to_string()))?;

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let router = self.router();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(async move { signal.cancelled().await });
            if let Err(e) = serve.await {
                warn!(error = %e, "desktop server exited with error");
            }
        });

        info!(addr = %addr, "local desktop transport listening");
        *server = Some(ServerHandle {
            addr,
            shutdown,
            task,
        });
        self.set_status(ChannelStatus::Connected);
        Ok(())
    }

    /// Shutdown: end every SSE response, close every audio socket with
    /// 1001 `server_shutdown`, clear stream buffers, stop the listener.
    async fn disconnect(&self) -> Result<(), ChannelError> {
        let Some(handle) = self.server.lock().await.take() else {
            return Ok(());
        };

        self.state.sse_clients.clear();
        for client in self.state.audio_clients.iter() {
            let _ = client
                .tx
                .send(WsOut::Close {
                    code: 1001,
                    reason: "server_shutdown",
                })
                .await;
        }
        self.state.audio_clients.clear();
        self.state.audio_streams.clear();

        handle.shutdown.cancel();
        let _ = handle.task.await;
        self.set_status(ChannelStatus::Disconnected);
        info!("local desktop transport stopped");
        Ok(())
    }

    fn status(&self) -> ChannelStatus {
        self.status.lock().expect("status lock poisoned").clone()
    }

    /// Broadcast the assistant message over SSE; when the peer has an
    /// audio client attached, follow with streamed TTS.
    async fn send(&self, peer_id: &str, msg: &OutboundMessage) -> Result<String, ChannelError> {
        let id = uuid::Uuid::now_v7().to_string();
        let media: Vec<serde_json::Value> = msg
            .media
            .iter()
            .filter_map(|m| serde_json::to_value(m).ok())
            .collect();
        self.state.broadcast(
            peer_id,
            SseEvent::AssistantMessage {
                id: id.clone(),
                peer_id: peer_id.to_string(),
                payload: AssistantPayload {
                    text: msg.text.clone(),
                    media,
                },
                timestamp: now_ms(),
            },
        );

        if !msg.text.is_empty() && self.state.audio_clients.contains_key(peer_id) {
            tokio::spawn(tts::stream_tts(
                Arc::clone(&self.state),
                peer_id.to_string(),
                msg.text.clone(),
            ));
        }
        Ok(id)
    }

    async fn emit_phase(
        &self,
        peer_id: &str,
        phase: Phase,
        payload: Option<serde_json::Value>,
    ) -> Result<(), ChannelError> {
        self.state.broadcast(
            peer_id,
            SseEvent::Phase {
                peer_id: peer_id.to_string(),
                phase,
                payload: payload.unwrap_or(serde_json::Value::Null),
                timestamp: now_ms(),
            },
        );
        Ok(())
    }
}
