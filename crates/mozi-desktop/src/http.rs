//! HTTP surface: widget config, health, inbound injection, SSE stream,
//! and the CORS middleware.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Query, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tracing::{debug, info};

use mozi_core::types::{InboundMessage, MediaAttachment, PeerKind};

use crate::events::{now_ms, SseEvent};
use crate::state::{DesktopState, SseClient};

/// Check the three accepted credentials: `Authorization: Bearer`,
/// `X-Mozi-Token`, `?token=`. No configured token means open access.
pub fn authorized(state: &DesktopState, headers: &HeaderMap, query_token: Option<&str>) -> bool {
    let Some(expected) = state.config.auth_token.as_deref() else {
        return true;
    };
    if let Some(value) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        if value.strip_prefix("Bearer ").map(str::trim) == Some(expected) {
            return true;
        }
    }
    if let Some(value) = headers.get("x-mozi-token").and_then(|v| v.to_str().ok()) {
        if value == expected {
            return true;
        }
    }
    query_token == Some(expected)
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(serde_json::json!({ "error": "unauthorized" }))).into_response()
}

/// CORS: reflect the origin when the allowlist is empty or contains it.
pub async fn cors_middleware(
    State(state): State<Arc<DesktopState>>,
    request: Request,
    next: Next,
) -> Response {
    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let allowed = origin.as_deref().filter(|origin| {
        state.config.allowed_origins.is_empty()
            || state.config.allowed_origins.iter().any(|o| o == origin)
    });

    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(request).await
    };

    if let Some(origin) = allowed {
        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(origin) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
        }
        headers.insert(header::VARY, HeaderValue::from_static("Origin"));
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Content-Type, Authorization, X-Mozi-Token"),
        );
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET,POST,OPTIONS"),
        );
    }
    response
}

/// `GET /widget-config` — never authenticated; the token is echoed only
/// when configured so the widget can bootstrap itself.
pub async fn widget_config(State(state): State<Arc<DesktopState>>) -> Response {
    let mut body = serde_json::json!({
        "enabled": state.config.enabled,
        "host": state.config.host,
        "port": state.config.port,
        "peerId": state.config.peer_id,
    });
    if let Some(token) = &state.config.auth_token {
        body["authToken"] = serde_json::Value::String(token.clone());
    }
    Json(body).into_response()
}

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    #[serde(default)]
    pub token: Option<String>,
}

pub async fn health(
    State(state): State<Arc<DesktopState>>,
    Query(q): Query<TokenQuery>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&state, &headers, q.token.as_deref()) {
        return unauthorized();
    }
    Json(serde_json::json!({ "ok": true })).into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundBody {
    pub text: String,
    #[serde(default)]
    pub peer_id: Option<String>,
    #[serde(default)]
    pub sender_id: Option<String>,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub peer_type: Option<PeerKind>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub media: Vec<MediaAttachment>,
}

/// `POST /inbound` — inject one message into the pipeline.
pub async fn inbound(
    State(state): State<Arc<DesktopState>>,
    Query(q): Query<TokenQuery>,
    headers: HeaderMap,
    body: Json<InboundBody>,
) -> Response {
    if !authorized(&state, &headers, q.token.as_deref()) {
        return unauthorized();
    }

    let body = body.0;
    let id = body.id.unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
    let msg = InboundMessage {
        id: id.clone(),
        channel: "local-desktop".to_string(),
        peer_id: body.peer_id.unwrap_or_else(|| state.config.peer_id.clone()),
        peer_kind: body.peer_type.unwrap_or(PeerKind::Dm),
        sender_id: body.sender_id.unwrap_or_else(|| "desktop-user".to_string()),
        sender_name: body.sender_name,
        account_id: None,
        thread_id: None,
        text: body.text,
        media: body.media,
        reply_to: None,
        timestamp: chrono::Utc::now(),
        provider_raw: None,
    };
    info!(id = %id, peer = %msg.peer_id, "desktop inbound accepted");
    state.sink.message(msg).await;

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "accepted": true, "id": id })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventsQuery {
    #[serde(default)]
    pub peer_id: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

/// `GET /events` — per-peer SSE stream. The first frame is a named
/// `ready` event; everything after is an unnamed `data:` frame.
pub async fn events(
    State(state): State<Arc<DesktopState>>,
    Query(q): Query<EventsQuery>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&state, &headers, q.token.as_deref()) {
        return unauthorized();
    }
    let peer_id = q.peer_id.unwrap_or_else(|| state.config.peer_id.clone());
    let client_id = uuid::Uuid::new_v4().to_string();
    let (tx, mut rx) = tokio::sync::mpsc::channel::<SseEvent>(256);
    state.sse_clients.insert(
        client_id.clone(),
        SseClient {
            peer_id: peer_id.clone(),
            tx,
        },
    );
    info!(client = %client_id, peer = %peer_id, "SSE client attached");

    let guard = SseGuard {
        state: Arc::clone(&state),
        client_id,
    };
    let stream = async_stream::stream! {
        let _guard = guard;
        let ready = serde_json::json!({ "peerId": peer_id, "ts": now_ms() });
        yield Ok::<_, Infallible>(Event::default().event("ready").data(ready.to_string()));
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => yield Ok(Event::default().data(json)),
                Err(e) => debug!(error = %e, "unserializable SSE event dropped"),
            }
        }
    };
    Sse::new(stream).into_response()
}

/// Removes the SSE client registration when the response stream drops.
struct SseGuard {
    state: Arc<DesktopState>,
    client_id: String,
}

impl Drop for SseGuard {
    fn drop(&mut self) {
        self.state.sse_clients.remove(&self.client_id);
        debug!(client = %self.client_id, "SSE client detached");
    }
}
