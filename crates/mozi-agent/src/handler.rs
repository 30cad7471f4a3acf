//! Message handler state machine.
//!
//! Four phases per inbound message: classify, command branch, prompt
//! branch, observability. The prompt branch owns phase emission, typing,
//! streaming edits, reply assembly, and error surfacing; the kernel owns
//! serialization and fallback.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use mozi_channels::ChannelAdapter;
use mozi_core::routes::LastRoute;
use mozi_core::text::redact_secrets;
use mozi_core::types::{InboundMessage, MediaSource, OutboundMessage, Phase, Route};
use mozi_dispatch::{DriverError, TurnEvent, TurnOutcome, TurnRequest, TurnSpec};
use mozi_sessions::types::meta;
use mozi_sessions::{build_session_key, Session, SessionAttrs, SessionKey};

use crate::commands::{handle_command, localized_intent, CommandAction};
use crate::context::HostContext;
use crate::lifecycle::maybe_rotate;
use crate::registry::ModelRegistry;
use crate::router::resolve_route;

/// Minimum newly streamed characters between two progressive edits.
const EDIT_STRIDE: usize = 120;
/// User-visible error detail cap.
const ERROR_DETAIL_MAX: usize = 200;
/// Assumed context window when the model config does not declare one.
const DEFAULT_CONTEXT_WINDOW: u64 = 200_000;

pub struct MessageHandler<C: HostContext> {
    ctx: Arc<C>,
}

impl<C: HostContext + 'static> MessageHandler<C> {
    pub fn new(ctx: Arc<C>) -> Self {
        Self { ctx }
    }

    /// Entry point for every inbound message, user-typed or synthesized.
    pub async fn handle(&self, msg: InboundMessage) {
        let trimmed = msg.text.trim();
        let effective_text = localized_intent(trimmed).unwrap_or(trimmed).to_string();

        let config = self.ctx.config();
        let default_agent = self.ctx.default_agent_id();
        let route = resolve_route(&msg, &default_agent, config.as_ref());
        let key = build_session_key(&route.agent_id, &msg, route.dm_scope);

        if let Err(e) = self.ctx.sessions().get_or_create(
            &key,
            SessionAttrs {
                agent_id: Some(route.agent_id.clone()),
                parent_key: None,
            },
        ) {
            warn!(key = %key, error = %e, "session bootstrap failed");
            return;
        }

        // Classify: command branch or prompt branch.
        if effective_text.starts_with('/') {
            match handle_command(self.ctx.as_ref(), &msg, &route, &key, &effective_text).await {
                CommandAction::Reply(reply) => {
                    self.send_text(&msg.channel, &msg.peer_id, &reply).await;
                }
                CommandAction::PromptOneShot {
                    thinking_level,
                    text,
                } => {
                    let mut prompt_msg = msg.clone();
                    prompt_msg.text = text;
                    self.prompt_branch(prompt_msg, route, key, Some(thinking_level))
                        .await;
                }
                CommandAction::Ignored => {
                    debug!(text = %effective_text, "unknown command ignored");
                }
            }
            return;
        }

        if effective_text.is_empty() && msg.media.is_empty() {
            return;
        }
        self.prompt_branch(msg, route, key, None).await;
    }

    /// Prompt branch. Step order is load-bearing: routing before STT,
    /// STT before the modality check, rollover before dispatch.
    async fn prompt_branch(
        &self,
        mut msg: InboundMessage,
        route: Route,
        key: SessionKey,
        one_shot_thinking: Option<String>,
    ) {
        let ctx = self.ctx.as_ref();
        let Some(adapter) = ctx.channel(&msg.channel) else {
            warn!(channel = %msg.channel, "no adapter for inbound channel");
            return;
        };

        // 1. Remember the route for heartbeat re-entry.
        ctx.routes().record(
            &route.agent_id,
            LastRoute {
                channel: msg.channel.clone(),
                peer_id: msg.peer_id.clone(),
                peer_kind: msg.peer_kind,
                account_id: msg.account_id.clone(),
                thread_id: msg.thread_id.clone(),
            },
        );

        let config = ctx.config();
        let registry = config
            .as_ref()
            .map(ModelRegistry::from_config)
            .unwrap_or_default();

        // 2. STT preprocessing for voice/audio attachments.
        let transcripts = self.transcribe_audio(&mut msg).await;

        let Ok(mut session) = ctx
            .sessions()
            .get_or_create(
                &key,
                SessionAttrs {
                    agent_id: Some(route.agent_id.clone()),
                    parent_key: None,
                },
            )
            .map_err(|e| warn!(key = %key, error = %e, "session load failed"))
        else {
            return;
        };

        // 3. Ensure a modality-capable model (or degrade to text).
        let mut primary = match config.as_ref().and_then(|c| {
            registry.primary_for(c, &route.agent_id, session.model_override())
        }) {
            Some(m) => m,
            None => {
                self.send_text(
                    &msg.channel,
                    &msg.peer_id,
                    "No model is configured. Add providers under `models` in the config.",
                )
                .await;
                return;
            }
        };
        if let Some(notice) =
            self.ensure_modality(&registry, &mut primary, &msg, !transcripts.is_empty())
        {
            self.send_text(&msg.channel, &msg.peer_id, &notice).await;
        }

        // 4. Lifecycle rollover.
        if let Some(config) = config.as_ref() {
            if let Some(kind) =
                maybe_rotate(ctx, config, &route.agent_id, &session, &msg.text).await
            {
                info!(key = %key, rotation = kind, "session rotated before turn");
                match ctx.sessions().get(&key) {
                    Ok(Some(fresh)) => session = fresh,
                    _ => return,
                }
            }
        }

        // 5. Pre-overflow memory flush.
        self.maybe_flush_memory(&session, &registry, &route.agent_id)
            .await;

        // 6. phase=thinking, typing on.
        let phase_payload = serde_json::json!({
            "sessionKey": key.as_str(),
            "agentId": route.agent_id,
        });
        let _ = adapter
            .emit_phase(&msg.peer_id, Phase::Thinking, Some(phase_payload.clone()))
            .await;
        let typing = ctx.typing().acquire(adapter.as_ref(), &msg.peer_id).await;

        // 7. Compose and dispatch.
        let prompt = compose_prompt(&msg, &transcripts);
        let thinking_level = one_shot_thinking
            .or_else(|| {
                session
                    .metadata_str(meta::THINKING_LEVEL)
                    .map(str::to_string)
            })
            .or_else(|| {
                config.as_ref().and_then(|c| {
                    c.agent(&route.agent_id)
                        .and_then(|a| a.thinking.as_ref())
                        .or(c.agents.defaults.thinking.as_ref())
                        .and_then(|t| t.level.clone())
                })
            });
        let reasoning_stream = self.reasoning_visibility(&session, &route.agent_id) == "stream";

        info!(
            trace_id = %msg.id,
            key = %key,
            model = %primary,
            preview = %redact_secrets(&prompt.chars().take(200).collect::<String>()),
            "dispatching turn"
        );

        let (event_tx, event_rx) = mpsc::channel(256);
        let fallbacks = registry.fallbacks_for(&primary);
        let spec = TurnSpec {
            request: TurnRequest {
                session_key: key.clone(),
                agent_id: route.agent_id.clone(),
                model: primary.clone(),
                prompt: prompt.clone(),
                context: session.context.clone(),
                thinking_level,
                trace_id: msg.id.clone(),
            },
            fallback_models: fallbacks,
            events: event_tx,
            on_fallback: None,
        };
        let outcome_rx = ctx.kernel().dispatch(spec).await;

        // 8. Stream: progressive edits while the turn runs.
        let streamed = self
            .consume_stream(adapter.as_ref(), &msg, reasoning_stream, event_rx)
            .await;
        let outcome = match outcome_rx.await {
            Ok(outcome) => outcome,
            Err(_) => TurnOutcome::Failed(DriverError::Model("kernel dropped the turn".into())),
        };

        // 9–11. Reply assembly, speaking, idle.
        match outcome {
            TurnOutcome::Ok { final_text, model } => {
                let visible_final = final_text
                    .as_deref()
                    .map(|t| visible_text(t, reasoning_stream))
                    .filter(|t| !t.is_empty());
                let visible_streamed =
                    Some(visible_text(&streamed.text, reasoning_stream)).filter(|t| !t.is_empty());

                let (source, reply) = match (&visible_final, &visible_streamed) {
                    (Some(f), Some(_)) => ("final_over_streamed", f.clone()),
                    (Some(f), None) => ("final_only", f.clone()),
                    (None, Some(s)) => ("streamed_only", s.clone()),
                    (None, None) => ("empty", String::new()),
                };
                info!(
                    trace_id = %msg.id,
                    key = %key,
                    model = %model,
                    source,
                    final_chars = final_text.as_deref().map(str::len).unwrap_or(0),
                    streamed_chars = streamed.text.len(),
                    "turn complete"
                );

                if !reply.is_empty() {
                    let _ = adapter
                        .emit_phase(&msg.peer_id, Phase::Speaking, Some(phase_payload.clone()))
                        .await;
                    self.deliver_reply(adapter.as_ref(), &msg, &streamed, &reply)
                        .await;
                    self.persist_turn(&key, &prompt, &reply);
                }
            }
            TurnOutcome::Failed(e) => {
                info!(trace_id = %msg.id, key = %key, error = %e, "turn failed");
                let text = user_error_text(&e);
                self.send_text(&msg.channel, &msg.peer_id, &text).await;
                let _ = adapter
                    .emit_phase(&msg.peer_id, Phase::Error, Some(phase_payload.clone()))
                    .await;
            }
            TurnOutcome::Timeout => {
                info!(trace_id = %msg.id, key = %key, "turn timed out");
                self.send_text(&msg.channel, &msg.peer_id, "This turn timed out.")
                    .await;
                let _ = adapter
                    .emit_phase(&msg.peer_id, Phase::Error, Some(phase_payload.clone()))
                    .await;
            }
            TurnOutcome::Interrupted { reason } => {
                // Silent: the /stop handler already replied.
                info!(trace_id = %msg.id, key = %key, reason, "turn interrupted");
            }
        }

        let _ = adapter
            .emit_phase(&msg.peer_id, Phase::Idle, Some(phase_payload))
            .await;
        drop(typing);
    }

    /// Pump driver events: accumulate streamed text, surface tool calls as
    /// `phase=executing`, and progressively edit the running reply on
    /// channels that support edits.
    async fn consume_stream(
        &self,
        adapter: &dyn ChannelAdapter,
        msg: &InboundMessage,
        reasoning_stream: bool,
        mut events: mpsc::Receiver<TurnEvent>,
    ) -> StreamedReply {
        let mut reply = StreamedReply::default();
        let mut last_edit_len = 0usize;

        while let Some(event) = events.recv().await {
            match event {
                TurnEvent::TextDelta(delta) => {
                    reply.text.push_str(&delta);
                    if !adapter.supports_edits() {
                        continue;
                    }
                    let visible = visible_text(&reply.text, reasoning_stream);
                    if visible.is_empty() || visible.len() < last_edit_len + EDIT_STRIDE {
                        continue;
                    }
                    last_edit_len = visible.len();
                    match &reply.message_id {
                        None => {
                            if let Ok(id) = adapter
                                .send(&msg.peer_id, &OutboundMessage::text(visible))
                                .await
                            {
                                reply.message_id = Some(id);
                            }
                        }
                        Some(id) => {
                            let _ = adapter.edit_message(id, &msg.peer_id, &visible).await;
                        }
                    }
                }
                TurnEvent::ToolCall { name, call_id } => {
                    let _ = adapter
                        .emit_phase(
                            &msg.peer_id,
                            Phase::Executing,
                            Some(serde_json::json!({
                                "toolName": name,
                                "toolCallId": call_id,
                            })),
                        )
                        .await;
                }
                // Final/Error terminate via the kernel outcome; Progress
                // only feeds the inactivity timer.
                TurnEvent::Final(_) | TurnEvent::Error(_) | TurnEvent::Progress => {}
            }
        }
        reply
    }

    /// Final delivery: edit the running reply into its terminal text when
    /// one exists, otherwise send fresh.
    async fn deliver_reply(
        &self,
        adapter: &dyn ChannelAdapter,
        msg: &InboundMessage,
        streamed: &StreamedReply,
        reply: &str,
    ) {
        if let Some(id) = &streamed.message_id {
            if adapter.edit_message(id, &msg.peer_id, reply).await.is_ok() {
                return;
            }
        }
        let _ = adapter
            .send(&msg.peer_id, &OutboundMessage::text(reply))
            .await;
    }

    async fn transcribe_audio(&self, msg: &mut InboundMessage) -> Vec<String> {
        let Some(stt) = self.ctx.stt() else {
            return Vec::new();
        };
        let mut transcripts = Vec::new();
        for attachment in msg.media.iter_mut().filter(|a| a.is_audio()) {
            let MediaSource::Bytes(bytes) = &attachment.source else {
                continue;
            };
            match stt.transcribe(bytes.clone()).await {
                Ok(text) if !text.trim().is_empty() => {
                    attachment.transcript = Some(text.clone());
                    transcripts.push(text);
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "attachment transcription failed"),
            }
        }
        transcripts
    }

    /// Step 3: switch to a modality-capable model, or return a degradation
    /// notice when none exists.
    fn ensure_modality(
        &self,
        registry: &ModelRegistry,
        primary: &mut String,
        msg: &InboundMessage,
        has_transcript: bool,
    ) -> Option<String> {
        let needed: Vec<&'static str> = msg
            .media
            .iter()
            .filter(|a| !(a.is_audio() && has_transcript))
            .map(|a| a.kind.modality())
            .collect();
        if needed.is_empty() {
            return None;
        }

        let declared: Vec<String> = registry
            .get(primary)
            .map(|m| m.config.input.clone())
            .unwrap_or_default();
        let missing: Vec<&&str> = needed
            .iter()
            .filter(|m| !declared.iter().any(|d| d == **m))
            .collect();
        if missing.is_empty() {
            return None;
        }

        for modality in &missing {
            if let Some(capable) = registry.pick_by_modality(modality) {
                info!(model = %capable, modality = %**modality, "temporary modality switch");
                *primary = capable;
                return None;
            }
        }

        // Nobody takes this modality; degrade to text and say so.
        let mut notice = format!(
            "None of the configured models accept {} input; continuing with text only.\nCandidates checked:",
            missing
                .iter()
                .map(|m| **m)
                .collect::<Vec<_>>()
                .join("/")
        );
        for reference in registry.refs().iter().take(5) {
            if let Some(model) = registry.get(reference) {
                notice.push_str(&format!(
                    "\n- `{}` ({}.input = [{}])",
                    model.reference,
                    model.config_path,
                    model.config.input.join(", ")
                ));
            }
        }
        Some(notice)
    }

    async fn maybe_flush_memory(
        &self,
        session: &Session,
        registry: &ModelRegistry,
        agent_id: &str,
    ) {
        let Some(memory) = self.ctx.memory() else {
            return;
        };
        let Some(config) = self.ctx.config() else {
            return;
        };
        let threshold = config
            .agent(agent_id)
            .and_then(|a| a.context_pruning.as_ref())
            .or(config.agents.defaults.context_pruning.as_ref())
            .and_then(|p| p.on_overflow);
        let Some(threshold) = threshold else {
            return;
        };

        let window = registry
            .primary_for(&config, agent_id, session.model_override())
            .and_then(|m| registry.get(&m).and_then(|r| r.config.context_window))
            .unwrap_or(DEFAULT_CONTEXT_WINDOW);
        let est_tokens: usize = session
            .context
            .iter()
            .map(|v| v.to_string().len() / 4)
            .sum();
        let ratio = est_tokens as f64 / window as f64;
        if ratio <= threshold {
            return;
        }

        info!(key = %session.key, ratio, threshold, "pre-overflow memory flush");
        if let Err(e) = memory.flush(&session.key).await {
            warn!(key = %session.key, error = %e, "memory flush failed");
            return;
        }
        let mut patch = serde_json::Map::new();
        patch.insert(
            meta::MEMORY_FLUSH.to_string(),
            serde_json::json!({
                "at": chrono::Utc::now().to_rfc3339(),
                "ratio": ratio,
            }),
        );
        let _ = self.ctx.sessions().patch_metadata(&session.key, &patch);
    }

    fn reasoning_visibility(&self, session: &Session, agent_id: &str) -> String {
        session
            .metadata_str(meta::REASONING_VISIBILITY)
            .map(str::to_string)
            .or_else(|| {
                self.ctx.config().and_then(|c| {
                    c.agent(agent_id)
                        .and_then(|a| a.thinking.as_ref())
                        .or(c.agents.defaults.thinking.as_ref())
                        .and_then(|t| t.reasoning.clone())
                })
            })
            .unwrap_or_else(|| "off".to_string())
    }

    /// Write the completed exchange through to the session context.
    fn persist_turn(&self, key: &SessionKey, prompt: &str, reply: &str) {
        let entries = vec![
            serde_json::json!({ "role": "user", "content": prompt }),
            serde_json::json!({ "role": "assistant", "content": reply }),
        ];
        if let Err(e) = self.ctx.sessions().append_context(key, &entries) {
            warn!(key = %key, error = %e, "context persist failed");
        }
    }

    async fn send_text(&self, channel: &str, peer_id: &str, text: &str) {
        let Some(adapter) = self.ctx.channel(channel) else {
            warn!(channel, "no adapter for reply");
            return;
        };
        if let Err(e) = adapter.send(peer_id, &OutboundMessage::text(text)).await {
            warn!(channel, peer = peer_id, error = %e, "reply send failed");
        }
    }
}

#[derive(Debug, Default)]
struct StreamedReply {
    text: String,
    message_id: Option<String>,
}

/// Streamed text as the user should see it.
fn visible_text(text: &str, reasoning_stream: bool) -> String {
    if reasoning_stream {
        text.trim().to_string()
    } else {
        strip_think_blocks(text).trim().to_string()
    }
}

/// Remove `<think>…</think>` blocks. An unterminated opening tag hides
/// everything after it — mid-stream the model may still be thinking.
pub fn strip_think_blocks(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        match rest.find("<think>") {
            None => {
                out.push_str(rest);
                break;
            }
            Some(start) => {
                out.push_str(&rest[..start]);
                match rest[start..].find("</think>") {
                    Some(end) => rest = &rest[start + end + "</think>".len()..],
                    None => break,
                }
            }
        }
    }
    out
}

/// User-visible error text for a failed turn.
fn user_error_text(error: &DriverError) -> String {
    match error {
        DriverError::AuthMissing { key } => format!(
            "Missing authentication secret {key}. Use /setAuth set {key}=<value>"
        ),
        other => {
            let detail = redact_secrets(&other.to_string());
            let detail: String = detail.chars().take(ERROR_DETAIL_MAX).collect();
            format!("Something went wrong: {detail}")
        }
    }
}

/// Context window for the session's effective model.
pub fn context_window_for<C: HostContext + ?Sized>(ctx: &C, session: &Session) -> u64 {
    let Some(config) = ctx.config() else {
        return DEFAULT_CONTEXT_WINDOW;
    };
    let registry = ModelRegistry::from_config(&config);
    registry
        .primary_for(&config, &session.agent_id, session.model_override())
        .and_then(|m| registry.get(&m).and_then(|r| r.config.context_window))
        .unwrap_or(DEFAULT_CONTEXT_WINDOW)
}

/// Compose the driver prompt: raw text, voice transcript, media summary.
fn compose_prompt(msg: &InboundMessage, transcripts: &[String]) -> String {
    let mut prompt = msg.text.clone();
    if !transcripts.is_empty() {
        prompt.push_str("\n\n[voice transcript]\n");
        prompt.push_str(&transcripts.join("\n"));
    }

    let summaries: Vec<String> = msg
        .media
        .iter()
        .filter(|a| !a.is_audio() || a.transcript.is_none())
        .map(|a| {
            let mut line = format!("- {}", a.kind.modality());
            if let Some(mime) = &a.mime_type {
                line.push_str(&format!(" {mime}"));
            }
            if let (Some(w), Some(h)) = (a.width, a.height) {
                line.push_str(&format!(" {w}x{h}"));
            }
            if let Some(name) = &a.file_name {
                line.push_str(&format!(" \"{name}\""));
            }
            if let Some(caption) = &a.caption {
                line.push_str(&format!(" — {caption}"));
            }
            line
        })
        .collect();
    if !summaries.is_empty() {
        prompt.push_str("\n\n[attachments]\n");
        prompt.push_str(&summaries.join("\n"));
    }
    prompt
}
