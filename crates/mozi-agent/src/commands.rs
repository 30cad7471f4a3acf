//! Slash-command branch of the message handler.
//!
//! Commands short-circuit the prompt pipeline. Unknown commands are
//! silently ignored — no reply, no model call.

use std::sync::OnceLock;

use regex::Regex;
use tracing::info;

use mozi_core::types::{InboundMessage, Route};
use mozi_scheduler::heartbeat::{read_directive, set_directive, HEARTBEAT_FILE};
use mozi_scheduler::{ReminderPayload, ReminderSchedule};
use mozi_sessions::types::meta;
use mozi_sessions::SessionKey;

use crate::context::HostContext;
use crate::registry::ModelRegistry;

/// What the command branch decided.
#[derive(Debug)]
pub enum CommandAction {
    /// Send this reply on the originating channel.
    Reply(String),
    /// `/think level -- text`: run the prompt branch once with the level.
    PromptOneShot {
        thinking_level: String,
        text: String,
    },
    /// Unknown command: no reply, no prompt invocation.
    Ignored,
}

const VALID_THINKING_LEVELS: &[&str] = &["off", "low", "medium", "high"];
const VALID_REASONING: &[&str] = &["on", "off", "stream"];

/// Map localized intent phrases onto their slash commands.
pub fn localized_intent(text: &str) -> Option<&'static str> {
    static INTENTS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    let intents = INTENTS.get_or_init(|| {
        vec![
            (Regex::new(r"^取消心跳$").unwrap(), "/heartbeat off"),
            (Regex::new(r"^开启心跳$").unwrap(), "/heartbeat on"),
            (Regex::new(r"^心跳状态$").unwrap(), "/heartbeat status"),
        ]
    });
    let trimmed = text.trim();
    intents
        .iter()
        .find(|(re, _)| re.is_match(trimmed))
        .map(|(_, cmd)| *cmd)
}

/// Execute one slash command.
pub async fn handle_command<C: HostContext + ?Sized>(
    ctx: &C,
    msg: &InboundMessage,
    route: &Route,
    key: &SessionKey,
    text: &str,
) -> CommandAction {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix('/') else {
        return CommandAction::Ignored;
    };
    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((n, a)) => (n, a.trim()),
        None => (rest, ""),
    };
    let name = name.to_ascii_lowercase();
    info!(command = %name, key = %key, "command received");

    match name.as_str() {
        "start" | "help" => CommandAction::Reply(help_text()),
        "whoami" => CommandAction::Reply(whoami(msg, route, key)),
        "status" => CommandAction::Reply(status(ctx, route, key)),
        "new" => new_session(ctx, key),
        "models" => CommandAction::Reply(models(ctx)),
        "switch" => switch_model(ctx, key, args),
        "stop" => stop(ctx, key),
        "restart" => restart(ctx).await,
        "compact" => compact(ctx, key).await,
        "context" => CommandAction::Reply(context_usage(ctx, key)),
        "think" => think(ctx, key, args),
        "reasoning" => reasoning(ctx, key, args),
        "setauth" => auth_set(ctx, args).await,
        "unsetauth" => auth_unset(ctx, args).await,
        "listauth" => auth_list(ctx).await,
        "checkauth" => auth_check(ctx, args).await,
        "reminders" => reminders(ctx, key, args),
        "heartbeat" => heartbeat(ctx, route, args),
        _ => CommandAction::Ignored,
    }
}

fn help_text() -> String {
    "**Mozi commands**\n\
     - `/help` — this text\n\
     - `/whoami` — sender identity summary\n\
     - `/status` — runtime and model summary\n\
     - `/new` — start a fresh session\n\
     - `/models` — list available models\n\
     - `/switch <ref>` — set the session model (typo-tolerant)\n\
     - `/stop` — interrupt the active turn\n\
     - `/restart` — restart the runtime\n\
     - `/compact` — compact session memory\n\
     - `/context` — context usage breakdown\n\
     - `/think [level]` — thinking level (`off|low|medium|high`); `level -- text` applies once\n\
     - `/reasoning [on|off|stream]` — reasoning visibility\n\
     - `/setAuth set KEY=value`, `/unsetAuth KEY`, `/listAuth`, `/checkAuth KEY`\n\
     - `/reminders …` — create/list/snooze/cancel reminders\n\
     - `/heartbeat [status|on|off]` — heartbeat directive"
        .to_string()
}

fn whoami(msg: &InboundMessage, route: &Route, key: &SessionKey) -> String {
    format!(
        "You are `{}`{} on `{}` (peer `{}`, {}).\nAgent: `{}`\nSession: `{}`",
        msg.sender_id,
        msg.sender_name
            .as_deref()
            .map(|n| format!(" ({n})"))
            .unwrap_or_default(),
        msg.channel,
        msg.peer_id,
        msg.peer_kind.as_str(),
        route.agent_id,
        key
    )
}

fn status<C: HostContext + ?Sized>(ctx: &C, route: &Route, key: &SessionKey) -> String {
    let config = ctx.config();
    let registry = config
        .as_ref()
        .map(ModelRegistry::from_config)
        .unwrap_or_default();
    let session = ctx.sessions().get(key).ok().flatten();

    let model = session
        .as_ref()
        .and_then(|s| s.model_override().map(str::to_string))
        .or_else(|| {
            config
                .as_ref()
                .and_then(|c| registry.primary_for(c, &route.agent_id, None))
        })
        .unwrap_or_else(|| "unconfigured".to_string());
    let thinking = session
        .as_ref()
        .and_then(|s| s.metadata_str(meta::THINKING_LEVEL).map(str::to_string))
        .unwrap_or_else(|| "off".to_string());
    let reasoning = session
        .as_ref()
        .and_then(|s| s.metadata_str(meta::REASONING_VISIBILITY).map(str::to_string))
        .unwrap_or_else(|| "off".to_string());
    let state = session
        .as_ref()
        .map(|s| s.status.as_str())
        .unwrap_or("idle");

    format!(
        "**Mozi v{}**\n- Agent: `{}`\n- Model: `{}`\n- Thinking: `{}`\n- Reasoning: `{}`\n- Session: `{}` ({})",
        env!("CARGO_PKG_VERSION"),
        route.agent_id,
        model,
        thinking,
        reasoning,
        key,
        state
    )
}

fn new_session<C: HostContext + ?Sized>(ctx: &C, key: &SessionKey) -> CommandAction {
    match ctx.sessions().rotate(key, "manual") {
        Ok(()) => CommandAction::Reply("Started a fresh session. 新会话已开始。".to_string()),
        Err(e) => CommandAction::Reply(format!("Could not rotate the session: {e}")),
    }
}

fn models<C: HostContext + ?Sized>(ctx: &C) -> String {
    let registry = ctx
        .config()
        .map(|c| ModelRegistry::from_config(&c))
        .unwrap_or_default();
    if registry.is_empty() {
        return "No models are configured. Add providers under `models` in the config.".to_string();
    }
    let mut out = String::from("**Available models**\n");
    for reference in registry.refs() {
        out.push_str(&format!("- `{reference}`\n"));
    }
    out
}

fn switch_model<C: HostContext + ?Sized>(ctx: &C, key: &SessionKey, args: &str) -> CommandAction {
    let registry = ctx
        .config()
        .map(|c| ModelRegistry::from_config(&c))
        .unwrap_or_default();

    if args.is_empty() {
        let current = ctx
            .sessions()
            .get(key)
            .ok()
            .flatten()
            .and_then(|s| s.model_override().map(str::to_string));
        return CommandAction::Reply(match current {
            Some(m) => format!("Session model override: `{m}`"),
            None => "No session model override; the agent default applies.".to_string(),
        });
    }

    match registry.resolve(args) {
        Some(resolved) => {
            let mut patch = serde_json::Map::new();
            patch.insert(
                meta::MODEL_OVERRIDE.to_string(),
                serde_json::Value::String(resolved.clone()),
            );
            match ctx.sessions().patch_metadata(key, &patch) {
                Ok(_) => {
                    let corrected = if resolved != args {
                        format!(" (corrected from `{args}`)")
                    } else {
                        String::new()
                    };
                    CommandAction::Reply(format!("Session model set to `{resolved}`{corrected}."))
                }
                Err(e) => CommandAction::Reply(format!("Could not store the override: {e}")),
            }
        }
        None => CommandAction::Reply(format!(
            "Unknown model `{args}`. Use `/models` to list registered refs."
        )),
    }
}

fn stop<C: HostContext + ?Sized>(ctx: &C, key: &SessionKey) -> CommandAction {
    let interrupted = ctx.kernel().interrupt(key, "user stop");
    CommandAction::Reply(if interrupted {
        "Interrupted the active turn.".to_string()
    } else {
        "Nothing is running for this session.".to_string()
    })
}

async fn restart<C: HostContext + ?Sized>(ctx: &C) -> CommandAction {
    match ctx.runtime_control() {
        Some(control) => match control.restart().await {
            Ok(()) => CommandAction::Reply("Restarting the runtime…".to_string()),
            Err(e) => CommandAction::Reply(format!("Restart failed: {e}")),
        },
        None => CommandAction::Reply("Runtime control is not available.".to_string()),
    }
}

async fn compact<C: HostContext + ?Sized>(ctx: &C, key: &SessionKey) -> CommandAction {
    match ctx.memory() {
        Some(memory) => match memory.compact(key).await {
            Ok(summary) => CommandAction::Reply(format!("Memory compacted. {summary}")),
            Err(e) => CommandAction::Reply(format!("Compaction failed: {e}")),
        },
        None => CommandAction::Reply("Memory backend is not configured.".to_string()),
    }
}

fn context_usage<C: HostContext + ?Sized>(ctx: &C, key: &SessionKey) -> String {
    let Some(session) = ctx.sessions().get(key).ok().flatten() else {
        return "No session state yet.".to_string();
    };
    let chars: usize = session
        .context
        .iter()
        .map(|v| v.to_string().len())
        .sum();
    let est_tokens = chars / 4;
    let window = crate::handler::context_window_for(ctx, &session);
    let ratio = est_tokens as f64 / window as f64;
    format!(
        "**Context usage**\n- Entries: {}\n- Estimated tokens: ~{}\n- Window: {}\n- Usage: {:.1}%",
        session.context.len(),
        est_tokens,
        window,
        ratio * 100.0
    )
}

fn think<C: HostContext + ?Sized>(ctx: &C, key: &SessionKey, args: &str) -> CommandAction {
    if args.is_empty() {
        let current = ctx
            .sessions()
            .get(key)
            .ok()
            .flatten()
            .and_then(|s| s.metadata_str(meta::THINKING_LEVEL).map(str::to_string))
            .unwrap_or_else(|| "off".to_string());
        return CommandAction::Reply(format!(
            "Thinking level: `{current}`. Set with `/think off|low|medium|high`."
        ));
    }

    // One-shot form: `level -- remaining text` runs a single prompt turn.
    if let Some((level, remainder)) = args.split_once("--") {
        let level = level.trim().to_ascii_lowercase();
        let remainder = remainder.trim();
        if VALID_THINKING_LEVELS.contains(&level.as_str()) && !remainder.is_empty() {
            return CommandAction::PromptOneShot {
                thinking_level: level,
                text: remainder.to_string(),
            };
        }
    }

    let level = args.to_ascii_lowercase();
    if !VALID_THINKING_LEVELS.contains(&level.as_str()) {
        return CommandAction::Reply(format!(
            "Unknown thinking level `{args}`. Valid: off, low, medium, high."
        ));
    }
    let mut patch = serde_json::Map::new();
    patch.insert(
        meta::THINKING_LEVEL.to_string(),
        serde_json::Value::String(level.clone()),
    );
    match ctx.sessions().patch_metadata(key, &patch) {
        Ok(_) => CommandAction::Reply(format!("Thinking level set to `{level}`.")),
        Err(e) => CommandAction::Reply(format!("Could not store the level: {e}")),
    }
}

fn reasoning<C: HostContext + ?Sized>(ctx: &C, key: &SessionKey, args: &str) -> CommandAction {
    if args.is_empty() {
        let current = ctx
            .sessions()
            .get(key)
            .ok()
            .flatten()
            .and_then(|s| s.metadata_str(meta::REASONING_VISIBILITY).map(str::to_string))
            .unwrap_or_else(|| "off".to_string());
        return CommandAction::Reply(format!("Reasoning visibility: `{current}`."));
    }
    let mode = args.to_ascii_lowercase();
    if !VALID_REASONING.contains(&mode.as_str()) {
        return CommandAction::Reply(
            "Reasoning visibility must be `on`, `off`, or `stream`.".to_string(),
        );
    }
    let mut patch = serde_json::Map::new();
    patch.insert(
        meta::REASONING_VISIBILITY.to_string(),
        serde_json::Value::String(mode.clone()),
    );
    match ctx.sessions().patch_metadata(key, &patch) {
        Ok(_) => CommandAction::Reply(format!("Reasoning visibility set to `{mode}`.")),
        Err(e) => CommandAction::Reply(format!("Could not store the setting: {e}")),
    }
}

async fn auth_set<C: HostContext + ?Sized>(ctx: &C, args: &str) -> CommandAction {
    let Some(auth) = ctx.auth() else {
        return CommandAction::Reply("Auth commands are disabled.".to_string());
    };
    // Accept both `/setAuth set KEY=value` and `/setAuth KEY=value`.
    let spec = args.strip_prefix("set ").unwrap_or(args).trim();
    let Some((auth_key, value)) = spec.split_once('=') else {
        return CommandAction::Reply("Usage: `/setAuth set KEY=value`".to_string());
    };
    match auth.set_secret(auth_key.trim(), value.trim()).await {
        Ok(()) => CommandAction::Reply(format!("Secret `{}` stored.", auth_key.trim())),
        Err(e) => CommandAction::Reply(format!("Could not store the secret: {e}")),
    }
}

async fn auth_unset<C: HostContext + ?Sized>(ctx: &C, args: &str) -> CommandAction {
    let Some(auth) = ctx.auth() else {
        return CommandAction::Reply("Auth commands are disabled.".to_string());
    };
    if args.is_empty() {
        return CommandAction::Reply("Usage: `/unsetAuth KEY`".to_string());
    }
    match auth.unset_secret(args).await {
        Ok(()) => CommandAction::Reply(format!("Secret `{args}` removed.")),
        Err(e) => CommandAction::Reply(format!("Could not remove the secret: {e}")),
    }
}

async fn auth_list<C: HostContext + ?Sized>(ctx: &C) -> CommandAction {
    let Some(auth) = ctx.auth() else {
        return CommandAction::Reply("Auth commands are disabled.".to_string());
    };
    match auth.list_secrets().await {
        Ok(keys) if keys.is_empty() => CommandAction::Reply("No secrets stored.".to_string()),
        Ok(keys) => CommandAction::Reply(format!("Stored secrets: {}", keys.join(", "))),
        Err(e) => CommandAction::Reply(format!("Could not list secrets: {e}")),
    }
}

async fn auth_check<C: HostContext + ?Sized>(ctx: &C, args: &str) -> CommandAction {
    let Some(auth) = ctx.auth() else {
        return CommandAction::Reply("Auth commands are disabled.".to_string());
    };
    if args.is_empty() {
        return CommandAction::Reply("Usage: `/checkAuth KEY`".to_string());
    }
    match auth.check_secret(args).await {
        Ok(true) => CommandAction::Reply(format!("Secret `{args}` is set and valid.")),
        Ok(false) => CommandAction::Reply(format!("Secret `{args}` is missing or rejected.")),
        Err(e) => CommandAction::Reply(format!("Check failed: {e}")),
    }
}

fn reminders<C: HostContext + ?Sized>(ctx: &C, key: &SessionKey, args: &str) -> CommandAction {
    let Some(store) = ctx.reminders() else {
        return CommandAction::Reply("Reminders are not available.".to_string());
    };
    let mut parts = args.split_whitespace();
    let sub = parts.next().unwrap_or("list");

    match sub {
        "list" => {
            let rows = match store.list(Some(key)) {
                Ok(r) => r,
                Err(e) => return CommandAction::Reply(format!("Could not list reminders: {e}")),
            };
            if rows.is_empty() {
                return CommandAction::Reply("No reminders for this session.".to_string());
            }
            let mut out = String::from("**Reminders**\n");
            for r in rows {
                let next = r
                    .next_fire_at
                    .map(|dt| dt.to_rfc3339())
                    .unwrap_or_else(|| "—".to_string());
                let state = if r.enabled { "on" } else { "off" };
                out.push_str(&format!("- `{}` [{}] next: {} — {}\n", r.id, state, next, payload_summary(&r.payload)));
            }
            CommandAction::Reply(out)
        }
        "create" => {
            let rest: Vec<&str> = parts.collect();
            match parse_create(&rest) {
                Ok((schedule, text)) => {
                    match store.create(key, schedule, ReminderPayload::AgentTurn { prompt: text }) {
                        Ok(r) => CommandAction::Reply(format!("Reminder `{}` created.", r.id)),
                        Err(e) => CommandAction::Reply(format!("Could not create reminder: {e}")),
                    }
                }
                Err(usage) => CommandAction::Reply(usage),
            }
        }
        "snooze" => {
            let id = parts.next().unwrap_or_default();
            let dur = parts.next().unwrap_or("10m");
            match mozi_core::duration::parse_duration(dur) {
                Ok(d) => match store.snooze(id, d.as_secs()) {
                    Ok(r) => CommandAction::Reply(format!(
                        "Reminder `{}` snoozed until {}.",
                        r.id,
                        r.next_fire_at.map(|dt| dt.to_rfc3339()).unwrap_or_default()
                    )),
                    Err(e) => CommandAction::Reply(format!("Snooze failed: {e}")),
                },
                Err(e) => CommandAction::Reply(format!("Bad duration: {e}")),
            }
        }
        "cancel" | "off" => {
            let id = parts.next().unwrap_or_default();
            match store.set_enabled(id, false) {
                Ok(()) => CommandAction::Reply(format!("Reminder `{id}` disabled.")),
                Err(e) => CommandAction::Reply(format!("Cancel failed: {e}")),
            }
        }
        "on" => {
            let id = parts.next().unwrap_or_default();
            match store.set_enabled(id, true) {
                Ok(()) => CommandAction::Reply(format!("Reminder `{id}` enabled.")),
                Err(e) => CommandAction::Reply(format!("Enable failed: {e}")),
            }
        }
        "delete" => {
            let id = parts.next().unwrap_or_default();
            match store.delete(id) {
                Ok(()) => CommandAction::Reply(format!("Reminder `{id}` deleted.")),
                Err(e) => CommandAction::Reply(format!("Delete failed: {e}")),
            }
        }
        other => CommandAction::Reply(format!(
            "Unknown reminders subcommand `{other}`. Use list, create, snooze, cancel, on, delete."
        )),
    }
}

fn parse_create(rest: &[&str]) -> Result<(ReminderSchedule, String), String> {
    const USAGE: &str = "Usage: `/reminders create every <duration> <text>` | \
                         `/reminders create at <rfc3339> <text>` | \
                         `/reminders create cron <expr> -- <text>`";
    match rest.first() {
        Some(&"every") => {
            let dur = rest.get(1).ok_or(USAGE)?;
            let secs = mozi_core::duration::parse_duration(dur)
                .map_err(|e| format!("Bad duration: {e}"))?
                .as_secs();
            let text = rest[2..].join(" ");
            if text.is_empty() {
                return Err(USAGE.to_string());
            }
            Ok((ReminderSchedule::Every { every_secs: secs }, text))
        }
        Some(&"at") => {
            let ts = rest.get(1).ok_or(USAGE)?;
            let at = chrono::DateTime::parse_from_rfc3339(ts)
                .map_err(|e| format!("Bad timestamp: {e}"))?
                .with_timezone(&chrono::Utc);
            let text = rest[2..].join(" ");
            if text.is_empty() {
                return Err(USAGE.to_string());
            }
            Ok((ReminderSchedule::At { at }, text))
        }
        Some(&"cron") => {
            let joined = rest[1..].join(" ");
            let (expr, text) = joined.split_once(" -- ").ok_or(USAGE)?;
            if expr.trim().is_empty() || text.trim().is_empty() {
                return Err(USAGE.to_string());
            }
            Ok((
                ReminderSchedule::Cron {
                    expr: expr.trim().to_string(),
                    tz: None,
                },
                text.trim().to_string(),
            ))
        }
        _ => Err(USAGE.to_string()),
    }
}

fn payload_summary(payload: &ReminderPayload) -> String {
    match payload {
        ReminderPayload::AgentTurn { prompt } => prompt.clone(),
        ReminderPayload::SystemEvent { text } => format!("[system] {text}"),
        ReminderPayload::SendMessage { text } => format!("[send] {text}"),
    }
}

fn heartbeat<C: HostContext + ?Sized>(ctx: &C, route: &Route, args: &str) -> CommandAction {
    let Some(config) = ctx.config() else {
        return CommandAction::Reply("Config is unavailable.".to_string());
    };
    let Some(workspace) = config.agent_workspace(&route.agent_id) else {
        return CommandAction::Reply(format!(
            "Agent `{}` has no workspace directory configured.",
            route.agent_id
        ));
    };
    let path = workspace.join(HEARTBEAT_FILE);

    match args.trim() {
        "" | "status" => {
            let merged = config.heartbeat_for(&route.agent_id);
            let config_enabled = merged.enabled == Some(true);
            let directive = std::fs::read_to_string(&path)
                .ok()
                .and_then(|t| read_directive(&t));
            let effective = config_enabled && directive != Some(false);
            CommandAction::Reply(format!(
                "Heartbeat: {} (config: {}, directive: {})",
                if effective { "active" } else { "inactive" },
                if config_enabled { "enabled" } else { "disabled" },
                match directive {
                    Some(true) => "on",
                    Some(false) => "off",
                    None => "unset",
                }
            ))
        }
        "on" | "off" => {
            let enabled = args.trim() == "on";
            let current = std::fs::read_to_string(&path).unwrap_or_default();
            let updated = set_directive(&current, enabled);
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            match std::fs::write(&path, updated) {
                Ok(()) => CommandAction::Reply(format!(
                    "Heartbeat directive set to `{}` in {}.",
                    args.trim(),
                    HEARTBEAT_FILE
                )),
                Err(e) => CommandAction::Reply(format!("Could not update {HEARTBEAT_FILE}: {e}")),
            }
        }
        other => CommandAction::Reply(format!(
            "Unknown heartbeat subcommand `{other}`. Use status, on, or off."
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn localized_intents_map_to_commands() {
        assert_eq!(localized_intent("取消心跳"), Some("/heartbeat off"));
        assert_eq!(localized_intent("  开启心跳  "), Some("/heartbeat on"));
        assert_eq!(localized_intent("心跳状态"), Some("/heartbeat status"));
        assert_eq!(localized_intent("hello"), None);
        assert_eq!(localized_intent("请取消心跳吧"), None);
    }

    #[test]
    fn create_parser_accepts_every_at_cron() {
        let (s, text) = parse_create(&["every", "15m", "drink", "water"]).unwrap();
        assert_eq!(s, ReminderSchedule::Every { every_secs: 900 });
        assert_eq!(text, "drink water");

        let (s, _) = parse_create(&["at", "2030-01-01T09:00:00Z", "happy", "new", "year"]).unwrap();
        assert!(matches!(s, ReminderSchedule::At { .. }));

        let (s, text) = parse_create(&["cron", "0", "9", "*", "*", "*", "--", "stand", "up"]).unwrap();
        match s {
            ReminderSchedule::Cron { expr, tz } => {
                assert_eq!(expr, "0 9 * * *");
                assert!(tz.is_none());
            }
            other => panic!("expected cron, got {other:?}"),
        }
        assert_eq!(text, "stand up");
    }

    #[test]
    fn create_parser_rejects_garbage() {
        assert!(parse_create(&[]).is_err());
        assert!(parse_create(&["every"]).is_err());
        assert!(parse_create(&["every", "nonsense", "x"]).is_err());
        assert!(parse_create(&["at", "yesterday", "x"]).is_err());
        assert!(parse_create(&["cron", "0 9 * * *"]).is_err());
    }
}
