//! Session key algebra.
//!
//! A session key is a canonical lowercase colon-delimited string. Two
//! inbound messages that canonicalize to the same key share all
//! per-session state, so the normalization here is load-bearing: every
//! segment passes through [`normalize_segment`] before joining.
//!
//! | Peer kind | Scope | Form |
//! |---|---|---|
//! | dm | main | `agent:{agent}:main` |
//! | dm | per-peer | `agent:{agent}:dm:{peer}` |
//! | dm | per-channel-peer | `agent:{agent}:{channel}:dm:{peer}` |
//! | dm | per-account-channel-peer | `agent:{agent}:{channel}:{account}:dm:{peer}` |
//! | group/channel | — | `agent:{agent}:{channel}:{kind}:{peer}` |
//!
//! A thread id appends `:thread:{thread}`.

use serde::{Deserialize, Serialize};

use mozi_core::types::{DmScope, InboundMessage, PeerKind};

/// Segment length cap from the grammar `[a-z0-9][a-z0-9_-]{0,63}`.
const MAX_SEGMENT_LEN: usize = 64;

pub const FALLBACK_AGENT: &str = "mozi";
pub const FALLBACK_CHANNEL: &str = "unknown";
pub const FALLBACK_PEER: &str = "unknown";
pub const FALLBACK_ACCOUNT: &str = "default";
pub const FALLBACK_THREAD: &str = "main";

/// Canonical session identifier. Always in normalized form by construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    /// Wrap an externally supplied key, re-normalizing each segment.
    ///
    /// Canonical input passes through unchanged; anything else is
    /// rewritten before use.
    pub fn parse(raw: &str) -> Self {
        let segments: Vec<String> = raw
            .split(':')
            .map(|s| normalize_segment(s, "x"))
            .collect();
        SessionKey(segments.join(":"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The agent segment (`agent:{agent}:…`).
    pub fn agent_id(&self) -> Option<&str> {
        let mut parts = self.0.split(':');
        match (parts.next(), parts.next()) {
            (Some("agent"), Some(agent)) => Some(agent),
            _ => None,
        }
    }

    /// The channel segment, when the key carries one.
    ///
    /// `agent:{a}:main` and `agent:{a}:dm:{p}` are channel-agnostic and
    /// yield `None`.
    pub fn channel(&self) -> Option<&str> {
        let parts: Vec<&str> = self.0.split(':').collect();
        match parts.get(2) {
            Some(&"main") | Some(&"dm") | None => None,
            Some(channel) => Some(channel),
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<SessionKey> for String {
    fn from(key: SessionKey) -> String {
        key.0
    }
}

/// Normalize one segment to the grammar `[a-z0-9][a-z0-9_-]{0,63}`.
///
/// Lowercases, collapses invalid characters to `-`, strips characters the
/// grammar forbids at the edges (so Telegram's negative group ids lose
/// their leading `-`), truncates to 64, and substitutes `fallback` when
/// nothing survives.
pub fn normalize_segment(raw: &str, fallback: &str) -> String {
    let mut out = String::with_capacity(raw.len().min(MAX_SEGMENT_LEN));
    for c in raw.trim().chars() {
        let lower = c.to_ascii_lowercase();
        match lower {
            'a'..='z' | '0'..='9' | '_' | '-' => out.push(lower),
            _ => out.push('-'),
        }
    }

    // First char must be alphanumeric; trailing dashes are never canonical.
    let start = out
        .find(|c: char| c.is_ascii_alphanumeric())
        .unwrap_or(out.len());
    let trimmed = out[start..].trim_end_matches('-');

    let mut result: String = trimmed.chars().take(MAX_SEGMENT_LEN).collect();
    // Truncation may expose a new trailing dash.
    while result.ends_with('-') {
        result.pop();
    }

    if result.is_empty() {
        fallback.to_string()
    } else {
        result
    }
}

fn segment(value: Option<&str>, fallback: &str) -> String {
    match value {
        Some(v) if !v.trim().is_empty() => normalize_segment(v, fallback),
        _ => fallback.to_string(),
    }
}

/// Build the canonical key for one routed inbound message.
pub fn build_session_key(agent_id: &str, msg: &InboundMessage, dm_scope: DmScope) -> SessionKey {
    let agent = segment(Some(agent_id), FALLBACK_AGENT);
    let channel = segment(Some(&msg.channel), FALLBACK_CHANNEL);
    let peer = segment(Some(&msg.peer_id), FALLBACK_PEER);

    let mut key = match msg.peer_kind {
        PeerKind::Dm => match dm_scope {
            DmScope::Main => format!("agent:{agent}:main"),
            DmScope::PerPeer => format!("agent:{agent}:dm:{peer}"),
            DmScope::PerChannelPeer => format!("agent:{agent}:{channel}:dm:{peer}"),
            DmScope::PerAccountChannelPeer => {
                let account = segment(msg.account_id.as_deref(), FALLBACK_ACCOUNT);
                format!("agent:{agent}:{channel}:{account}:dm:{peer}")
            }
        },
        kind => format!("agent:{agent}:{channel}:{}:{peer}", kind.as_str()),
    };

    if let Some(thread) = msg.thread_id.as_deref().filter(|t| !t.trim().is_empty()) {
        let thread = segment(Some(thread), FALLBACK_THREAD);
        key.push_str(&format!(":thread:{thread}"));
    }

    SessionKey(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn msg(channel: &str, peer_id: &str, peer_kind: PeerKind) -> InboundMessage {
        InboundMessage {
            id: "m1".into(),
            channel: channel.into(),
            peer_id: peer_id.into(),
            peer_kind,
            sender_id: "u1".into(),
            sender_name: None,
            account_id: None,
            thread_id: None,
            text: "hi".into(),
            media: Vec::new(),
            reply_to: None,
            timestamp: Utc::now(),
            provider_raw: None,
        }
    }

    #[test]
    fn telegram_dm_per_channel_peer() {
        let m = msg("Telegram", "-1001", PeerKind::Dm);
        let key = build_session_key("Mozi", &m, DmScope::PerChannelPeer);
        // Leading-dash stripping applies uniformly per the segment grammar.
        assert_eq!(key.as_str(), "agent:mozi:telegram:dm:1001");
    }

    #[test]
    fn scopes_produce_documented_forms() {
        let m = msg("discord", "777", PeerKind::Dm);
        assert_eq!(
            build_session_key("a", &m, DmScope::Main).as_str(),
            "agent:a:main"
        );
        assert_eq!(
            build_session_key("a", &m, DmScope::PerPeer).as_str(),
            "agent:a:dm:777"
        );
        assert_eq!(
            build_session_key("a", &m, DmScope::PerChannelPeer).as_str(),
            "agent:a:discord:dm:777"
        );
    }

    #[test]
    fn account_scope_uses_default_when_absent() {
        let m = msg("telegram", "5", PeerKind::Dm);
        let key = build_session_key("a", &m, DmScope::PerAccountChannelPeer);
        assert_eq!(key.as_str(), "agent:a:telegram:default:dm:5");
    }

    #[test]
    fn group_and_channel_kinds_are_fixed_form() {
        let g = msg("telegram", "100", PeerKind::Group);
        assert_eq!(
            build_session_key("a", &g, DmScope::Main).as_str(),
            "agent:a:telegram:group:100"
        );
        let c = msg("discord", "200", PeerKind::Channel);
        assert_eq!(
            build_session_key("a", &c, DmScope::PerPeer).as_str(),
            "agent:a:discord:channel:200"
        );
    }

    #[test]
    fn thread_id_appends_suffix() {
        let mut m = msg("telegram", "100", PeerKind::Group);
        m.thread_id = Some("42".into());
        assert_eq!(
            build_session_key("a", &m, DmScope::Main).as_str(),
            "agent:a:telegram:group:100:thread:42"
        );
    }

    #[test]
    fn equivalent_inputs_canonicalize_identically() {
        let a = msg("TELEGRAM", "User Name!", PeerKind::Dm);
        let b = msg("telegram", "user name?", PeerKind::Dm);
        let ka = build_session_key("Mozi", &a, DmScope::PerChannelPeer);
        let kb = build_session_key("mozi", &b, DmScope::PerChannelPeer);
        assert_eq!(ka, kb);
    }

    #[test]
    fn segment_normalization_grammar() {
        assert_eq!(normalize_segment("Hello World", "x"), "hello-world");
        assert_eq!(normalize_segment("--dashed--", "x"), "dashed");
        assert_eq!(normalize_segment("___", "x"), "x");
        assert_eq!(normalize_segment("", "x"), "x");
        assert_eq!(normalize_segment("ALLCAPS_42", "x"), "allcaps_42");
        let long = "a".repeat(100);
        assert_eq!(normalize_segment(&long, "x").len(), 64);
    }

    #[test]
    fn parse_rewrites_non_canonical_input() {
        let key = SessionKey::parse("Agent:MOZI:Telegram:DM:99");
        assert_eq!(key.as_str(), "agent:mozi:telegram:dm:99");
    }

    #[test]
    fn channel_extraction() {
        let m = msg("telegram", "1", PeerKind::Group);
        let key = build_session_key("a", &m, DmScope::Main);
        assert_eq!(key.channel(), Some("telegram"));
        assert_eq!(key.agent_id(), Some("a"));

        let dm = msg("x", "1", PeerKind::Dm);
        let main_key = build_session_key("a", &dm, DmScope::Main);
        assert_eq!(main_key.channel(), None);
        let per_peer = build_session_key("a", &dm, DmScope::PerPeer);
        assert_eq!(per_peer.channel(), None);
    }
}
