//! Route resolution: which agent answers an inbound message, and under
//! which DM scope.

use mozi_core::config::EffectiveConfig;
use mozi_core::types::{DmScope, InboundMessage, PeerKind, Route};

/// Resolve the agent and DM scope for a message.
///
/// First rule that yields an agent wins:
/// 1. Telegram per-group binding (`channels.telegram.groups[peerId]`)
/// 2. Channel-specific binding (`channels.<id>.agentId`)
/// 3. Generic routing table by peer kind
/// 4. The default agent
pub fn resolve_route(
    msg: &InboundMessage,
    default_agent: &str,
    config: Option<&EffectiveConfig>,
) -> Route {
    let dm_scope = dm_scope_for(msg, config);
    let Some(config) = config else {
        return Route {
            agent_id: default_agent.to_string(),
            dm_scope,
        };
    };

    // 1. Telegram group binding.
    if msg.channel == "telegram" && msg.peer_kind != PeerKind::Dm {
        if let Some(binding) = config
            .channels
            .telegram
            .as_ref()
            .and_then(|t| t.groups.get(&msg.peer_id))
            .and_then(|g| g.agent_id.clone())
        {
            return Route {
                agent_id: binding,
                dm_scope,
            };
        }
    }

    // 2. Channel-wide binding.
    let channel_binding = match msg.channel.as_str() {
        "telegram" => config
            .channels
            .telegram
            .as_ref()
            .and_then(|t| t.agent_id.clone()),
        "discord" => config
            .channels
            .discord
            .as_ref()
            .and_then(|d| d.agent_id.clone()),
        "local-desktop" => config.channels.local_desktop.agent_id.clone(),
        _ => None,
    };
    if let Some(agent_id) = channel_binding {
        return Route { agent_id, dm_scope };
    }

    // 3. Generic routing defaults by peer kind.
    let routed = match msg.peer_kind {
        PeerKind::Dm => config.channels.routing.dm_agent_id.clone(),
        _ => config.channels.routing.group_agent_id.clone(),
    };
    if let Some(agent_id) = routed {
        return Route { agent_id, dm_scope };
    }

    // 4. Fallback.
    Route {
        agent_id: default_agent.to_string(),
        dm_scope,
    }
}

/// Channel-specific `dmScope`, else the top-level one, else the default.
fn dm_scope_for(msg: &InboundMessage, config: Option<&EffectiveConfig>) -> DmScope {
    let Some(config) = config else {
        return DmScope::default();
    };
    let channel_scope = match msg.channel.as_str() {
        "telegram" => config.channels.telegram.as_ref().and_then(|t| t.dm_scope),
        "discord" => config.channels.discord.as_ref().and_then(|d| d.dm_scope),
        "local-desktop" => config.channels.local_desktop.dm_scope,
        _ => None,
    };
    channel_scope
        .or(config.channels.dm_scope)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn msg(channel: &str, peer_id: &str, kind: PeerKind) -> InboundMessage {
        InboundMessage {
            id: "m".into(),
            channel: channel.into(),
            peer_id: peer_id.into(),
            peer_kind: kind,
            sender_id: "s".into(),
            sender_name: None,
            account_id: None,
            thread_id: None,
            text: String::new(),
            media: Vec::new(),
            reply_to: None,
            timestamp: Utc::now(),
            provider_raw: None,
        }
    }

    fn config(value: serde_json::Value) -> EffectiveConfig {
        EffectiveConfig::from_value(&value).unwrap()
    }

    #[test]
    fn telegram_group_binding_wins() {
        let c = config(json!({
            "channels": {
                "telegram": {
                    "agentId": "channel-wide",
                    "groups": { "-1001": { "agentId": "group-agent" } }
                },
                "routing": { "groupAgentId": "generic" }
            }
        }));
        let route = resolve_route(&msg("telegram", "-1001", PeerKind::Group), "fallback", Some(&c));
        assert_eq!(route.agent_id, "group-agent");
    }

    #[test]
    fn group_binding_does_not_apply_to_dms() {
        let c = config(json!({
            "channels": {
                "telegram": { "groups": { "5": { "agentId": "group-agent" } } }
            }
        }));
        let route = resolve_route(&msg("telegram", "5", PeerKind::Dm), "fallback", Some(&c));
        assert_eq!(route.agent_id, "fallback");
    }

    #[test]
    fn channel_binding_beats_generic_routing() {
        let c = config(json!({
            "channels": {
                "discord": { "agentId": "discord-agent" },
                "routing": { "dmAgentId": "generic-dm" }
            }
        }));
        let route = resolve_route(&msg("discord", "1", PeerKind::Dm), "fallback", Some(&c));
        assert_eq!(route.agent_id, "discord-agent");
    }

    #[test]
    fn generic_routing_by_peer_kind() {
        let c = config(json!({
            "channels": {
                "routing": { "dmAgentId": "dm-agent", "groupAgentId": "group-agent" }
            }
        }));
        assert_eq!(
            resolve_route(&msg("telegram", "1", PeerKind::Dm), "f", Some(&c)).agent_id,
            "dm-agent"
        );
        assert_eq!(
            resolve_route(&msg("telegram", "1", PeerKind::Group), "f", Some(&c)).agent_id,
            "group-agent"
        );
        assert_eq!(
            resolve_route(&msg("discord", "1", PeerKind::Channel), "f", Some(&c)).agent_id,
            "group-agent"
        );
    }

    #[test]
    fn default_agent_when_nothing_matches() {
        let route = resolve_route(&msg("telegram", "1", PeerKind::Dm), "fallback", None);
        assert_eq!(route.agent_id, "fallback");
        assert_eq!(route.dm_scope, DmScope::PerChannelPeer);
    }

    #[test]
    fn dm_scope_channel_override_beats_top_level() {
        let c = config(json!({
            "channels": {
                "dmScope": "main",
                "telegram": { "dmScope": "per-peer" }
            }
        }));
        assert_eq!(
            resolve_route(&msg("telegram", "1", PeerKind::Dm), "f", Some(&c)).dm_scope,
            DmScope::PerPeer
        );
        assert_eq!(
            resolve_route(&msg("discord", "1", PeerKind::Dm), "f", Some(&c)).dm_scope,
            DmScope::Main
        );
    }
}
