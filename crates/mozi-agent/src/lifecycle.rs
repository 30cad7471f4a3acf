//! Session lifecycle rollover: temporal (idle window) and semantic
//! (topic-shift classifier) rotation, applied before a prompt turn runs.

use chrono::Utc;
use tracing::{debug, warn};

use mozi_core::config::schema::LifecycleConfig;
use mozi_core::config::EffectiveConfig;
use mozi_core::duration::parse_duration;
use mozi_sessions::Session;

use crate::context::HostContext;

/// Which rotation fired, for the metadata stamp and logs.
pub const ROTATION_TEMPORAL: &str = "temporal";
pub const ROTATION_SEMANTIC: &str = "semantic";

fn lifecycle_for<'a>(config: &'a EffectiveConfig, agent_id: &str) -> Option<&'a LifecycleConfig> {
    config
        .agent(agent_id)
        .and_then(|a| a.lifecycle.as_ref())
        .or(config.agents.defaults.lifecycle.as_ref())
}

/// Run the rollover checks; returns the rotation kind if one happened.
///
/// Temporal is checked first: a session idle past its active window
/// rotates unconditionally. Semantic only consults the classifier when
/// temporal did not fire and the debounce window has passed.
pub async fn maybe_rotate<C: HostContext + ?Sized>(
    ctx: &C,
    config: &EffectiveConfig,
    agent_id: &str,
    session: &Session,
    recent_user_turn: &str,
) -> Option<&'static str> {
    let lifecycle = lifecycle_for(config, agent_id)?;

    if let Some(temporal) = &lifecycle.temporal {
        if temporal.enabled {
            if let Some(window) = &temporal.active_window {
                match parse_duration(window) {
                    Ok(window) => {
                        let age = (Utc::now() - session.updated_at)
                            .to_std()
                            .unwrap_or_default();
                        if age > window {
                            if let Err(e) = ctx.sessions().rotate(&session.key, ROTATION_TEMPORAL) {
                                warn!(key = %session.key, error = %e, "temporal rotation failed");
                                return None;
                            }
                            return Some(ROTATION_TEMPORAL);
                        }
                    }
                    Err(e) => warn!(agent = %agent_id, error = %e, "bad activeWindow"),
                }
            }
        }
    }

    let semantic = lifecycle.semantic.as_ref().filter(|s| s.enabled)?;
    let classifier = ctx.classifier()?;

    // Debounce: a recent rotation of any kind suppresses the classifier.
    if let Some(last) = session.last_rotation_at() {
        let since = (Utc::now() - last).to_std().unwrap_or_default();
        if since.as_secs() < semantic.debounce_seconds {
            debug!(key = %session.key, "semantic rollover debounced");
            return None;
        }
    }

    let prior = last_user_utterance(session)?;
    match classifier.confidence(recent_user_turn, &prior).await {
        Ok(confidence) if confidence >= semantic.threshold => {
            if let Err(e) = ctx.sessions().rotate(&session.key, ROTATION_SEMANTIC) {
                warn!(key = %session.key, error = %e, "semantic rotation failed");
                return None;
            }
            Some(ROTATION_SEMANTIC)
        }
        Ok(confidence) => {
            debug!(key = %session.key, confidence, "topic shift below threshold");
            None
        }
        Err(e) => {
            // Classifier trouble never blocks the turn.
            warn!(key = %session.key, error = %e, "topic classifier failed");
            None
        }
    }
}

/// The session's last user utterance, for the classifier's `prior` input.
fn last_user_utterance(session: &Session) -> Option<String> {
    session
        .context
        .iter()
        .rev()
        .find(|entry| entry.get("role").and_then(|r| r.as_str()) == Some("user"))
        .and_then(|entry| entry.get("content").and_then(|c| c.as_str()))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn last_user_utterance_finds_most_recent() {
        let mut session = Session {
            key: mozi_sessions::SessionKey::parse("agent:a:main"),
            agent_id: "a".into(),
            status: mozi_sessions::SessionStatus::Idle,
            parent_key: None,
            context: vec![
                json!({"role": "user", "content": "first"}),
                json!({"role": "assistant", "content": "reply"}),
                json!({"role": "user", "content": "second"}),
            ],
            metadata: serde_json::Map::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(last_user_utterance(&session).as_deref(), Some("second"));

        session.context.clear();
        assert_eq!(last_user_utterance(&session), None);
    }
}
