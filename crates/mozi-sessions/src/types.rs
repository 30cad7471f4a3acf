use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::key::SessionKey;

/// Lifecycle state of a session's dispatch lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Running,
    Queued,
    Cancelled,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Running => "running",
            SessionStatus::Queued => "queued",
            SessionStatus::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(SessionStatus::Idle),
            "running" => Ok(SessionStatus::Running),
            "queued" => Ok(SessionStatus::Queued),
            "cancelled" => Ok(SessionStatus::Cancelled),
            other => Err(format!("unknown session status '{other}'")),
        }
    }
}

/// Metadata keys the runtime writes. Free-form keys are allowed alongside.
pub mod meta {
    pub const MODEL_OVERRIDE: &str = "modelOverride";
    pub const THINKING_LEVEL: &str = "thinkingLevel";
    pub const REASONING_VISIBILITY: &str = "reasoningVisibility";
    pub const LAST_ROTATION_AT: &str = "lastRotationAt";
    pub const LAST_ROTATION_TYPE: &str = "lastRotationType";
    pub const MEMORY_FLUSH: &str = "memoryFlush";
}

/// One persisted conversation session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub key: SessionKey,
    pub agent_id: String,
    pub status: SessionStatus,
    /// Nominal link to a spawning session (sub-agent runs); no cascade.
    pub parent_key: Option<SessionKey>,
    /// Prior messages in whatever shape the prompt driver consumes.
    pub context: Vec<serde_json::Value>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    pub fn model_override(&self) -> Option<&str> {
        self.metadata_str(meta::MODEL_OVERRIDE)
    }

    pub fn last_rotation_at(&self) -> Option<DateTime<Utc>> {
        self.metadata_str(meta::LAST_ROTATION_AT)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// Attributes supplied at creation; later `get_or_create` calls only fill
/// attributes that are still unset.
#[derive(Debug, Clone, Default)]
pub struct SessionAttrs {
    pub agent_id: Option<String>,
    pub parent_key: Option<SessionKey>,
}

/// Filter for [`SessionStore::list`](crate::store::SessionStore::list).
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub agent_id: Option<String>,
    /// Matches the channel segment decoded from the key.
    pub channel: Option<String>,
    pub status: Option<SessionStatus>,
}
