use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mozi_sessions::SessionKey;

/// When a reminder fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ReminderSchedule {
    /// One-shot at a fixed instant; self-disables after firing.
    At { at: DateTime<Utc> },
    /// Periodic with a fixed interval.
    Every { every_secs: u64 },
    /// Cron expression, optionally evaluated in a named timezone.
    Cron { expr: String, tz: Option<String> },
}

/// What a firing reminder does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ReminderPayload {
    /// Injected into the prompt pipeline as a system-event message.
    SystemEvent { text: String },
    /// Injected as a regular agent turn.
    AgentTurn { prompt: String },
    /// Delivered verbatim through `channel.send`, bypassing the prompt path.
    SendMessage { text: String },
}

/// Persisted reminder row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reminder {
    pub id: String,
    pub session_key: SessionKey,
    pub schedule: ReminderSchedule,
    pub payload: ReminderPayload,
    pub enabled: bool,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub next_fire_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What the engine hands the host for delivery.
#[derive(Debug, Clone)]
pub enum SchedulerDelivery {
    /// Re-enters the full message-handler pipeline.
    Inbound(mozi_core::types::InboundMessage),
    /// Bypasses the prompt path; sent verbatim on the channel.
    Direct {
        channel: String,
        peer_id: String,
        text: String,
    },
}
