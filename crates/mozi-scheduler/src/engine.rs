//! Clock-driven re-entrant dispatch: the heartbeat ticker and the durable
//! reminder timer. Both synthesize inbound messages and hand them to the
//! host over an mpsc lane; heartbeat and reminder turns then share the
//! dispatch kernel's serialization guarantees like any user message.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use mozi_core::config::ConfigStore;
use mozi_core::duration::parse_duration;
use mozi_core::routes::RouteLedger;
use mozi_core::types::{InboundMessage, PeerKind};
use mozi_sessions::SessionKey;

use crate::heartbeat::{
    meaningful_content, read_directive, read_heartbeat_file, DEFAULT_HEARTBEAT_PROMPT,
    HEARTBEAT_SENDER,
};
use crate::store::ReminderStore;
use crate::types::{ReminderPayload, SchedulerDelivery};

/// Heartbeat evaluation cadence.
const HEARTBEAT_TICK: Duration = Duration::from_secs(15);
/// Default heartbeat period when an agent enables it without `every`.
const DEFAULT_HEARTBEAT_EVERY: &str = "30m";
/// Upper bound on the reminder timer sleep, so newly visible rows from
/// other processes are noticed even without a wakeup poke.
const REMINDER_SLEEP_CAP: Duration = Duration::from_secs(3600);

pub struct SchedulerEngine {
    config: Arc<ConfigStore>,
    reminders: Arc<ReminderStore>,
    routes: Arc<RouteLedger>,
    delivery_tx: mpsc::Sender<SchedulerDelivery>,
    last_beats: HashMap<String, DateTime<Utc>>,
}

impl SchedulerEngine {
    pub fn new(
        config: Arc<ConfigStore>,
        reminders: Arc<ReminderStore>,
        routes: Arc<RouteLedger>,
        delivery_tx: mpsc::Sender<SchedulerDelivery>,
    ) -> Self {
        Self {
            config,
            reminders,
            routes,
            delivery_tx,
            last_beats: HashMap::new(),
        }
    }

    /// Main loop. Runs until `shutdown` broadcasts `true`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!("scheduler engine started");
        let wakeup = self.reminders.wakeup();
        let mut hb_tick = tokio::time::interval(HEARTBEAT_TICK);
        hb_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let reminder_sleep = self.time_until_next_reminder();
            tokio::select! {
                _ = hb_tick.tick() => {
                    self.heartbeat_tick().await;
                }
                _ = tokio::time::sleep(reminder_sleep) => {
                    self.fire_due_reminders().await;
                }
                _ = wakeup.notified() => {
                    // A row changed; loop to re-arm the timer.
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("scheduler engine shutting down");
                        break;
                    }
                }
            }
        }
    }

    fn time_until_next_reminder(&self) -> Duration {
        match self.reminders.nearest_due() {
            Ok(Some(at)) => (at - Utc::now()).to_std().unwrap_or(Duration::ZERO),
            Ok(None) => REMINDER_SLEEP_CAP,
            Err(e) => {
                error!(error = %e, "nearest-due query failed");
                REMINDER_SLEEP_CAP
            }
        }
        .min(REMINDER_SLEEP_CAP)
    }

    /// Evaluate every agent's heartbeat state once.
    async fn heartbeat_tick(&mut self) {
        let config = match self.config.snapshot() {
            Ok(snap) => match snap.typed() {
                Some(c) => c,
                None => return,
            },
            Err(e) => {
                warn!(error = %e, "heartbeat tick: config unreadable");
                return;
            }
        };

        let agent_ids: Vec<String> = config.agents.entries.keys().cloned().collect();
        for agent_id in agent_ids {
            let hb = config.heartbeat_for(&agent_id);
            if hb.enabled != Some(true) {
                continue;
            }
            let every = hb.every.as_deref().unwrap_or(DEFAULT_HEARTBEAT_EVERY);
            let period = match parse_duration(every) {
                Ok(p) => p,
                Err(e) => {
                    // An invalid period disqualifies the agent entirely.
                    warn!(agent = %agent_id, error = %e, "heartbeat disabled by invalid period");
                    continue;
                }
            };

            let now = Utc::now();
            if let Some(last) = self.last_beats.get(&agent_id) {
                let elapsed = (now - *last).to_std().unwrap_or(Duration::ZERO);
                if elapsed < period {
                    continue;
                }
            }

            // No route yet — the agent has never spoken anywhere.
            let Some(route) = self.routes.get(&agent_id) else {
                debug!(agent = %agent_id, "heartbeat skipped: no last route");
                continue;
            };

            let Some(workspace) = config.agent_workspace(&agent_id) else {
                debug!(agent = %agent_id, "heartbeat skipped: no workspace");
                continue;
            };
            let Some(content) = read_heartbeat_file(&workspace) else {
                debug!(agent = %agent_id, "heartbeat skipped: no HEARTBEAT.md");
                continue;
            };
            if read_directive(&content) == Some(false) {
                debug!(agent = %agent_id, "heartbeat skipped: directive off");
                continue;
            }
            if meaningful_content(&content).is_empty() {
                debug!(agent = %agent_id, "heartbeat skipped: nothing meaningful");
                continue;
            }

            let prompt = hb
                .prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_HEARTBEAT_PROMPT.to_string());
            let mut msg = InboundMessage::text_message(
                route.channel.clone(),
                route.peer_id.clone(),
                route.peer_kind,
                HEARTBEAT_SENDER,
                prompt,
            );
            msg.account_id = route.account_id.clone();
            msg.thread_id = route.thread_id.clone();

            match self.delivery_tx.try_send(SchedulerDelivery::Inbound(msg)) {
                Ok(()) => {
                    info!(agent = %agent_id, channel = %route.channel, "heartbeat dispatched");
                    self.last_beats.insert(agent_id, now);
                }
                Err(e) => {
                    // Swallowed by design: the next tick retries.
                    warn!(agent = %agent_id, error = %e, "heartbeat delivery lane full");
                }
            }
        }
    }

    /// Fire every due reminder and reschedule/disable it.
    async fn fire_due_reminders(&mut self) {
        let now = Utc::now();
        let due = match self.reminders.due(now) {
            Ok(d) => d,
            Err(e) => {
                error!(error = %e, "due-reminder query failed");
                return;
            }
        };

        for reminder in due {
            let delivery = self.delivery_for(&reminder.session_key, &reminder.payload);
            match delivery {
                Some(delivery) => {
                    if let Err(e) = self.delivery_tx.try_send(delivery) {
                        warn!(id = %reminder.id, error = %e, "reminder delivery lane full");
                        // Leave the row due; the next wake retries it.
                        continue;
                    }
                    info!(id = %reminder.id, key = %reminder.session_key, "reminder fired");
                }
                None => {
                    warn!(id = %reminder.id, key = %reminder.session_key,
                          "reminder has no resolvable route; dropping this firing");
                }
            }
            if let Err(e) = self.reminders.mark_fired(&reminder.id, now) {
                error!(id = %reminder.id, error = %e, "mark_fired failed");
            }
        }
    }

    fn delivery_for(
        &self,
        key: &SessionKey,
        payload: &ReminderPayload,
    ) -> Option<SchedulerDelivery> {
        let (channel, peer_kind, peer_id) = self.resolve_route(key)?;
        match payload {
            ReminderPayload::SendMessage { text } => Some(SchedulerDelivery::Direct {
                channel,
                peer_id,
                text: text.clone(),
            }),
            ReminderPayload::AgentTurn { prompt } => {
                Some(SchedulerDelivery::Inbound(InboundMessage::text_message(
                    channel,
                    peer_id,
                    peer_kind,
                    "reminder",
                    prompt.clone(),
                )))
            }
            ReminderPayload::SystemEvent { text } => {
                Some(SchedulerDelivery::Inbound(InboundMessage::text_message(
                    channel,
                    peer_id,
                    peer_kind,
                    "reminder",
                    format!("[system event] {text}"),
                )))
            }
        }
    }

    /// The reminder's session key determines its route; channel-agnostic
    /// keys (`main`, bare `dm`) fall back to the agent's last route.
    fn resolve_route(&self, key: &SessionKey) -> Option<(String, PeerKind, String)> {
        if let Some(parts) = route_from_key(key) {
            return Some(parts);
        }
        let agent_id = key.agent_id()?;
        let route = self.routes.get(agent_id)?;
        Some((route.channel, route.peer_kind, route.peer_id))
    }
}

/// Decode `(channel, peer_kind, peer)` from a channel-carrying session key.
fn route_from_key(key: &SessionKey) -> Option<(String, PeerKind, String)> {
    let parts: Vec<&str> = key.as_str().split(':').collect();
    if parts.first() != Some(&"agent") || parts.len() < 3 {
        return None;
    }
    let rest = &parts[2..];
    match rest {
        // agent:{a}:main / agent:{a}:dm:{peer} — no channel segment.
        ["main", ..] | ["dm", ..] => None,
        [channel, "dm", peer, ..] => Some((channel.to_string(), PeerKind::Dm, peer.to_string())),
        [channel, _account, "dm", peer, ..] => {
            Some((channel.to_string(), PeerKind::Dm, peer.to_string()))
        }
        [channel, "group", peer, ..] => {
            Some((channel.to_string(), PeerKind::Group, peer.to_string()))
        }
        [channel, "channel", peer, ..] => {
            Some((channel.to_string(), PeerKind::Channel, peer.to_string()))
        }
        _ => None,
    }
}
