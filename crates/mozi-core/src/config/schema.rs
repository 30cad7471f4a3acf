//! Typed view of the effective configuration document.
//!
//! The document is permissive — unknown keys ride along untouched in the
//! raw JSON — but the sections the runtime reads are deserialized here and
//! checked by [`EffectiveConfig::validate`].

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::types::DmScope;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EffectiveConfig {
    pub meta: Option<Value>,
    pub paths: PathsConfig,
    /// Providers keyed by id.
    pub models: BTreeMap<String, ProviderConfig>,
    pub channels: ChannelsConfig,
    pub logging: LoggingConfig,
    pub agents: AgentsConfig,
    pub memory: Option<Value>,
    pub skills: Option<Value>,
    pub voice: VoiceConfig,
    pub runtime: RuntimeConfig,
    pub extensions: Option<Value>,
    /// Legacy top-level cron section, superseded by `runtime.cron`.
    pub cron: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PathsConfig {
    /// Root directory for agent workspaces (`{workspace}/{agentId}/`).
    pub workspace: Option<String>,
    pub data: Option<String>,
    pub logs: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfig {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub api: Option<String>,
    pub models: Vec<ModelConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModelConfig {
    pub id: String,
    pub name: Option<String>,
    pub api: Option<String>,
    /// Declared input modalities (`"text"`, `"image"`, `"audio"`, …).
    pub input: Vec<String>,
    pub reasoning: Option<bool>,
    pub context_window: Option<u64>,
    pub max_tokens: Option<u64>,
    pub headers: BTreeMap<String, String>,
    pub compat: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChannelsConfig {
    pub routing: RoutingConfig,
    pub telegram: Option<TelegramChannelConfig>,
    pub discord: Option<DiscordChannelConfig>,
    pub local_desktop: LocalDesktopConfig,
    /// Top-level DM scope default; channel configs may override.
    pub dm_scope: Option<DmScope>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoutingConfig {
    pub dm_agent_id: Option<String>,
    pub group_agent_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelegramChannelConfig {
    pub bot_token: Option<String>,
    pub agent_id: Option<String>,
    pub dm_scope: Option<DmScope>,
    /// Per-group agent bindings keyed by the platform peer id.
    pub groups: BTreeMap<String, GroupBinding>,
    /// Chat ids allowed to talk to the bot; numbers are normalized to
    /// strings on load.
    #[serde(deserialize_with = "de_string_or_number_vec")]
    pub allowed_chats: Vec<String>,
    pub max_retry_time_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GroupBinding {
    pub agent_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiscordChannelConfig {
    pub bot_token: Option<String>,
    pub agent_id: Option<String>,
    pub dm_scope: Option<DmScope>,
    pub max_retry_time_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocalDesktopConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub auth_token: Option<String>,
    pub allowed_origins: Vec<String>,
    pub peer_id: String,
    pub agent_id: Option<String>,
    pub dm_scope: Option<DmScope>,
}

impl Default for LocalDesktopConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 3987,
            auth_token: None,
            allowed_origins: Vec::new(),
            peer_id: "desktop-default".to_string(),
            agent_id: None,
            dm_scope: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentsConfig {
    pub defaults: AgentConfig,
    /// One entry per agent id.
    #[serde(flatten)]
    pub entries: BTreeMap<String, AgentConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    pub model: Option<String>,
    pub image_model: Option<String>,
    pub tools: Option<Value>,
    pub skills: Option<Value>,
    pub sandbox: Option<Value>,
    pub exec: Option<Value>,
    pub heartbeat: Option<HeartbeatConfig>,
    pub lifecycle: Option<LifecycleConfig>,
    pub thinking: Option<ThinkingConfig>,
    pub output: Option<Value>,
    pub context_pruning: Option<ContextPruningConfig>,
    /// Workspace directory override; defaults to `{paths.workspace}/{id}`.
    pub workspace: Option<String>,
    pub main: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatConfig {
    pub enabled: Option<bool>,
    /// Duration string, e.g. `"30m"`.
    pub every: Option<String>,
    pub prompt: Option<String>,
}

impl HeartbeatConfig {
    /// Field-wise merge: agent overrides win over defaults.
    pub fn merged(defaults: Option<&Self>, overrides: Option<&Self>) -> Self {
        let d = defaults.cloned().unwrap_or_default();
        let o = overrides.cloned().unwrap_or_default();
        Self {
            enabled: o.enabled.or(d.enabled),
            every: o.every.or(d.every),
            prompt: o.prompt.or(d.prompt),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LifecycleConfig {
    pub temporal: Option<TemporalLifecycle>,
    pub semantic: Option<SemanticLifecycle>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TemporalLifecycle {
    pub enabled: bool,
    /// Duration string: sessions idle longer than this rotate on the next
    /// prompt.
    pub active_window: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SemanticLifecycle {
    pub enabled: bool,
    pub threshold: f64,
    pub debounce_seconds: u64,
}

impl Default for SemanticLifecycle {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 0.8,
            debounce_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ThinkingConfig {
    /// Effective thinking level (`"off"`, `"low"`, `"medium"`, `"high"`).
    pub level: Option<String>,
    /// Reasoning visibility: `on`, `off`, or `stream`.
    pub reasoning: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextPruningConfig {
    /// Usage ratio that triggers a pre-dispatch memory flush.
    pub on_overflow: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VoiceConfig {
    pub stt: Option<Value>,
    pub tts: TtsConfig,
    pub vad: Option<Value>,
    pub wake: Option<Value>,
    pub ui: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TtsConfig {
    pub voice: Option<String>,
    pub provider: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeConfig {
    pub queue: QueueConfig,
    pub cron: Option<Value>,
    pub auth: AuthRuntimeConfig,
    pub sanitize_tool_schema: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueueConfig {
    /// Prompt-driver inactivity timeout as a duration string; default 30s.
    pub turn_timeout: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthRuntimeConfig {
    pub enabled: bool,
}

impl Default for AuthRuntimeConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl EffectiveConfig {
    pub fn from_value(value: &Value) -> Result<Self, String> {
        serde_json::from_value(value.clone()).map_err(|e| format!("config schema error: {e}"))
    }

    /// Structural checks beyond what serde enforces. Returns a list of
    /// human-readable problems; empty means valid.
    pub fn validate(value: &Value) -> Vec<String> {
        let mut errors = Vec::new();
        let config = match Self::from_value(value) {
            Ok(c) => c,
            Err(e) => return vec![e],
        };

        let main_agents: Vec<&String> = config
            .agents
            .entries
            .iter()
            .filter(|(_, a)| a.main)
            .map(|(id, _)| id)
            .collect();
        if main_agents.len() > 1 {
            errors.push(format!(
                "exactly one agent may set main: true (found {})",
                main_agents.len()
            ));
        }

        for (id, agent) in &config.agents.entries {
            if let Some(hb) = &agent.heartbeat {
                if let Some(every) = &hb.every {
                    if crate::duration::parse_duration(every).is_err() {
                        errors.push(format!("agents.{id}.heartbeat.every: invalid duration '{every}'"));
                    }
                }
            }
        }

        errors
    }

    /// The agent that owns unrouted traffic: the `main: true` entry, else
    /// the lexicographically first agent, else the built-in `"mozi"` id.
    pub fn default_agent_id(&self) -> String {
        self.agents
            .entries
            .iter()
            .find(|(_, a)| a.main)
            .map(|(id, _)| id.clone())
            .or_else(|| self.agents.entries.keys().next().cloned())
            .unwrap_or_else(|| "mozi".to_string())
    }

    pub fn agent(&self, id: &str) -> Option<&AgentConfig> {
        self.agents.entries.get(id)
    }

    /// Merged heartbeat config (defaults ⊕ agent overrides) for one agent.
    pub fn heartbeat_for(&self, agent_id: &str) -> HeartbeatConfig {
        HeartbeatConfig::merged(
            self.agents.defaults.heartbeat.as_ref(),
            self.agent(agent_id).and_then(|a| a.heartbeat.as_ref()),
        )
    }

    /// Workspace directory for an agent.
    pub fn agent_workspace(&self, agent_id: &str) -> Option<std::path::PathBuf> {
        if let Some(dir) = self.agent(agent_id).and_then(|a| a.workspace.as_ref()) {
            return Some(std::path::PathBuf::from(dir));
        }
        self.paths
            .workspace
            .as_ref()
            .map(|root| std::path::Path::new(root).join(agent_id))
    }
}

/// Accept both `[123, "456"]` and `["123"]`, normalizing to strings.
fn de_string_or_number_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrNumber {
        String(String),
        Number(i64),
    }

    let raw: Vec<StringOrNumber> = Vec::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|v| match v {
            StringOrNumber::String(s) => s,
            StringOrNumber::Number(n) => n.to_string(),
        })
        .collect())
}
