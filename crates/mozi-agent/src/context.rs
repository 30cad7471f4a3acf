//! Host context trait: everything the message handler needs from the
//! runtime, expressed as one seam so channel adapters, tests, and the
//! binary wire in their own implementations.

use std::sync::Arc;

use async_trait::async_trait;

use mozi_channels::{ChannelAdapter, TypingShare};
use mozi_core::config::EffectiveConfig;
use mozi_core::routes::RouteLedger;
use mozi_dispatch::DispatchKernel;
use mozi_media::SttEngine;
use mozi_scheduler::ReminderStore;
use mozi_sessions::{SessionKey, SessionStore};

/// Secret management collaborator behind `/setAuth` and friends.
/// May be absent — the commands then report themselves disabled.
#[async_trait]
pub trait AuthBroker: Send + Sync {
    async fn set_secret(&self, key: &str, value: &str) -> Result<(), String>;
    async fn unset_secret(&self, key: &str) -> Result<(), String>;
    /// Key names only; values never travel back through the pipeline.
    async fn list_secrets(&self) -> Result<Vec<String>, String>;
    async fn check_secret(&self, key: &str) -> Result<bool, String>;
}

/// Memory/RAG collaborator: compaction and pre-overflow flushes.
#[async_trait]
pub trait MemoryBroker: Send + Sync {
    /// Compact the session's long tail; returns a short status line.
    async fn compact(&self, key: &SessionKey) -> Result<String, String>;
    /// Flush salient context to durable memory before overflow.
    async fn flush(&self, key: &SessionKey) -> Result<(), String>;
}

/// Semantic-rollover classifier. Contract per the lifecycle design:
/// `{recent, prior}` user turns in, confidence in `[0,1]` out.
#[async_trait]
pub trait TopicShiftClassifier: Send + Sync {
    async fn confidence(&self, recent_turn: &str, prior_turn: &str) -> Result<f64, String>;
}

/// Runtime-control hooks the command branch can invoke.
#[async_trait]
pub trait RuntimeControl: Send + Sync {
    async fn restart(&self) -> Result<(), String>;
}

/// The host surface the handler runs against.
pub trait HostContext: Send + Sync {
    /// Current typed config; `None` while the document is unreadable.
    fn config(&self) -> Option<EffectiveConfig>;
    fn sessions(&self) -> &SessionStore;
    fn kernel(&self) -> &DispatchKernel;
    fn channel(&self, id: &str) -> Option<Arc<dyn ChannelAdapter>>;
    fn typing(&self) -> &TypingShare;
    fn routes(&self) -> &RouteLedger;
    fn reminders(&self) -> Option<&ReminderStore>;
    fn stt(&self) -> Option<Arc<dyn SttEngine>>;
    fn auth(&self) -> Option<Arc<dyn AuthBroker>>;
    fn memory(&self) -> Option<Arc<dyn MemoryBroker>>;
    fn classifier(&self) -> Option<Arc<dyn TopicShiftClassifier>>;
    fn runtime_control(&self) -> Option<Arc<dyn RuntimeControl>>;

    fn default_agent_id(&self) -> String {
        self.config()
            .map(|c| c.default_agent_id())
            .unwrap_or_else(|| "mozi".to_string())
    }
}
