//! The prompt-driver contract.
//!
//! The LLM client library lives outside the core; the kernel drives it
//! through this interface. A turn is a stream of typed events the handler
//! consumes to completion (and may cancel) — no callbacks, no dynamic
//! event names.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use mozi_sessions::SessionKey;

/// Everything a driver needs for one model call.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub session_key: SessionKey,
    pub agent_id: String,
    /// Model reference, `provider/model-id`. The kernel rewrites this per
    /// fallback attempt.
    pub model: String,
    /// Composed prompt text (user text + transcript + media summary).
    pub prompt: String,
    /// Prior conversation in whatever shape the driver persists.
    pub context: Vec<serde_json::Value>,
    pub thinking_level: Option<String>,
    /// Derived from the inbound message id; stable across fallbacks.
    pub trace_id: String,
}

/// Events a driver emits while a turn runs.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    /// Incremental assistant text.
    TextDelta(String),
    /// The model invoked a tool; surfaces as `phase=executing` upstream.
    ToolCall { name: String, call_id: String },
    /// Keep-alive; resets the inactivity timeout without other effects.
    Progress,
    /// The complete assistant message, when the driver produces one.
    Final(String),
    /// Terminal failure for this attempt.
    Error(DriverError),
}

#[derive(Debug, Clone, Error)]
pub enum DriverError {
    /// A required secret is not configured. Never retried.
    #[error("AUTH_MISSING {key}")]
    AuthMissing { key: String },

    /// The model is explicitly disabled. Never retried.
    #[error("model '{model}' is disabled")]
    ModelDisabled { model: String },

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl DriverError {
    /// Whether the fallback chain should try the next model.
    pub fn retryable(&self) -> bool {
        !matches!(
            self,
            DriverError::AuthMissing { .. } | DriverError::ModelDisabled { .. }
        )
    }
}

/// External LLM collaborator. Implementations must honor `cancel`
/// cooperatively: stop emitting and drop the sender at the next
/// checkpoint after cancellation.
#[async_trait]
pub trait PromptDriver: Send + Sync {
    async fn run_turn(
        &self,
        request: TurnRequest,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<TurnEvent>, DriverError>;
}
