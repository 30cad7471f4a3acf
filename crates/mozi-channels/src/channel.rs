use async_trait::async_trait;

use mozi_core::types::{OutboundMessage, Phase};

use crate::{error::ChannelError, types::ChannelStatus};

/// Stop handle returned by [`ChannelAdapter::begin_typing`].
///
/// Wraps whatever the adapter needs to tear its indicator down (usually a
/// task abort). Dropping without calling [`stop`](TypingStop::stop) also
/// stops the indicator.
pub struct TypingStop(Option<Box<dyn FnOnce() + Send>>);

impl TypingStop {
    pub fn new(stop: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(stop)))
    }

    pub fn stop(mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl Drop for TypingStop {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl std::fmt::Debug for TypingStop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TypingStop")
    }
}

/// Common interface implemented by every channel adapter (Telegram,
/// Discord, local desktop, …).
///
/// Implementations must be `Send + Sync`; the registry stores them as
/// `Arc<dyn ChannelAdapter>` and drives them from multiple Tokio tasks.
/// The lifecycle methods take `&self` — adapters keep their own interior
/// state behind whatever synchronization they need.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Stable lowercase identifier (e.g. `"telegram"`, `"local-desktop"`).
    fn id(&self) -> &str;

    /// Human-readable name for diagnostics.
    fn display_name(&self) -> &str;

    /// Establish the connection to the external service.
    async fn connect(&self) -> Result<(), ChannelError>;

    /// Gracefully close the connection.
    async fn disconnect(&self) -> Result<(), ChannelError>;

    /// Current runtime status without blocking.
    fn status(&self) -> ChannelStatus;

    /// Deliver one outbound message. Returns the platform message id.
    async fn send(&self, peer_id: &str, msg: &OutboundMessage) -> Result<String, ChannelError>;

    // --- optional capabilities -------------------------------------------

    /// Start a typing indicator for the peer. The returned handle stops it.
    async fn begin_typing(&self, _peer_id: &str) -> Result<TypingStop, ChannelError> {
        Err(ChannelError::Unsupported("begin_typing"))
    }

    /// Replace the text of a previously sent message.
    async fn edit_message(
        &self,
        _message_id: &str,
        _peer_id: &str,
        _text: &str,
    ) -> Result<(), ChannelError> {
        Err(ChannelError::Unsupported("edit_message"))
    }

    /// Whether [`edit_message`](Self::edit_message) is implemented; lets
    /// the handler skip progressive streaming on channels without edits.
    fn supports_edits(&self) -> bool {
        false
    }

    /// Attach an emoji reaction to a message.
    async fn react(
        &self,
        _message_id: &str,
        _peer_id: &str,
        _emoji: &str,
    ) -> Result<(), ChannelError> {
        Err(ChannelError::Unsupported("react"))
    }

    /// Surface a processing phase to the peer (widget animation, presence).
    async fn emit_phase(
        &self,
        _peer_id: &str,
        _phase: Phase,
        _payload: Option<serde_json::Value>,
    ) -> Result<(), ChannelError> {
        // Channels without a phase surface just ignore it.
        Ok(())
    }
}
