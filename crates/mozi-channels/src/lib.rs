//! Channel adapter framework: the adapter trait, the typed inbound event
//! bus, the registry with connect supervision, and shared typing handles.

pub mod channel;
pub mod error;
pub mod registry;
pub mod types;
pub mod typing;

pub use channel::{ChannelAdapter, TypingStop};
pub use error::ChannelError;
pub use registry::{ChannelRegistry, ConnectPolicy};
pub use types::{ChannelEvent, ChannelStatus, EventSink};
pub use typing::{TypingGuard, TypingShare};
