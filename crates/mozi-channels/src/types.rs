use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use mozi_core::types::InboundMessage;

/// Runtime connection state of a channel adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Connecting,
    Connected,
    Disconnected,
    Error(String),
}

/// Inbound events an adapter can raise.
///
/// This is the typed replacement for the string-keyed emitters the design
/// grew out of: every event kind is a variant, and the compiler knows the
/// full set.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Message(InboundMessage),
    Error { channel: String, message: String },
    Status { channel: String, status: ChannelStatus },
}

/// Handle adapters use to emit events into the host's single inbound lane.
#[derive(Clone)]
pub struct EventSink {
    channel: String,
    tx: mpsc::Sender<ChannelEvent>,
}

impl EventSink {
    pub fn new(channel: impl Into<String>, tx: mpsc::Sender<ChannelEvent>) -> Self {
        Self {
            channel: channel.into(),
            tx,
        }
    }

    pub async fn message(&self, msg: InboundMessage) {
        if self.tx.send(ChannelEvent::Message(msg)).await.is_err() {
            warn!(channel = %self.channel, "event bus closed; inbound message dropped");
        }
    }

    pub async fn error(&self, message: impl Into<String>) {
        let _ = self
            .tx
            .send(ChannelEvent::Error {
                channel: self.channel.clone(),
                message: message.into(),
            })
            .await;
    }

    pub async fn status(&self, status: ChannelStatus) {
        let _ = self
            .tx
            .send(ChannelEvent::Status {
                channel: self.channel.clone(),
                status,
            })
            .await;
    }
}
