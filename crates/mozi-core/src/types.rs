use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What kind of peer a message came from or is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerKind {
    Dm,
    Group,
    Channel,
}

impl PeerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerKind::Dm => "dm",
            PeerKind::Group => "group",
            PeerKind::Channel => "channel",
        }
    }
}

/// Externally visible processing state, broadcast to transports that care
/// (the desktop widget animates on these).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Listening,
    Thinking,
    Speaking,
    Executing,
    Error,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Listening => "listening",
            Phase::Thinking => "thinking",
            Phase::Speaking => "speaking",
            Phase::Executing => "executing",
            Phase::Error => "error",
        }
    }
}

/// Media attachment payload variants. Exactly one source is present by
/// construction — the enum makes a url/path/buffer mix unrepresentable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaSource {
    /// Transport-native file handle. Opaque to everything but the adapter
    /// that produced it.
    Url(String),
    Path(String),
    #[serde(with = "bytes_base64")]
    Bytes(Vec<u8>),
}

mod bytes_base64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&crate::text::to_base64(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        crate::text::from_base64(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Video,
    Audio,
    Document,
    Voice,
}

impl MediaKind {
    /// The model-input modality this attachment requires.
    pub fn modality(&self) -> &'static str {
        match self {
            MediaKind::Photo => "image",
            MediaKind::Video => "video",
            MediaKind::Audio | MediaKind::Voice => "audio",
            MediaKind::Document => "document",
        }
    }
}

/// One attachment on an inbound or outbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaAttachment {
    pub kind: MediaKind,
    pub source: MediaSource,
    pub mime_type: Option<String>,
    pub file_name: Option<String>,
    pub caption: Option<String>,
    pub byte_size: Option<u64>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration_ms: Option<u64>,
    /// Filled by STT preprocessing for voice/audio attachments.
    pub transcript: Option<String>,
}

impl MediaAttachment {
    pub fn new(kind: MediaKind, source: MediaSource) -> Self {
        Self {
            kind,
            source,
            mime_type: None,
            file_name: None,
            caption: None,
            byte_size: None,
            width: None,
            height: None,
            duration_ms: None,
            transcript: None,
        }
    }

    pub fn is_audio(&self) -> bool {
        matches!(self.kind, MediaKind::Audio | MediaKind::Voice)
    }
}

/// Envelope for one incoming unit of user input.
///
/// Immutable after construction; the pipeline owns it for the duration of
/// one turn. Adapters stash platform payloads in `provider_raw`, which is
/// never traversed outside the adapter that wrote it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    pub channel: String,
    pub peer_id: String,
    pub peer_kind: PeerKind,
    pub sender_id: String,
    pub sender_name: Option<String>,
    pub account_id: Option<String>,
    pub thread_id: Option<String>,
    pub text: String,
    #[serde(default)]
    pub media: Vec<MediaAttachment>,
    pub reply_to: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_raw: Option<serde_json::Value>,
}

impl InboundMessage {
    /// Minimal constructor used by transports and by the scheduler when it
    /// synthesizes heartbeat/reminder messages.
    pub fn text_message(
        channel: impl Into<String>,
        peer_id: impl Into<String>,
        peer_kind: PeerKind,
        sender_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            channel: channel.into(),
            peer_id: peer_id.into(),
            peer_kind,
            sender_id: sender_id.into(),
            sender_name: None,
            account_id: None,
            thread_id: None,
            text: text.into(),
            media: Vec::new(),
            reply_to: None,
            timestamp: Utc::now(),
            provider_raw: None,
        }
    }
}

/// A clickable button attached to an outbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InlineButton {
    pub text: String,
    #[serde(flatten)]
    pub action: ButtonAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ButtonAction {
    CallbackData(String),
    Url(String),
}

/// A message the runtime wants delivered through a channel adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub text: String,
    #[serde(default)]
    pub media: Vec<MediaAttachment>,
    /// Rows of inline buttons; empty means no keyboard.
    #[serde(default)]
    pub buttons: Vec<Vec<InlineButton>>,
    pub reply_to: Option<String>,
    /// Deliver without a notification sound where the platform supports it.
    #[serde(default)]
    pub silent: bool,
}

impl OutboundMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

/// Which peer-id combinations share a DM session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DmScope {
    Main,
    PerPeer,
    PerChannelPeer,
    PerAccountChannelPeer,
}

impl Default for DmScope {
    fn default() -> Self {
        DmScope::PerChannelPeer
    }
}

/// The routing decision derived from one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub agent_id: String,
    pub dm_scope: DmScope,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_kind_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&PeerKind::Dm).unwrap(), "\"dm\"");
        assert_eq!(serde_json::to_string(&PeerKind::Group).unwrap(), "\"group\"");
    }

    #[test]
    fn phase_str_matches_serde() {
        for phase in [
            Phase::Idle,
            Phase::Listening,
            Phase::Thinking,
            Phase::Speaking,
            Phase::Executing,
            Phase::Error,
        ] {
            let json = serde_json::to_string(&phase).unwrap();
            assert_eq!(json, format!("\"{}\"", phase.as_str()));
        }
    }

    #[test]
    fn media_bytes_roundtrip_via_base64() {
        let att = MediaAttachment::new(MediaKind::Voice, MediaSource::Bytes(vec![1, 2, 3, 4]));
        let json = serde_json::to_string(&att).unwrap();
        let back: MediaAttachment = serde_json::from_str(&json).unwrap();
        match back.source {
            MediaSource::Bytes(b) => assert_eq!(b, vec![1, 2, 3, 4]),
            other => panic!("expected bytes source, got {other:?}"),
        }
    }

    #[test]
    fn dm_scope_default_is_per_channel_peer() {
        assert_eq!(DmScope::default(), DmScope::PerChannelPeer);
    }

    #[test]
    fn synthetic_message_has_fresh_id_and_empty_media() {
        let m = InboundMessage::text_message("telegram", "42", PeerKind::Dm, "heartbeat", "hi");
        assert!(!m.id.is_empty());
        assert!(m.media.is_empty());
        assert!(m.provider_raw.is_none());
    }
}
