//! Media pipeline glue: the STT/TTS collaborator contracts, WAV framing
//! for speech ingestion, and base64 chunking for TTS egress.
//!
//! The engines themselves (Whisper endpoints, vendor TTS, …) live outside
//! the core; the runtime wires concrete implementations in.

use async_trait::async_trait;
use thiserror::Error;

pub mod frame;
pub mod wav;

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("speech-to-text failed: {0}")]
    Stt(String),

    #[error("text-to-speech failed: {0}")]
    Tts(String),

    #[error("media decode failed: {0}")]
    Decode(String),
}

impl MediaError {
    /// STT/TTS vendor hiccups are worth retrying; a bad payload is not.
    pub fn retryable(&self) -> bool {
        matches!(self, MediaError::Stt(_) | MediaError::Tts(_))
    }
}

pub type Result<T> = std::result::Result<T, MediaError>;

/// Speech-to-text collaborator. Input is a complete WAV file.
#[async_trait]
pub trait SttEngine: Send + Sync {
    async fn transcribe(&self, wav: Vec<u8>) -> Result<String>;
}

/// One synthesized utterance.
#[derive(Debug, Clone)]
pub struct TtsAudio {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub duration_ms: Option<u64>,
    pub voice: Option<String>,
}

/// Text-to-speech collaborator.
#[async_trait]
pub trait TtsEngine: Send + Sync {
    async fn synthesize(&self, text: &str, voice: Option<&str>) -> Result<TtsAudio>;
}
