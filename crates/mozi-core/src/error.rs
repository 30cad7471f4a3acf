use thiserror::Error;

/// Runtime-host error taxonomy.
///
/// Each variant maps to a short code string sent to clients or written to
/// the runtime log. Per-subsystem crates define their own narrower error
/// enums and convert into `MoziError` at the host boundary.
#[derive(Debug, Error)]
pub enum MoziError {
    #[error("Configuration conflict: expected hash {expected}, found {actual}")]
    ConfigConflict { expected: String, actual: String },

    #[error("Configuration validation failed: {0}")]
    ConfigValidation(String),

    #[error("Missing authentication secret: {key}")]
    AuthMissing { key: String },

    #[error("Authentication secret rejected: {key}")]
    AuthInvalid { key: String },

    #[error("Recoverable transport error: {0}")]
    TransportRecoverable(String),

    #[error("Fatal transport error: {0}")]
    TransportFatal(String),

    #[error("Prompt driver error: {0}")]
    PromptDriver(String),

    #[error("Prompt driver timed out after {ms}ms of inactivity")]
    PromptDriverTimeout { ms: u64 },

    #[error("Turn interrupted: {reason}")]
    PromptInterrupted { reason: String },

    #[error("Media decode failed: {0}")]
    MediaDecode(String),

    #[error("Speech-to-text failed: {0}")]
    SttFailed(String),

    #[error("Text-to-speech failed: {0}")]
    TtsFailed(String),

    #[error("Malformed inbound payload: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MoziError {
    /// Short error code string for wire frames and structured logs.
    pub fn code(&self) -> &'static str {
        match self {
            MoziError::ConfigConflict { .. } => "config-conflict",
            MoziError::ConfigValidation(_) => "config-validation",
            MoziError::AuthMissing { .. } => "auth-missing",
            MoziError::AuthInvalid { .. } => "auth-invalid",
            MoziError::TransportRecoverable(_) => "transport-recoverable",
            MoziError::TransportFatal(_) => "transport-fatal",
            MoziError::PromptDriver(_) => "prompt-driver-error",
            MoziError::PromptDriverTimeout { .. } => "prompt-driver-timeout",
            MoziError::PromptInterrupted { .. } => "prompt-interrupted",
            MoziError::MediaDecode(_) => "media-decode",
            MoziError::SttFailed(_) => "stt-failed",
            MoziError::TtsFailed(_) => "tts-failed",
            MoziError::Validation(_) => "validation",
            MoziError::Serialization(_) | MoziError::Io(_) | MoziError::Internal(_) => "internal",
        }
    }

    /// Whether retrying the same operation may succeed.
    ///
    /// Auth failures and validation problems never clear on their own;
    /// transport blips and vendor 5xx/timeouts do.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            MoziError::TransportRecoverable(_)
                | MoziError::PromptDriver(_)
                | MoziError::PromptDriverTimeout { .. }
                | MoziError::SttFailed(_)
                | MoziError::TtsFailed(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, MoziError>;
