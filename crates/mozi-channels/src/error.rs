use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    /// The adapter does not implement this optional capability.
    #[error("capability not supported by this channel: {0}")]
    Unsupported(&'static str),

    /// Network-shaped failure: DNS, timeout, 5xx, 429. Worth retrying.
    #[error("recoverable transport error: {0}")]
    Recoverable(String),

    /// Invalid token, 401/403. Retrying would only cause a connection storm.
    #[error("fatal transport error: {0}")]
    Fatal(String),

    #[error("channel is not connected")]
    NotConnected,

    #[error("send failed: {0}")]
    Send(String),
}

impl ChannelError {
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ChannelError::Recoverable(_) | ChannelError::NotConnected | ChannelError::Send(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ChannelError>;
