// mskit-messaging-core/src/error.rs
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("service {0} is not initialized")]
    NotInitialized(String),

    #[error("wrong parameters: {0}")]
    InvalidParameters(String),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("exchange not found: {0}")]
    ExchangeNotFound(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("subscribe error: {0}")]
    Subscribe(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("handler error: {0}")]
    Handler(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl MessagingError {
    /// Errors raised from call parameters, before any broker I/O happened.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::NotInitialized(_) | Self::InvalidParameters(_) | Self::InvalidMessage(_)
        )
    }
}

impl From<serde_json::Error> for MessagingError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MessagingError>;
