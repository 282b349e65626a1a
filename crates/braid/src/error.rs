//! Error taxonomy shared by every stream, primitive, and operator.

use std::sync::Arc;

/// Errors surfaced by streams and the primitives beneath them.
///
/// `Clone` because a stored terminal error is handed to every later read.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    /// Invalid construction arguments, raised before any stream activity.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("stream is locked to another reader")]
    Locked,

    #[error("stream is closed")]
    Closed,

    #[error("stream has errored")]
    Errored,

    #[error("gate closed while waiting for a permit")]
    GateClosed,

    #[error("queue already finished")]
    QueueFinished,

    /// Arbitrary error payload forwarded from a producer.
    #[error("{0}")]
    Upstream(Arc<dyn std::error::Error + Send + Sync>),

    #[error("{0}")]
    Message(String),

    /// Error relayed from the far side of a bridge.
    #[error("remote stream failed: {0}")]
    Remote(String),

    #[error("bridge transport failed: {0}")]
    Io(String),

    #[error("inner task failed: {0}")]
    TaskFailed(String),
}

impl StreamError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    pub fn upstream<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Upstream(Arc::new(error))
    }

    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
