use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("blob storage error: {0}")]
    Blob(String),

    #[error("inference throttled: {0}")]
    Throttled(String),

    #[error("inference error: {0}")]
    Inference(String),

    #[error("agent error: {0}")]
    Agent(String),

    #[error("tool error: {0}")]
    Tool(String),

    #[error("mcp error: {0}")]
    Mcp(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// How a caller should react to an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transient; the same request may succeed if retried.
    Retryable,
    Fatal,
    /// The surrounding session was superseded. Stop quietly.
    Cancelled,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Throttled(_) => ErrorKind::Retryable,
            Error::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Retryable
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_throttling_is_retryable() {
        assert!(Error::Throttled("slow down".into()).is_retryable());
        assert!(!Error::Inference("status=500".into()).is_retryable());
        assert!(!Error::Database("locked".into()).is_retryable());
    }

    #[test]
    fn cancellation_has_its_own_kind() {
        assert_eq!(Error::Cancelled.kind(), ErrorKind::Cancelled);
        assert!(Error::Cancelled.is_cancelled());
        assert_eq!(Error::Agent("boom".into()).kind(), ErrorKind::Fatal);
    }
}
