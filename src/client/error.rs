use super::transport::TransportError;
use crate::validation::ValidationError;

#[derive(thiserror::Error, Debug, Clone)]
pub enum ClientError {
    /// Bad input; never retried, shown verbatim.
    #[error("{0}")]
    Validation(#[from] ValidationError),

    /// Network or server failure that outlived the retry budget.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Error reported by the proxy or the queue processor.
    #[error("{message}")]
    Upstream { status: u16, message: String },

    /// Refused locally because the queue is being processed.
    #[error("{0}")]
    Rejected(String),

    #[error("{0}")]
    Throttled(String),

    #[error("cancelled")]
    Declined,

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl ClientError {
    pub fn is_transport(&self) -> bool {
        matches!(self, ClientError::Transport(_))
    }
}
