use crate::upstream::UpstreamError;
use crate::validation::ValidationError;

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("queue is being processed; try again once processing has finished")]
    Busy,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}
