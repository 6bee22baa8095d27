use http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] http::Error),

    #[error("connection error: {0}")]
    Hyper(#[from] hyper::Error),

    #[error("store error: {0}")]
    Store(#[from] routetable::StoreError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("no route for {0}")]
    NoRoute(String),

    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("upstream timed out before responding")]
    UpstreamTimeout,

    #[error("upstream aborted mid-stream: {0}")]
    UpstreamAborted(String),

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl ServerError {
    /// Status the data plane reports for this failure when response headers
    /// have not been sent yet.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NoRoute(_) => StatusCode::NOT_FOUND,
            Self::UpstreamUnreachable(_) | Self::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::UpstreamAborted(_) | Self::Hyper(_) => StatusCode::BAD_GATEWAY,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type ServerResult<T> = Result<T, ServerError>;
