pub use reqwest::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        source: reqwest::Error,
    },
    #[error("{endpoint} returned {status}: {body}")]
    Status {
        endpoint: String,
        status: StatusCode,
        body: String,
    },
    #[error("malformed response from {endpoint}: {source}")]
    Decode {
        endpoint: String,
        source: reqwest::Error,
    },
    #[error("invalid content type for {path}: {source}")]
    ContentType {
        path: String,
        source: reqwest::Error,
    },
}

impl ClientError {
    /// `true` when the service answered but refused the call (e.g. missing or
    /// stale session), as opposed to the service being unreachable.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Status { status, .. } if status.is_client_error())
    }
}
