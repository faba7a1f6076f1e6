use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("failed to access index at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The stored document exists but is not a valid index.  Never recovered
    /// silently: a corrupt index cannot be trusted.
    #[error("malformed index at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("failed to encode index: {0}")]
    Encode(#[source] serde_json::Error),
}
