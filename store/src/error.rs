use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid namespace name {0:?}")]
    InvalidNamespace(String),
    #[error("store I/O failed for {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to serialize namespace {name}: {source}")]
    Serialize {
        name: String,
        source: serde_json::Error,
    },
}
