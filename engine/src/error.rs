use std::time::Duration;

use fabric_store::StoreError;
use fabric_types::Qid;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to decode {key} of {qid}: {source}")]
    Decode {
        qid: Qid,
        key: String,
        source: serde_json::Error,
    },
    #[error("failed to encode {key} of {qid}: {source}")]
    Encode {
        qid: Qid,
        key: String,
        source: serde_json::Error,
    },
    #[error("failed to spawn dispatch thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("dispatch thread did not start within {0:?}")]
    StartTimeout(Duration),
}
