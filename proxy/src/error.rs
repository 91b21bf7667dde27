use std::io;

use fabric_utils::PayloadError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to encode payload: {0}")]
    Payload(#[from] PayloadError),
    #[error("unknown event {0:?}")]
    UnknownEvent(String),
    #[error("{event} event carries no request id")]
    MissingRid { event: &'static str },
    #[error("failed to start client runtime: {0}")]
    Runtime(#[source] io::Error),
    #[error("legacy call did not complete: {0}")]
    Join(#[from] tokio::task::JoinError),
}
