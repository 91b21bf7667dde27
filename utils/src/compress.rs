//! Compressed JSON payloads for the remote client wire protocol.
//!
//! Request bodies are serialized to JSON, zlib-compressed and base64-encoded
//! so they can travel as a string inside a JSON event frame.

use std::io::{Read, Write};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("payload (de)compression failed: {0}")]
    Zlib(#[from] std::io::Error),
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn compress_json<T: Serialize + ?Sized>(value: &T) -> Result<String, PayloadError> {
    let json = serde_json::to_vec(value)?;
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    let packed = encoder.finish()?;
    Ok(STANDARD.encode(packed))
}

pub fn decompress_json(payload: &str) -> Result<Value, PayloadError> {
    let packed = STANDARD.decode(payload)?;
    let mut json = Vec::new();
    ZlibDecoder::new(packed.as_slice()).read_to_end(&mut json)?;
    Ok(serde_json::from_slice(&json)?)
}
