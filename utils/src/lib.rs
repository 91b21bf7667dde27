//! Shared infrastructure utilities.
//!
//! - **`atomic_write`**: Crash-safe file persistence (temp + rename)
//! - **`codec`**: Length-prefixed frames over async byte streams
//! - **`compress`**: zlib + base64 packing of JSON payloads

pub mod atomic_write;
pub mod codec;
pub mod compress;

pub use atomic_write::{FileSyncPolicy, atomic_write};
pub use codec::{CodecError, FrameReader, FrameWriter, MAX_FRAME_BYTES};
pub use compress::{PayloadError, compress_json, decompress_json};
