//! Durable key-value persistence, one JSON document per namespace.
//!
//! - [`KeyValueDb`]: one open document with explicit or automatic flush.
//! - [`BoundedCache`]: fixed-capacity LRU map with an eviction hook.
//! - [`Store`]: namespace-addressed facade that keeps at most `capacity`
//!   documents open and flushes whatever it evicts.

mod error;
mod kvdb;
mod lru;
mod store;

pub use error::StoreError;
pub use kvdb::KeyValueDb;
pub use lru::BoundedCache;
pub use store::Store;
