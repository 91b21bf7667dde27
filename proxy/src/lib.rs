//! Remote client for a running engine instance.
//!
//! [`Proxy`] keeps one auto-reconnecting connection to the remote side and
//! hands out a [`RequestHandle`] per submitted request. Inbound events are
//! correlated to handles by request id; a watchdog resyncs quiet requests and
//! gives up on silent ones.

mod error;
mod handle;
mod proxy;
pub mod wire;

pub use error::ProxyError;
pub use handle::{CANCELLED, RequestHandle, UNKNOWN};
pub use proxy::{Listener, Proxy};
