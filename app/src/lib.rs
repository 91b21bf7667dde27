//! Controller/worker process pair.
//!
//! The controller runs inside the engine's process as its [`Executor`]
//! (see `fabric_engine`) and spawns a worker child that does the actual
//! work. The two talk over a pair of TCP pub/sub connections carrying the
//! [`Message`] schema.
//!
//! [`Executor`]: fabric_engine::Executor

pub mod channel;
pub mod controller;
pub mod logging;
pub mod message;
pub mod worker;

pub use channel::{Handler, Publisher, Subscriber};
pub use controller::Controller;
pub use logging::{init_tracing, init_worker_tracing, relay};
pub use message::{Action, FETCH_QUEUE, LogRecord, Message, PROTOCOL_VERSION, ProtocolError, Update};
pub use worker::{Callbacks, WorkerArgs, run as run_worker};
