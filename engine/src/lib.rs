//! Execution engine: durable queue, progress records and dispatch.
//!
//! [`Engine::prepare`] persists a request and queues it; a single dispatch
//! thread hands queued ids to the registered [`Executor`] one at a time.
//! The hosting application supplies the executor (usually the controller
//! side of the controller/worker pair) through the engine's [`Context`].

mod context;
mod engine;
mod error;
mod task;

pub use context::{Context, Executor, SharedRay, cancel_ray, lock_ray};
pub use engine::{CONFIG_NAMESPACE, Engine, IN_KEY, OUT_KEY, RAY_KEY, Submission};
pub use error::EngineError;
pub use task::{STATE_NAMESPACE, TaskQueue};
