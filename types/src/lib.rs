//! Core domain types for the execution engine.
//!
//! This crate contains pure domain types with no IO and no async. The
//! progress record ([`Ray`]) is shared by the engine, the controller/worker
//! pair and the remote client, so its serialized form lives here too.

#![allow(clippy::missing_errors_doc)]

mod ids;
mod ray;
mod state;

pub use ids::Qid;
pub use ray::{Bar, ChangeCallback, DEFAULT_BAR, Message, MessageKind, Ray, RayError, RayStatus};
pub use state::{AppState, StateStatus};
