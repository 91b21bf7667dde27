//! Per-engine registry of collaborators.
//!
//! Everything the dispatch loop needs from the hosting application lives in
//! one [`Context`] owned by the [`Engine`](crate::Engine), so independent
//! engines can coexist in one process (tests rely on this).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use fabric_types::{ChangeCallback, Ray, RayStatus};
use serde_json::{Map, Value};

/// Progress record shared between the engine and whoever executes it.
pub type SharedRay = Arc<Mutex<Ray>>;

/// Lock a shared record, recovering from a poisoned lock.
pub fn lock_ray(ray: &SharedRay) -> MutexGuard<'_, Ray> {
    ray.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Force a record to CANCELED and finished.
pub fn cancel_ray(ray: &SharedRay) {
    let mut record = lock_ray(ray);
    if let Err(e) = record.finish(RayStatus::Canceled) {
        tracing::warn!(qid = %record.qid(), "Failed to cancel record: {e}");
    }
}

/// Runs executions on behalf of the engine.
///
/// Implementations must not call back into the engine while holding the
/// record's lock.
pub trait Executor: Send + Sync {
    /// Drive `ray` to completion. Returns once the record is finished or the
    /// engine is shutting down.
    fn execute(&self, ray: &SharedRay);

    /// Force `ray` to CANCELED and finished, and stop any pending work for it.
    fn cancel(&self, ray: &SharedRay);

    /// Apply new settings. The settings are already persisted when this runs.
    fn configure(&self, settings: &Map<String, Value>) {
        let _ = settings;
    }
}

#[derive(Default)]
pub struct Context {
    executor: RwLock<Option<Arc<dyn Executor>>>,
    listener: RwLock<Option<ChangeCallback>>,
    running: AtomicBool,
}

impl Context {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_executor(&self, executor: Arc<dyn Executor>) {
        *self
            .executor
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(executor);
    }

    pub fn clear_executor(&self) {
        *self
            .executor
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    #[must_use]
    pub fn executor(&self) -> Option<Arc<dyn Executor>> {
        self.executor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Listener installed on every record the engine creates or restores.
    ///
    /// It runs while the record is locked and must not re-enter the engine.
    pub fn set_listener(&self, listener: ChangeCallback) {
        *self
            .listener
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    #[must_use]
    pub fn listener(&self) -> Option<ChangeCallback> {
        self.listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Cleared on shutdown; long-running executors poll it to bail out.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::Release);
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("executor", &self.executor().is_some())
            .field("listener", &self.listener().is_some())
            .field("running", &self.is_running())
            .finish()
    }
}
