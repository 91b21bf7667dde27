use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use fabric_config::FabricConfig;
use fabric_store::Store;
use fabric_types::{Qid, Ray, RayStatus};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::context::{Context, Executor, SharedRay, cancel_ray, lock_ray};
use crate::error::EngineError;
use crate::task::TaskQueue;

/// Request payload key in an execution namespace.
pub const IN_KEY: &str = "in";
/// Response payload key in an execution namespace.
pub const OUT_KEY: &str = "out";
/// Serialized progress record key in an execution namespace.
pub const RAY_KEY: &str = "ray";
/// Namespace holding the application settings pushed by [`Engine::configure`].
pub const CONFIG_NAMESPACE: &str = "config";

/// Correlation ids attached to a submission. Every field is optional; a
/// missing `qid` is generated.
#[derive(Debug, Clone, Default)]
pub struct Submission {
    pub qid: Option<Qid>,
    pub sid: Option<String>,
    pub uid: Option<String>,
    pub rid: Option<String>,
}

impl Submission {
    #[must_use]
    pub fn with_qid(qid: impl Into<Qid>) -> Self {
        Self {
            qid: Some(qid.into()),
            ..Self::default()
        }
    }
}

struct Dispatch {
    rays: HashMap<Qid, SharedRay>,
    task: TaskQueue,
    stopping: bool,
}

/// Queue, records and dispatch thread for one store directory.
///
/// All mutations of the record map and the queue happen under one mutex; the
/// dispatch thread sleeps on the paired condition variable until an id is
/// queued, then runs it through [`Engine::process`] before looking again.
pub struct Engine {
    store: Store,
    state: Mutex<Dispatch>,
    wake: Condvar,
    context: Context,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    pub fn start(config: &FabricConfig) -> Result<Arc<Self>, EngineError> {
        Self::start_with(config, Context::new())
    }

    /// Restore persisted records, then spawn the dispatch thread and wait
    /// for it to come up.
    ///
    /// The thread keeps the engine alive until [`shutdown`](Self::shutdown).
    pub fn start_with(config: &FabricConfig, context: Context) -> Result<Arc<Self>, EngineError> {
        let task = TaskQueue::open(&config.store.path)?;
        let engine = Arc::new(Self {
            store: Store::from_config(&config.store, false),
            state: Mutex::new(Dispatch {
                rays: HashMap::new(),
                task,
                stopping: false,
            }),
            wake: Condvar::new(),
            context,
            dispatcher: Mutex::new(None),
        });
        engine.restore_rays()?;

        let (ready_tx, ready_rx) = mpsc::channel();
        let runner = Arc::clone(&engine);
        let handle = thread::Builder::new()
            .name("fabric-dispatch".to_string())
            .spawn(move || {
                runner.context.set_running(true);
                let _ = ready_tx.send(());
                runner.dispatch_loop();
            })
            .map_err(EngineError::Spawn)?;
        *engine
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        let timeout = config.engine.start_timeout();
        if ready_rx.recv_timeout(timeout).is_err() {
            engine.shutdown();
            return Err(EngineError::StartTimeout(timeout));
        }
        tracing::info!(dir = %config.store.path.display(), "Engine started");
        Ok(engine)
    }

    #[must_use]
    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn register_executor(&self, executor: Arc<dyn Executor>) {
        self.context.set_executor(executor);
    }

    /// Persist `input` and a fresh QUEUED record for the execution, then
    /// queue it and wake the dispatch thread.
    pub fn prepare<T: Serialize + ?Sized>(
        &self,
        input: &T,
        submission: Submission,
    ) -> Result<Qid, EngineError> {
        let mut state = self.lock();
        let qid = submission.qid.unwrap_or_else(Qid::generate);
        // `delete` forgets the record, so a reused id starts from a fresh one.
        let ray = self.ray_entry(&mut state, &qid);

        {
            let mut record = lock_ray(&ray);
            record.requeue(submission.sid, submission.uid, submission.rid);
            self.write(&qid, RAY_KEY, &*record)?;
        }
        self.write(&qid, IN_KEY, input)?;
        self.flush(&qid)?;
        state.task.add(&qid)?;
        self.wake.notify_all();

        tracing::info!(qid = %qid, "Queued execution");
        Ok(qid)
    }

    /// Record for `qid`, created with status UNKNOWN if none exists yet.
    pub fn ray(&self, qid: &Qid) -> SharedRay {
        let mut state = self.lock();
        self.ray_entry(&mut state, qid)
    }

    /// Record for `qid` if the engine tracks one.
    pub fn lookup(&self, qid: &Qid) -> Option<SharedRay> {
        self.lock().rays.get(qid).cloned()
    }

    /// Snapshots of every record accepted by `filter`.
    pub fn rays(&self, filter: impl Fn(&Ray) -> bool) -> Vec<Ray> {
        let shared: Vec<SharedRay> = self.lock().rays.values().cloned().collect();
        shared
            .iter()
            .filter_map(|ray| {
                let record = lock_ray(ray);
                filter(&*record).then(|| record.clone())
            })
            .collect()
    }

    /// Like [`rays`](Self::rays), oldest first.
    pub fn pending_rays(&self, filter: impl Fn(&Ray) -> bool) -> Vec<Ray> {
        let mut rays = self.rays(filter);
        rays.sort_by_key(Ray::created_at);
        rays
    }

    /// Ids waiting for the dispatch thread.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.lock().task.len()
    }

    /// Run `qid` through the registered executor and return its output.
    ///
    /// Without an executor the execution is logged and dropped.
    pub fn process(&self, qid: &Qid) -> Result<Option<Value>, EngineError> {
        let Some(executor) = self.context.executor() else {
            tracing::error!(qid = %qid, "No executor registered, dropping execution");
            return Ok(None);
        };
        let ray = self.ray(qid);
        let started = Instant::now();
        executor.execute(&ray);
        tracing::debug!(
            qid = %qid,
            elapsed = ?started.elapsed(),
            "Execution returned"
        );
        self.read(qid, OUT_KEY)
    }

    /// Cancel and forget `qid`: unqueue it, force its record to CANCELED,
    /// drop its namespace and mark the record REMOVED.
    ///
    /// Returns the final snapshot. Safe to call for unknown or finished ids.
    pub fn delete(&self, qid: &Qid) -> Result<Ray, EngineError> {
        let mut state = self.lock();
        state.task.rem(qid)?;
        let ray = state
            .rays
            .remove(qid)
            .unwrap_or_else(|| self.new_ray(qid));

        match self.context.executor() {
            Some(executor) => executor.cancel(&ray),
            None => cancel_ray(&ray),
        }
        self.store.drop_namespace(qid.as_str())?;

        let mut record = lock_ray(&ray);
        record.set_status(RayStatus::Removed);
        self.wake.notify_all();
        tracing::info!(qid = %qid, "Deleted execution");
        Ok(record.clone())
    }

    pub fn read<T: DeserializeOwned>(&self, qid: &Qid, key: &str) -> Result<Option<T>, EngineError> {
        let Some(value) = self.store.get(qid.as_str(), key)? else {
            return Ok(None);
        };
        serde_json::from_value(value)
            .map(Some)
            .map_err(|source| EngineError::Decode {
                qid: qid.clone(),
                key: key.to_string(),
                source,
            })
    }

    pub fn write<T: Serialize + ?Sized>(
        &self,
        qid: &Qid,
        key: &str,
        value: &T,
    ) -> Result<(), EngineError> {
        let value = serde_json::to_value(value).map_err(|source| EngineError::Encode {
            qid: qid.clone(),
            key: key.to_string(),
            source,
        })?;
        self.store.set(qid.as_str(), key, value)?;
        Ok(())
    }

    pub fn flush(&self, qid: &Qid) -> Result<(), EngineError> {
        self.store.flush(qid.as_str())?;
        Ok(())
    }

    /// Persist `settings` under [`CONFIG_NAMESPACE`] and hand them to the
    /// executor.
    pub fn configure(&self, settings: &Map<String, Value>) -> Result<(), EngineError> {
        for (key, value) in settings {
            self.store.set(CONFIG_NAMESPACE, key, value.clone())?;
        }
        self.store.flush(CONFIG_NAMESPACE)?;
        match self.context.executor() {
            Some(executor) => executor.configure(settings),
            None => tracing::warn!("Settings stored but no executor is registered"),
        }
        Ok(())
    }

    /// Settings last stored by [`configure`](Self::configure).
    pub fn settings(&self) -> Result<Map<String, Value>, EngineError> {
        Ok(self.store.all(CONFIG_NAMESPACE)?)
    }

    /// Stop the dispatch thread and wait for it to exit.
    ///
    /// An execution in flight finishes first; executors observe
    /// [`Context::is_running`] to cut that short.
    pub fn shutdown(&self) {
        {
            let mut state = self.lock();
            if state.stopping {
                return;
            }
            state.stopping = true;
        }
        self.context.set_running(false);
        self.wake.notify_all();

        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && handle.thread().id() != thread::current().id()
            && handle.join().is_err()
        {
            tracing::warn!("Dispatch thread panicked");
        }
        if let Err(e) = self.store.flush_all() {
            tracing::warn!("Failed to flush store on shutdown: {e}");
        }
        tracing::info!("Engine stopped");
    }

    fn dispatch_loop(&self) {
        loop {
            let next = {
                let mut state = self.lock();
                while !state.stopping && state.task.empty() {
                    state = self
                        .wake
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                if state.stopping {
                    break;
                }
                match state.task.next() {
                    Ok(next) => next,
                    Err(e) => {
                        tracing::error!("Failed to dequeue execution: {e}");
                        None
                    }
                }
            };

            if let Some(qid) = next
                && let Err(e) = self.process(&qid)
            {
                tracing::error!(qid = %qid, "Execution failed: {e}");
            }
        }
    }

    fn restore_rays(&self) -> Result<(), EngineError> {
        let mut state = self.lock();
        for qid in state.task.all()? {
            match self.read::<Ray>(&qid, RAY_KEY) {
                Ok(Some(mut ray)) => {
                    if let Some(listener) = self.context.listener() {
                        ray.on_update(listener);
                    }
                    state.rays.insert(qid, Arc::new(Mutex::new(ray)));
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(qid = %qid, "Skipping unreadable progress record: {e}"),
            }
        }
        if !state.rays.is_empty() {
            tracing::info!(count = state.rays.len(), "Restored progress records");
        }
        Ok(())
    }

    fn ray_entry(&self, state: &mut Dispatch, qid: &Qid) -> SharedRay {
        Arc::clone(
            state
                .rays
                .entry(qid.clone())
                .or_insert_with(|| self.new_ray(qid)),
        )
    }

    fn new_ray(&self, qid: &Qid) -> SharedRay {
        let mut ray = Ray::new(qid.clone());
        if let Some(listener) = self.context.listener() {
            ray.on_update(listener);
        }
        Arc::new(Mutex::new(ray))
    }

    fn lock(&self) -> MutexGuard<'_, Dispatch> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("store", &self.store)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}
