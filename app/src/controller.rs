//! Controller side of the controller/worker pair.
//!
//! The [`Controller`] is the engine's [`Executor`]: it hands each execution
//! to a child worker process over the channel and polls the shared record
//! until the worker's UPDATEs mark it finished. The worker is spawned lazily
//! and respawned whenever new work arrives after it exited.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use fabric_config::{ControllerConfig, FabricConfig};
use fabric_engine::{
    Engine, EngineError, Executor, IN_KEY, OUT_KEY, RAY_KEY, SharedRay, cancel_ray, lock_ray,
};
use fabric_types::{AppState, Qid, RayStatus, StateStatus};
use serde_json::{Map, Value};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

use crate::channel::{Handler, Publisher, Subscriber};
use crate::logging::relay;
use crate::message::{FETCH_QUEUE, Message, Update};

pub struct Controller {
    config: ControllerConfig,
    store_dir: PathBuf,
    engine: Weak<Engine>,
    publisher: Publisher,
    subscriber: Subscriber,
    child: Mutex<Option<Child>>,
    state: Mutex<AppState>,
    inflight: Mutex<HashSet<Qid>>,
    /// Executions whose output already arrived; CHECK is no longer sent for them.
    answered: Mutex<HashSet<Qid>>,
    updates: mpsc::UnboundedSender<Update>,
    runtime: Option<Runtime>,
}

impl Controller {
    /// Bind the channel, then register the controller as `engine`'s executor.
    ///
    /// No worker is spawned until the first execution.
    pub fn start(config: &FabricConfig, engine: &Arc<Engine>) -> Result<Arc<Self>> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("fabric-channel")
            .enable_all()
            .build()
            .context("building channel runtime")?;

        let slot: Arc<OnceLock<Weak<Controller>>> = Arc::new(OnceLock::new());
        let handler_slot = Arc::clone(&slot);
        let handler: Handler = Arc::new(move |message: Message| {
            if let Some(controller) = handler_slot.get().and_then(Weak::upgrade) {
                controller.on_message(message);
            }
        });

        let host = config.controller.host.as_str();
        let publisher = runtime
            .block_on(Publisher::bind(host))
            .with_context(|| format!("binding publisher on {host}"))?;
        let subscriber = runtime
            .block_on(Subscriber::bind(host, handler))
            .with_context(|| format!("binding subscriber on {host}"))?;
        tracing::info!(
            publisher = %publisher.addr(),
            subscriber = %subscriber.addr(),
            "Controller channel bound"
        );

        // Store writes fsync, so they run off the channel tasks, in arrival order.
        let (updates, mut pending) = mpsc::unbounded_channel::<Update>();
        let store_engine = Arc::downgrade(engine);
        runtime.spawn_blocking(move || {
            while let Some(update) = pending.blocking_recv() {
                let qid = update.qid.clone();
                if let Err(e) = apply_update(&store_engine, update) {
                    tracing::error!(qid = %qid, "Failed to apply worker update: {e}");
                }
            }
        });

        let controller = Arc::new(Self {
            config: config.controller.clone(),
            store_dir: config.store.path.clone(),
            engine: Arc::downgrade(engine),
            publisher,
            subscriber,
            child: Mutex::new(None),
            state: Mutex::new(AppState::default()),
            inflight: Mutex::new(HashSet::new()),
            answered: Mutex::new(HashSet::new()),
            updates,
            runtime: Some(runtime),
        });
        let _ = slot.set(Arc::downgrade(&controller));
        engine.register_executor(controller.clone());
        Ok(controller)
    }

    /// Last health reported by the worker.
    #[must_use]
    pub fn state(&self) -> AppState {
        lock(&self.state).clone()
    }

    /// Whether a worker process is currently running.
    #[must_use]
    pub fn worker_alive(&self) -> bool {
        let mut child = lock(&self.child);
        match child.as_mut() {
            Some(process) => matches!(process.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Ask the worker to exit, killing it if it is still running after the
    /// grace period.
    pub fn shutdown(&self) {
        self.publisher.publish(&Message::Exit("closing".to_string()));
        let Some(mut child) = lock(&self.child).take() else {
            return;
        };

        let deadline = Instant::now() + self.config.shutdown_grace();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    tracing::info!(%status, "Worker stopped");
                    return;
                }
                Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(20)),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Failed to poll worker: {e}");
                    break;
                }
            }
        }
        tracing::warn!("Worker ignored EXIT, killing it");
        reap(&mut child);
    }

    fn dispatch(&self, message: Message, start_worker: bool) {
        if start_worker {
            self.ensure_worker();
        }
        tracing::debug!(action = message.action().as_str(), "Dispatching");
        self.publisher.publish(&message);
    }

    /// Kill a worker that reported CRASHED but has not exited yet, so the
    /// next dispatch spawns a fresh one.
    fn replace_crashed_worker(&self) {
        let mut child = lock(&self.child);
        if lock(&self.state).status != StateStatus::Crashed {
            return;
        }
        if let Some(mut process) = child.take() {
            tracing::warn!(pid = process.id(), "Replacing crashed worker");
            reap(&mut process);
        }
    }

    fn awaiting_output(&self, qid: &Qid) -> bool {
        !lock(&self.answered).contains(qid)
    }

    fn ensure_worker(&self) {
        let mut child = lock(&self.child);
        if let Some(process) = child.as_mut() {
            match process.try_wait() {
                Ok(None) => return,
                Ok(Some(status)) => tracing::info!(%status, "Worker exited, respawning"),
                Err(e) => tracing::warn!("Failed to poll worker, respawning: {e}"),
            }
        }

        *lock(&self.state) = AppState::new(StateStatus::Starting);
        match self.spawn_worker() {
            Ok(process) => {
                tracing::info!(pid = process.id(), "Worker spawned");
                *child = Some(process);
            }
            Err(e) => {
                tracing::error!("Failed to spawn worker: {e:#}");
                *lock(&self.state) = AppState::new(StateStatus::Crashed);
                *child = None;
            }
        }
    }

    fn spawn_worker(&self) -> Result<Child> {
        let (program, leading) = match self.config.worker_command.split_first() {
            Some((program, rest)) => (PathBuf::from(program), rest.to_vec()),
            None => (
                std::env::current_exe().context("resolving current executable")?,
                vec!["worker".to_string()],
            ),
        };

        // The worker publishes into our subscriber and subscribes to our publisher.
        Command::new(&program)
            .args(leading)
            .arg("--host")
            .arg(&self.config.host)
            .arg("--publisher-port")
            .arg(self.subscriber.addr().port().to_string())
            .arg("--subscriber-port")
            .arg(self.publisher.addr().port().to_string())
            .arg("--store-dir")
            .arg(&self.store_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("spawning {}", program.display()))
    }

    fn engine_running(&self) -> bool {
        self.engine
            .upgrade()
            .is_some_and(|engine| engine.context().is_running())
    }

    fn on_message(&self, message: Message) {
        match message {
            Message::Fetch(what) if what == FETCH_QUEUE => {
                let pending: Vec<Qid> = lock(&self.inflight)
                    .iter()
                    .filter(|qid| self.awaiting_output(qid))
                    .cloned()
                    .collect();
                tracing::debug!(count = pending.len(), "Worker fetched the queue");
                for qid in pending {
                    self.publisher.publish(&Message::Add(qid));
                }
            }
            Message::Fetch(what) => tracing::error!(what = %what, "Unknown fetch request"),
            Message::Update(update) => {
                if update.output.is_some() {
                    lock(&self.answered).insert(update.qid.clone());
                }
                if self.updates.send(update).is_err() {
                    tracing::error!("Update writer stopped, dropping worker update");
                }
            }
            Message::AppState(state) => {
                let mut current = lock(&self.state);
                tracing::info!(from = %current.status, to = %state.status, "Worker state changed");
                *current = state;
            }
            Message::Log(record) => relay(&record),
            Message::Exit(reason) => {
                tracing::info!(reason = %reason, "Worker exited");
                if let Some(mut child) = lock(&self.child).take() {
                    reap(&mut child);
                }
            }
            other => tracing::error!(
                action = other.action().as_str(),
                "Unexpected message from worker"
            ),
        }
    }

    fn fail(&self, qid: &Qid, ray: &SharedRay) {
        let mut record = lock_ray(ray);
        if let Err(e) = record.finish(RayStatus::Failed) {
            tracing::warn!(qid = %qid, "Failed to mark record failed: {e}");
        }
        if let Some(engine) = self.engine.upgrade()
            && let Err(e) = engine
                .write(qid, RAY_KEY, &*record)
                .and_then(|()| engine.flush(qid))
        {
            tracing::warn!(qid = %qid, "Failed to persist failed record: {e}");
        }
    }
}

impl Executor for Controller {
    fn execute(&self, ray: &SharedRay) {
        let qid = lock_ray(ray).qid().clone();
        lock(&self.inflight).insert(qid.clone());
        lock(&self.answered).remove(&qid);
        self.replace_crashed_worker();
        self.dispatch(Message::Add(qid.clone()), true);

        let check_every = u64::from(self.config.check_every.max(1));
        let mut ticks: u64 = 0;
        loop {
            if lock_ray(ray).is_finished() {
                break;
            }
            if lock(&self.state).status == StateStatus::Crashed {
                tracing::error!(qid = %qid, "Worker crashed, failing execution");
                self.fail(&qid, ray);
                break;
            }
            if !self.engine_running() {
                tracing::debug!(qid = %qid, "Engine stopping, abandoning wait");
                break;
            }

            thread::sleep(self.config.tick());
            ticks += 1;
            // The worker may have exited or missed the ADD; probe again.
            if ticks % check_every == 0 && self.awaiting_output(&qid) {
                self.dispatch(Message::Check(qid.clone()), true);
            }
        }
        lock(&self.inflight).remove(&qid);
        lock(&self.answered).remove(&qid);
    }

    fn cancel(&self, ray: &SharedRay) {
        cancel_ray(ray);
        let qid = lock_ray(ray).qid().clone();
        lock(&self.inflight).remove(&qid);
        lock(&self.answered).remove(&qid);
        self.dispatch(Message::Remove(qid), false);
    }

    fn configure(&self, _settings: &Map<String, Value>) {
        self.dispatch(Message::Configure("reload".to_string()), false);
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if let Some(mut child) = lock(&self.child).take() {
            reap(&mut child);
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("publisher", &self.publisher.addr())
            .field("subscriber", &self.subscriber.addr())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Persist one worker UPDATE into the engine's store.
fn apply_update(engine: &Weak<Engine>, update: Update) -> Result<(), EngineError> {
    let Some(engine) = engine.upgrade() else {
        return Ok(());
    };
    let Some(shared) = engine.lookup(&update.qid) else {
        tracing::debug!(qid = %update.qid, "Ignoring update for unknown execution");
        return Ok(());
    };

    let mut flush = false;
    if let Some(output) = &update.output {
        engine.write(&update.qid, OUT_KEY, output)?;
        flush = true;
    }
    if let Some(input) = &update.input {
        engine.write(&update.qid, IN_KEY, input)?;
        flush = true;
    }
    if let Some(snapshot) = &update.ray {
        let mut record = lock_ray(&shared);
        record.merge(snapshot);
        engine.write(&update.qid, RAY_KEY, &*record)?;
        flush |= record.is_finished();
    }
    if flush {
        engine.flush(&update.qid)?;
    }
    Ok(())
}

fn reap(child: &mut Child) {
    if let Err(e) = child.kill() {
        tracing::debug!("Worker already gone: {e}");
    }
    if let Err(e) = child.wait() {
        tracing::warn!("Failed to reap worker: {e}");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use fabric_types::Ray;
    use serde_json::json;
    use tempfile::tempdir;

    use super::*;

    /// Controller over an engine whose dispatch thread is already stopped,
    /// so only the messages fed by the test touch the records.
    fn started(dir: &Path) -> (Arc<Engine>, Arc<Controller>) {
        let mut config = FabricConfig::default();
        config.store.path = dir.to_path_buf();
        let engine = Engine::start(&config).unwrap();
        engine.shutdown();
        let controller = Controller::start(&config, &engine).unwrap();
        (engine, controller)
    }

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        done()
    }

    #[test]
    fn worker_updates_are_stored_in_arrival_order() {
        let dir = tempdir().unwrap();
        let (engine, controller) = started(dir.path());
        let qid = Qid::from("q1");
        engine.ray(&qid);

        controller.on_message(Message::Update(Update::output(
            qid.clone(),
            Some(json!({"y": 1})),
        )));
        let mut done = Ray::new(qid.clone());
        done.finish(RayStatus::Completed).unwrap();
        controller.on_message(Message::Update(Update::ray(&done)));

        assert!(wait_until(|| lock_ray(&engine.ray(&qid)).is_finished()));
        assert_eq!(
            engine.read::<Value>(&qid, OUT_KEY).unwrap(),
            Some(json!({"y": 1}))
        );
        let stored: Ray = engine.read(&qid, RAY_KEY).unwrap().unwrap();
        assert_eq!(stored.status(), RayStatus::Completed);
    }

    #[test]
    fn answered_executions_get_no_more_checks() {
        let dir = tempdir().unwrap();
        let (engine, controller) = started(dir.path());
        let qid = Qid::from("q2");
        engine.ray(&qid);
        assert!(controller.awaiting_output(&qid));

        controller.on_message(Message::Update(Update::ray(&Ray::new(qid.clone()))));
        assert!(controller.awaiting_output(&qid));

        controller.on_message(Message::Update(Update::output(qid.clone(), None)));
        assert!(!controller.awaiting_output(&qid));
    }

    #[test]
    fn healthy_app_state_clears_a_crash() {
        let dir = tempdir().unwrap();
        let (_engine, controller) = started(dir.path());
        controller.on_message(Message::AppState(AppState::new(StateStatus::Crashed)));
        assert_eq!(controller.state().status, StateStatus::Crashed);

        controller.on_message(Message::AppState(AppState::new(StateStatus::Running)));
        assert_eq!(controller.state().status, StateStatus::Running);
    }
}
