//! Worker side of the controller/worker pair.
//!
//! The worker is a child process. It connects back to the controller's two
//! listeners, then pulls execution ids fed by ADD/CHECK/REMOVE into a local
//! queue and runs them one at a time through the hosting application's
//! [`Callbacks`]. Inputs are read from the shared store directory; results
//! travel back as UPDATE messages and the controller persists them.

use std::collections::VecDeque;
use std::net::{SocketAddr, ToSocketAddrs};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::{Context as _, Result, anyhow};
use clap::Args;
use fabric_config::WorkerConfig;
use fabric_engine::{CONFIG_NAMESPACE, IN_KEY, OUT_KEY, RAY_KEY};
use fabric_store::KeyValueDb;
use fabric_types::{AppState, MessageKind, Qid, Ray, RayStatus, StateStatus};
use serde_json::{Map, Value};

use crate::channel::{Handler, Publisher, Subscriber};
use crate::logging::init_worker_tracing;
use crate::message::{FETCH_QUEUE, Message, Update};

/// Time given to the controller to read our last messages before exiting.
const EXIT_GRACE: Duration = Duration::from_secs(1);

type ExecuteFn = dyn Fn(&Value, &mut Ray) -> Result<Option<Value>> + Send + Sync;
type ConfigureFn = dyn Fn(&Map<String, Value>) -> Result<()> + Send + Sync;
type SuspendFn = dyn Fn(&AppState) -> bool + Send + Sync;

/// Hooks supplied by the hosting application.
pub struct Callbacks {
    execute: Box<ExecuteFn>,
    configure: Option<Box<ConfigureFn>>,
    suspend: Option<Box<SuspendFn>>,
}

impl Callbacks {
    /// `execute` receives the stored input and the record to report progress
    /// on; its return value becomes the execution's output.
    pub fn new(
        execute: impl Fn(&Value, &mut Ray) -> Result<Option<Value>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            execute: Box::new(execute),
            configure: None,
            suspend: None,
        }
    }

    /// Called with every entry of the settings namespace on CONFIGURE.
    pub fn with_configure(
        mut self,
        configure: impl Fn(&Map<String, Value>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.configure = Some(Box::new(configure));
        self
    }

    /// Consulted when the worker has been idle; returning true exits the
    /// process. Without one the worker never exits on its own.
    pub fn with_suspend(
        mut self,
        suspend: impl Fn(&AppState) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.suspend = Some(Box::new(suspend));
        self
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("configure", &self.configure.is_some())
            .field("suspend", &self.suspend.is_some())
            .finish_non_exhaustive()
    }
}

/// Command line the controller spawns the worker with.
#[derive(Debug, Clone, Args)]
pub struct WorkerArgs {
    /// Controller port this worker publishes into.
    #[arg(long)]
    pub publisher_port: u16,
    /// Controller port this worker subscribes to.
    #[arg(long)]
    pub subscriber_port: u16,
    /// Store directory shared with the controller.
    #[arg(long)]
    pub store_dir: PathBuf,
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
}

/// Inbound work and control flags, fed by the channel handler.
#[derive(Debug, Default)]
struct Inbox {
    queue: Mutex<VecDeque<Qid>>,
    current: Mutex<Option<Qid>>,
    reconfigure: AtomicBool,
    exit: AtomicBool,
}

impl Inbox {
    fn handle(&self, message: Message) {
        match message {
            Message::Add(qid) | Message::Check(qid) => {
                if lock(&self.current).as_ref() == Some(&qid) {
                    return;
                }
                let mut queue = lock(&self.queue);
                if !queue.contains(&qid) {
                    tracing::debug!(qid = %qid, "Queued");
                    queue.push_back(qid);
                }
            }
            Message::Remove(qid) => lock(&self.queue).retain(|queued| *queued != qid),
            Message::Configure(_) => self.reconfigure.store(true, Ordering::SeqCst),
            Message::Exit(reason) => {
                tracing::info!(reason = %reason, "Controller asked us to exit");
                self.exit.store(true, Ordering::SeqCst);
            }
            other => tracing::error!(
                action = other.action().as_str(),
                "Unexpected message from controller"
            ),
        }
    }

    fn next(&self) -> Option<Qid> {
        let qid = lock(&self.queue).pop_front()?;
        *lock(&self.current) = Some(qid.clone());
        Some(qid)
    }

    fn done(&self) {
        *lock(&self.current) = None;
    }
}

/// Connect to the controller and serve until told to exit, the controller
/// goes away, or the suspend predicate agrees to stop.
///
/// `load` builds the callbacks; a failure is reported to the controller as
/// CRASHED before this returns the error.
pub fn run(
    args: &WorkerArgs,
    config: &WorkerConfig,
    load: impl FnOnce() -> Result<Callbacks>,
) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("fabric-worker-channel")
        .enable_all()
        .build()
        .context("building channel runtime")?;

    let inbox = Arc::new(Inbox::default());
    let handler_inbox = Arc::clone(&inbox);
    let handler: Handler = Arc::new(move |message: Message| handler_inbox.handle(message));

    let publisher = Arc::new(
        runtime
            .block_on(Publisher::connect(resolve(&args.host, args.publisher_port)?))
            .context("connecting to the controller subscriber")?,
    );
    let subscriber = runtime
        .block_on(Subscriber::connect(
            resolve(&args.host, args.subscriber_port)?,
            handler,
        ))
        .context("connecting to the controller publisher")?;
    init_worker_tracing(Arc::clone(&publisher));

    let callbacks = match load() {
        Ok(callbacks) => callbacks,
        Err(e) => {
            tracing::error!("Failed to load callbacks: {e:#}");
            publisher.publish(&Message::AppState(AppState::new(StateStatus::Crashed)));
            runtime.block_on(publisher.drain(EXIT_GRACE));
            thread::sleep(EXIT_GRACE);
            return Err(e);
        }
    };

    let worker = Worker::new(
        args.store_dir.clone(),
        config.clone(),
        callbacks,
        Arc::clone(&publisher),
        inbox,
    );
    worker.announce();
    worker.serve(|| subscriber.is_closed() || publisher.is_closed());

    runtime.block_on(publisher.drain(EXIT_GRACE));
    drop(subscriber);
    runtime.shutdown_timeout(Duration::from_millis(100));
    Ok(())
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .with_context(|| format!("resolving {host}:{port}"))?
        .next()
        .ok_or_else(|| anyhow!("{host}:{port} resolved to nothing"))
}

struct Worker {
    store_dir: PathBuf,
    config: WorkerConfig,
    callbacks: Callbacks,
    publisher: Arc<Publisher>,
    inbox: Arc<Inbox>,
    state: AppState,
}

impl Worker {
    fn new(
        store_dir: PathBuf,
        config: WorkerConfig,
        callbacks: Callbacks,
        publisher: Arc<Publisher>,
        inbox: Arc<Inbox>,
    ) -> Self {
        Self {
            store_dir,
            config,
            callbacks,
            publisher,
            inbox,
            state: AppState::new(StateStatus::Running),
        }
    }

    /// Report health and ask for whatever the controller has in flight.
    fn announce(&self) {
        self.publisher.publish(&Message::AppState(self.state.clone()));
        self.publisher
            .publish(&Message::Fetch(FETCH_QUEUE.to_string()));
    }

    fn serve(&self, disconnected: impl Fn() -> bool) {
        let mut idle: u64 = 0;
        let mut threshold = self.config.suspend_after_ticks();
        loop {
            if self.inbox.exit.load(Ordering::SeqCst) {
                break;
            }
            if disconnected() {
                tracing::warn!("Controller connection lost, stopping");
                break;
            }
            if self.inbox.reconfigure.swap(false, Ordering::SeqCst) {
                self.reconfigure();
            }

            if let Some(qid) = self.inbox.next() {
                self.process(&qid);
                self.inbox.done();
                idle = 0;
                threshold = self.config.suspend_after_ticks();
                continue;
            }

            idle += 1;
            if idle >= threshold
                && let Some(suspend) = &self.callbacks.suspend
            {
                if suspend(&self.state) {
                    tracing::info!("Idle, suspending");
                    self.publisher.publish(&Message::Exit("suspend".to_string()));
                    break;
                }
                idle = 0;
                threshold = self.config.suspend_retry_ticks();
            }
            thread::sleep(self.config.tick());
        }
    }

    fn reconfigure(&self) {
        let Some(configure) = &self.callbacks.configure else {
            tracing::warn!("Settings changed but no configure callback is installed");
            return;
        };
        let settings = match KeyValueDb::open(&self.store_dir, CONFIG_NAMESPACE, false) {
            Ok(db) => db.all().clone(),
            Err(e) => {
                tracing::error!("Failed to open settings: {e}");
                return;
            }
        };
        if let Err(e) = configure(&settings) {
            tracing::error!("Configure callback failed: {e:#}");
        }
    }

    fn process(&self, qid: &Qid) {
        let db = match KeyValueDb::open(&self.store_dir, qid.as_str(), false) {
            Ok(db) => db,
            Err(e) => {
                tracing::error!(qid = %qid, "Failed to open execution store: {e}");
                self.report_failure(qid, format!("failed to open execution store: {e}"));
                return;
            }
        };
        let Some(mut ray) = stored_ray(&db, qid) else {
            tracing::debug!(qid = %qid, "Execution no longer exists, skipping");
            return;
        };

        if ray.is_finished() && ray.status() != RayStatus::Removed {
            tracing::debug!(qid = %qid, status = %ray.status(), "Already finished, resending result");
            self.publisher.publish(&Message::Update(Update {
                qid: qid.clone(),
                ray: Some(ray),
                input: None,
                output: Some(db.get(OUT_KEY).cloned().unwrap_or(Value::Null)),
            }));
            return;
        }

        let publisher = Arc::clone(&self.publisher);
        ray.on_update(Arc::new(move |record: &Ray| {
            publisher.publish(&Message::Update(Update::ray(record)));
        }));
        ray.set_status(RayStatus::Running);
        tracing::info!(qid = %qid, "Executing");

        let input = db.get(IN_KEY).cloned().unwrap_or(Value::Null);
        let output = match catch_unwind(AssertUnwindSafe(|| (self.callbacks.execute)(&input, &mut ray))) {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                tracing::error!(qid = %qid, "Execution failed: {e:#}");
                ray.message(MessageKind::Error, format!("{e:#}"));
                ray.set_status(RayStatus::Failed);
                None
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                tracing::error!(qid = %qid, "Execution panicked: {reason}");
                ray.message(MessageKind::Error, reason);
                ray.set_status(RayStatus::Failed);
                None
            }
        };

        self.publisher
            .publish(&Message::Update(Update::output(qid.clone(), output)));
        let status = if ray.status().is_terminal() {
            ray.status()
        } else {
            RayStatus::Completed
        };
        if let Err(e) = ray.finish(status) {
            tracing::error!(qid = %qid, "Failed to finish record: {e}");
        }
        tracing::info!(qid = %qid, status = %status, "Execution finished");
    }

    /// Publish a FAILED record for an execution that could not be started.
    fn report_failure(&self, qid: &Qid, reason: String) {
        let mut ray = Ray::new(qid.clone());
        ray.message(MessageKind::Error, reason);
        if let Err(e) = ray.finish(RayStatus::Failed) {
            tracing::error!(qid = %qid, "Failed to finish record: {e}");
            return;
        }
        self.publisher.publish(&Message::Update(Update::ray(&ray)));
    }
}

/// The stored record, or a fresh one if only the input exists. `None` when
/// the namespace holds neither (the execution was deleted).
fn stored_ray(db: &KeyValueDb, qid: &Qid) -> Option<Ray> {
    match db.get(RAY_KEY).cloned().map(serde_json::from_value::<Ray>) {
        Some(Ok(ray)) => Some(ray),
        Some(Err(e)) => {
            tracing::warn!(qid = %qid, "Stored record unreadable, starting fresh: {e}");
            Some(Ray::new(qid.clone()))
        }
        None if db.exists(IN_KEY) => Some(Ray::new(qid.clone())),
        None => None,
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "panic with a non-string payload".to_string()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;

    use serde_json::json;
    use tempfile::tempdir;

    use super::*;

    struct Harness {
        _subscriber: Subscriber,
        seen: Arc<Mutex<Vec<Message>>>,
        publisher: Arc<Publisher>,
    }

    async fn harness() -> Harness {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: Handler = Arc::new(move |message: Message| sink.lock().unwrap().push(message));
        let subscriber = Subscriber::bind("127.0.0.1", handler).await.unwrap();
        let publisher = Arc::new(Publisher::connect(subscriber.addr()).await.unwrap());
        Harness {
            _subscriber: subscriber,
            seen,
            publisher,
        }
    }

    async fn settle(harness: &Harness) {
        harness.publisher.drain(Duration::from_secs(1)).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    fn seed(dir: &Path, qid: &str, input: Value) {
        let mut db = KeyValueDb::open(dir, qid, false).unwrap();
        let mut ray = Ray::new(Qid::from(qid));
        ray.requeue(None, None, None);
        db.set(RAY_KEY, serde_json::to_value(&ray).unwrap()).unwrap();
        db.set(IN_KEY, input).unwrap();
        db.dump().unwrap();
    }

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            tick_ms: 5,
            suspend_after_ms: 20,
            suspend_retry_ms: 10,
        }
    }

    fn worker(dir: &Path, callbacks: Callbacks, publisher: &Arc<Publisher>) -> Worker {
        Worker::new(
            dir.to_path_buf(),
            fast_config(),
            callbacks,
            Arc::clone(publisher),
            Arc::new(Inbox::default()),
        )
    }

    fn updates(seen: &Mutex<Vec<Message>>) -> Vec<Update> {
        seen.lock()
            .unwrap()
            .iter()
            .filter_map(|message| match message {
                Message::Update(update) => Some(update.clone()),
                _ => None,
            })
            .collect()
    }

    fn increment() -> Callbacks {
        Callbacks::new(|input: &Value, ray: &mut Ray| {
            ray.progress("default", 1.0, 2.0);
            Ok(Some(json!({ "y": input["x"].as_i64().unwrap_or(0) + 1 })))
        })
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn output_is_published_before_the_finished_record() {
        let dir = tempdir().unwrap();
        seed(dir.path(), "q1", json!({"x": 1}));
        let harness = harness().await;

        worker(dir.path(), increment(), &harness.publisher).process(&Qid::from("q1"));
        settle(&harness).await;

        let updates = updates(&harness.seen);
        let output_at = updates
            .iter()
            .position(|update| update.output == Some(json!({"y": 2})))
            .unwrap();
        let finished_at = updates
            .iter()
            .position(|update| update.ray.as_ref().is_some_and(Ray::is_finished))
            .unwrap();
        assert!(output_at < finished_at);
        let last = updates[finished_at].ray.as_ref().unwrap();
        assert_eq!(last.status(), RayStatus::Completed);
        assert!(
            updates
                .iter()
                .any(|update| update.ray.as_ref().map(Ray::status) == Some(RayStatus::Running))
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn callback_errors_fail_the_record_without_stopping() {
        let dir = tempdir().unwrap();
        seed(dir.path(), "bad", json!({}));
        let harness = harness().await;
        let callbacks = Callbacks::new(|_: &Value, _: &mut Ray| Err(anyhow!("model exploded")));

        worker(dir.path(), callbacks, &harness.publisher).process(&Qid::from("bad"));
        settle(&harness).await;

        let updates = updates(&harness.seen);
        let last = updates
            .iter()
            .filter_map(|update| update.ray.as_ref())
            .next_back()
            .unwrap();
        assert_eq!(last.status(), RayStatus::Failed);
        assert!(last.is_finished());
        assert_eq!(last.messages()[0].kind, MessageKind::Error);
        assert!(last.messages()[0].content.contains("model exploded"));
        assert!(updates.iter().any(|update| update.output == Some(Value::Null)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn panics_are_contained() {
        let dir = tempdir().unwrap();
        seed(dir.path(), "boom", json!({}));
        let harness = harness().await;
        let callbacks = Callbacks::new(|_: &Value, _: &mut Ray| panic!("index out of range"));

        worker(dir.path(), callbacks, &harness.publisher).process(&Qid::from("boom"));
        settle(&harness).await;

        let updates = updates(&harness.seen);
        let last = updates
            .iter()
            .filter_map(|update| update.ray.as_ref())
            .next_back()
            .unwrap();
        assert_eq!(last.status(), RayStatus::Failed);
        assert!(last.messages()[0].content.contains("index out of range"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn finished_records_are_resent_not_rerun() {
        let dir = tempdir().unwrap();
        let mut db = KeyValueDb::open(dir.path(), "done", false).unwrap();
        let mut ray = Ray::new(Qid::from("done"));
        ray.finish(RayStatus::Completed).unwrap();
        db.set(RAY_KEY, serde_json::to_value(&ray).unwrap()).unwrap();
        db.set(OUT_KEY, json!({"y": 5})).unwrap();
        db.dump().unwrap();

        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let callbacks = Callbacks::new(move |_: &Value, _: &mut Ray| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        });
        let harness = harness().await;

        worker(dir.path(), callbacks, &harness.publisher).process(&Qid::from("done"));
        settle(&harness).await;

        assert_eq!(runs.load(Ordering::SeqCst), 0);
        let updates = updates(&harness.seen);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].output, Some(json!({"y": 5})));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unopenable_store_fails_the_record() {
        let dir = tempdir().unwrap();
        let harness = harness().await;

        worker(dir.path(), increment(), &harness.publisher).process(&Qid::from("../escape"));
        settle(&harness).await;

        let updates = updates(&harness.seen);
        assert_eq!(updates.len(), 1);
        let ray = updates[0].ray.as_ref().unwrap();
        assert_eq!(ray.qid().as_str(), "../escape");
        assert_eq!(ray.status(), RayStatus::Failed);
        assert!(ray.is_finished());
        assert_eq!(ray.messages()[0].kind, MessageKind::Error);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn deleted_executions_are_skipped() {
        let dir = tempdir().unwrap();
        let harness = harness().await;

        worker(dir.path(), increment(), &harness.publisher).process(&Qid::from("gone"));
        settle(&harness).await;

        assert!(updates(&harness.seen).is_empty());
    }

    #[test]
    fn inbox_ignores_duplicates_and_honours_remove() {
        let inbox = Inbox::default();
        inbox.handle(Message::Add(Qid::from("a")));
        inbox.handle(Message::Check(Qid::from("a")));
        inbox.handle(Message::Add(Qid::from("b")));
        inbox.handle(Message::Remove(Qid::from("b")));
        inbox.handle(Message::Remove(Qid::from("never")));

        assert_eq!(inbox.next(), Some(Qid::from("a")));
        // A CHECK for the running id does not queue it twice.
        inbox.handle(Message::Check(Qid::from("a")));
        assert_eq!(inbox.next(), None);
        inbox.done();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn suspend_denial_retries_then_exits() {
        let dir = tempdir().unwrap();
        let harness = harness().await;
        let asked = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&asked);
        let callbacks = increment().with_suspend(move |state: &AppState| {
            assert_eq!(state.status, StateStatus::Running);
            counter.fetch_add(1, Ordering::SeqCst) >= 2
        });

        let worker = worker(dir.path(), callbacks, &harness.publisher);
        tokio::task::spawn_blocking(move || worker.serve(|| false))
            .await
            .unwrap();
        settle(&harness).await;

        assert_eq!(asked.load(Ordering::SeqCst), 3);
        assert!(
            harness
                .seen
                .lock()
                .unwrap()
                .iter()
                .any(|message| matches!(message, Message::Exit(reason) if reason == "suspend"))
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn configure_reads_the_settings_namespace() {
        let dir = tempdir().unwrap();
        let mut db = KeyValueDb::open(dir.path(), CONFIG_NAMESPACE, false).unwrap();
        db.set("model", json!("small")).unwrap();
        db.dump().unwrap();

        let received = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&received);
        let callbacks = increment().with_configure(move |settings: &Map<String, Value>| {
            *sink.lock().unwrap() = Some(settings.clone());
            Ok(())
        });
        let harness = harness().await;
        let worker = worker(dir.path(), callbacks, &harness.publisher);

        worker.inbox.handle(Message::Configure("reload".to_string()));
        assert!(worker.inbox.reconfigure.load(Ordering::SeqCst));
        worker.reconfigure();

        let settings = received.lock().unwrap().clone().unwrap();
        assert_eq!(settings["model"], json!("small"));
    }
}
