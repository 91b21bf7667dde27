//! Connection management, event correlation and the liveness watchdog.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use fabric_config::ProxyConfig;
use fabric_types::Qid;
use fabric_utils::{FrameReader, FrameWriter};
use serde::Serialize;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::ProxyError;
use crate::handle::{RequestHandle, Shared, Tracker};
use crate::wire::{self, Event, Inbound, Outbound};

/// Callback registered with [`Proxy::on`]. Receives the event payload.
pub type Listener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Event name under which connection changes are announced, with a boolean
/// payload.
const CONNECTED: &str = "connected";

/// Remote client with one auto-reconnecting connection.
///
/// Construction waits up to `connect_timeout` for the first connection but
/// never fails because of it; check [`is_connected`](Self::is_connected).
/// Events emitted while disconnected are dropped; the watchdog's resync
/// requests recover from the gap.
pub struct Proxy {
    inner: Arc<Inner>,
    handle: Handle,
    runtime: Option<Runtime>,
    stop: watch::Sender<bool>,
}

struct Inner {
    tag: String,
    url: String,
    config: ProxyConfig,
    running: AtomicBool,
    session: Mutex<Option<mpsc::UnboundedSender<Event>>>,
    tracked: Mutex<HashMap<String, Weak<Shared>>>,
    listeners: Mutex<HashMap<String, Vec<Listener>>>,
    legacy: Legacy,
}

/// Bookkeeping for the synchronous `execute` path.
struct Legacy {
    permit: Arc<Semaphore>,
    waiting: Mutex<HashSet<String>>,
    results: Mutex<HashMap<String, Value>>,
    cancel_next: AtomicBool,
    pending: AtomicUsize,
}

impl Proxy {
    /// Start connecting to `url` (`host:port`). `tag` prefixes log lines and
    /// defaults to the url.
    pub fn connect(
        url: impl Into<String>,
        tag: Option<&str>,
        config: &ProxyConfig,
    ) -> Result<Self, ProxyError> {
        let url = url.into();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("fabric-proxy")
            .enable_all()
            .build()
            .map_err(ProxyError::Runtime)?;
        let handle = runtime.handle().clone();

        let inner = Arc::new(Inner {
            tag: tag.map_or_else(|| url.clone(), ToString::to_string),
            url,
            config: config.clone(),
            running: AtomicBool::new(true),
            session: Mutex::new(None),
            tracked: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            legacy: Legacy {
                permit: Arc::new(Semaphore::new(1)),
                waiting: Mutex::new(HashSet::new()),
                results: Mutex::new(HashMap::new()),
                cancel_next: AtomicBool::new(false),
                pending: AtomicUsize::new(0),
            },
        });

        let (stop, stop_rx) = watch::channel(false);
        handle.spawn(Arc::clone(&inner).run(stop_rx.clone()));
        handle.spawn(Arc::clone(&inner).check_state(stop_rx));

        let proxy = Self {
            inner,
            handle,
            runtime: Some(runtime),
            stop,
        };
        let deadline = Instant::now() + config.connect_timeout();
        while !proxy.is_connected() && Instant::now() < deadline {
            thread::sleep(config.tick());
        }
        Ok(proxy)
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        lock(&self.inner.session).is_some()
    }

    /// Stop every background loop and forget all tracked requests.
    pub fn disconnect(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        lock(&self.inner.tracked).clear();
        let _ = self.stop.send(true);
        tracing::info!(tag = %self.inner.tag, "Proxy disconnecting");
    }

    /// Add a listener for `event`: `connected`, `response`, `submitted`,
    /// `progress`, `restore`, `state` or `settings`.
    pub fn on(&self, event: &str, listener: Listener) {
        lock(&self.inner.listeners)
            .entry(event.to_string())
            .or_default()
            .push(listener);
    }

    /// Remove every listener for `event`.
    pub fn off(&self, event: &str) {
        lock(&self.inner.listeners).remove(event);
    }

    /// Submit `input` and return immediately with a handle tracking it.
    /// A missing `uid` is generated.
    pub fn request<T: Serialize + ?Sized>(
        &self,
        input: &T,
        uid: Option<&str>,
    ) -> Result<RequestHandle, ProxyError> {
        let uid = uid.map_or_else(new_id, ToString::to_string);
        let tracker: Weak<Inner> = Arc::downgrade(&self.inner);
        let handle = RequestHandle::new(tracker, self.inner.config.tick());
        let payload = wire::request_payload(&uid, handle.request_id(), input)?;

        // Track before sending so an immediate answer finds the handle.
        lock(&self.inner.tracked).insert(
            handle.request_id().to_string(),
            Arc::downgrade(handle.shared()),
        );
        tracing::info!(tag = %self.inner.tag, rid = handle.request_id(), "Request created");
        self.inner.send(Outbound::Execute(payload));
        Ok(handle)
    }

    /// Number of requests still tracked.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        lock(&self.inner.tracked).len()
    }

    pub fn configure<T: Serialize + ?Sized>(&self, config: &T, uid: &str) -> Result<(), ProxyError> {
        let payload = wire::configure_payload(uid, config)?;
        self.inner.send(Outbound::Configure(payload));
        Ok(())
    }

    pub fn resume(&self, uid: &str) {
        self.inner.send(Outbound::Resume(uid.to_string()));
    }

    /// Ask the remote side to resend the state of execution `qid`.
    pub fn restore(&self, qid: &Qid) {
        self.inner.send(Outbound::Restore(qid.clone()));
    }

    pub fn state(&self, uid: &str) {
        self.inner.send(Outbound::State(uid.to_string()));
    }

    pub fn delete(&self, qid: &Qid) {
        self.inner.send(Outbound::Delete(qid.clone()));
    }

    /// Submit `input` and resolve with its output once a response for the
    /// request id arrives. Calls run one at a time; [`cancel_next`] abandons
    /// the one currently waiting.
    ///
    /// [`cancel_next`]: Self::cancel_next
    pub fn execute_async<T: Serialize + ?Sized>(
        &self,
        input: &T,
        uid: Option<&str>,
        rid: Option<&str>,
    ) -> Result<JoinHandle<Option<Value>>, ProxyError> {
        let uid = uid.map_or_else(new_id, ToString::to_string);
        let rid = rid.map_or_else(new_id, ToString::to_string);
        let payload = wire::request_payload(&uid, &rid, input)?;

        lock(&self.inner.legacy.waiting).insert(rid.clone());
        self.inner.legacy.pending.fetch_add(1, Ordering::SeqCst);
        self.inner.send(Outbound::Execute(payload));
        Ok(self.handle.spawn(Arc::clone(&self.inner).await_response(rid)))
    }

    /// Blocking form of [`execute_async`](Self::execute_async). Must not be
    /// called from inside an async runtime.
    pub fn execute<T: Serialize + ?Sized>(
        &self,
        input: &T,
        uid: Option<&str>,
        rid: Option<&str>,
    ) -> Result<Option<Value>, ProxyError> {
        let call = self.execute_async(input, uid, rid)?;
        Ok(self.handle.block_on(call)?)
    }

    /// Whether any legacy call is still waiting for its response.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.inner.legacy.pending.load(Ordering::SeqCst) > 0
    }

    pub fn cancel_next(&self) {
        self.inner.legacy.cancel_next.store(true, Ordering::SeqCst);
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.disconnect();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("tag", &self.inner.tag)
            .field("url", &self.inner.url)
            .field("connected", &self.is_connected())
            .field("outstanding", &self.outstanding())
            .finish_non_exhaustive()
    }
}

impl Tracker for Inner {
    fn forget(&self, rid: &str) {
        lock(&self.tracked).remove(rid);
    }

    fn tracks(&self, rid: &str) -> bool {
        lock(&self.tracked).contains_key(rid)
    }
}

impl Inner {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn send(&self, outbound: Outbound) {
        let name = outbound.name();
        let session = lock(&self.session);
        let sent = session
            .as_ref()
            .is_some_and(|tx| tx.send(outbound.into_event()).is_ok());
        if !sent {
            tracing::warn!(tag = %self.tag, event = name, "Not connected, event dropped");
        }
    }

    fn notify(&self, event: &str, data: &Value) {
        let listeners = lock(&self.listeners).get(event).cloned().unwrap_or_default();
        for listener in listeners {
            listener(data);
        }
    }

    fn handle_for(&self, rid: &str) -> Option<Arc<Shared>> {
        lock(&self.tracked).get(rid).and_then(Weak::upgrade)
    }

    /// Connect, serve, and reconnect until stopped. A session that ends is
    /// retried after one tick; failed connects back off by one tick per
    /// attempt, capped at `reconnect_delay`.
    async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        tracing::info!(tag = %self.tag, "Proxy started");
        let mut backoff = Duration::ZERO;
        while self.is_running() {
            let pause = match TcpStream::connect(self.url.as_str()).await {
                Ok(stream) => {
                    backoff = Duration::ZERO;
                    self.serve(stream, &mut stop).await;
                    self.config.tick()
                }
                Err(e) => {
                    backoff = (backoff + self.config.tick()).min(self.config.reconnect_delay());
                    tracing::error!(
                        tag = %self.tag,
                        url = %self.url,
                        "Could not connect to server, retrying in {backoff:?}: {e}"
                    );
                    backoff
                }
            };
            if !self.is_running() {
                break;
            }
            tokio::select! {
                () = tokio::time::sleep(pause) => {}
                _ = stop.changed() => {}
            }
        }
        tracing::info!(tag = %self.tag, "Proxy exiting");
    }

    async fn serve(self: &Arc<Self>, stream: TcpStream, stop: &mut watch::Receiver<bool>) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(tag = %self.tag, "Failed to disable Nagle: {e}");
        }
        let (read, write) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
        *lock(&self.session) = Some(tx);
        tracing::info!(tag = %self.tag, "Connection established");
        self.notify(CONNECTED, &Value::Bool(true));

        let mut reader = tokio::spawn(Arc::clone(self).read(read));
        let mut writer = FrameWriter::new(write);
        loop {
            tokio::select! {
                outbound = rx.recv() => {
                    let Some(event) = outbound else { break };
                    if let Err(e) = writer.write_json(&event).await {
                        tracing::warn!(tag = %self.tag, "Write failed: {e}");
                        break;
                    }
                }
                _ = &mut reader => break,
                _ = stop.changed() => break,
            }
        }

        *lock(&self.session) = None;
        reader.abort();
        tracing::info!(tag = %self.tag, "Disconnected from server");
        self.notify(CONNECTED, &Value::Bool(false));
    }

    async fn read(self: Arc<Self>, read: OwnedReadHalf) {
        let mut reader = FrameReader::new(read);
        loop {
            match reader.read_json::<Event>().await {
                Ok(Some(event)) => {
                    if !self.dispatch(event) {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(tag = %self.tag, "Read failed: {e}");
                    break;
                }
            }
        }
    }

    /// Route one inbound event. Returns false when the server said goodbye.
    fn dispatch(&self, event: Event) -> bool {
        let inbound = match Inbound::parse(event) {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::warn!(tag = %self.tag, "Dropping event: {e}");
                return true;
            }
        };
        tracing::debug!(tag = %self.tag, event = inbound.name(), "Data received");

        match &inbound {
            Inbound::Connect => tracing::info!(tag = %self.tag, "Server acknowledged connection"),
            Inbound::ConnectError(data) => {
                tracing::error!(tag = %self.tag, "Failed to establish connection: {data}");
            }
            Inbound::Disconnect => {
                tracing::info!(tag = %self.tag, "Server closed the session");
                return false;
            }
            Inbound::Response(data) => {
                if let Some(rid) = data.pointer("/ray/rid").and_then(Value::as_str) {
                    self.record_legacy(rid, data);
                    if let Some(handle) = self.handle_for(rid) {
                        handle.on_response(data);
                    }
                }
                self.notify("response", data);
            }
            Inbound::Submitted(data) | Inbound::Progress(data) => {
                let Some(rid) = data.get("rid").and_then(Value::as_str) else {
                    let e = ProxyError::MissingRid {
                        event: inbound.name(),
                    };
                    tracing::warn!(tag = %self.tag, "Dropping event: {e}");
                    return true;
                };
                if let Some(handle) = self.handle_for(rid) {
                    handle.on_progress(data.clone());
                }
                self.notify(inbound.name(), data);
            }
            Inbound::Restore(data) => {
                let Some(rid) = data.pointer("/ray/rid").and_then(Value::as_str) else {
                    return true;
                };
                if let Some(handle) = self.handle_for(rid) {
                    handle.on_restore(data);
                }
                self.notify("restore", data);
            }
            Inbound::Settings(data) | Inbound::State(data) => self.notify(inbound.name(), data),
        }
        true
    }

    fn record_legacy(&self, rid: &str, data: &Value) {
        if let Some(output) = data.get("output")
            && lock(&self.legacy.waiting).contains(rid)
        {
            lock(&self.legacy.results).insert(rid.to_string(), output.clone());
        }
    }

    async fn await_response(self: Arc<Self>, rid: String) -> Option<Value> {
        let permit = Arc::clone(&self.legacy.permit).acquire_owned().await;
        tracing::debug!(tag = %self.tag, rid = %rid, "Waiting for response");
        let result = loop {
            if self.legacy.cancel_next.swap(false, Ordering::SeqCst) {
                tracing::info!(tag = %self.tag, rid = %rid, "Cancelled");
                break None;
            }
            if let Some(output) = lock(&self.legacy.results).remove(&rid) {
                break Some(output);
            }
            if !self.is_running() {
                break None;
            }
            tokio::time::sleep(self.config.tick()).await;
        };
        lock(&self.legacy.waiting).remove(&rid);
        self.legacy.pending.fetch_sub(1, Ordering::SeqCst);
        drop(permit);
        result
    }

    /// Every `check_interval`, resync quiet requests and give up on silent
    /// ones.
    async fn check_state(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        tracing::info!(tag = %self.tag, "State checker started");
        while self.is_running() {
            tokio::select! {
                () = tokio::time::sleep(self.config.check_interval()) => {}
                _ = stop.changed() => break,
            }
            if self.is_running() {
                self.inspect();
            }
        }
        tracing::info!(tag = %self.tag, "State checker exiting");
    }

    fn inspect(&self) {
        let mut silent = Vec::new();
        let mut quiet = Vec::new();
        lock(&self.tracked).retain(|_, weak| {
            let Some(handle) = weak.upgrade() else {
                return false;
            };
            let elapsed = handle.since_update();
            if elapsed > self.config.max_silence() {
                silent.push(handle);
            } else if elapsed > self.config.update_interval() {
                quiet.push(handle);
            }
            true
        });

        for handle in silent {
            tracing::error!(tag = %self.tag, rid = handle.rid(), "Execution is not responding, cancelling");
            let qid = handle.qid();
            handle.cancel();
            if let Some(qid) = qid {
                self.send(Outbound::Delete(qid));
            }
        }
        for handle in quiet {
            match handle.qid() {
                Some(qid) => {
                    tracing::info!(tag = %self.tag, rid = handle.rid(), "Execution is quiet, requesting update");
                    self.send(Outbound::Restore(qid));
                }
                None => tracing::info!(
                    tag = %self.tag,
                    rid = handle.rid(),
                    "Execution is quiet, queue id not yet available"
                ),
            }
        }
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
