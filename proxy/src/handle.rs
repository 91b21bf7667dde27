//! Client-side view of one outstanding remote request.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::{Duration, Instant};

use fabric_types::{Bar, DEFAULT_BAR, Message, Qid};
use serde_json::{Map, Value};

/// Status reported before any snapshot arrived.
pub const UNKNOWN: &str = "UNKNOWN";
/// Status forced onto a handle cancelled before it finished.
pub const CANCELLED: &str = "CANCELLED";

/// Whoever tracks handles by request id.
pub(crate) trait Tracker: Send + Sync {
    fn forget(&self, rid: &str);
    fn tracks(&self, rid: &str) -> bool;
}

#[derive(Debug)]
struct Snapshot {
    progress: Option<Value>,
    result: Option<Value>,
    finished: bool,
    last_update: Instant,
}

pub(crate) struct Shared {
    rid: String,
    tick: Duration,
    tracker: Mutex<Option<Weak<dyn Tracker>>>,
    state: Mutex<Snapshot>,
}

impl Shared {
    pub(crate) fn rid(&self) -> &str {
        &self.rid
    }

    pub(crate) fn since_update(&self) -> Duration {
        lock(&self.state).last_update.elapsed()
    }

    pub(crate) fn qid(&self) -> Option<Qid> {
        lock(&self.state)
            .progress
            .as_ref()
            .and_then(|progress| progress.get("qid"))
            .and_then(Value::as_str)
            .map(Qid::from)
    }

    /// A submitted or progress snapshot.
    pub(crate) fn on_progress(&self, data: Value) {
        let mut state = lock(&self.state);
        state.progress = Some(data);
        state.last_update = Instant::now();
    }

    /// The final answer. Resolves the handle exactly once.
    pub(crate) fn on_response(&self, data: &Value) {
        {
            let mut state = lock(&self.state);
            if let Some(ray) = data.get("ray") {
                state.progress = Some(ray.clone());
                state.last_update = Instant::now();
            }
            if let Some(output) = data.get("output") {
                state.result = Some(output.clone());
            }
            state.finished = true;
        }
        self.cancel();
    }

    /// A resync answer. Only finishes the handle when it carries output.
    pub(crate) fn on_restore(&self, data: &Value) {
        let finished = {
            let mut state = lock(&self.state);
            if let Some(ray) = data.get("ray").filter(|ray| !ray.is_null()) {
                state.progress = Some(ray.clone());
                state.last_update = Instant::now();
            }
            match data.get("output") {
                Some(output) if !output.is_null() => {
                    state.result = Some(output.clone());
                    state.finished = true;
                    true
                }
                _ => false,
            }
        };
        if finished {
            self.cancel();
        }
    }

    pub(crate) fn cancel(&self) {
        let tracker = lock(&self.tracker).take();
        if let Some(tracker) = tracker.and_then(|weak| weak.upgrade()) {
            tracker.forget(&self.rid);
        }

        let mut state = lock(&self.state);
        if state.finished {
            return;
        }
        match state.progress.as_mut() {
            Some(Value::Object(progress)) => {
                progress.insert("status".to_string(), Value::from(CANCELLED));
            }
            _ => {
                let mut progress = Map::new();
                progress.insert("status".to_string(), Value::from(CANCELLED));
                state.progress = Some(Value::Object(progress));
            }
        }
    }

    fn registered(&self) -> bool {
        lock(&self.tracker)
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|tracker| tracker.tracks(&self.rid))
    }
}

/// Handle returned by [`Proxy::request`](crate::Proxy::request).
///
/// Reads never block; [`wait`](Self::wait) polls. Dropping the handle
/// cancels it.
pub struct RequestHandle {
    shared: Arc<Shared>,
}

impl RequestHandle {
    pub(crate) fn new(tracker: Weak<dyn Tracker>, tick: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                rid: uuid::Uuid::new_v4().simple().to_string(),
                tick,
                tracker: Mutex::new(Some(tracker)),
                state: Mutex::new(Snapshot {
                    progress: None,
                    result: None,
                    finished: false,
                    last_update: Instant::now(),
                }),
            }),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    #[must_use]
    pub fn request_id(&self) -> &str {
        self.shared.rid()
    }

    /// Execution id assigned by the remote side, once a snapshot told us.
    #[must_use]
    pub fn request_qid(&self) -> Option<Qid> {
        self.shared.qid()
    }

    /// Block until the request finishes, it is cancelled, or `timeout`
    /// elapses. A zero timeout waits indefinitely. Returns whether it
    /// finished.
    pub fn wait(&self, timeout: Duration) -> bool {
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        loop {
            if self.is_finished() {
                return true;
            }
            if !self.shared.registered() || deadline.is_some_and(|at| Instant::now() >= at) {
                return false;
            }
            thread::sleep(self.shared.tick);
        }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        lock(&self.shared.state).finished
    }

    /// Status of the latest snapshot, [`UNKNOWN`] before the first one.
    #[must_use]
    pub fn status(&self) -> String {
        lock(&self.shared.state)
            .progress
            .as_ref()
            .and_then(|progress| progress.get("status"))
            .and_then(Value::as_str)
            .unwrap_or(UNKNOWN)
            .to_string()
    }

    /// Bar `name` of the latest snapshot.
    #[must_use]
    pub fn progress(&self, name: &str) -> Option<Bar> {
        let state = lock(&self.shared.state);
        let bar = state.progress.as_ref()?.get("bars")?.get(name)?;
        serde_json::from_value(bar.clone()).ok()
    }

    /// The [`DEFAULT_BAR`] of the latest snapshot.
    #[must_use]
    pub fn default_progress(&self) -> Option<Bar> {
        self.progress(DEFAULT_BAR)
    }

    /// Messages of the latest snapshot. Entries that do not parse are
    /// skipped.
    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        let state = lock(&self.shared.state);
        let Some(Value::Array(messages)) = state
            .progress
            .as_ref()
            .and_then(|progress| progress.get("messages"))
        else {
            return Vec::new();
        };
        messages
            .iter()
            .filter_map(|message| serde_json::from_value(message.clone()).ok())
            .collect()
    }

    /// The output, if the response carried one. May stay empty forever when
    /// the remote side never answers.
    #[must_use]
    pub fn data(&self) -> Option<Value> {
        lock(&self.shared.state).result.clone()
    }

    /// Stop tracking the request. Idempotent; an unfinished request reads
    /// [`CANCELLED`] afterwards. The remote execution is not interrupted.
    pub fn cancel(&self) {
        self.shared.cancel();
    }
}

impl Drop for RequestHandle {
    fn drop(&mut self) {
        self.shared.cancel();
    }
}

impl fmt::Display for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.shared.state);
        let progress = state.progress.as_ref().unwrap_or(&Value::Null);
        let result = state.result.as_ref().unwrap_or(&Value::Null);
        write!(f, "RequestHandle({}, {progress}, {result})", self.shared.rid)
    }
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.shared.state);
        f.debug_struct("RequestHandle")
            .field("rid", &self.shared.rid)
            .field("finished", &state.finished)
            .field("progress", &state.progress)
            .finish_non_exhaustive()
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use fabric_types::MessageKind;
    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct Registry {
        live: Mutex<HashSet<String>>,
        forgotten: Mutex<Vec<String>>,
    }

    impl Tracker for Registry {
        fn forget(&self, rid: &str) {
            self.live.lock().unwrap().remove(rid);
            self.forgotten.lock().unwrap().push(rid.to_string());
        }

        fn tracks(&self, rid: &str) -> bool {
            self.live.lock().unwrap().contains(rid)
        }
    }

    fn tracked() -> (Arc<Registry>, RequestHandle) {
        let registry = Arc::new(Registry::default());
        let weak: Weak<Registry> = Arc::downgrade(&registry);
        let handle = RequestHandle::new(weak, Duration::from_millis(5));
        registry
            .live
            .lock()
            .unwrap()
            .insert(handle.request_id().to_string());
        (registry, handle)
    }

    #[test]
    fn fresh_handle_reads_unknown_and_empty() {
        let (_registry, handle) = tracked();
        assert_eq!(handle.status(), UNKNOWN);
        assert_eq!(handle.request_id().len(), 32);
        assert!(handle.request_qid().is_none());
        assert!(handle.default_progress().is_none());
        assert!(handle.messages().is_empty());
        assert!(handle.data().is_none());
        assert!(!handle.wait(Duration::from_millis(20)));
    }

    #[test]
    fn cancel_is_idempotent() {
        let (registry, handle) = tracked();
        handle.cancel();
        handle.cancel();
        assert_eq!(handle.status(), CANCELLED);
        assert_eq!(registry.forgotten.lock().unwrap().len(), 1);
        // Cancelled handles stop waiting immediately.
        assert!(!handle.wait(Duration::ZERO));
    }

    #[test]
    fn response_resolves_once_and_keeps_its_status() {
        let (registry, handle) = tracked();
        handle.shared().on_progress(json!({
            "rid": handle.request_id(),
            "qid": "q1",
            "status": "RUNNING",
            "bars": {"default": {"percent": 50.0, "remaining": 1.5}},
            "messages": [{"type": "INFO", "content": "half way", "created_at": "2024-01-01T00:00:00Z"}],
        }));
        assert_eq!(handle.request_qid(), Some(Qid::from("q1")));
        assert_eq!(handle.default_progress().unwrap().percent, 50.0);
        assert_eq!(handle.messages()[0].kind, MessageKind::Info);

        handle.shared().on_response(&json!({
            "ray": {"rid": handle.request_id(), "qid": "q1", "status": "COMPLETED"},
            "output": {"y": 2},
        }));
        assert!(handle.wait(Duration::ZERO));
        assert_eq!(handle.data(), Some(json!({"y": 2})));
        assert_eq!(handle.status(), "COMPLETED");

        handle.cancel();
        assert_eq!(handle.status(), "COMPLETED");
        assert_eq!(registry.forgotten.lock().unwrap().len(), 1);
    }

    #[test]
    fn restore_only_finishes_with_output() {
        let (_registry, handle) = tracked();
        handle.shared().on_restore(&json!({
            "ray": {"qid": "q2", "status": "RUNNING"},
            "output": null,
        }));
        assert!(!handle.is_finished());
        assert_eq!(handle.status(), "RUNNING");

        handle.shared().on_restore(&json!({
            "ray": {"qid": "q2", "status": "COMPLETED"},
            "output": "done",
        }));
        assert!(handle.is_finished());
        assert_eq!(handle.data(), Some(json!("done")));
    }

    #[test]
    fn display_shows_rid_progress_and_result() {
        let (_registry, handle) = tracked();
        let text = handle.to_string();
        assert!(text.starts_with(&format!("RequestHandle({}", handle.request_id())));
        assert!(text.ends_with("null, null)"));
    }
}
